use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{BoardMember, Candidate, Phase, RatedBallot, RaterIdentity, RaterProgress};
use crate::store::RatingRepository;

#[derive(Default)]
struct Tally {
    rated: [HashSet<Uuid>; 3],
    last_activity: Option<DateTime<Utc>>,
}

/// An abstain counts as rated. Off-board raters follow the board members.
pub fn rater_progress(
    members: &[BoardMember],
    candidates: &[Candidate],
    ballots: &[RatedBallot],
) -> Vec<RaterProgress> {
    let active: HashSet<Uuid> = candidates
        .iter()
        .filter(|c| c.is_active)
        .map(|c| c.id)
        .collect();

    let mut tallies: BTreeMap<RaterIdentity, Tally> = BTreeMap::new();
    for ballot in ballots {
        let rating = &ballot.rating;
        if !active.contains(&rating.candidate_id) {
            continue;
        }
        let tally = tallies.entry(rating.rater.clone()).or_default();
        tally.rated[rating.phase.index()].insert(rating.candidate_id);
        tally.last_activity = tally.last_activity.max(Some(rating.updated_at));
    }

    let build = |rater: &RaterIdentity, name: String, tally: Option<&Tally>| {
        let count = |phase: Phase| tally.map_or(0, |t| t.rated[phase.index()].len());
        RaterProgress {
            rater: rater.clone(),
            name,
            application: count(Phase::Application),
            interview: count(Phase::Interview),
            character: count(Phase::Character),
            candidate_total: active.len(),
            last_activity: tally.and_then(|t| t.last_activity),
        }
    };

    let mut rows: Vec<RaterProgress> = members
        .iter()
        .map(|m| build(&m.rater, m.name.clone(), tallies.get(&m.rater)))
        .collect();

    let on_board: HashSet<&RaterIdentity> = members.iter().map(|m| &m.rater).collect();
    for (rater, tally) in &tallies {
        if on_board.contains(rater) {
            continue;
        }
        let name = match rater {
            RaterIdentity::HistoricalAlias(alias) => alias.clone(),
            RaterIdentity::LiveUser(id) => format!("Unknown user {id}"),
        };
        rows.push(build(rater, name, Some(tally)));
    }

    rows
}

pub async fn load_progress<R>(repo: &R, cohort_id: Uuid) -> Result<Vec<RaterProgress>, EngineError>
where
    R: RatingRepository + ?Sized,
{
    let members = repo.board_members(cohort_id).await?;
    let candidates = repo.candidates(cohort_id).await?;
    let ballots = repo.rated_ballots(cohort_id).await?;
    Ok(rater_progress(&members, &candidates, &ballots))
}
