use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    Candidate, CandidateAggregate, ItemBreakdown, ItemRef, Phase, PhaseAggregate, PhaseAggregates,
    RatedBallot, ScorableItem,
};
use crate::stats::{classify_outliers, mean, population_std_dev};
use crate::store::RatingRepository;

type ItemScores = BTreeMap<ItemRef, Vec<f64>>;

/// Display order: explicit `custom_order` first, then candidate number, then name.
pub fn sort_for_display(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        let key = |c: &Candidate| {
            (
                c.custom_order.is_none(),
                c.custom_order,
                c.candidate_number.is_none(),
                c.candidate_number,
            )
        };
        key(a)
            .cmp(&key(b))
            .then_with(|| a.last_name.cmp(&b.last_name))
            .then_with(|| a.first_name.cmp(&b.first_name))
    });
}

/// Outliers are found per item, then pooled per phase.
pub fn aggregate_scores(
    candidates: &[Candidate],
    ballots: &[RatedBallot],
    threshold_std_devs: f64,
) -> Vec<CandidateAggregate> {
    let mut active: Vec<Candidate> = candidates.iter().filter(|c| c.is_active).cloned().collect();
    sort_for_display(&mut active);

    let known: HashMap<Uuid, bool> = candidates.iter().map(|c| (c.id, c.is_active)).collect();
    let mut grouped: HashMap<Uuid, HashMap<Phase, ItemScores>> = HashMap::new();

    for ballot in ballots {
        let rating = &ballot.rating;
        match known.get(&rating.candidate_id) {
            Some(true) => {}
            Some(false) => {
                debug!(rating_id = %rating.id, candidate_id = %rating.candidate_id, "skipping rating for inactive candidate");
                continue;
            }
            None => {
                warn!(rating_id = %rating.id, candidate_id = %rating.candidate_id, "rating references unknown candidate, skipping");
                continue;
            }
        }

        let items = grouped
            .entry(rating.candidate_id)
            .or_default()
            .entry(rating.phase)
            .or_default();
        for score in &ballot.scores {
            items.entry(score.item).or_default().push(score.score);
        }
    }

    active
        .into_iter()
        .map(|candidate| {
            let mut phases = PhaseAggregates::default();
            if let Some(by_phase) = grouped.get(&candidate.id) {
                for phase in Phase::ALL {
                    if let Some(items) = by_phase.get(&phase) {
                        *phases.get_mut(phase) = aggregate_phase(items, threshold_std_devs);
                    }
                }
            }
            CandidateAggregate { candidate, phases }
        })
        .collect()
}

fn aggregate_phase(items: &ItemScores, threshold_std_devs: f64) -> PhaseAggregate {
    let mut raw_scores = Vec::new();
    let mut outliers = Vec::new();
    let mut inliers = Vec::new();

    for scores in items.values() {
        let split = classify_outliers(scores, threshold_std_devs);
        raw_scores.extend_from_slice(scores);
        outliers.extend(split.outliers);
        inliers.extend(split.inliers);
    }

    if raw_scores.is_empty() {
        return PhaseAggregate::default();
    }

    let average = if inliers.is_empty() {
        mean(&raw_scores)
    } else {
        mean(&inliers)
    };

    PhaseAggregate {
        average: Some(average),
        raw_scores,
        outliers,
        is_complete: true,
    }
}

pub async fn aggregate<R>(
    repo: &R,
    cohort_id: Uuid,
    threshold_std_devs: f64,
) -> Result<Vec<CandidateAggregate>, EngineError>
where
    R: RatingRepository + ?Sized,
{
    let candidates = repo.candidates(cohort_id).await?;
    let ballots = repo.rated_ballots(cohort_id).await?;
    debug!(
        %cohort_id,
        candidates = candidates.len(),
        ratings = ballots.len(),
        "aggregating cohort"
    );
    Ok(aggregate_scores(&candidates, &ballots, threshold_std_devs))
}

pub fn breakdown_items(
    candidate_id: Uuid,
    ballots: &[RatedBallot],
    items: &[ScorableItem],
    threshold_std_devs: f64,
) -> Vec<ItemBreakdown> {
    let catalog: HashMap<ItemRef, &ScorableItem> = items.iter().map(|i| (i.item, i)).collect();
    let mut grouped: BTreeMap<(Phase, i32, ItemRef), (Vec<f64>, Vec<String>)> = BTreeMap::new();

    for ballot in ballots.iter().filter(|b| b.rating.candidate_id == candidate_id) {
        for score in &ballot.scores {
            let order = catalog.get(&score.item).map_or(i32::MAX, |i| i.sort_order);
            let entry = grouped
                .entry((ballot.rating.phase, order, score.item))
                .or_default();
            entry.0.push(score.score);
            if let Some(comment) = &score.comment {
                entry.1.push(comment.clone());
            }
        }
    }

    grouped
        .into_iter()
        .map(|((phase, _, item), (scores, comments))| {
            let split = classify_outliers(&scores, threshold_std_devs);
            let raw_mean = mean(&scores);
            let adjusted_mean = if split.inliers.is_empty() {
                raw_mean
            } else {
                mean(&split.inliers)
            };
            ItemBreakdown {
                phase,
                label: catalog
                    .get(&item)
                    .map_or_else(|| "Unknown item".to_string(), |i| i.label.clone()),
                std_dev: population_std_dev(&scores),
                mean: raw_mean,
                outliers: split.outliers,
                adjusted_mean,
                scores,
                comments,
            }
        })
        .collect()
}

pub async fn item_breakdown<R>(
    repo: &R,
    cohort_id: Uuid,
    candidate_id: Uuid,
    threshold_std_devs: f64,
) -> Result<Vec<ItemBreakdown>, EngineError>
where
    R: RatingRepository + ?Sized,
{
    repo.candidate(cohort_id, candidate_id).await?;
    let items = repo.scorable_items(cohort_id).await?;
    let ballots = repo.rated_ballots(cohort_id).await?;
    Ok(breakdown_items(candidate_id, &ballots, &items, threshold_std_devs))
}
