use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    Ballot, BoardMember, Candidate, CohortSettings, ItemKind, ItemRef, RatedBallot, RaterIdentity,
    RatingKey, RatingScore, ScorableItem,
};

#[async_trait]
pub trait RatingRepository: Send + Sync {
    async fn candidates(&self, cohort_id: Uuid) -> Result<Vec<Candidate>, EngineError>;

    async fn candidate(&self, cohort_id: Uuid, candidate_id: Uuid)
        -> Result<Candidate, EngineError>;

    async fn scorable_items(&self, cohort_id: Uuid) -> Result<Vec<ScorableItem>, EngineError>;

    /// Ratings and their scores must come from one consistent read.
    async fn rated_ballots(&self, cohort_id: Uuid) -> Result<Vec<RatedBallot>, EngineError>;

    async fn board_members(&self, cohort_id: Uuid) -> Result<Vec<BoardMember>, EngineError>;

    async fn settings(&self, cohort_id: Uuid) -> Result<Option<CohortSettings>, EngineError>;

    async fn save_settings(
        &self,
        cohort_id: Uuid,
        settings: &CohortSettings,
    ) -> Result<(), EngineError>;

    /// Upserts the rating for `key` and replaces its scores of `kind`, atomically.
    async fn write_ballot(
        &self,
        key: &RatingKey,
        kind: ItemKind,
        scores: &[RatingScore],
    ) -> Result<Uuid, EngineError>;
}

/// Write path for ballots. Submissions for the same (candidate, rater, cohort,
/// phase) are serialized in-process.
pub struct RatingStore<R: ?Sized> {
    repo: Arc<R>,
    locks: Mutex<HashMap<RatingKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl<R> RatingStore<R>
where
    R: RatingRepository + ?Sized,
{
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub async fn submit_ballot(
        &self,
        rater: Option<&RaterIdentity>,
        ballot: &Ballot,
    ) -> Result<Uuid, EngineError> {
        let rater = match rater {
            Some(RaterIdentity::HistoricalAlias(name)) if name.trim().is_empty() => {
                return Err(EngineError::Unauthorized)
            }
            Some(rater) => rater.clone(),
            None => return Err(EngineError::Unauthorized),
        };

        self.repo
            .candidate(ballot.cohort_id, ballot.candidate_id)
            .await?;
        let kind = ballot.phase.item_kind();
        let scores = self.resolve_items(ballot, kind).await?;

        let key = RatingKey {
            candidate_id: ballot.candidate_id,
            rater,
            cohort_id: ballot.cohort_id,
            phase: ballot.phase,
        };

        if scores.is_empty() {
            debug!(candidate_id = %key.candidate_id, phase = %key.phase, "abstain ballot");
        }

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.repo.write_ballot(&key, kind, &scores).await
        };
        drop(lock);
        self.release_lock(&key);

        let rating_id = result?;
        info!(
            %rating_id,
            candidate_id = %key.candidate_id,
            phase = %key.phase,
            rater = %key.rater,
            scores = scores.len(),
            "ballot recorded"
        );
        Ok(rating_id)
    }

    async fn resolve_items(
        &self,
        ballot: &Ballot,
        kind: ItemKind,
    ) -> Result<Vec<RatingScore>, EngineError> {
        if ballot.items.is_empty() {
            return Ok(Vec::new());
        }

        let scorable: HashSet<ItemRef> = self
            .repo
            .scorable_items(ballot.cohort_id)
            .await?
            .into_iter()
            .filter(|item| item.is_scorable && item.item.kind() == kind)
            .map(|item| item.item)
            .collect();

        let mut resolved: Vec<RatingScore> = Vec::with_capacity(ballot.items.len());
        let mut positions: HashMap<ItemRef, usize> = HashMap::new();

        for entry in &ballot.items {
            let item = ItemRef::new(kind, entry.item_id);
            if !scorable.contains(&item) {
                return Err(EngineError::ItemNotFound(item));
            }
            if !entry.score.is_finite() {
                return Err(EngineError::InvalidScore {
                    item,
                    score: entry.score,
                });
            }

            let score = RatingScore {
                item,
                score: entry.score,
                comment: entry
                    .comment
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            };

            match positions.get(&item) {
                Some(&index) => resolved[index] = score,
                None => {
                    positions.insert(item, resolved.len());
                    resolved.push(score);
                }
            }
        }

        Ok(resolved)
    }

    fn key_lock(&self, key: &RatingKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    fn release_lock(&self, key: &RatingKey) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn pending_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRepository;
    use crate::models::{BallotItem, Phase};

    struct Fixture {
        store: Arc<RatingStore<InMemoryRepository>>,
        cohort_id: Uuid,
        candidate_id: Uuid,
        q1: Uuid,
        q2: Uuid,
    }

    fn fixture() -> Fixture {
        let repo = InMemoryRepository::new();
        let cohort_id = repo.add_cohort();
        let candidate_id = repo.add_candidate(cohort_id, "Avery", "Lee");
        let q1 = repo.add_question(cohort_id, "Why do you want to join?");
        let q2 = repo.add_question(cohort_id, "Describe a leadership moment.");
        Fixture {
            store: Arc::new(RatingStore::new(Arc::new(repo))),
            cohort_id,
            candidate_id,
            q1,
            q2,
        }
    }

    fn ballot(f: &Fixture, phase: Phase, items: &[(Uuid, f64)]) -> Ballot {
        Ballot {
            candidate_id: f.candidate_id,
            cohort_id: f.cohort_id,
            phase,
            items: items
                .iter()
                .map(|(item_id, score)| BallotItem {
                    item_id: *item_id,
                    score: *score,
                    comment: None,
                })
                .collect(),
        }
    }

    async fn stored(f: &Fixture) -> Vec<RatedBallot> {
        f.store
            .repository()
            .rated_ballots(f.cohort_id)
            .await
            .unwrap()
    }

    fn score_map(ballot: &RatedBallot) -> HashMap<ItemRef, f64> {
        ballot.scores.iter().map(|s| (s.item, s.score)).collect()
    }

    #[tokio::test]
    async fn resubmission_replaces_previous_scores() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());

        let first = f
            .store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Application, &[(f.q1, 5.0), (f.q2, 6.0)]))
            .await
            .unwrap();
        let second = f
            .store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Application, &[(f.q1, 7.0)]))
            .await
            .unwrap();
        assert_eq!(first, second);

        let ballots = stored(&f).await;
        assert_eq!(ballots.len(), 1);
        let scores = score_map(&ballots[0]);
        assert_eq!(scores.len(), 1);
        assert_eq!(scores.get(&ItemRef::Question(f.q1)), Some(&7.0));
    }

    #[tokio::test]
    async fn abstain_clears_scores_but_keeps_rating() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());

        f.store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Interview, &[(f.q1, 8.0)]))
            .await
            .unwrap();
        f.store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Interview, &[]))
            .await
            .unwrap();

        let ballots = stored(&f).await;
        assert_eq!(ballots.len(), 1);
        assert_eq!(ballots[0].rating.phase, Phase::Interview);
        assert!(ballots[0].scores.is_empty());
    }

    #[tokio::test]
    async fn missing_identity_is_rejected_before_any_write() {
        let f = fixture();
        let result = f
            .store
            .submit_ballot(None, &ballot(&f, Phase::Application, &[(f.q1, 5.0)]))
            .await;
        assert!(matches!(result, Err(EngineError::Unauthorized)));

        let blank = RaterIdentity::HistoricalAlias("   ".to_string());
        let result = f
            .store
            .submit_ballot(Some(&blank), &ballot(&f, Phase::Application, &[(f.q1, 5.0)]))
            .await;
        assert!(matches!(result, Err(EngineError::Unauthorized)));
        assert!(stored(&f).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_candidate_is_reported() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());
        let mut b = ballot(&f, Phase::Application, &[(f.q1, 5.0)]);
        b.candidate_id = Uuid::new_v4();

        let result = f.store.submit_ballot(Some(&rater), &b).await;
        assert!(matches!(result, Err(EngineError::CandidateNotFound(id)) if id == b.candidate_id));
    }

    #[tokio::test]
    async fn failed_submission_leaves_prior_scores() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());
        f.store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Application, &[(f.q1, 4.0)]))
            .await
            .unwrap();

        let bogus = Uuid::new_v4();
        let result = f
            .store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Application, &[(f.q2, 9.0), (bogus, 3.0)]))
            .await;
        assert!(matches!(result, Err(EngineError::ItemNotFound(ItemRef::Question(id))) if id == bogus));

        let scores = score_map(&stored(&f).await[0]);
        assert_eq!(scores.len(), 1);
        assert_eq!(scores.get(&ItemRef::Question(f.q1)), Some(&4.0));
    }

    #[tokio::test]
    async fn question_ids_are_not_valid_for_character_ballots() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());
        let result = f
            .store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Character, &[(f.q1, 5.0)]))
            .await;
        assert!(matches!(result, Err(EngineError::ItemNotFound(ItemRef::Trait(_)))));
    }

    #[tokio::test]
    async fn unscorable_question_is_rejected() {
        let repo = InMemoryRepository::new();
        let cohort_id = repo.add_cohort();
        let candidate_id = repo.add_candidate(cohort_id, "Jules", "Moreno");
        let display_only = repo.add_item(cohort_id, ItemKind::Question, "Resume link", false);
        let store = RatingStore::new(Arc::new(repo));

        let b = Ballot {
            candidate_id,
            cohort_id,
            phase: Phase::Application,
            items: vec![BallotItem {
                item_id: display_only,
                score: 5.0,
                comment: None,
            }],
        };
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());
        assert!(matches!(
            store.submit_ballot(Some(&rater), &b).await,
            Err(EngineError::ItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn non_finite_score_is_rejected() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());
        let result = f
            .store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Application, &[(f.q1, f64::NAN)]))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidScore { .. })));
    }

    #[tokio::test]
    async fn repeated_item_keeps_last_value() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());
        f.store
            .submit_ballot(Some(&rater), &ballot(&f, Phase::Application, &[(f.q1, 2.0), (f.q1, 8.0)]))
            .await
            .unwrap();

        let ballots = stored(&f).await;
        assert_eq!(ballots[0].scores.len(), 1);
        assert_eq!(ballots[0].scores[0].score, 8.0);
    }

    #[tokio::test]
    async fn raters_and_phases_get_separate_ratings() {
        let f = fixture();
        let live = RaterIdentity::LiveUser(Uuid::new_v4());
        let legacy = RaterIdentity::HistoricalAlias("M. Chen".to_string());

        f.store
            .submit_ballot(Some(&live), &ballot(&f, Phase::Application, &[(f.q1, 5.0)]))
            .await
            .unwrap();
        f.store
            .submit_ballot(Some(&live), &ballot(&f, Phase::Interview, &[(f.q1, 6.0)]))
            .await
            .unwrap();
        f.store
            .submit_ballot(Some(&legacy), &ballot(&f, Phase::Application, &[(f.q1, 7.0)]))
            .await
            .unwrap();

        assert_eq!(stored(&f).await.len(), 3);
    }

    #[tokio::test]
    async fn clearing_questions_leaves_traits_on_the_same_rating() {
        let repo = InMemoryRepository::new();
        let cohort_id = repo.add_cohort();
        let candidate_id = repo.add_candidate(cohort_id, "Jules", "Moreno");
        let question = ItemRef::Question(repo.add_question(cohort_id, "Motivation"));
        let trait_item = ItemRef::Trait(repo.add_trait(cohort_id, "Integrity"));
        let key = RatingKey {
            candidate_id,
            rater: RaterIdentity::LiveUser(Uuid::new_v4()),
            cohort_id,
            phase: Phase::Character,
        };
        let row = |item, score| RatingScore {
            item,
            score,
            comment: None,
        };

        let first = repo
            .write_ballot(&key, ItemKind::Question, &[row(question, 5.0)])
            .await
            .unwrap();
        repo.write_ballot(&key, ItemKind::Trait, &[row(trait_item, 9.0)])
            .await
            .unwrap();
        let again = repo.write_ballot(&key, ItemKind::Question, &[]).await.unwrap();
        assert_eq!(first, again);

        let ballots = repo.rated_ballots(cohort_id).await.unwrap();
        assert_eq!(ballots.len(), 1);
        assert_eq!(ballots[0].scores.len(), 1);
        assert_eq!(ballots[0].scores[0].item, trait_item);
    }

    #[tokio::test]
    async fn rejected_write_leaves_no_rating_behind() {
        let repo = InMemoryRepository::new();
        let cohort_id = repo.add_cohort();
        let candidate_id = repo.add_candidate(cohort_id, "Kiara", "Patel");
        let question = ItemRef::Question(repo.add_question(cohort_id, "Motivation"));
        let deleted = ItemRef::Question(Uuid::new_v4());
        let row = |item, score| RatingScore {
            item,
            score,
            comment: None,
        };
        let fresh = RatingKey {
            candidate_id,
            rater: RaterIdentity::LiveUser(Uuid::new_v4()),
            cohort_id,
            phase: Phase::Application,
        };

        let result = repo
            .write_ballot(&fresh, ItemKind::Question, &[row(question, 4.0), row(deleted, 3.0)])
            .await;
        assert!(matches!(result, Err(EngineError::ItemNotFound(item)) if item == deleted));
        assert!(repo.rated_ballots(cohort_id).await.unwrap().is_empty());

        let returning = RatingKey {
            rater: RaterIdentity::HistoricalAlias("Former Chair".to_string()),
            ..fresh.clone()
        };
        repo.write_ballot(&returning, ItemKind::Question, &[row(question, 6.0)])
            .await
            .unwrap();
        let before = repo.rated_ballots(cohort_id).await.unwrap();

        let result = repo
            .write_ballot(&returning, ItemKind::Question, &[row(deleted, 1.0)])
            .await;
        assert!(matches!(result, Err(EngineError::ItemNotFound(_))));

        let after = repo.rated_ballots(cohort_id).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].rating, before[0].rating);
        assert_eq!(after[0].scores, before[0].scores);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resubmissions_never_duplicate() {
        let f = fixture();
        let rater = RaterIdentity::LiveUser(Uuid::new_v4());
        let first = ballot(&f, Phase::Application, &[(f.q1, 3.0), (f.q2, 4.0)]);
        let second = ballot(&f, Phase::Application, &[(f.q1, 9.0)]);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&f.store);
            let rater = rater.clone();
            let b = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store.submit_ballot(Some(&rater), &b).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let ballots = stored(&f).await;
        assert_eq!(ballots.len(), 1);
        let scores = score_map(&ballots[0]);
        assert_eq!(scores.len(), ballots[0].scores.len());
        let matches_first = scores.len() == 2
            && scores.get(&ItemRef::Question(f.q1)) == Some(&3.0)
            && scores.get(&ItemRef::Question(f.q2)) == Some(&4.0);
        let matches_second = scores.len() == 1 && scores.get(&ItemRef::Question(f.q1)) == Some(&9.0);
        assert!(matches_first || matches_second);
        assert_eq!(f.store.pending_locks(), 0);
    }
}
