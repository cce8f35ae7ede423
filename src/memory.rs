use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    BoardMember, Candidate, CohortSettings, ItemKind, ItemRef, RatedBallot, Rating, RatingKey,
    RatingScore, ScorableItem,
};
use crate::store::RatingRepository;

#[derive(Default)]
struct MemoryState {
    cohorts: HashSet<Uuid>,
    candidates: Vec<Candidate>,
    items: Vec<ScorableItem>,
    board: HashMap<Uuid, Vec<BoardMember>>,
    settings: HashMap<Uuid, CohortSettings>,
    ratings: Vec<Rating>,
    scores: Vec<(Uuid, RatingScore)>,
}

impl MemoryState {
    fn require_cohort(&self, cohort_id: Uuid) -> Result<(), EngineError> {
        if self.cohorts.contains(&cohort_id) {
            Ok(())
        } else {
            Err(EngineError::CohortNotFound(cohort_id))
        }
    }

    fn in_cohort(&self, candidate_id: Uuid, cohort_id: Uuid) -> bool {
        self.candidates
            .iter()
            .any(|c| c.id == candidate_id && c.cohort_id == cohort_id)
    }
}

/// One lock guards every table.
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, EngineError> {
        self.state
            .read()
            .map_err(|_| EngineError::Storage(anyhow!("in-memory store lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, EngineError> {
        self.state
            .write()
            .map_err(|_| EngineError::Storage(anyhow!("in-memory store lock poisoned")))
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_cohort(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.state_mut().cohorts.insert(id);
        id
    }

    pub fn add_candidate(&self, cohort_id: Uuid, first_name: &str, last_name: &str) -> Uuid {
        let mut state = self.state_mut();
        let next_number = state
            .candidates
            .iter()
            .filter(|c| c.cohort_id == cohort_id)
            .filter_map(|c| c.candidate_number)
            .max()
            .unwrap_or(0)
            + 1;
        let id = Uuid::new_v4();
        state.candidates.push(Candidate {
            id,
            cohort_id,
            candidate_number: Some(next_number),
            custom_order: None,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: None,
            is_active: true,
        });
        id
    }

    pub fn set_candidate_active(&self, candidate_id: Uuid, is_active: bool) {
        let mut state = self.state_mut();
        if let Some(candidate) = state.candidates.iter_mut().find(|c| c.id == candidate_id) {
            candidate.is_active = is_active;
        }
    }

    pub fn add_question(&self, cohort_id: Uuid, text: &str) -> Uuid {
        self.add_item(cohort_id, ItemKind::Question, text, true)
    }

    pub fn add_trait(&self, cohort_id: Uuid, name: &str) -> Uuid {
        self.add_item(cohort_id, ItemKind::Trait, name, true)
    }

    pub fn add_item(&self, cohort_id: Uuid, kind: ItemKind, label: &str, is_scorable: bool) -> Uuid {
        let mut state = self.state_mut();
        let sort_order = state
            .items
            .iter()
            .filter(|i| i.cohort_id == cohort_id && i.item.kind() == kind)
            .count() as i32;
        let id = Uuid::new_v4();
        state.items.push(ScorableItem {
            item: ItemRef::new(kind, id),
            cohort_id,
            label: label.to_string(),
            category: None,
            sort_order,
            is_scorable,
        });
        id
    }

    pub fn add_board_member(&self, cohort_id: Uuid, member: BoardMember) {
        self.state_mut().board.entry(cohort_id).or_default().push(member);
    }
}

#[async_trait]
impl RatingRepository for InMemoryRepository {
    async fn candidates(&self, cohort_id: Uuid) -> Result<Vec<Candidate>, EngineError> {
        let state = self.read()?;
        state.require_cohort(cohort_id)?;
        Ok(state
            .candidates
            .iter()
            .filter(|c| c.cohort_id == cohort_id)
            .cloned()
            .collect())
    }

    async fn candidate(
        &self,
        cohort_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Candidate, EngineError> {
        let state = self.read()?;
        state
            .candidates
            .iter()
            .find(|c| c.id == candidate_id && c.cohort_id == cohort_id)
            .cloned()
            .ok_or(EngineError::CandidateNotFound(candidate_id))
    }

    async fn scorable_items(&self, cohort_id: Uuid) -> Result<Vec<ScorableItem>, EngineError> {
        let state = self.read()?;
        state.require_cohort(cohort_id)?;
        let mut items: Vec<ScorableItem> = state
            .items
            .iter()
            .filter(|i| i.cohort_id == cohort_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sort_order);
        Ok(items)
    }

    async fn rated_ballots(&self, cohort_id: Uuid) -> Result<Vec<RatedBallot>, EngineError> {
        let state = self.read()?;
        state.require_cohort(cohort_id)?;
        Ok(state
            .ratings
            .iter()
            .filter(|r| state.in_cohort(r.candidate_id, cohort_id))
            .map(|rating| RatedBallot {
                rating: rating.clone(),
                scores: state
                    .scores
                    .iter()
                    .filter(|(rating_id, _)| *rating_id == rating.id)
                    .map(|(_, score)| score.clone())
                    .collect(),
            })
            .collect())
    }

    async fn board_members(&self, cohort_id: Uuid) -> Result<Vec<BoardMember>, EngineError> {
        let state = self.read()?;
        state.require_cohort(cohort_id)?;
        Ok(state.board.get(&cohort_id).cloned().unwrap_or_default())
    }

    async fn settings(&self, cohort_id: Uuid) -> Result<Option<CohortSettings>, EngineError> {
        Ok(self.read()?.settings.get(&cohort_id).copied())
    }

    async fn save_settings(
        &self,
        cohort_id: Uuid,
        settings: &CohortSettings,
    ) -> Result<(), EngineError> {
        let mut state = self.write()?;
        state.require_cohort(cohort_id)?;
        state.settings.insert(cohort_id, *settings);
        Ok(())
    }

    async fn write_ballot(
        &self,
        key: &RatingKey,
        kind: ItemKind,
        scores: &[RatingScore],
    ) -> Result<Uuid, EngineError> {
        let mut state = self.write()?;
        if !state.in_cohort(key.candidate_id, key.cohort_id) {
            return Err(EngineError::CandidateNotFound(key.candidate_id));
        }
        for score in scores {
            let known = score.item.kind() == kind
                && state.items.iter().any(|i| {
                    i.item == score.item && i.cohort_id == key.cohort_id && i.is_scorable
                });
            if !known {
                return Err(EngineError::ItemNotFound(score.item));
            }
        }

        let now = Utc::now();
        let existing = state.ratings.iter().position(|r| {
            r.candidate_id == key.candidate_id && r.rater == key.rater && r.phase == key.phase
        });
        let rating_id = match existing {
            Some(index) => {
                let rating = &mut state.ratings[index];
                rating.updated_at = now;
                rating.id
            }
            None => {
                let id = Uuid::new_v4();
                state.ratings.push(Rating {
                    id,
                    candidate_id: key.candidate_id,
                    rater: key.rater.clone(),
                    phase: key.phase,
                    updated_at: now,
                });
                id
            }
        };

        state
            .scores
            .retain(|(id, s)| !(*id == rating_id && s.item.kind() == kind));
        state
            .scores
            .extend(scores.iter().map(|s| (rating_id, s.clone())));
        Ok(rating_id)
    }
}
