use uuid::Uuid;

use crate::models::ItemRef;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unauthorized: submission has no rater identity")]
    Unauthorized,
    #[error("candidate {0} not found")]
    CandidateNotFound(Uuid),
    #[error("{0} not found or not scorable")]
    ItemNotFound(ItemRef),
    #[error("cohort {0} not found")]
    CohortNotFound(Uuid),
    #[error("weights must sum to 1.00, got {sum:.3}")]
    InvalidWeights { sum: f64 },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("invalid score {score} for {item}")]
    InvalidScore { item: ItemRef, score: f64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
