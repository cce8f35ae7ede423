use std::fmt;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Application,
    Interview,
    Character,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Application, Phase::Interview, Phase::Character];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Application => "application",
            Phase::Interview => "interview",
            Phase::Character => "character",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "application" | "app" => Ok(Phase::Application),
            "interview" | "int" => Ok(Phase::Interview),
            "character" | "char" => Ok(Phase::Character),
            other => Err(anyhow!(
                "invalid phase '{}'. expected one of: application | interview | character",
                other
            )),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Phase::Application => 0,
            Phase::Interview => 1,
            Phase::Character => 2,
        }
    }

    pub fn item_kind(&self) -> ItemKind {
        match self {
            Phase::Application | Phase::Interview => ItemKind::Question,
            Phase::Character => ItemKind::Trait,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Question,
    Trait,
}

/// Question and trait ids live in separate tables, so the kind is part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ItemRef {
    Question(Uuid),
    Trait(Uuid),
}

impl ItemRef {
    pub fn new(kind: ItemKind, id: Uuid) -> Self {
        match kind {
            ItemKind::Question => ItemRef::Question(id),
            ItemKind::Trait => ItemRef::Trait(id),
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            ItemRef::Question(_) => ItemKind::Question,
            ItemRef::Trait(_) => ItemKind::Trait,
        }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemRef::Question(id) => write!(f, "question {}", id),
            ItemRef::Trait(id) => write!(f, "trait {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaterIdentity {
    LiveUser(Uuid),
    HistoricalAlias(String),
}

impl RaterIdentity {
    /// Rebuilds the identity from the two mutually exclusive storage columns.
    pub fn from_columns(voter_id: Option<Uuid>, alias: Option<String>) -> Option<Self> {
        match (voter_id, alias) {
            (Some(id), _) => Some(RaterIdentity::LiveUser(id)),
            (None, Some(name)) if !name.trim().is_empty() => {
                Some(RaterIdentity::HistoricalAlias(name))
            }
            _ => None,
        }
    }

    pub fn voter_id(&self) -> Option<Uuid> {
        match self {
            RaterIdentity::LiveUser(id) => Some(*id),
            RaterIdentity::HistoricalAlias(_) => None,
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            RaterIdentity::LiveUser(_) => None,
            RaterIdentity::HistoricalAlias(name) => Some(name.as_str()),
        }
    }
}

impl fmt::Display for RaterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaterIdentity::LiveUser(id) => write!(f, "user {}", id),
            RaterIdentity::HistoricalAlias(name) => write!(f, "alias '{}'", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    pub cohort_id: Uuid,
    pub candidate_number: Option<i32>,
    pub custom_order: Option<i32>,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub is_active: bool,
}

impl Candidate {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorableItem {
    pub item: ItemRef,
    pub cohort_id: Uuid,
    pub label: String,
    pub category: Option<String>,
    pub sort_order: i32,
    pub is_scorable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RatingKey {
    pub candidate_id: Uuid,
    pub rater: RaterIdentity,
    pub cohort_id: Uuid,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rating {
    pub id: Uuid,
    pub candidate_id: Uuid,
    pub rater: RaterIdentity,
    pub phase: Phase,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatingScore {
    pub item: ItemRef,
    pub score: f64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RatedBallot {
    pub rating: Rating,
    pub scores: Vec<RatingScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotItem {
    pub item_id: Uuid,
    pub score: f64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// One submission. An empty `items` list is an explicit abstain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub candidate_id: Uuid,
    pub cohort_id: Uuid,
    pub phase: Phase,
    #[serde(default)]
    pub items: Vec<BallotItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMember {
    pub rater: RaterIdentity,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseWeights {
    pub application: f64,
    pub interview: f64,
    pub character: f64,
}

impl PhaseWeights {
    pub fn weight(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Application => self.application,
            Phase::Interview => self.interview,
            Phase::Character => self.character,
        }
    }

    pub fn sum(&self) -> f64 {
        self.application + self.interview + self.character
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CohortSettings {
    pub weights: PhaseWeights,
    pub outlier_std_devs: f64,
    pub top_n_display: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseAggregate {
    pub average: Option<f64>,
    pub raw_scores: Vec<f64>,
    pub outliers: Vec<f64>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseAggregates {
    pub application: PhaseAggregate,
    pub interview: PhaseAggregate,
    pub character: PhaseAggregate,
}

impl PhaseAggregates {
    pub fn get(&self, phase: Phase) -> &PhaseAggregate {
        match phase {
            Phase::Application => &self.application,
            Phase::Interview => &self.interview,
            Phase::Character => &self.character,
        }
    }

    pub fn get_mut(&mut self, phase: Phase) -> &mut PhaseAggregate {
        match phase {
            Phase::Application => &mut self.application,
            Phase::Interview => &mut self.interview,
            Phase::Character => &mut self.character,
        }
    }

    pub fn total_raw(&self) -> usize {
        Phase::ALL.iter().map(|p| self.get(*p).raw_scores.len()).sum()
    }

    pub fn total_outliers(&self) -> usize {
        Phase::ALL.iter().map(|p| self.get(*p).outliers.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct CandidateAggregate {
    pub candidate: Candidate,
    pub phases: PhaseAggregates,
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub rank: usize,
    pub candidate: Candidate,
    pub phases: PhaseAggregates,
    pub composite: Option<f64>,
    pub consistency: Option<u32>,
    pub highlighted: bool,
}

impl RankedCandidate {
    pub fn average(&self, phase: Phase) -> Option<f64> {
        self.phases.get(phase).average
    }

    pub fn outlier_count(&self, phase: Phase) -> usize {
        self.phases.get(phase).outliers.len()
    }

    pub fn has_outliers(&self) -> bool {
        self.phases.total_outliers() > 0
    }
}

#[derive(Debug, Clone)]
pub struct Leaderboard {
    pub cohort_id: Uuid,
    pub settings: CohortSettings,
    pub entries: Vec<RankedCandidate>,
}

#[derive(Debug, Clone)]
pub struct ItemBreakdown {
    pub phase: Phase,
    pub label: String,
    pub scores: Vec<f64>,
    pub mean: f64,
    pub std_dev: f64,
    pub outliers: Vec<f64>,
    pub adjusted_mean: f64,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaterProgress {
    pub rater: RaterIdentity,
    pub name: String,
    pub application: usize,
    pub interview: usize,
    pub character: usize,
    pub candidate_total: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

impl RaterProgress {
    pub fn count(&self, phase: Phase) -> usize {
        match phase {
            Phase::Application => self.application,
            Phase::Interview => self.interview,
            Phase::Character => self.character,
        }
    }
}
