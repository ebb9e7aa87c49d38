use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Technical,
    Behavioral,
    Contextual,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [
        Dimension::Technical,
        Dimension::Behavioral,
        Dimension::Contextual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Technical => "technical",
            Dimension::Behavioral => "behavioral",
            Dimension::Contextual => "contextual",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    College,
    State,
    National,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::College => "college",
            Scope::State => "state",
            Scope::National => "national",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "college" => Ok(Scope::College),
            "state" => Ok(Scope::State),
            "national" => Ok(Scope::National),
            other => Err(EngineError::Validation(format!("unknown scope {other}"))),
        }
    }
}

pub const NATIONAL_SCOPE_ID: &str = "national";

/// One leaderboard: a scope plus the college id or state code it covers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope: Scope,
    pub scope_id: String,
}

impl ScopeKey {
    pub fn new(scope: Scope, scope_id: impl Into<String>) -> Self {
        Self {
            scope,
            scope_id: scope_id.into(),
        }
    }

    pub fn national() -> Self {
        Self::new(Scope::National, NATIONAL_SCOPE_ID)
    }

    /// Name of the published pointer guarding this scope.
    pub fn pointer_key(&self) -> String {
        format!("rank:{}:{}", self.scope, self.scope_id)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.scope_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentProfile {
    pub student_id: Uuid,
    pub college_id: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opportunity {
    pub opportunity_id: Uuid,
    pub category: String,
    pub deadline: Option<DateTime<Utc>>,
    pub total_spots: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentAttempt {
    pub student_id: Uuid,
    pub dimension: Dimension,
    pub raw_score: f64,
    pub completed_at: DateTime<Utc>,
    pub item_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub mean: f64,
    pub confidence: f64,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentScoreRecord {
    pub student_id: Uuid,
    pub technical: Option<DimensionScore>,
    pub behavioral: Option<DimensionScore>,
    pub contextual: Option<DimensionScore>,
    pub composite_score: f64,
    /// Weights after renormalising over the dimensions that had attempts.
    pub weights_used: BTreeMap<Dimension, f64>,
    pub completed_at: DateTime<Utc>,
    pub as_of: DateTime<Utc>,
}

impl StudentScoreRecord {
    pub fn dimension(&self, dimension: Dimension) -> Option<&DimensionScore> {
        match dimension {
            Dimension::Technical => self.technical.as_ref(),
            Dimension::Behavioral => self.behavioral.as_ref(),
            Dimension::Contextual => self.contextual.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "delta", rename_all = "snake_case")]
pub enum Movement {
    New,
    /// Positive means the student moved up.
    Delta(i64),
}

impl fmt::Display for Movement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Movement::New => f.write_str("new"),
            Movement::Delta(0) => f.write_str("="),
            Movement::Delta(delta) if *delta > 0 => write!(f, "+{delta}"),
            Movement::Delta(delta) => write!(f, "{delta}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub scope: Scope,
    pub scope_id: String,
    pub student_id: Uuid,
    pub period: NaiveDate,
    pub rank: u32,
    pub percentile: f64,
    pub previous_rank: Option<u32>,
    pub movement: Movement,
    pub total_in_scope: u32,
    pub composite_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClosingIn {
    Time { hours: i64 },
    Spots { count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityScarcitySnapshot {
    pub opportunity_id: Uuid,
    pub total_applications: u32,
    pub recent_applications: u32,
    pub applications_from_college: BTreeMap<String, u32>,
    pub spots_remaining: Option<u32>,
    pub closing_in: Option<ClosingIn>,
    pub urgency: Urgency,
    pub demand_level: DemandLevel,
    pub computed_at: DateTime<Utc>,
}

/// Scarcity as seen by one viewer: raw per-college counts projected onto their college.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScarcityView {
    pub snapshot: OpportunityScarcitySnapshot,
    pub from_your_college: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Rank,
    Scarcity,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Rank => "rank",
            CycleKind::Scarcity => "scarcity",
        }
    }
}

pub const SCARCITY_POINTER_KEY: &str = "scarcity";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPointer {
    pub key: String,
    pub current_cycle: Uuid,
    pub current_period: NaiveDate,
    pub previous_cycle: Option<Uuid>,
    pub previous_period: Option<NaiveDate>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub published: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CycleSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
