use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    CycleKind, OpportunityScarcitySnapshot, PublishedPointer, ScopeKey, StudentScoreRecord,
    SCARCITY_POINTER_KEY,
};
use crate::ranking::assign_ranks;
use crate::store::SnapshotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Pending,
    Computing,
    Staged,
    Published,
    Failed,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Pending => "pending",
            CycleState::Computing => "computing",
            CycleState::Staged => "staged",
            CycleState::Published => "published",
            CycleState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Published | CycleState::Failed)
    }

    /// PENDING → COMPUTING → STAGED → PUBLISHED, with FAILED reachable from any
    /// non-terminal state.
    pub fn advance(self, next: CycleState) -> Result<CycleState> {
        let allowed = matches!(
            (self, next),
            (CycleState::Pending, CycleState::Computing)
                | (CycleState::Computing, CycleState::Staged)
                | (CycleState::Staged, CycleState::Published)
                | (
                    CycleState::Pending | CycleState::Computing | CycleState::Staged,
                    CycleState::Failed
                )
        );
        if allowed {
            Ok(next)
        } else {
            Err(EngineError::ConsistencyViolation(format!(
                "illegal cycle transition {self} -> {next}"
            )))
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleState {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(CycleState::Pending),
            "computing" => Ok(CycleState::Computing),
            "staged" => Ok(CycleState::Staged),
            "published" => Ok(CycleState::Published),
            "failed" => Ok(CycleState::Failed),
            other => Err(EngineError::ConsistencyViolation(format!(
                "unknown cycle state {other}"
            ))),
        }
    }
}

/// Computes the pointer that results from publishing `cycle_id` for `period`.
///
/// Recomputing the current period keeps the existing previous period so movement stays
/// comparable. Publishing a period older than the current one is refused.
pub fn swap_pointer(
    existing: Option<&PublishedPointer>,
    key: &str,
    cycle_id: Uuid,
    period: NaiveDate,
    published_at: DateTime<Utc>,
) -> Result<PublishedPointer> {
    let (previous_cycle, previous_period) = match existing {
        None => (None, None),
        Some(current) if current.current_period == period => {
            (current.previous_cycle, current.previous_period)
        }
        Some(current) if current.current_period < period => {
            (Some(current.current_cycle), Some(current.current_period))
        }
        Some(current) => {
            return Err(EngineError::Validation(format!(
                "{key}: period {period} is older than published {}",
                current.current_period
            )));
        }
    };

    Ok(PublishedPointer {
        key: key.to_string(),
        current_cycle: cycle_id,
        current_period: period,
        previous_cycle,
        previous_period,
        published_at,
    })
}

/// The published cycle a new computation for `period` should compare against.
pub fn baseline_cycle(pointer: Option<&PublishedPointer>, period: NaiveDate) -> Option<Uuid> {
    match pointer {
        Some(pointer) if pointer.current_period == period => pointer.previous_cycle,
        Some(pointer) if pointer.current_period < period => Some(pointer.current_cycle),
        _ => None,
    }
}

async fn previous_ranks<S: SnapshotStore>(
    store: &S,
    key: &str,
    period: NaiveDate,
) -> Result<HashMap<Uuid, u32>> {
    let pointer = store.pointer(key).await?;
    let Some(cycle_id) = baseline_cycle(pointer.as_ref(), period) else {
        return Ok(HashMap::new());
    };
    let entries = store.ranks(cycle_id, usize::MAX, 0).await?;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.student_id, entry.rank))
        .collect())
}

/// Runs `body` inside a fresh cycle and publishes on success. Any error marks the cycle
/// failed and leaves the pointer where it was.
async fn run_cycle<S, F, Fut>(
    store: &S,
    kind: CycleKind,
    key: &str,
    period: NaiveDate,
    body: F,
) -> Result<PublishedPointer>
where
    S: SnapshotStore,
    F: FnOnce(Uuid) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let cycle_id = store.begin_cycle(kind, key, period).await?;
    info!(%cycle_id, kind = kind.as_str(), key, %period, "cycle started");

    let outcome = async {
        store
            .transition(cycle_id, CycleState::Computing, None)
            .await?;
        body(cycle_id).await?;
        store.transition(cycle_id, CycleState::Staged, None).await?;
        store.publish(cycle_id).await
    }
    .await;

    match outcome {
        Ok(pointer) => {
            info!(%cycle_id, key, %period, "cycle published");
            Ok(pointer)
        }
        Err(err) => {
            error!(%cycle_id, key, %period, error = %err, "cycle failed");
            if let Err(mark_err) = store
                .transition(cycle_id, CycleState::Failed, Some(&err.to_string()))
                .await
            {
                error!(%cycle_id, error = %mark_err, "could not mark cycle failed");
            }
            Err(err)
        }
    }
}

/// Ranks one scope for `period` and publishes it atomically.
pub async fn publish_ranks<S: SnapshotStore>(
    store: &S,
    scope: &ScopeKey,
    period: NaiveDate,
    records: &[StudentScoreRecord],
) -> Result<PublishedPointer> {
    let key = scope.pointer_key();
    run_cycle(store, CycleKind::Rank, &key, period, |cycle_id| {
        let key = key.clone();
        async move {
            let previous = previous_ranks(store, &key, period).await?;
            let entries = assign_ranks(scope, period, records, &previous)?;
            store.stage_ranks(cycle_id, &entries).await?;
            store.stage_scores(cycle_id, records).await
        }
    })
    .await
}

pub async fn publish_scarcity<S: SnapshotStore>(
    store: &S,
    computed_at: DateTime<Utc>,
    snapshots: &[OpportunityScarcitySnapshot],
) -> Result<PublishedPointer> {
    let period = computed_at.date_naive();
    run_cycle(
        store,
        CycleKind::Scarcity,
        SCARCITY_POINTER_KEY,
        period,
        |cycle_id| async move { store.stage_scarcity(cycle_id, snapshots).await },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RankEntry;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn period(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
    }

    fn record(score: f64) -> StudentScoreRecord {
        let as_of = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();
        StudentScoreRecord {
            student_id: Uuid::new_v4(),
            technical: None,
            behavioral: None,
            contextual: None,
            composite_score: score,
            weights_used: BTreeMap::new(),
            completed_at: as_of - Duration::days(1),
            as_of,
        }
    }

    async fn published(store: &MemoryStore, scope: &ScopeKey) -> Vec<RankEntry> {
        let pointer = store.pointer(&scope.pointer_key()).await.unwrap().unwrap();
        store.ranks(pointer.current_cycle, usize::MAX, 0).await.unwrap()
    }

    #[test]
    fn state_machine_allows_only_forward_moves() {
        assert!(CycleState::Pending.advance(CycleState::Computing).is_ok());
        assert!(CycleState::Computing.advance(CycleState::Failed).is_ok());
        assert!(CycleState::Pending.advance(CycleState::Published).is_err());
        assert!(CycleState::Published.advance(CycleState::Failed).is_err());
        assert!(CycleState::Failed.advance(CycleState::Computing).is_err());
        assert_eq!("staged".parse::<CycleState>().unwrap(), CycleState::Staged);
    }

    #[test]
    fn swapping_same_period_keeps_previous() {
        let first = swap_pointer(None, "k", Uuid::new_v4(), period(5), Utc::now()).unwrap();
        let second =
            swap_pointer(Some(&first), "k", Uuid::new_v4(), period(12), Utc::now()).unwrap();
        assert_eq!(second.previous_cycle, Some(first.current_cycle));

        let rerun =
            swap_pointer(Some(&second), "k", Uuid::new_v4(), period(12), Utc::now()).unwrap();
        assert_eq!(rerun.previous_cycle, Some(first.current_cycle));
        assert_eq!(baseline_cycle(Some(&rerun), period(12)), Some(first.current_cycle));

        assert!(swap_pointer(Some(&rerun), "k", Uuid::new_v4(), period(5), Utc::now()).is_err());
    }

    #[tokio::test]
    async fn rerun_publishes_identical_entries() {
        let store = MemoryStore::new();
        let scope = ScopeKey::national();
        let records = vec![record(70.0), record(90.0), record(80.0)];

        publish_ranks(&store, &scope, period(12), &records).await.unwrap();
        let first = published(&store, &scope).await;
        publish_ranks(&store, &scope, period(12), &records).await.unwrap();
        let second = published(&store, &scope).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn failed_cycle_leaves_published_snapshot_visible() {
        let store = MemoryStore::new();
        let scope = ScopeKey::national();
        let records = vec![record(70.0), record(90.0)];

        let before = publish_ranks(&store, &scope, period(5), &records).await.unwrap();
        let visible = published(&store, &scope).await;

        store.fail_next_stages(1);
        let result = publish_ranks(&store, &scope, period(12), &records).await;
        assert!(matches!(result, Err(EngineError::ComputationFailure(_))));

        let after = store.pointer(&scope.pointer_key()).await.unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(published(&store, &scope).await, visible);

        publish_ranks(&store, &scope, period(5), &records).await.unwrap();
        let republished = published(&store, &scope).await;
        assert_eq!(republished, visible);
    }

    #[tokio::test]
    async fn failed_cycle_records_reason() {
        let store = MemoryStore::new();
        store.fail_next_stages(1);

        let err = publish_scarcity(&store, Utc::now(), &[]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.pointer(SCARCITY_POINTER_KEY).await.unwrap().is_none());
        assert_eq!(store.failure_reasons(), vec![err.to_string()]);
    }

    #[tokio::test]
    async fn movement_uses_prior_period() {
        let store = MemoryStore::new();
        let scope = ScopeKey::national();
        let mut records = vec![record(90.0), record(80.0)];
        publish_ranks(&store, &scope, period(5), &records).await.unwrap();

        records[1].composite_score = 95.0;
        publish_ranks(&store, &scope, period(12), &records).await.unwrap();
        let entries = published(&store, &scope).await;

        assert_eq!(entries[0].student_id, records[1].student_id);
        assert_eq!(entries[0].previous_rank, Some(2));
        assert_eq!(entries[0].movement, crate::models::Movement::Delta(1));
        assert_eq!(entries[1].movement, crate::models::Movement::Delta(-1));

        // recomputing the same period still compares against the 5th
        publish_ranks(&store, &scope, period(12), &records).await.unwrap();
        assert_eq!(published(&store, &scope).await, entries);
    }
}
