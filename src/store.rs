use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::Event;
use crate::models::{
    CycleKind, Opportunity, OpportunityScarcitySnapshot, PublishedPointer, RankEntry,
    StudentProfile, StudentScoreRecord,
};
use crate::publisher::{swap_pointer, CycleState};

/// Read side of the platform: who the students are, what they can apply to, what happened.
pub trait EventLog: Send + Sync {
    fn students(&self) -> impl Future<Output = Result<Vec<StudentProfile>>> + Send;

    fn opportunities(&self) -> impl Future<Output = Result<Vec<Opportunity>>> + Send;

    /// Validated events strictly before `until`, in occurrence order.
    fn events_before(
        &self,
        until: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Event>>> + Send;
}

/// Staging area plus the published pointers readers go through.
pub trait SnapshotStore: Send + Sync {
    /// Registers a new cycle in `Pending`.
    fn begin_cycle(
        &self,
        kind: CycleKind,
        key: &str,
        period: NaiveDate,
    ) -> impl Future<Output = Result<Uuid>> + Send;

    fn transition(
        &self,
        cycle_id: Uuid,
        next: CycleState,
        error: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Replaces whatever the cycle staged before. Only valid while `Computing`.
    fn stage_ranks(
        &self,
        cycle_id: Uuid,
        entries: &[RankEntry],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Score records behind the cycle's ranks, kept so each composite can be audited.
    fn stage_scores(
        &self,
        cycle_id: Uuid,
        records: &[StudentScoreRecord],
    ) -> impl Future<Output = Result<()>> + Send;

    fn stage_scarcity(
        &self,
        cycle_id: Uuid,
        snapshots: &[OpportunityScarcitySnapshot],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Swaps the cycle's pointer to it and marks it `Published` in one atomic step.
    fn publish(&self, cycle_id: Uuid) -> impl Future<Output = Result<PublishedPointer>> + Send;

    fn pointer(&self, key: &str) -> impl Future<Output = Result<Option<PublishedPointer>>> + Send;

    /// Entries ordered by rank.
    fn ranks(
        &self,
        cycle_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<RankEntry>>> + Send;

    fn rank_of(
        &self,
        cycle_id: Uuid,
        student_id: Uuid,
    ) -> impl Future<Output = Result<Option<RankEntry>>> + Send;

    fn score_of(
        &self,
        cycle_id: Uuid,
        student_id: Uuid,
    ) -> impl Future<Output = Result<Option<StudentScoreRecord>>> + Send;

    fn scarcity_of(
        &self,
        cycle_id: Uuid,
        opportunity_id: Uuid,
    ) -> impl Future<Output = Result<Option<OpportunityScarcitySnapshot>>> + Send;
}

#[derive(Debug, Clone)]
struct CycleRecord {
    kind: CycleKind,
    key: String,
    period: NaiveDate,
    state: CycleState,
    error: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    students: BTreeMap<Uuid, StudentProfile>,
    opportunities: BTreeMap<Uuid, Opportunity>,
    events: Vec<Event>,
    cycles: HashMap<Uuid, CycleRecord>,
    rank_rows: HashMap<Uuid, Vec<RankEntry>>,
    score_rows: HashMap<Uuid, Vec<StudentScoreRecord>>,
    scarcity_rows: HashMap<Uuid, Vec<OpportunityScarcitySnapshot>>,
    pointers: HashMap<String, PublishedPointer>,
    #[cfg(test)]
    stage_failures: u32,
}

impl MemoryState {
    fn cycle_mut(&mut self, cycle_id: Uuid) -> Result<&mut CycleRecord> {
        self.cycles
            .get_mut(&cycle_id)
            .ok_or_else(|| EngineError::ConsistencyViolation(format!("unknown cycle {cycle_id}")))
    }

    #[cfg(test)]
    fn injected_failure(&mut self) -> Result<()> {
        if self.stage_failures > 0 {
            self.stage_failures -= 1;
            return Err(EngineError::ComputationFailure("injected staging failure".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_failure(&mut self) -> Result<()> {
        Ok(())
    }

    fn check_staging(&mut self, cycle_id: Uuid) -> Result<()> {
        self.injected_failure()?;
        let cycle = self.cycle_mut(cycle_id)?;
        if cycle.state != CycleState::Computing {
            return Err(EngineError::ConsistencyViolation(format!(
                "cannot stage cycle {cycle_id} in state {}",
                cycle.state
            )));
        }
        Ok(())
    }

    /// Drops staged rows of finished cycles the pointer no longer references.
    fn prune(&mut self, pointer: &PublishedPointer) {
        let keep: HashSet<Uuid> = std::iter::once(pointer.current_cycle)
            .chain(pointer.previous_cycle)
            .collect();
        let stale: Vec<Uuid> = self
            .cycles
            .iter()
            .filter(|(id, cycle)| {
                cycle.key == pointer.key && cycle.state.is_terminal() && !keep.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.rank_rows.remove(&id);
            self.score_rows.remove(&id);
            self.scarcity_rows.remove(&id);
        }
    }
}

/// Process-local store used for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::ComputationFailure("memory store lock poisoned".into()))
    }

    pub fn upsert_student(&self, profile: StudentProfile) -> Result<()> {
        self.lock()?.students.insert(profile.student_id, profile);
        Ok(())
    }

    pub fn upsert_opportunity(&self, opportunity: Opportunity) -> Result<()> {
        self.lock()?
            .opportunities
            .insert(opportunity.opportunity_id, opportunity);
        Ok(())
    }

    pub fn append_event(&self, event: Event) -> Result<()> {
        self.lock()?.events.push(event);
        Ok(())
    }

    #[cfg(test)]
    pub fn fail_next_stages(&self, count: u32) {
        if let Ok(mut state) = self.lock() {
            state.stage_failures = count;
        }
    }

    #[cfg(test)]
    pub fn failure_reasons(&self) -> Vec<String> {
        self.lock()
            .map(|state| {
                state
                    .cycles
                    .values()
                    .filter(|cycle| cycle.state == CycleState::Failed)
                    .filter_map(|cycle| cycle.error.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl EventLog for MemoryStore {
    async fn students(&self) -> Result<Vec<StudentProfile>> {
        Ok(self.lock()?.students.values().cloned().collect())
    }

    async fn opportunities(&self) -> Result<Vec<Opportunity>> {
        Ok(self.lock()?.opportunities.values().cloned().collect())
    }

    async fn events_before(&self, until: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .lock()?
            .events
            .iter()
            .filter(|event| event.occurred_at < until)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.occurred_at);
        Ok(events)
    }
}

impl SnapshotStore for MemoryStore {
    async fn begin_cycle(&self, kind: CycleKind, key: &str, period: NaiveDate) -> Result<Uuid> {
        let cycle_id = Uuid::new_v4();
        self.lock()?.cycles.insert(
            cycle_id,
            CycleRecord {
                kind,
                key: key.to_string(),
                period,
                state: CycleState::Pending,
                error: None,
            },
        );
        Ok(cycle_id)
    }

    async fn transition(&self, cycle_id: Uuid, next: CycleState, error: Option<&str>) -> Result<()> {
        let mut state = self.lock()?;
        let cycle = state.cycle_mut(cycle_id)?;
        cycle.state = cycle.state.advance(next)?;
        cycle.error = error.map(str::to_string);
        tracing::debug!(%cycle_id, state = %cycle.state, error = ?cycle.error, "memory cycle moved");
        Ok(())
    }

    async fn stage_ranks(&self, cycle_id: Uuid, entries: &[RankEntry]) -> Result<()> {
        let mut state = self.lock()?;
        state.check_staging(cycle_id)?;
        state.rank_rows.insert(cycle_id, entries.to_vec());
        Ok(())
    }

    async fn stage_scores(&self, cycle_id: Uuid, records: &[StudentScoreRecord]) -> Result<()> {
        let mut state = self.lock()?;
        state.check_staging(cycle_id)?;
        state.score_rows.insert(cycle_id, records.to_vec());
        Ok(())
    }

    async fn stage_scarcity(
        &self,
        cycle_id: Uuid,
        snapshots: &[OpportunityScarcitySnapshot],
    ) -> Result<()> {
        let mut state = self.lock()?;
        state.check_staging(cycle_id)?;
        state.scarcity_rows.insert(cycle_id, snapshots.to_vec());
        Ok(())
    }

    async fn publish(&self, cycle_id: Uuid) -> Result<PublishedPointer> {
        let mut state = self.lock()?;
        let cycle = state.cycle_mut(cycle_id)?.clone();
        let next_state = cycle.state.advance(CycleState::Published)?;
        let pointer = swap_pointer(
            state.pointers.get(&cycle.key),
            &cycle.key,
            cycle_id,
            cycle.period,
            Utc::now(),
        )?;

        state.cycle_mut(cycle_id)?.state = next_state;
        state.pointers.insert(cycle.key.clone(), pointer.clone());
        state.prune(&pointer);
        tracing::debug!(kind = cycle.kind.as_str(), key = %cycle.key, "memory pointer swapped");
        Ok(pointer)
    }

    async fn pointer(&self, key: &str) -> Result<Option<PublishedPointer>> {
        Ok(self.lock()?.pointers.get(key).cloned())
    }

    async fn ranks(&self, cycle_id: Uuid, limit: usize, offset: usize) -> Result<Vec<RankEntry>> {
        let state = self.lock()?;
        let mut entries = state.rank_rows.get(&cycle_id).cloned().unwrap_or_default();
        entries.sort_by_key(|entry| entry.rank);
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn rank_of(&self, cycle_id: Uuid, student_id: Uuid) -> Result<Option<RankEntry>> {
        Ok(self.lock()?.rank_rows.get(&cycle_id).and_then(|entries| {
            entries
                .iter()
                .find(|entry| entry.student_id == student_id)
                .cloned()
        }))
    }

    async fn score_of(&self, cycle_id: Uuid, student_id: Uuid) -> Result<Option<StudentScoreRecord>> {
        Ok(self.lock()?.score_rows.get(&cycle_id).and_then(|records| {
            records
                .iter()
                .find(|record| record.student_id == student_id)
                .cloned()
        }))
    }

    async fn scarcity_of(
        &self,
        cycle_id: Uuid,
        opportunity_id: Uuid,
    ) -> Result<Option<OpportunityScarcitySnapshot>> {
        Ok(self.lock()?.scarcity_rows.get(&cycle_id).and_then(|snapshots| {
            snapshots
                .iter()
                .find(|snapshot| snapshot.opportunity_id == opportunity_id)
                .cloned()
        }))
    }
}
