use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Movement, RankEntry, Scope, ScopeKey, StudentProfile, StudentScoreRecord};
use crate::scoring::leaderboard_order;

/// Splits scored students into every leaderboard they belong to.
///
/// Each student lands in their college, their state and the national board. Students
/// without a profile only appear nationally.
pub fn partition_by_scope(
    records: &[StudentScoreRecord],
    profiles: &HashMap<Uuid, StudentProfile>,
) -> BTreeMap<ScopeKey, Vec<StudentScoreRecord>> {
    let mut scopes: BTreeMap<ScopeKey, Vec<StudentScoreRecord>> = BTreeMap::new();

    for record in records {
        scopes
            .entry(ScopeKey::national())
            .or_default()
            .push(record.clone());

        if let Some(profile) = profiles.get(&record.student_id) {
            scopes
                .entry(ScopeKey::new(Scope::College, profile.college_id.clone()))
                .or_default()
                .push(record.clone());
            scopes
                .entry(ScopeKey::new(Scope::State, profile.state.clone()))
                .or_default()
                .push(record.clone());
        }
    }

    scopes
}

pub fn percentile(rank: u32, total_in_scope: u32) -> f64 {
    (total_in_scope - rank) as f64 / total_in_scope as f64 * 100.0
}

/// Orders one scope and assigns dense 1-based ranks.
///
/// `previous` maps student ids to their rank in the prior published period of the same
/// scope.
pub fn assign_ranks(
    scope: &ScopeKey,
    period: NaiveDate,
    records: &[StudentScoreRecord],
    previous: &HashMap<Uuid, u32>,
) -> Result<Vec<RankEntry>> {
    let mut ordered: Vec<&StudentScoreRecord> = records.iter().collect();
    ordered.sort_by(|a, b| leaderboard_order(a, b));

    let total_in_scope = u32::try_from(ordered.len()).map_err(|_| {
        EngineError::ComputationFailure(format!("scope {scope} exceeds u32 students"))
    })?;

    let entries: Vec<RankEntry> = ordered
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let rank = index as u32 + 1;
            let previous_rank = previous.get(&record.student_id).copied();
            let movement = match previous_rank {
                Some(before) => Movement::Delta(before as i64 - rank as i64),
                None => Movement::New,
            };
            RankEntry {
                scope: scope.scope,
                scope_id: scope.scope_id.clone(),
                student_id: record.student_id,
                period,
                rank,
                percentile: percentile(rank, total_in_scope),
                previous_rank,
                movement,
                total_in_scope,
                composite_score: record.composite_score,
            }
        })
        .collect();

    verify_ranks(scope, &entries)?;
    Ok(entries)
}

/// Checks the dense-rank invariant before anything is staged.
pub fn verify_ranks(scope: &ScopeKey, entries: &[RankEntry]) -> Result<()> {
    let total = entries.len();
    let mut seen_ranks = vec![false; total];
    let mut seen_students = HashSet::with_capacity(total);

    for entry in entries {
        if entry.scope != scope.scope || entry.scope_id != scope.scope_id {
            return Err(EngineError::ConsistencyViolation(format!(
                "entry for {} staged under {scope}",
                entry.student_id
            )));
        }
        if entry.total_in_scope as usize != total {
            return Err(EngineError::ConsistencyViolation(format!(
                "{scope}: total_in_scope {} but {total} entries",
                entry.total_in_scope
            )));
        }
        let slot = (entry.rank as usize)
            .checked_sub(1)
            .filter(|slot| *slot < total)
            .ok_or_else(|| {
                EngineError::ConsistencyViolation(format!(
                    "{scope}: rank {} outside 1..={total}",
                    entry.rank
                ))
            })?;
        if std::mem::replace(&mut seen_ranks[slot], true) {
            return Err(EngineError::ConsistencyViolation(format!(
                "{scope}: rank {} assigned twice",
                entry.rank
            )));
        }
        if !seen_students.insert(entry.student_id) {
            return Err(EngineError::ConsistencyViolation(format!(
                "{scope}: student {} ranked twice",
                entry.student_id
            )));
        }
    }

    Ok(())
}
