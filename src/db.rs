use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::{Event, EventBody, RawEvent};
use crate::ingest::IngestedEvent;
use crate::models::{
    CycleKind, Dimension, Movement, Opportunity, OpportunityScarcitySnapshot, PublishedPointer,
    RankEntry, StudentProfile, StudentScoreRecord,
};
use crate::publisher::{swap_pointer, CycleState};
use crate::store::{EventLog, SnapshotStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed event log and snapshot store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn upsert_students(&self, students: &[StudentProfile]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for student in students {
            sqlx::query(
                r#"
                INSERT INTO layersrank.students (id, college_id, state)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE
                SET college_id = EXCLUDED.college_id, state = EXCLUDED.state
                "#,
            )
            .bind(student.student_id)
            .bind(&student.college_id)
            .bind(&student.state)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(students.len())
    }

    pub async fn upsert_opportunities(&self, opportunities: &[Opportunity]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for opportunity in opportunities {
            sqlx::query(
                r#"
                INSERT INTO layersrank.opportunities (id, category, deadline, total_spots)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE
                SET category = EXCLUDED.category,
                    deadline = EXCLUDED.deadline,
                    total_spots = EXCLUDED.total_spots
                "#,
            )
            .bind(opportunity.opportunity_id)
            .bind(&opportunity.category)
            .bind(opportunity.deadline)
            .bind(opportunity.total_spots.map(|spots| spots as i32))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(opportunities.len())
    }

    /// Inserts validated events. Rows whose source key already exists are skipped.
    pub async fn insert_events(&self, events: &[IngestedEvent]) -> Result<usize> {
        let mut inserted = 0usize;
        let mut tx = self.pool.begin().await?;
        for ingested in events {
            let raw = ingested.event.to_raw();
            let result = sqlx::query(
                r#"
                INSERT INTO layersrank.events
                (id, source_key, event_type, student_id, opportunity_id, occurred_at, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&ingested.source_key)
            .bind(&raw.event_type)
            .bind(ingested.event.student_id)
            .bind(raw.opportunity_id)
            .bind(raw.occurred_at)
            .bind(&raw.payload)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn load_state(tx: &mut Transaction<'_, Postgres>, cycle_id: Uuid) -> Result<(String, NaiveDate, CycleState)> {
        let row = sqlx::query(
            "SELECT pointer_key, period, state FROM layersrank.cycles WHERE id = $1 FOR UPDATE",
        )
        .bind(cycle_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| EngineError::ConsistencyViolation(format!("unknown cycle {cycle_id}")))?;

        let state: String = row.get("state");
        Ok((row.get("pointer_key"), row.get("period"), state.parse()?))
    }

    async fn ensure_computing(&self, tx: &mut Transaction<'_, Postgres>, cycle_id: Uuid) -> Result<()> {
        let (_, _, state) = Self::load_state(tx, cycle_id).await?;
        if state != CycleState::Computing {
            return Err(EngineError::ConsistencyViolation(format!(
                "cannot stage cycle {cycle_id} in state {state}"
            )));
        }
        Ok(())
    }
}

fn pointer_from_row(row: &PgRow) -> PublishedPointer {
    PublishedPointer {
        key: row.get("pointer_key"),
        current_cycle: row.get("current_cycle"),
        current_period: row.get("current_period"),
        previous_cycle: row.get("previous_cycle"),
        previous_period: row.get("previous_period"),
        published_at: row.get("published_at"),
    }
}

fn rank_from_row(row: &PgRow) -> Result<RankEntry> {
    let scope: String = row.get("scope");
    let rank: i32 = row.get("rank");
    let previous_rank: Option<i32> = row.get("previous_rank");
    let total: i32 = row.get("total_in_scope");
    let movement = match previous_rank {
        Some(before) => Movement::Delta(before as i64 - rank as i64),
        None => Movement::New,
    };

    Ok(RankEntry {
        scope: scope.parse()?,
        scope_id: row.get("scope_id"),
        student_id: row.get("student_id"),
        period: row.get("period"),
        rank: rank as u32,
        percentile: row.get("percentile"),
        previous_rank: previous_rank.map(|value| value as u32),
        movement,
        total_in_scope: total as u32,
        composite_score: row.get("composite_score"),
    })
}

const RANK_COLUMNS: &str = "scope, scope_id, student_id, period, rank, percentile, \
     previous_rank, total_in_scope, composite_score";

impl EventLog for PgStore {
    async fn students(&self) -> Result<Vec<StudentProfile>> {
        let rows = sqlx::query("SELECT id, college_id, state FROM layersrank.students ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| StudentProfile {
                student_id: row.get("id"),
                college_id: row.get("college_id"),
                state: row.get("state"),
            })
            .collect())
    }

    async fn opportunities(&self) -> Result<Vec<Opportunity>> {
        let rows = sqlx::query(
            "SELECT id, category, deadline, total_spots FROM layersrank.opportunities ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let total_spots: Option<i32> = row.get("total_spots");
                Opportunity {
                    opportunity_id: row.get("id"),
                    category: row.get("category"),
                    deadline: row.get("deadline"),
                    total_spots: total_spots.map(|spots| spots.max(0) as u32),
                }
            })
            .collect())
    }

    async fn events_before(&self, until: DateTime<Utc>) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT event_type, student_id, opportunity_id, occurred_at, payload
            FROM layersrank.events
            WHERE occurred_at < $1
            ORDER BY occurred_at, seq
            "#,
        )
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let raw = RawEvent {
                event_type: row.get("event_type"),
                student_id: row.get("student_id"),
                opportunity_id: row.get("opportunity_id"),
                occurred_at: row.get("occurred_at"),
                payload: row.get("payload"),
            };
            // Rows were validated on the way in; a failure here means the table was edited by hand.
            match raw.validate() {
                Ok(event) => events.push(event),
                Err(err) => warn!(error = %err, "skipping stored event that no longer validates"),
            }
        }
        Ok(events)
    }
}

impl SnapshotStore for PgStore {
    async fn begin_cycle(&self, kind: CycleKind, key: &str, period: NaiveDate) -> Result<Uuid> {
        let cycle_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO layersrank.cycles (id, kind, pointer_key, period, state)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(cycle_id)
        .bind(kind.as_str())
        .bind(key)
        .bind(period)
        .bind(CycleState::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(cycle_id)
    }

    async fn transition(&self, cycle_id: Uuid, next: CycleState, error: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let (_, _, current) = Self::load_state(&mut tx, cycle_id).await?;
        let next = current.advance(next)?;
        sqlx::query(
            "UPDATE layersrank.cycles SET state = $2, error = $3, updated_at = now() WHERE id = $1",
        )
        .bind(cycle_id)
        .bind(next.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn stage_ranks(&self, cycle_id: Uuid, entries: &[RankEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.ensure_computing(&mut tx, cycle_id).await?;
        sqlx::query("DELETE FROM layersrank.rank_entries WHERE cycle_id = $1")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO layersrank.rank_entries
                (cycle_id, scope, scope_id, student_id, period, rank, percentile,
                 previous_rank, total_in_scope, composite_score)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(cycle_id)
            .bind(entry.scope.as_str())
            .bind(&entry.scope_id)
            .bind(entry.student_id)
            .bind(entry.period)
            .bind(entry.rank as i32)
            .bind(entry.percentile)
            .bind(entry.previous_rank.map(|rank| rank as i32))
            .bind(entry.total_in_scope as i32)
            .bind(entry.composite_score)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(%cycle_id, rows = entries.len(), "staged rank entries");
        Ok(())
    }

    async fn stage_scores(&self, cycle_id: Uuid, records: &[StudentScoreRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.ensure_computing(&mut tx, cycle_id).await?;
        sqlx::query("DELETE FROM layersrank.score_records WHERE cycle_id = $1")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?;

        for record in records {
            let body = serde_json::to_value(record)
                .map_err(|err| EngineError::ComputationFailure(err.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO layersrank.score_records (cycle_id, student_id, record)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(cycle_id)
            .bind(record.student_id)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(%cycle_id, rows = records.len(), "staged score records");
        Ok(())
    }

    async fn stage_scarcity(
        &self,
        cycle_id: Uuid,
        snapshots: &[OpportunityScarcitySnapshot],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.ensure_computing(&mut tx, cycle_id).await?;
        sqlx::query("DELETE FROM layersrank.scarcity_snapshots WHERE cycle_id = $1")
            .bind(cycle_id)
            .execute(&mut *tx)
            .await?;

        for snapshot in snapshots {
            let body = serde_json::to_value(snapshot)
                .map_err(|err| EngineError::ComputationFailure(err.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO layersrank.scarcity_snapshots (cycle_id, opportunity_id, snapshot)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(cycle_id)
            .bind(snapshot.opportunity_id)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(%cycle_id, rows = snapshots.len(), "staged scarcity snapshots");
        Ok(())
    }

    async fn publish(&self, cycle_id: Uuid) -> Result<PublishedPointer> {
        let mut tx = self.pool.begin().await?;
        let (key, period, state) = Self::load_state(&mut tx, cycle_id).await?;
        let next = state.advance(CycleState::Published)?;

        // Serialises publishers of the same key, including the first one when no row exists yet.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(
            r#"
            SELECT pointer_key, current_cycle, current_period, previous_cycle,
                   previous_period, published_at
            FROM layersrank.published_pointers
            WHERE pointer_key = $1
            FOR UPDATE
            "#,
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| pointer_from_row(&row));

        let pointer = swap_pointer(existing.as_ref(), &key, cycle_id, period, Utc::now())?;

        sqlx::query(
            r#"
            INSERT INTO layersrank.published_pointers
            (pointer_key, current_cycle, current_period, previous_cycle, previous_period, published_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (pointer_key) DO UPDATE
            SET current_cycle = EXCLUDED.current_cycle,
                current_period = EXCLUDED.current_period,
                previous_cycle = EXCLUDED.previous_cycle,
                previous_period = EXCLUDED.previous_period,
                published_at = EXCLUDED.published_at
            "#,
        )
        .bind(&pointer.key)
        .bind(pointer.current_cycle)
        .bind(pointer.current_period)
        .bind(pointer.previous_cycle)
        .bind(pointer.previous_period)
        .bind(pointer.published_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE layersrank.cycles SET state = $2, updated_at = now() WHERE id = $1")
            .bind(cycle_id)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await?;

        // Staged rows cascade with their cycle.
        let pruned = sqlx::query(
            r#"
            DELETE FROM layersrank.cycles
            WHERE pointer_key = $1
              AND state IN ('published', 'failed')
              AND id <> $2
              AND id IS DISTINCT FROM $3
            "#,
        )
        .bind(&pointer.key)
        .bind(pointer.current_cycle)
        .bind(pointer.previous_cycle)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(key = %pointer.key, pruned = pruned.rows_affected(), "pointer swapped");
        Ok(pointer)
    }

    async fn pointer(&self, key: &str) -> Result<Option<PublishedPointer>> {
        let row = sqlx::query(
            r#"
            SELECT pointer_key, current_cycle, current_period, previous_cycle,
                   previous_period, published_at
            FROM layersrank.published_pointers
            WHERE pointer_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| pointer_from_row(&row)))
    }

    async fn ranks(&self, cycle_id: Uuid, limit: usize, offset: usize) -> Result<Vec<RankEntry>> {
        let query = format!(
            "SELECT {RANK_COLUMNS} FROM layersrank.rank_entries \
             WHERE cycle_id = $1 ORDER BY rank LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&query)
            .bind(cycle_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rank_from_row).collect()
    }

    async fn rank_of(&self, cycle_id: Uuid, student_id: Uuid) -> Result<Option<RankEntry>> {
        let query = format!(
            "SELECT {RANK_COLUMNS} FROM layersrank.rank_entries \
             WHERE cycle_id = $1 AND student_id = $2"
        );
        let row = sqlx::query(&query)
            .bind(cycle_id)
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rank_from_row).transpose()
    }

    async fn score_of(&self, cycle_id: Uuid, student_id: Uuid) -> Result<Option<StudentScoreRecord>> {
        let row = sqlx::query(
            "SELECT record FROM layersrank.score_records WHERE cycle_id = $1 AND student_id = $2",
        )
        .bind(cycle_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let body: serde_json::Value = row.get("record");
            serde_json::from_value(body)
                .map_err(|err| EngineError::ComputationFailure(format!("corrupt score record: {err}")))
        })
        .transpose()
    }

    async fn scarcity_of(
        &self,
        cycle_id: Uuid,
        opportunity_id: Uuid,
    ) -> Result<Option<OpportunityScarcitySnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT snapshot FROM layersrank.scarcity_snapshots
            WHERE cycle_id = $1 AND opportunity_id = $2
            "#,
        )
        .bind(cycle_id)
        .bind(opportunity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let body: serde_json::Value = row.get("snapshot");
            serde_json::from_value(body)
                .map_err(|err| EngineError::ComputationFailure(format!("corrupt snapshot: {err}")))
        })
        .transpose()
    }
}

/// Demo dataset: two colleges in one state, a handful of assessments and applications.
pub async fn seed(store: &PgStore) -> anyhow::Result<()> {
    let avery = Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?;
    let jules = Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?;
    let kiara = Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?;
    let internship = Uuid::parse_str("8f1d3c2e-6b4a-4c1f-9e7d-2a5b6c7d8e9f")?;

    store
        .upsert_students(&[
            StudentProfile {
                student_id: avery,
                college_id: "iit-bombay".into(),
                state: "MH".into(),
            },
            StudentProfile {
                student_id: jules,
                college_id: "coep".into(),
                state: "MH".into(),
            },
            StudentProfile {
                student_id: kiara,
                college_id: "iit-bombay".into(),
                state: "MH".into(),
            },
        ])
        .await?;

    let base = Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).single().ok_or_else(|| {
        anyhow::anyhow!("invalid seed timestamp")
    })?;

    store
        .upsert_opportunities(&[Opportunity {
            opportunity_id: internship,
            category: "sde-intern".into(),
            deadline: Some(base + Duration::days(30)),
            total_spots: Some(10),
        }])
        .await?;

    let assessments = [
        ("seed-001", avery, Dimension::Technical, 90.0, 30),
        ("seed-002", avery, Dimension::Behavioral, 80.0, 20),
        ("seed-003", avery, Dimension::Contextual, 70.0, 20),
        ("seed-004", jules, Dimension::Technical, 85.0, 30),
        ("seed-005", jules, Dimension::Behavioral, 85.0, 20),
        ("seed-006", jules, Dimension::Contextual, 85.0, 20),
        ("seed-007", kiara, Dimension::Technical, 78.0, 12),
    ];

    let mut events: Vec<IngestedEvent> = assessments
        .iter()
        .enumerate()
        .map(|(index, (key, student_id, dimension, raw_score, item_count))| IngestedEvent {
            source_key: key.to_string(),
            event: Event {
                student_id: *student_id,
                occurred_at: base + Duration::hours(index as i64),
                body: EventBody::AssessmentCompleted {
                    dimension: *dimension,
                    raw_score: *raw_score,
                    item_count: *item_count,
                },
            },
        })
        .collect();

    for (index, (student_id, college)) in [(avery, "iit-bombay"), (jules, "coep"), (kiara, "iit-bombay")]
        .into_iter()
        .enumerate()
    {
        events.push(IngestedEvent {
            source_key: format!("seed-app-{index}"),
            event: Event {
                student_id,
                occurred_at: base + Duration::days(2) + Duration::hours(index as i64),
                body: EventBody::ApplicationSubmitted {
                    opportunity_id: internship,
                    college_id: college.into(),
                },
            },
        });
    }

    store.insert_events(&events).await?;
    Ok(())
}
