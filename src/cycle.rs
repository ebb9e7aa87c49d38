use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{EngineConfig, RankCadence};
use crate::error::{EngineError, Result};
use crate::events::{application_events_by_opportunity, assessment_attempts};
use crate::models::{CycleSummary, PublishedPointer};
use crate::publisher::{publish_ranks, publish_scarcity};
use crate::ranking::partition_by_scope;
use crate::scarcity::compute_snapshots;
use crate::scheduler::retry_with_backoff;
use crate::scoring::aggregate_all;
use crate::store::{EventLog, SnapshotStore};

/// Scores for `period` are taken as of midnight UTC at the period's end.
pub fn period_as_of(period: NaiveDate, cadence: RankCadence) -> DateTime<Utc> {
    (period + cadence.length()).and_time(NaiveTime::MIN).and_utc()
}

/// The latest period that has fully ended by `today`.
pub fn last_closed_period(today: NaiveDate, cadence: RankCadence) -> NaiveDate {
    cadence.period_start(today) - cadence.length()
}

/// Recomputes every leaderboard for `period`.
///
/// Scopes are independent: each runs in its own task and its own cycle, so one failing
/// scope leaves the others published.
pub async fn run_rank_cycle<S>(
    store: Arc<S>,
    config: Arc<EngineConfig>,
    period: NaiveDate,
) -> Result<CycleSummary>
where
    S: EventLog + SnapshotStore + 'static,
{
    let period = config.rank_cadence.period_start(period);
    let as_of = period_as_of(period, config.rank_cadence);

    let (students, events) = retry_with_backoff(&config.retry, "load rank inputs", || async {
        Ok::<_, EngineError>((store.students().await?, store.events_before(as_of).await?))
    })
    .await?;

    let records = aggregate_all(&assessment_attempts(&events), as_of, &config)?;
    let profiles: HashMap<_, _> = students
        .into_iter()
        .map(|profile| (profile.student_id, profile))
        .collect();
    let scopes = partition_by_scope(&records, &profiles);
    info!(%period, students = records.len(), scopes = scopes.len(), "ranking period");

    let mut tasks = JoinSet::new();
    for (scope, records) in scopes {
        let store = Arc::clone(&store);
        let config = Arc::clone(&config);
        tasks.spawn(async move {
            let label = scope.to_string();
            let result = retry_with_backoff(&config.retry, &label, || {
                publish_ranks(store.as_ref(), &scope, period, &records)
            })
            .await;
            (scope, result)
        });
    }

    let mut summary = CycleSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((scope, Ok(_))) => summary.published.push(scope.to_string()),
            Ok((scope, Err(err))) => {
                warn!(%scope, error = %err, "scope not published");
                summary.failed.push((scope.to_string(), err.to_string()));
            }
            Err(join_err) => {
                warn!(error = %join_err, "scope task aborted");
                summary.failed.push(("aborted".to_string(), join_err.to_string()));
            }
        }
    }
    summary.published.sort();
    summary.failed.sort();
    Ok(summary)
}

/// Recomputes scarcity for every opportunity as of `now` and publishes it as one cycle.
pub async fn run_scarcity_cycle<S>(
    store: Arc<S>,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<PublishedPointer>
where
    S: EventLog + SnapshotStore + 'static,
{
    let (opportunities, events) =
        retry_with_backoff(&config.retry, "load scarcity inputs", || async {
            Ok::<_, EngineError>((store.opportunities().await?, store.events_before(now).await?))
        })
        .await?;

    let grouped = application_events_by_opportunity(&events);
    let snapshots = compute_snapshots(&opportunities, &grouped, now, &config.scarcity);
    info!(opportunities = snapshots.len(), "scarcity computed");

    retry_with_backoff(&config.retry, "publish scarcity", || {
        publish_scarcity(store.as_ref(), now, &snapshots)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBody};
    use crate::models::{
        Dimension, Movement, Opportunity, Scope, StudentProfile, Urgency, SCARCITY_POINTER_KEY,
    };
    use crate::queries::{get_leaderboard, get_rank, get_scarcity, get_score};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 5).unwrap()
    }

    fn assessment(student_id: Uuid, dimension: Dimension, raw_score: f64, day: u32) -> Event {
        Event {
            student_id,
            occurred_at: Utc.with_ymd_and_hms(2026, 10, day, 10, 0, 0).unwrap(),
            body: EventBody::AssessmentCompleted {
                dimension,
                raw_score,
                item_count: 20,
            },
        }
    }

    fn seeded_store() -> (Arc<MemoryStore>, Uuid, Uuid, Uuid) {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        for (student_id, college_id) in [(a, "iit-b"), (b, "iit-b"), (c, "coep")] {
            store
                .upsert_student(StudentProfile {
                    student_id,
                    college_id: college_id.into(),
                    state: "MH".into(),
                })
                .unwrap();
        }
        for (dimension, score) in Dimension::ALL.iter().zip([90.0, 80.0, 70.0]) {
            store.append_event(assessment(a, *dimension, score, 6)).unwrap();
        }
        for dimension in Dimension::ALL {
            store.append_event(assessment(b, dimension, 85.0, 7)).unwrap();
        }
        store
            .append_event(assessment(c, Dimension::Technical, 60.0, 8))
            .unwrap();
        (Arc::new(store), a, b, c)
    }

    #[test]
    fn periods_close_at_midnight() {
        let monday = NaiveDate::from_ymd_opt(2026, 10, 12).unwrap();
        assert_eq!(
            period_as_of(week(), RankCadence::Weekly),
            monday.and_time(NaiveTime::MIN).and_utc()
        );
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(last_closed_period(sunday, RankCadence::Weekly), week());
        assert_eq!(
            last_closed_period(sunday, RankCadence::Daily),
            NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
        );
    }

    #[tokio::test]
    async fn publishes_every_scope() {
        let (store, a, b, c) = seeded_store();
        let config = Arc::new(EngineConfig::default());

        let summary = run_rank_cycle(Arc::clone(&store), config, week()).await.unwrap();

        assert!(summary.is_clean());
        assert_eq!(
            summary.published,
            vec!["college/coep", "college/iit-b", "national/national", "state/MH"]
        );

        let board = get_leaderboard(store.as_ref(), Scope::College, "iit-b", 10, 0)
            .await
            .unwrap();
        let order: Vec<Uuid> = board.iter().map(|entry| entry.student_id).collect();
        assert_eq!(order, vec![b, a]);

        let national = get_rank(store.as_ref(), Scope::National, "national", c)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(national.rank, 3);
        assert_eq!(national.total_in_scope, 3);
        assert_eq!(national.movement, Movement::New);
    }

    #[tokio::test]
    async fn published_composite_is_reproducible() {
        let (store, a, _, _) = seeded_store();
        run_rank_cycle(Arc::clone(&store), Arc::new(EngineConfig::default()), week())
            .await
            .unwrap();

        let record = get_score(store.as_ref(), a).await.unwrap().unwrap();
        let recomputed: f64 = Dimension::ALL
            .iter()
            .filter_map(|dimension| {
                record
                    .dimension(*dimension)
                    .map(|score| score.mean * record.weights_used[dimension])
            })
            .sum();
        assert!((recomputed - record.composite_score).abs() < 1e-9);
        assert!((record.composite_score - 81.0).abs() < 1e-9);
        assert_eq!(record.technical.unwrap().confidence, 1.0);

        let entry = get_rank(store.as_ref(), Scope::National, "national", a)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.composite_score, record.composite_score);
    }

    #[tokio::test]
    async fn rerunning_a_period_is_idempotent() {
        let (store, _, _, _) = seeded_store();
        let config = Arc::new(EngineConfig::default());

        run_rank_cycle(Arc::clone(&store), Arc::clone(&config), week())
            .await
            .unwrap();
        let first = get_leaderboard(store.as_ref(), Scope::National, "national", 50, 0)
            .await
            .unwrap();

        // any day inside the week maps to the same period
        let wednesday = week() + Duration::days(2);
        run_rank_cycle(Arc::clone(&store), config, wednesday)
            .await
            .unwrap();
        let second = get_leaderboard(store.as_ref(), Scope::National, "national", 50, 0)
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn events_after_period_end_are_ignored() {
        let (store, _, _, c) = seeded_store();
        store
            .append_event(assessment(c, Dimension::Behavioral, 100.0, 14))
            .unwrap();

        run_rank_cycle(Arc::clone(&store), Arc::new(EngineConfig::default()), week())
            .await
            .unwrap();
        let entry = get_rank(store.as_ref(), Scope::National, "national", c)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.rank, 3);
    }

    #[tokio::test]
    async fn scarcity_cycle_publishes_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let opportunity_id = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        store
            .upsert_opportunity(Opportunity {
                opportunity_id,
                category: "sde-intern".into(),
                deadline: Some(now + Duration::hours(20)),
                total_spots: Some(10),
            })
            .unwrap();
        for college in ["iit-b", "iit-b", "coep"] {
            store
                .append_event(Event {
                    student_id: Uuid::new_v4(),
                    occurred_at: now - Duration::hours(3),
                    body: EventBody::ApplicationSubmitted {
                        opportunity_id,
                        college_id: college.into(),
                    },
                })
                .unwrap();
        }

        let pointer = run_scarcity_cycle(Arc::clone(&store), &EngineConfig::default(), now)
            .await
            .unwrap();
        assert_eq!(pointer.key, SCARCITY_POINTER_KEY);

        let view = get_scarcity(store.as_ref(), opportunity_id, Some("iit-b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.from_your_college, Some(2));
        assert_eq!(view.snapshot.total_applications, 3);
        assert_eq!(view.snapshot.urgency, Urgency::High);
    }
}
