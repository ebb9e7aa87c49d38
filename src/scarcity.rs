use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ScarcityConfig;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBody};
use crate::models::{
    ClosingIn, DemandLevel, Opportunity, OpportunityScarcitySnapshot, ScarcityView, Urgency,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplicationStatus {
    Submitted,
    OfferExtended,
    Accepted,
    Withdrawn,
}

#[derive(Debug, Clone)]
struct Application {
    college_id: String,
    submitted_at: DateTime<Utc>,
    status: ApplicationStatus,
}

/// Application counts for one opportunity after replaying its events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationTally {
    pub total: u32,
    pub recent: u32,
    pub accepted: u32,
    pub offers_in_flight: u32,
    pub by_college: BTreeMap<String, u32>,
}

/// Replays one opportunity's events (already in time order) up to `now`.
pub fn tally_applications(
    events: &[Event],
    now: DateTime<Utc>,
    window: Duration,
) -> ApplicationTally {
    let mut applications: HashMap<Uuid, Application> = HashMap::new();

    for event in events.iter().filter(|event| event.occurred_at <= now) {
        match &event.body {
            EventBody::ApplicationSubmitted { college_id, .. } => {
                // A resubmission only reopens a withdrawn application.
                if let Some(existing) = applications.get(&event.student_id) {
                    if existing.status != ApplicationStatus::Withdrawn {
                        debug!(
                            student_id = %event.student_id,
                            status = ?existing.status,
                            "ignoring repeat submission"
                        );
                        continue;
                    }
                }
                applications.insert(
                    event.student_id,
                    Application {
                        college_id: college_id.clone(),
                        submitted_at: event.occurred_at,
                        status: ApplicationStatus::Submitted,
                    },
                );
            }
            EventBody::ApplicationWithdrawn { .. }
            | EventBody::OfferExtended { .. }
            | EventBody::OfferAccepted { .. } => {
                let Some(application) = applications.get_mut(&event.student_id) else {
                    debug!(
                        student_id = %event.student_id,
                        event = event.body.type_name(),
                        "ignoring event for unknown application"
                    );
                    continue;
                };
                if application.status == ApplicationStatus::Withdrawn {
                    continue;
                }
                application.status = match event.body {
                    EventBody::ApplicationWithdrawn { .. } => ApplicationStatus::Withdrawn,
                    EventBody::OfferExtended { .. } => ApplicationStatus::OfferExtended,
                    _ => ApplicationStatus::Accepted,
                };
            }
            EventBody::AssessmentCompleted { .. } => {}
        }
    }

    let window_start = now - window;
    let mut tally = ApplicationTally::default();
    for application in applications.values() {
        if application.submitted_at > window_start {
            tally.recent += 1;
        }
        match application.status {
            ApplicationStatus::Withdrawn => continue,
            ApplicationStatus::Accepted => tally.accepted += 1,
            ApplicationStatus::OfferExtended => tally.offers_in_flight += 1,
            ApplicationStatus::Submitted => {}
        }
        tally.total += 1;
        *tally
            .by_college
            .entry(application.college_id.clone())
            .or_insert(0) += 1;
    }
    tally
}

pub fn spots_remaining(total_spots: u32, accepted: u32, offers_in_flight: u32) -> u32 {
    total_spots.saturating_sub(accepted.saturating_add(offers_in_flight))
}

pub fn closing_in(
    opportunity: &Opportunity,
    spots_remaining: Option<u32>,
    now: DateTime<Utc>,
) -> Option<ClosingIn> {
    match (opportunity.deadline, spots_remaining) {
        (Some(deadline), _) => Some(ClosingIn::Time {
            hours: (deadline - now).num_hours().max(0),
        }),
        (None, Some(count)) => Some(ClosingIn::Spots { count }),
        (None, None) => None,
    }
}

/// Either an imminent deadline or a nearly full opportunity is enough to raise urgency.
pub fn urgency(
    hours_left: Option<i64>,
    spots_remaining: Option<u32>,
    config: &ScarcityConfig,
) -> Urgency {
    let hours_below = |limit: i64| hours_left.is_some_and(|hours| hours < limit);
    let spots_below = |limit: u32| spots_remaining.is_some_and(|spots| spots < limit);

    if hours_below(config.urgent_hours) || spots_below(config.urgent_spots) {
        Urgency::High
    } else if hours_below(config.soon_hours) || spots_below(config.few_spots) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

/// Percentile cutoffs of application velocity across comparable opportunities.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandBaseline {
    pub population: usize,
    pub cutoffs: [f64; 3],
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = (percentile / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

impl DemandBaseline {
    pub fn from_velocities(velocities: &[f64], config: &ScarcityConfig) -> Result<Self> {
        if velocities.len() < config.min_baseline_population {
            return Err(EngineError::InsufficientData(format!(
                "{} comparable opportunities, need {}",
                velocities.len(),
                config.min_baseline_population
            )));
        }
        let mut sorted = velocities.to_vec();
        sorted.sort_by(f64::total_cmp);
        let [low, mid, high] = config.demand_cutoffs;
        Ok(Self {
            population: sorted.len(),
            cutoffs: [
                nearest_rank(&sorted, low),
                nearest_rank(&sorted, mid),
                nearest_rank(&sorted, high),
            ],
        })
    }

    pub fn classify(&self, velocity: f64) -> DemandLevel {
        let [low, mid, high] = self.cutoffs;
        if velocity <= low {
            DemandLevel::Low
        } else if velocity <= mid {
            DemandLevel::Medium
        } else if velocity <= high {
            DemandLevel::High
        } else {
            DemandLevel::VeryHigh
        }
    }
}

/// Applications per hour over the trailing window.
pub fn velocity(recent_applications: u32, config: &ScarcityConfig) -> f64 {
    recent_applications as f64 / config.velocity_window_hours as f64
}

/// Computes a snapshot for every opportunity, comparing demand within each category.
pub fn compute_snapshots(
    opportunities: &[Opportunity],
    events_by_opportunity: &HashMap<Uuid, Vec<Event>>,
    now: DateTime<Utc>,
    config: &ScarcityConfig,
) -> Vec<OpportunityScarcitySnapshot> {
    let window = Duration::hours(config.velocity_window_hours);
    let tallies: Vec<ApplicationTally> = opportunities
        .iter()
        .map(|opportunity| {
            let events = events_by_opportunity
                .get(&opportunity.opportunity_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            tally_applications(events, now, window)
        })
        .collect();

    let mut velocities_by_category: HashMap<&str, Vec<f64>> = HashMap::new();
    for (opportunity, tally) in opportunities.iter().zip(&tallies) {
        velocities_by_category
            .entry(opportunity.category.as_str())
            .or_default()
            .push(velocity(tally.recent, config));
    }

    let mut baselines: HashMap<&str, DemandBaseline> = HashMap::new();
    for (category, velocities) in &velocities_by_category {
        match DemandBaseline::from_velocities(velocities, config) {
            Ok(baseline) => {
                debug!(
                    category = *category,
                    population = baseline.population,
                    cutoffs = ?baseline.cutoffs,
                    "demand baseline"
                );
                baselines.insert(*category, baseline);
            }
            Err(err) => {
                warn!(category = *category, error = %err, "demand defaults to medium");
            }
        }
    }

    let mut snapshots: Vec<OpportunityScarcitySnapshot> = opportunities
        .iter()
        .zip(tallies)
        .map(|(opportunity, tally)| {
            let demand_level = baselines
                .get(opportunity.category.as_str())
                .map(|baseline| baseline.classify(velocity(tally.recent, config)))
                .unwrap_or(DemandLevel::Medium);
            build_snapshot(opportunity, tally, demand_level, now, config)
        })
        .collect();
    snapshots.sort_by_key(|snapshot| snapshot.opportunity_id);
    snapshots
}

pub fn build_snapshot(
    opportunity: &Opportunity,
    tally: ApplicationTally,
    demand_level: DemandLevel,
    now: DateTime<Utc>,
    config: &ScarcityConfig,
) -> OpportunityScarcitySnapshot {
    let spots = opportunity
        .total_spots
        .map(|total| spots_remaining(total, tally.accepted, tally.offers_in_flight));
    let closing = closing_in(opportunity, spots, now);
    let hours_left = match closing {
        Some(ClosingIn::Time { hours }) => Some(hours),
        _ => None,
    };
    let closed = opportunity.deadline.is_some_and(|deadline| deadline <= now);

    OpportunityScarcitySnapshot {
        opportunity_id: opportunity.opportunity_id,
        total_applications: tally.total,
        recent_applications: tally.recent,
        applications_from_college: tally.by_college,
        spots_remaining: spots,
        closing_in: closing,
        urgency: if closed {
            Urgency::Low
        } else {
            urgency(hours_left, spots, config)
        },
        demand_level,
        computed_at: now,
    }
}

/// Read-time projection of per-college counts onto the viewer's college.
pub fn project(
    snapshot: OpportunityScarcitySnapshot,
    viewer_college_id: Option<&str>,
) -> ScarcityView {
    let from_your_college = viewer_college_id.map(|college| {
        snapshot
            .applications_from_college
            .get(college)
            .copied()
            .unwrap_or(0)
    });
    ScarcityView {
        snapshot,
        from_your_college,
    }
}
