use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{AssessmentAttempt, Dimension};

/// An event as produced by the web tier, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub student_id: Option<Uuid>,
    pub opportunity_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    ApplicationSubmitted {
        opportunity_id: Uuid,
        college_id: String,
    },
    ApplicationWithdrawn {
        opportunity_id: Uuid,
    },
    OfferExtended {
        opportunity_id: Uuid,
    },
    OfferAccepted {
        opportunity_id: Uuid,
    },
    AssessmentCompleted {
        dimension: Dimension,
        raw_score: f64,
        item_count: u32,
    },
}

impl EventBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventBody::ApplicationSubmitted { .. } => "application_submitted",
            EventBody::ApplicationWithdrawn { .. } => "application_withdrawn",
            EventBody::OfferExtended { .. } => "offer_extended",
            EventBody::OfferAccepted { .. } => "offer_accepted",
            EventBody::AssessmentCompleted { .. } => "assessment_completed",
        }
    }

    pub fn opportunity_id(&self) -> Option<Uuid> {
        match self {
            EventBody::ApplicationSubmitted { opportunity_id, .. }
            | EventBody::ApplicationWithdrawn { opportunity_id }
            | EventBody::OfferExtended { opportunity_id }
            | EventBody::OfferAccepted { opportunity_id } => Some(*opportunity_id),
            EventBody::AssessmentCompleted { .. } => None,
        }
    }
}

/// A validated event. Every event concerns exactly one student.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub student_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub body: EventBody,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmittedPayload {
    college_id: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyPayload {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AssessmentPayload {
    dimension: Dimension,
    raw_score: f64,
    item_count: u32,
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    event_type: &str,
    payload: serde_json::Value,
) -> Result<T> {
    let payload = match payload {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(payload)
        .map_err(|err| EngineError::Validation(format!("{event_type} payload: {err}")))
}

pub fn validate_score(raw_score: f64) -> Result<()> {
    if !raw_score.is_finite() || !(0.0..=100.0).contains(&raw_score) {
        return Err(EngineError::Validation(format!(
            "raw score {raw_score} outside [0, 100]"
        )));
    }
    Ok(())
}

impl RawEvent {
    pub fn validate(self) -> Result<Event> {
        let event_type = self.event_type.as_str();
        let student_id = self
            .student_id
            .ok_or_else(|| EngineError::Validation(format!("{event_type} without student_id")))?;
        let opportunity = || {
            self.opportunity_id.ok_or_else(|| {
                EngineError::Validation(format!("{event_type} without opportunity_id"))
            })
        };

        let body = match event_type {
            "application_submitted" => {
                let payload: SubmittedPayload = parse_payload(event_type, self.payload.clone())?;
                if payload.college_id.trim().is_empty() {
                    return Err(EngineError::Validation(
                        "application_submitted with empty college_id".into(),
                    ));
                }
                EventBody::ApplicationSubmitted {
                    opportunity_id: opportunity()?,
                    college_id: payload.college_id,
                }
            }
            "application_withdrawn" => {
                let _: EmptyPayload = parse_payload(event_type, self.payload.clone())?;
                EventBody::ApplicationWithdrawn {
                    opportunity_id: opportunity()?,
                }
            }
            "offer_extended" => {
                let _: EmptyPayload = parse_payload(event_type, self.payload.clone())?;
                EventBody::OfferExtended {
                    opportunity_id: opportunity()?,
                }
            }
            "offer_accepted" => {
                let _: EmptyPayload = parse_payload(event_type, self.payload.clone())?;
                EventBody::OfferAccepted {
                    opportunity_id: opportunity()?,
                }
            }
            "assessment_completed" => {
                let payload: AssessmentPayload =
                    parse_payload(event_type, self.payload.clone())?;
                validate_score(payload.raw_score)?;
                if payload.item_count == 0 {
                    return Err(EngineError::Validation(
                        "assessment_completed with zero items".into(),
                    ));
                }
                EventBody::AssessmentCompleted {
                    dimension: payload.dimension,
                    raw_score: payload.raw_score,
                    item_count: payload.item_count,
                }
            }
            other => {
                return Err(EngineError::Validation(format!("unknown event type {other}")));
            }
        };

        Ok(Event {
            student_id,
            occurred_at: self.occurred_at,
            body,
        })
    }
}

impl Event {
    /// Inverse of [`RawEvent::validate`], used when persisting.
    pub fn to_raw(&self) -> RawEvent {
        let payload = match &self.body {
            EventBody::ApplicationSubmitted { college_id, .. } => {
                serde_json::json!({ "college_id": college_id })
            }
            EventBody::AssessmentCompleted {
                dimension,
                raw_score,
                item_count,
            } => serde_json::json!({
                "dimension": dimension,
                "raw_score": raw_score,
                "item_count": item_count,
            }),
            _ => serde_json::json!({}),
        };

        RawEvent {
            event_type: self.body.type_name().to_string(),
            student_id: Some(self.student_id),
            opportunity_id: self.body.opportunity_id(),
            occurred_at: self.occurred_at,
            payload,
        }
    }
}

pub fn assessment_attempts(events: &[Event]) -> Vec<AssessmentAttempt> {
    events
        .iter()
        .filter_map(|event| match event.body {
            EventBody::AssessmentCompleted {
                dimension,
                raw_score,
                item_count,
            } => Some(AssessmentAttempt {
                student_id: event.student_id,
                dimension,
                raw_score,
                completed_at: event.occurred_at,
                item_count,
            }),
            _ => None,
        })
        .collect()
}

/// Application events grouped by opportunity, each group in occurrence order.
pub fn application_events_by_opportunity(events: &[Event]) -> HashMap<Uuid, Vec<Event>> {
    let mut grouped: HashMap<Uuid, Vec<Event>> = HashMap::new();
    for event in events {
        if let Some(opportunity_id) = event.body.opportunity_id() {
            grouped.entry(opportunity_id).or_default().push(event.clone());
        }
    }
    for group in grouped.values_mut() {
        group.sort_by_key(|event| event.occurred_at);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(event_type: &str, payload: serde_json::Value) -> RawEvent {
        RawEvent {
            event_type: event_type.to_string(),
            student_id: Some(Uuid::new_v4()),
            opportunity_id: Some(Uuid::new_v4()),
            occurred_at: Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap(),
            payload,
        }
    }

    #[test]
    fn accepts_assessment_within_range() {
        let event = raw(
            "assessment_completed",
            json!({"dimension": "technical", "raw_score": 88.5, "item_count": 12}),
        )
        .validate()
        .unwrap();

        assert_eq!(
            event.body,
            EventBody::AssessmentCompleted {
                dimension: Dimension::Technical,
                raw_score: 88.5,
                item_count: 12,
            }
        );
    }

    #[test]
    fn rejects_out_of_range_score() {
        let result = raw(
            "assessment_completed",
            json!({"dimension": "behavioral", "raw_score": 101.0, "item_count": 4}),
        )
        .validate();
        assert!(matches!(result, Err(EngineError::Validation(_))));

        let result = raw(
            "assessment_completed",
            json!({"dimension": "behavioral", "raw_score": -0.5, "item_count": 4}),
        )
        .validate();
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn rejects_unknown_type_and_fields() {
        assert!(raw("profile_viewed", json!({})).validate().is_err());
        assert!(raw("offer_accepted", json!({"salary": 10})).validate().is_err());
    }

    #[test]
    fn application_requires_opportunity() {
        let mut event = raw("application_submitted", json!({"college_id": "iit-b"}));
        event.opportunity_id = None;
        assert!(matches!(event.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn null_payload_counts_as_empty() {
        let event = raw("offer_extended", serde_json::Value::Null).validate().unwrap();
        assert_eq!(event.body.type_name(), "offer_extended");
    }

    #[test]
    fn raw_form_validates_back_to_same_event() {
        let event = raw("application_submitted", json!({"college_id": "nit-t"}))
            .validate()
            .unwrap();
        assert_eq!(event.to_raw().validate().unwrap(), event);
    }

    #[test]
    fn groups_applications_in_time_order() {
        let opportunity_id = Uuid::new_v4();
        let student_id = Uuid::new_v4();
        let late = Event {
            student_id,
            occurred_at: Utc.with_ymd_and_hms(2026, 10, 2, 0, 0, 0).unwrap(),
            body: EventBody::OfferAccepted { opportunity_id },
        };
        let early = Event {
            student_id,
            occurred_at: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
            body: EventBody::ApplicationSubmitted {
                opportunity_id,
                college_id: "iit-m".into(),
            },
        };

        let grouped = application_events_by_opportunity(&[late.clone(), early.clone()]);
        assert_eq!(grouped[&opportunity_id], vec![early, late]);
    }
}
