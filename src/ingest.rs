use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::{Event, RawEvent};
use crate::models::{Opportunity, StudentProfile};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestedEvent {
    pub source_key: String,
    pub event: Event,
}

#[derive(Deserialize)]
struct StudentRow {
    student_id: Uuid,
    college_id: String,
    state: String,
}

#[derive(Deserialize)]
struct OpportunityRow {
    opportunity_id: Uuid,
    category: String,
    deadline: Option<DateTime<Utc>>,
    total_spots: Option<u32>,
}

#[derive(Deserialize)]
struct EventRow {
    source_key: Option<String>,
    event_type: String,
    student_id: Option<Uuid>,
    opportunity_id: Option<Uuid>,
    occurred_at: DateTime<Utc>,
    payload: Option<String>,
}

pub fn open(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::Reader::from_path(path)
        .map_err(|err| EngineError::Validation(format!("{}: {err}", path.display())))
}

fn row_error(line: usize, err: impl std::fmt::Display) -> EngineError {
    EngineError::Validation(format!("row {line}: {err}"))
}

pub fn read_students<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<StudentProfile>> {
    let mut students = Vec::new();
    for (index, result) in reader.deserialize::<StudentRow>().enumerate() {
        let row = result.map_err(|err| row_error(index + 1, err))?;
        if row.college_id.trim().is_empty() || row.state.trim().is_empty() {
            return Err(row_error(index + 1, "college_id and state are required"));
        }
        students.push(StudentProfile {
            student_id: row.student_id,
            college_id: row.college_id,
            state: row.state,
        });
    }
    Ok(students)
}

pub fn read_opportunities<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<Opportunity>> {
    let mut opportunities = Vec::new();
    for (index, result) in reader.deserialize::<OpportunityRow>().enumerate() {
        let row = result.map_err(|err| row_error(index + 1, err))?;
        opportunities.push(Opportunity {
            opportunity_id: row.opportunity_id,
            category: row.category,
            deadline: row.deadline,
            total_spots: row.total_spots,
        });
    }
    Ok(opportunities)
}

/// Parses and validates every row. One bad row rejects the whole file.
pub fn read_events<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<IngestedEvent>> {
    let mut events = Vec::new();
    for (index, result) in reader.deserialize::<EventRow>().enumerate() {
        let row = result.map_err(|err| row_error(index + 1, err))?;
        let payload = match row.payload.as_deref().map(str::trim) {
            None | Some("") => serde_json::Value::Null,
            Some(text) => serde_json::from_str(text).map_err(|err| row_error(index + 1, err))?,
        };
        let event = RawEvent {
            event_type: row.event_type,
            student_id: row.student_id,
            opportunity_id: row.opportunity_id,
            occurred_at: row.occurred_at,
            payload,
        }
        .validate()
        .map_err(|err| row_error(index + 1, err))?;

        let source_key = row
            .source_key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        events.push(IngestedEvent { source_key, event });
    }
    Ok(events)
}
