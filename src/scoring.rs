use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::validate_score;
use crate::models::{AssessmentAttempt, Dimension, DimensionScore, StudentScoreRecord};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Exponential decay: an attempt one half-life older than another counts half as much.
pub fn recency_weight(age_days: f64, half_life_days: f64) -> f64 {
    0.5_f64.powf(age_days.max(0.0) / half_life_days)
}

pub fn confidence(item_count: u64, min_sample_size: u32) -> f64 {
    (item_count as f64 / min_sample_size as f64).min(1.0)
}

/// Ages are measured from the dimension's newest attempt, so its weight is always 1.
fn dimension_score(attempts: &[&AssessmentAttempt], config: &EngineConfig) -> DimensionScore {
    let newest = attempts
        .iter()
        .map(|attempt| attempt.completed_at)
        .max()
        .unwrap_or_default();
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut items = 0u64;

    for attempt in attempts {
        let age_days = (newest - attempt.completed_at).num_seconds() as f64 / SECONDS_PER_DAY;
        let weight = recency_weight(age_days, config.half_life_days);
        weighted_sum += attempt.raw_score * weight;
        weight_total += weight;
        items += attempt.item_count as u64;
    }

    DimensionScore {
        mean: weighted_sum / weight_total,
        confidence: confidence(items, config.min_sample_size),
        attempts: attempts.len(),
    }
}

/// Folds one student's attempts into a score record.
///
/// Attempts at or after `as_of` are ignored so a period can be recomputed later with the
/// same result. Returns `Ok(None)` when nothing remains; such students are not ranked.
pub fn aggregate_student(
    student_id: Uuid,
    attempts: &[AssessmentAttempt],
    as_of: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<Option<StudentScoreRecord>> {
    let mut by_dimension: BTreeMap<Dimension, Vec<&AssessmentAttempt>> = BTreeMap::new();
    let mut completed_at: Option<DateTime<Utc>> = None;

    for attempt in attempts {
        if attempt.student_id != student_id || attempt.completed_at >= as_of {
            continue;
        }
        validate_score(attempt.raw_score)?;
        by_dimension.entry(attempt.dimension).or_default().push(attempt);
        completed_at = Some(match completed_at {
            Some(current) => current.max(attempt.completed_at),
            None => attempt.completed_at,
        });
    }

    let Some(completed_at) = completed_at else {
        return Ok(None);
    };

    let scores: BTreeMap<Dimension, DimensionScore> = by_dimension
        .iter()
        .map(|(dimension, attempts)| (*dimension, dimension_score(attempts, config)))
        .collect();

    // Missing dimensions drop out and the remaining weights are rescaled to 1.0.
    let present_weight: f64 = scores.keys().map(|d| config.weights.get(*d)).sum();
    let weights_used: BTreeMap<Dimension, f64> = scores
        .keys()
        .map(|d| (*d, config.weights.get(*d) / present_weight))
        .collect();
    let composite_score = scores
        .iter()
        .map(|(d, score)| score.mean * weights_used[d])
        .sum();

    Ok(Some(StudentScoreRecord {
        student_id,
        technical: scores.get(&Dimension::Technical).copied(),
        behavioral: scores.get(&Dimension::Behavioral).copied(),
        contextual: scores.get(&Dimension::Contextual).copied(),
        composite_score,
        weights_used,
        completed_at,
        as_of,
    }))
}

/// Score every student with at least one attempt before `as_of`, ordered by student id.
pub fn aggregate_all(
    attempts: &[AssessmentAttempt],
    as_of: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<Vec<StudentScoreRecord>> {
    let mut by_student: HashMap<Uuid, Vec<AssessmentAttempt>> = HashMap::new();
    for attempt in attempts {
        by_student
            .entry(attempt.student_id)
            .or_default()
            .push(attempt.clone());
    }

    let mut records = Vec::new();
    for (student_id, attempts) in by_student {
        if let Some(record) = aggregate_student(student_id, &attempts, as_of, config)? {
            records.push(record);
        }
    }
    records.sort_by_key(|record| record.student_id);
    Ok(records)
}

/// Leaderboard order: higher composite first, then earlier completion, then student id.
pub fn leaderboard_order(a: &StudentScoreRecord, b: &StudentScoreRecord) -> Ordering {
    b.composite_score
        .total_cmp(&a.composite_score)
        .then_with(|| a.completed_at.cmp(&b.completed_at))
        .then_with(|| a.student_id.cmp(&b.student_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Weights;
    use crate::error::EngineError;
    use chrono::{Duration, TimeZone};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap()
    }

    fn attempt(
        student_id: Uuid,
        dimension: Dimension,
        raw_score: f64,
        days_ago: i64,
    ) -> AssessmentAttempt {
        AssessmentAttempt {
            student_id,
            dimension,
            raw_score,
            completed_at: as_of() - Duration::days(days_ago),
            item_count: 25,
        }
    }

    fn full_profile(student_id: Uuid, scores: [f64; 3]) -> Vec<AssessmentAttempt> {
        Dimension::ALL
            .iter()
            .zip(scores)
            .map(|(dimension, score)| attempt(student_id, *dimension, score, 1))
            .collect()
    }

    #[test]
    fn weights_follow_half_life() {
        assert_eq!(recency_weight(0.0, 14.0), 1.0);
        assert!((recency_weight(14.0, 14.0) - 0.5).abs() < 1e-12);
        assert!((recency_weight(28.0, 14.0) - 0.25).abs() < 1e-12);
        assert_eq!(recency_weight(-3.0, 14.0), 1.0);
    }

    #[test]
    fn confidence_saturates_at_min_sample() {
        assert_eq!(confidence(5, 20), 0.25);
        assert_eq!(confidence(20, 20), 1.0);
        assert_eq!(confidence(80, 20), 1.0);
    }

    #[test]
    fn composite_uses_documented_weights() {
        let config = EngineConfig::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let record_a = aggregate_student(a, &full_profile(a, [90.0, 80.0, 70.0]), as_of(), &config)
            .unwrap()
            .unwrap();
        let record_b = aggregate_student(b, &full_profile(b, [85.0, 85.0, 85.0]), as_of(), &config)
            .unwrap()
            .unwrap();

        // 0.4 * 90 + 0.3 * 80 + 0.3 * 70
        assert!((record_a.composite_score - 81.0).abs() < 1e-9);
        assert!((record_b.composite_score - 85.0).abs() < 1e-9);
        assert_eq!(leaderboard_order(&record_b, &record_a), Ordering::Less);
    }

    #[test]
    fn technical_heavy_weights_reproduce_82() {
        let mut config = EngineConfig::default();
        config.weights = Weights {
            technical: 0.4,
            behavioral: 0.4,
            contextual: 0.2,
        };
        let a = Uuid::new_v4();
        let record = aggregate_student(a, &full_profile(a, [90.0, 80.0, 70.0]), as_of(), &config)
            .unwrap()
            .unwrap();
        assert!((record.composite_score - 82.0).abs() < 1e-9);
    }

    #[test]
    fn missing_dimension_renormalizes_weights() {
        let config = EngineConfig::default();
        let student = Uuid::new_v4();
        let attempts = vec![
            attempt(student, Dimension::Technical, 80.0, 2),
            attempt(student, Dimension::Contextual, 60.0, 2),
        ];

        let record = aggregate_student(student, &attempts, as_of(), &config)
            .unwrap()
            .unwrap();

        let used: f64 = record.weights_used.values().sum();
        assert!((used - 1.0).abs() < 1e-9);
        assert!(record.behavioral.is_none());
        assert!((record.weights_used[&Dimension::Technical] - 0.4 / 0.7).abs() < 1e-9);
        let expected = 80.0 * 0.4 / 0.7 + 60.0 * 0.3 / 0.7;
        assert!((record.composite_score - expected).abs() < 1e-9);
    }

    #[test]
    fn recent_attempts_dominate_mean() {
        let config = EngineConfig::default();
        let student = Uuid::new_v4();
        let attempts = vec![
            attempt(student, Dimension::Technical, 40.0, 15),
            attempt(student, Dimension::Technical, 100.0, 1),
        ];

        let record = aggregate_student(student, &attempts, as_of(), &config)
            .unwrap()
            .unwrap();
        let technical = record.technical.unwrap();
        // the older attempt is one half-life further back
        assert!((technical.mean - 80.0).abs() < 1e-9);
        assert_eq!(technical.attempts, 2);
        assert_eq!(technical.confidence, 1.0);
    }

    #[test]
    fn ancient_attempts_keep_mean_finite() {
        let mut config = EngineConfig::default();
        config.half_life_days = 0.5;
        let student = Uuid::new_v4();
        let attempts = vec![
            attempt(student, Dimension::Technical, 99.0, 600),
            attempt(student, Dimension::Behavioral, 60.0, 600),
            attempt(student, Dimension::Behavioral, 20.0, 700),
        ];

        let record = aggregate_student(student, &attempts, as_of(), &config)
            .unwrap()
            .unwrap();

        assert!(record.composite_score.is_finite());
        assert!((record.technical.unwrap().mean - 99.0).abs() < 1e-9);
        assert!((record.behavioral.unwrap().mean - 60.0).abs() < 1e-9);
    }

    #[test]
    fn student_without_attempts_is_excluded() {
        let config = EngineConfig::default();
        let student = Uuid::new_v4();
        let future = vec![attempt(student, Dimension::Technical, 90.0, -1)];

        assert!(aggregate_student(student, &[], as_of(), &config).unwrap().is_none());
        assert!(aggregate_student(student, &future, as_of(), &config)
            .unwrap()
            .is_none());
    }

    #[test]
    fn out_of_range_score_is_rejected_not_clamped() {
        let config = EngineConfig::default();
        let student = Uuid::new_v4();
        let attempts = vec![attempt(student, Dimension::Technical, 140.0, 1)];
        let result = aggregate_student(student, &attempts, as_of(), &config);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn ties_break_on_completion_then_id() {
        let config = EngineConfig::default();
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        let attempts = vec![
            attempt(early, Dimension::Technical, 75.0, 5),
            attempt(late, Dimension::Technical, 75.0, 2),
        ];

        let mut records = aggregate_all(&attempts, as_of(), &config).unwrap();
        for record in records.iter_mut() {
            record.composite_score = 75.0;
        }
        let mut ordered = records.clone();
        ordered.sort_by(leaderboard_order);
        assert_eq!(ordered[0].student_id, early);

        let mut same_time = records;
        for record in same_time.iter_mut() {
            record.completed_at = as_of();
        }
        same_time.sort_by(leaderboard_order);
        assert!(same_time[0].student_id < same_time[1].student_id);
    }
}
