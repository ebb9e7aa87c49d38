use std::path::Path;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::models::Dimension;

const WEIGHT_EPSILON: f64 = 1e-6;

/// Composite weights. Documented defaults are 40/30/30.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub technical: f64,
    pub behavioral: f64,
    pub contextual: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            technical: 0.40,
            behavioral: 0.30,
            contextual: 0.30,
        }
    }
}

impl Weights {
    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Technical => self.technical,
            Dimension::Behavioral => self.behavioral,
            Dimension::Contextual => self.contextual,
        }
    }

    pub fn sum(&self) -> f64 {
        self.technical + self.behavioral + self.contextual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankCadence {
    Daily,
    Weekly,
}

impl RankCadence {
    /// Start of the period containing `date`. Weekly periods start on Monday.
    pub fn period_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            RankCadence::Daily => date,
            RankCadence::Weekly => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
        }
    }

    pub fn length(&self) -> Duration {
        match self {
            RankCadence::Daily => Duration::days(1),
            RankCadence::Weekly => Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScarcityConfig {
    pub urgent_hours: i64,
    pub urgent_spots: u32,
    pub soon_hours: i64,
    pub few_spots: u32,
    pub velocity_window_hours: i64,
    pub min_baseline_population: usize,
    /// Percentile cutoffs separating low/medium/high/very_high demand.
    pub demand_cutoffs: [f64; 3],
}

impl Default for ScarcityConfig {
    fn default() -> Self {
        Self {
            urgent_hours: 48,
            urgent_spots: 3,
            soon_hours: 168,
            few_spots: 10,
            velocity_window_hours: 24,
            min_baseline_population: 5,
            demand_cutoffs: [50.0, 75.0, 90.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub scarcity_interval_minutes: u64,
    pub rank_interval_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scarcity_interval_minutes: 60,
            rank_interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub weights: Weights,
    pub half_life_days: f64,
    pub min_sample_size: u32,
    pub rank_cadence: RankCadence,
    pub scarcity: ScarcityConfig,
    pub retry: RetryConfig,
    pub schedule: ScheduleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            half_life_days: 14.0,
            min_sample_size: 20,
            rank_cadence: RankCadence::Weekly,
            scarcity: ScarcityConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads `path` when given, otherwise the defaults. Either way the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|err| {
                    EngineError::Config(format!("cannot read {}: {err}", path.display()))
                })?;
                let config: EngineConfig = toml::from_str(&content).map_err(|err| {
                    EngineError::Config(format!("cannot parse {}: {err}", path.display()))
                })?;
                info!(path = %path.display(), "loaded engine config");
                config
            }
            None => EngineConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for dimension in Dimension::ALL {
            let weight = self.weights.get(dimension);
            if !weight.is_finite() || weight <= 0.0 {
                return Err(EngineError::Config(format!(
                    "weight for {} must be positive, got {weight}",
                    dimension.as_str()
                )));
            }
        }
        if (self.weights.sum() - 1.0).abs() > WEIGHT_EPSILON {
            return Err(EngineError::Config(format!(
                "weights must sum to 1.0, got {}",
                self.weights.sum()
            )));
        }
        if !self.half_life_days.is_finite() || self.half_life_days <= 0.0 {
            return Err(EngineError::Config("half_life_days must be positive".into()));
        }
        if self.min_sample_size == 0 {
            return Err(EngineError::Config("min_sample_size must be at least 1".into()));
        }
        if self.scarcity.velocity_window_hours <= 0 {
            return Err(EngineError::Config(
                "velocity_window_hours must be positive".into(),
            ));
        }
        let [low, mid, high] = self.scarcity.demand_cutoffs;
        if !(0.0 < low && low < mid && mid < high && high <= 100.0) {
            return Err(EngineError::Config(format!(
                "demand cutoffs must increase within (0, 100], got {:?}",
                self.scarcity.demand_cutoffs
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.weights.sum() - 1.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "half_life_days = 7.0\n\n[scarcity]\nurgent_spots = 5\n"
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.half_life_days, 7.0);
        assert_eq!(config.scarcity.urgent_spots, 5);
        assert_eq!(config.scarcity.urgent_hours, 48);
        assert_eq!(config.weights, Weights::default());
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut config = EngineConfig::default();
        config.weights.technical = 0.5;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_non_positive_weight() {
        let mut config = EngineConfig::default();
        config.weights = Weights {
            technical: 0.7,
            behavioral: 0.3,
            contextual: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unordered_cutoffs() {
        let mut config = EngineConfig::default();
        config.scarcity.demand_cutoffs = [75.0, 50.0, 90.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn weekly_periods_start_on_monday() {
        let thursday = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
        let monday = NaiveDate::from_ymd_opt(2026, 10, 12).unwrap();
        assert_eq!(RankCadence::Weekly.period_start(thursday), monday);
        assert_eq!(RankCadence::Daily.period_start(thursday), thursday);
    }
}
