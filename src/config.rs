use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::models::ContractType;

/// How module averages combine into an overall average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallWeighting {
    /// Every graded module counts once.
    Equal,
    /// Modules count proportionally to their coefficient.
    ModuleCoefficient,
}

impl FromStr for OverallWeighting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equal" => Ok(Self::Equal),
            "coefficient" | "module_coefficient" => Ok(Self::ModuleCoefficient),
            other => Err(format!("unknown weighting '{other}'")),
        }
    }
}

/// How a block's hours count toward a teaching load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// `hours_per_occurrence` counted once per block intersecting the window.
    PerBlock,
    /// `hours_per_occurrence` multiplied by the dated occurrences inside the window.
    PerOccurrence,
}

impl FromStr for LoadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_block" | "block" => Ok(Self::PerBlock),
            "per_occurrence" | "occurrence" => Ok(Self::PerOccurrence),
            other => Err(format!("unknown load policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub scale: Decimal,
    pub passing_threshold: Decimal,
    pub overall_weighting: OverallWeighting,
    pub load_policy: LoadPolicy,
    pub full_time_hours_due: Decimal,
    pub part_time_hours_due: Decimal,
    #[serde(skip)]
    pub cache_ttl: Duration,
}

/// Largest accepted grading scale; 20 and 100 are the usual ones.
pub const MAX_SCALE: u32 = 1000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scale: Decimal::from(20),
            passing_threshold: Decimal::from(10),
            overall_weighting: OverallWeighting::Equal,
            load_policy: LoadPolicy::PerBlock,
            full_time_hours_due: Decimal::from(192),
            part_time_hours_due: Decimal::from(96),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn validate(self) -> EngineResult<Self> {
        if self.scale <= Decimal::ZERO || self.scale > Decimal::from(MAX_SCALE) {
            return Err(EngineError::InvalidConfig(format!(
                "grading scale {} must lie within (0, {MAX_SCALE}]",
                self.scale
            )));
        }
        if self.passing_threshold < Decimal::ZERO || self.passing_threshold > self.scale {
            return Err(EngineError::InvalidConfig(format!(
                "passing threshold {} must lie within [0, {}]",
                self.passing_threshold, self.scale
            )));
        }
        if self.full_time_hours_due < Decimal::ZERO || self.part_time_hours_due < Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "hours due cannot be negative".to_string(),
            ));
        }
        Ok(self)
    }

    /// Settings that change a rendered grade report, for use in cache keys.
    pub fn cache_scope(&self) -> String {
        format!(
            "{}/{}/{:?}",
            self.scale.normalize(),
            self.passing_threshold.normalize(),
            self.overall_weighting
        )
    }

    pub fn hours_due(&self, contract: ContractType) -> Decimal {
        match contract {
            ContractType::FullTime => self.full_time_hours_due,
            ContractType::PartTime => self.part_time_hours_due,
            ContractType::PerSession => Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_twenty_point_scale() {
        let config = EngineConfig::default().validate().unwrap();
        assert_eq!(config.scale, Decimal::from(20));
        assert_eq!(config.passing_threshold, Decimal::from(10));
        assert_eq!(config.overall_weighting, OverallWeighting::Equal);
        assert_eq!(config.load_policy, LoadPolicy::PerBlock);
    }

    #[test]
    fn threshold_above_scale_is_rejected() {
        let config = EngineConfig {
            passing_threshold: Decimal::from(25),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn scale_must_be_positive_and_bounded() {
        for scale in [Decimal::ZERO, Decimal::from(-20), Decimal::from(1_000_000), Decimal::MAX] {
            let config = EngineConfig {
                scale,
                ..EngineConfig::default()
            };
            assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
        }
        let hundred = EngineConfig {
            scale: Decimal::from(100),
            ..EngineConfig::default()
        };
        assert!(hundred.validate().is_ok());
    }

    #[test]
    fn cache_scope_changes_with_grading_settings() {
        let default = EngineConfig::default();
        let weighted = EngineConfig {
            overall_weighting: OverallWeighting::ModuleCoefficient,
            ..EngineConfig::default()
        };
        let same_with_other_load = EngineConfig {
            load_policy: LoadPolicy::PerOccurrence,
            ..EngineConfig::default()
        };
        assert_eq!(default.cache_scope(), "20/10/Equal");
        assert_ne!(default.cache_scope(), weighted.cache_scope());
        assert_eq!(default.cache_scope(), same_with_other_load.cache_scope());
    }

    #[test]
    fn per_session_teachers_owe_no_hours() {
        let config = EngineConfig::default();
        assert_eq!(config.hours_due(ContractType::PerSession), Decimal::ZERO);
        assert_eq!(config.hours_due(ContractType::FullTime), Decimal::from(192));
    }

    #[test]
    fn policies_parse_from_env_style_values() {
        assert_eq!("coefficient".parse::<OverallWeighting>(), Ok(OverallWeighting::ModuleCoefficient));
        assert_eq!("per_occurrence".parse::<LoadPolicy>(), Ok(LoadPolicy::PerOccurrence));
        assert!("median".parse::<OverallWeighting>().is_err());
    }
}
