use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Validation failures raised by the grading, load and scheduling engines.
///
/// Every variant is local to one record: batch callers convert them into a
/// per-cell "unavailable" marker instead of aborting the whole report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid assessment {assessment_id}: {reason}")]
    InvalidAssessment { assessment_id: Uuid, reason: String },

    #[error("weights sum to zero for module {module_id}")]
    DegenerateWeights { module_id: Uuid },

    #[error("invalid teaching block {block_id}: {reason}")]
    InvalidBlock { block_id: Uuid, reason: String },

    #[error("invalid grading period {period_id}: {reason}")]
    InvalidPeriod { period_id: Uuid, reason: String },

    #[error("invalid window: {start} is after {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub fn invalid_assessment(assessment_id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvalidAssessment {
            assessment_id,
            reason: reason.into(),
        }
    }

    pub fn invalid_block(block_id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvalidBlock {
            block_id,
            reason: reason.into(),
        }
    }

    pub fn negative_hours(block_id: Uuid, hours: Decimal) -> Self {
        Self::invalid_block(block_id, format!("hours per occurrence {hours} is negative"))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
