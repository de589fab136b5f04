use std::borrow::Cow;
use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, OverallWeighting};
use crate::error::{EngineError, EngineResult};
use crate::models::{Assessment, AssessmentRow, GradingPeriod, Module, Student};

/// Half-up rounding as used on bulletins: 12.345 -> 12.35.
pub fn round_half_up(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Exact quotient of two integers. Module averages are accumulated
/// in this form so the only rounding is the final half-up step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fraction {
    num: i128,
    den: i128,
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs()
}

impl Fraction {
    const ZERO: Self = Self { num: 0, den: 1 };

    fn new(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num, den).max(1);
        Some(Self {
            num: sign * num / g,
            den: sign * den / g,
        })
    }

    fn from_decimal(value: Decimal) -> Option<Self> {
        Self::new(value.mantissa(), 10i128.checked_pow(value.scale())?)
    }

    fn checked_add(self, other: Self) -> Option<Self> {
        let g = gcd(self.den, other.den);
        let num = self
            .num
            .checked_mul(other.den / g)?
            .checked_add(other.num.checked_mul(self.den / g)?)?;
        Self::new(num, (self.den / g).checked_mul(other.den)?)
    }

    fn checked_mul(self, other: Self) -> Option<Self> {
        let g1 = gcd(self.num, other.den).max(1);
        let g2 = gcd(other.num, self.den).max(1);
        Self::new(
            (self.num / g1).checked_mul(other.num / g2)?,
            (self.den / g2).checked_mul(other.den / g1)?,
        )
    }

    fn checked_div(self, other: Self) -> Option<Self> {
        self.checked_mul(Self::new(other.den, other.num)?)
    }

    /// Rounds half away from zero to `decimals` places.
    fn round_half_up(self, decimals: u32) -> Option<Decimal> {
        let scaled = self.num.abs().checked_mul(10i128.checked_pow(decimals)?)?;
        let (quotient, remainder) = (scaled / self.den, scaled % self.den);
        let rounded = if remainder.checked_mul(2)? >= self.den {
            quotient + 1
        } else {
            quotient
        };
        let signed = if self.num < 0 { -rounded } else { rounded };
        Decimal::try_from_i128_with_scale(signed, decimals).ok()
    }
}

fn weighted_term(assessment: &Assessment) -> Option<Fraction> {
    Fraction::from_decimal(assessment.score)?
        .checked_div(Fraction::from_decimal(assessment.max_points)?)?
        .checked_mul(Fraction::from_decimal(assessment.weight)?)
}

fn too_large(assessment_id: Uuid) -> EngineError {
    EngineError::invalid_assessment(assessment_id, "values are too large to average exactly")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleAverage {
    pub student_id: Uuid,
    pub module_id: Uuid,
    pub average: Decimal,
    pub assessment_count: usize,
    pub assessments: Vec<Assessment>,
}

/// Weighted mean of normalized scores for one (student, module) pair:
/// `sum(score / max_points * scale * weight) / sum(weight)`, computed exactly
/// and rounded half-up to two places.
///
/// Returns `Ok(None)` for an empty list: an ungraded module has no average,
/// which is not the same as a zero.
pub fn compute_module_average(
    assessments: &[Assessment],
    scale: Decimal,
) -> EngineResult<Option<ModuleAverage>> {
    let Some(first) = assessments.first() else {
        return Ok(None);
    };

    let mut weighted_sum = Fraction::ZERO;
    let mut weight_total = Decimal::ZERO;

    for assessment in assessments {
        if assessment.module_id != first.module_id || assessment.student_id != first.student_id {
            return Err(EngineError::invalid_assessment(
                assessment.id,
                "assessment belongs to a different student or module",
            ));
        }
        assessment.validate()?;
        weighted_sum = weighted_term(assessment)
            .and_then(|term| weighted_sum.checked_add(term))
            .ok_or_else(|| too_large(assessment.id))?;
        weight_total = weight_total
            .checked_add(assessment.weight)
            .ok_or_else(|| too_large(assessment.id))?;
    }

    if weight_total.is_zero() {
        return Err(EngineError::DegenerateWeights {
            module_id: first.module_id,
        });
    }

    let average = Fraction::from_decimal(scale)
        .and_then(|scale| weighted_sum.checked_mul(scale))
        .zip(Fraction::from_decimal(weight_total))
        .and_then(|(sum, total)| sum.checked_div(total))
        .and_then(|mean| mean.round_half_up(2))
        .ok_or_else(|| too_large(first.id))?;

    Ok(Some(ModuleAverage {
        student_id: first.student_id,
        module_id: first.module_id,
        average,
        assessment_count: assessments.len(),
        assessments: assessments.to_vec(),
    }))
}

/// Unweighted mean of module averages, rounded once at the end.
pub fn compute_overall_average(module_averages: &[ModuleAverage]) -> Option<Decimal> {
    if module_averages.is_empty() {
        return None;
    }
    let total: Decimal = module_averages.iter().map(|m| m.average).sum();
    Some(round_half_up(
        total / Decimal::from(module_averages.len()),
        2,
    ))
}

/// Mean of module averages weighted by module coefficient. Modules missing
/// from `coefficients` count with coefficient 1. `None` when the
/// coefficients sum to zero or overflow.
pub fn compute_coefficient_average(
    module_averages: &[ModuleAverage],
    coefficients: &HashMap<Uuid, Decimal>,
) -> Option<Decimal> {
    let mut weighted_sum = Decimal::ZERO;
    let mut coefficient_total = Decimal::ZERO;
    for module in module_averages {
        let coefficient = coefficients
            .get(&module.module_id)
            .copied()
            .unwrap_or(Decimal::ONE);
        weighted_sum = weighted_sum.checked_add(module.average.checked_mul(coefficient)?)?;
        coefficient_total = coefficient_total.checked_add(coefficient)?;
    }
    if coefficient_total <= Decimal::ZERO {
        return None;
    }
    Some(round_half_up(weighted_sum / coefficient_total, 2))
}

pub fn overall_average(
    module_averages: &[ModuleAverage],
    weighting: OverallWeighting,
    coefficients: &HashMap<Uuid, Decimal>,
) -> Option<Decimal> {
    match weighting {
        OverallWeighting::Equal => compute_overall_average(module_averages),
        OverallWeighting::ModuleCoefficient => {
            compute_coefficient_average(module_averages, coefficients)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CohortStatistics {
    pub evaluated_count: usize,
    pub mean: Option<Decimal>,
    pub max: Option<Decimal>,
    pub min: Option<Decimal>,
    /// Integer percent of evaluated students at or above the threshold.
    pub pass_rate: Option<u32>,
}

/// Statistics over the students that have an average. An empty cohort yields
/// all-`None` statistics rather than zeros.
pub fn compute_cohort_statistics(
    averages: &[Option<Decimal>],
    passing_threshold: Decimal,
) -> CohortStatistics {
    let evaluated: Vec<Decimal> = averages.iter().flatten().copied().collect();
    if evaluated.is_empty() {
        return CohortStatistics::default();
    }

    let count = Decimal::from(evaluated.len());
    let total: Decimal = evaluated.iter().sum();
    let passed = evaluated
        .iter()
        .filter(|avg| **avg >= passing_threshold)
        .count();
    let pass_rate = round_half_up(Decimal::from(passed) * Decimal::ONE_HUNDRED / count, 0);

    CohortStatistics {
        evaluated_count: evaluated.len(),
        mean: Some(round_half_up(total / count, 2)),
        max: evaluated.iter().max().copied(),
        min: evaluated.iter().min().copied(),
        pass_rate: pass_rate.to_u32(),
    }
}

/// Assessments belonging to `period`: matched by period id, or by date when
/// the assessment carries no period.
pub fn assessments_in_period(assessments: &[Assessment], period: &GradingPeriod) -> Vec<Assessment> {
    assessments
        .iter()
        .filter(|a| match a.period_id {
            Some(period_id) => period_id == period.id,
            None => period.contains(a.date),
        })
        .cloned()
        .collect()
}

/// A stored row that failed validation, kept so its cell reports the failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedAssessment {
    pub assessment_id: Uuid,
    pub student_id: Uuid,
    pub module_id: Uuid,
    pub period_id: Option<Uuid>,
    pub date: chrono::NaiveDate,
    pub reason: String,
}

impl RejectedAssessment {
    fn in_period(&self, period: &GradingPeriod) -> bool {
        match self.period_id {
            Some(period_id) => period_id == period.id,
            None => period.contains(self.date),
        }
    }
}

/// Validated assessments plus the rows that were rejected on the way in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradeBook {
    pub assessments: Vec<Assessment>,
    pub rejected: Vec<RejectedAssessment>,
}

impl GradeBook {
    pub fn from_rows(rows: Vec<AssessmentRow>) -> Self {
        let mut book = GradeBook::default();
        for row in rows {
            let (assessment_id, student_id, module_id, period_id, date) =
                (row.id, row.student_id, row.module_id, row.period_id, row.date);
            match Assessment::try_from(row) {
                Ok(assessment) => book.assessments.push(assessment),
                Err(err) => {
                    warn!(%assessment_id, %student_id, %module_id, error = %err, "rejected assessment row");
                    book.rejected.push(RejectedAssessment {
                        assessment_id,
                        student_id,
                        module_id,
                        period_id,
                        date,
                        reason: err.to_string(),
                    });
                }
            }
        }
        book
    }

    /// Restricts the book to one grading period.
    pub fn in_period(&self, period: &GradingPeriod) -> Self {
        Self {
            assessments: assessments_in_period(&self.assessments, period),
            rejected: self
                .rejected
                .iter()
                .filter(|r| r.in_period(period))
                .cloned()
                .collect(),
        }
    }
}

impl From<Vec<Assessment>> for GradeBook {
    fn from(assessments: Vec<Assessment>) -> Self {
        Self {
            assessments,
            rejected: Vec::new(),
        }
    }
}

/// Outcome of aggregating one report cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleCell {
    Graded(ModuleAverage),
    NoData,
    Unavailable { reason: String },
}

impl ModuleCell {
    pub fn average(&self) -> Option<Decimal> {
        match self {
            Self::Graded(module) => Some(module.average),
            _ => None,
        }
    }
}

/// Aggregates one cell, turning validation failures into
/// [`ModuleCell::Unavailable`] so the surrounding report still renders.
pub fn aggregate_cell(assessments: &[Assessment], scale: Decimal) -> ModuleCell {
    match compute_module_average(assessments, scale) {
        Ok(Some(module)) => ModuleCell::Graded(module),
        Ok(None) => ModuleCell::NoData,
        Err(err) => {
            debug!(error = %err, "module aggregation failed");
            ModuleCell::Unavailable {
                reason: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleLine {
    pub module_id: Uuid,
    pub module_name: String,
    pub coefficient: Decimal,
    pub cell: ModuleCell,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentBulletin {
    pub student: Student,
    pub period: Option<GradingPeriod>,
    pub modules: Vec<ModuleLine>,
    pub overall_average: Option<Decimal>,
    pub passed: Option<bool>,
}

/// Builds one student's bulletin over `modules`. The book may contain other
/// students' rows; they are ignored.
pub fn build_bulletin(
    student: &Student,
    modules: &[Module],
    book: &GradeBook,
    period: Option<&GradingPeriod>,
    config: &EngineConfig,
) -> StudentBulletin {
    let scoped = scope_to_period(book, period);
    let mut bulletin = bulletin_in_scope(student, modules, &scoped, config);
    bulletin.period = period.cloned();
    bulletin
}

fn scope_to_period<'a>(book: &'a GradeBook, period: Option<&GradingPeriod>) -> Cow<'a, GradeBook> {
    match period {
        Some(period) => Cow::Owned(book.in_period(period)),
        None => Cow::Borrowed(book),
    }
}

fn bulletin_in_scope(
    student: &Student,
    modules: &[Module],
    scoped: &GradeBook,
    config: &EngineConfig,
) -> StudentBulletin {
    let mut by_module: HashMap<Uuid, Vec<Assessment>> = HashMap::new();
    for assessment in scoped.assessments.iter().filter(|a| a.student_id == student.id) {
        by_module
            .entry(assessment.module_id)
            .or_default()
            .push(assessment.clone());
    }

    let mut lines = Vec::with_capacity(modules.len());
    for module in modules {
        let rejected = scoped
            .rejected
            .iter()
            .find(|r| r.student_id == student.id && r.module_id == module.id);
        let cell = match rejected {
            Some(row) => ModuleCell::Unavailable {
                reason: row.reason.clone(),
            },
            None => {
                let rows = by_module.remove(&module.id).unwrap_or_default();
                aggregate_cell(&rows, config.scale)
            }
        };
        if let ModuleCell::Unavailable { reason } = &cell {
            warn!(student_id = %student.id, module_id = %module.id, %reason, "bulletin cell unavailable");
        }
        lines.push(ModuleLine {
            module_id: module.id,
            module_name: module.name.clone(),
            coefficient: module.coefficient,
            cell,
        });
    }

    let graded: Vec<ModuleAverage> = lines
        .iter()
        .filter_map(|line| match &line.cell {
            ModuleCell::Graded(module) => Some(module.clone()),
            _ => None,
        })
        .collect();
    let coefficients: HashMap<Uuid, Decimal> = modules.iter().map(|m| (m.id, m.coefficient)).collect();
    let overall = overall_average(&graded, config.overall_weighting, &coefficients);

    StudentBulletin {
        student: student.clone(),
        period: None,
        modules: lines,
        overall_average: overall,
        passed: overall.map(|avg| avg >= config.passing_threshold),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleStatistics {
    pub module_id: Uuid,
    pub module_name: String,
    pub statistics: CohortStatistics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortReport {
    pub period: Option<GradingPeriod>,
    pub bulletins: Vec<StudentBulletin>,
    pub per_module: Vec<ModuleStatistics>,
    pub overall: CohortStatistics,
}

/// Bulletins for every reportable student plus module and overall statistics.
pub fn build_cohort_report(
    students: &[Student],
    modules: &[Module],
    book: &GradeBook,
    period: Option<&GradingPeriod>,
    config: &EngineConfig,
) -> CohortReport {
    let scoped = scope_to_period(book, period);
    let bulletins: Vec<StudentBulletin> = students
        .iter()
        .filter(|s| s.status.is_reportable())
        .map(|s| bulletin_in_scope(s, modules, &scoped, config))
        .map(|mut bulletin| {
            bulletin.period = period.cloned();
            bulletin
        })
        .collect();

    let per_module = modules
        .iter()
        .enumerate()
        .map(|(idx, module)| {
            let averages: Vec<Option<Decimal>> = bulletins
                .iter()
                .map(|b| b.modules.get(idx).and_then(|line| line.cell.average()))
                .collect();
            ModuleStatistics {
                module_id: module.id,
                module_name: module.name.clone(),
                statistics: compute_cohort_statistics(&averages, config.passing_threshold),
            }
        })
        .collect();

    let overall_averages: Vec<Option<Decimal>> =
        bulletins.iter().map(|b| b.overall_average).collect();

    CohortReport {
        period: period.cloned(),
        overall: compute_cohort_statistics(&overall_averages, config.passing_threshold),
        per_module,
        bulletins,
    }
}
