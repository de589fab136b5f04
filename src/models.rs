use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentKind {
    Homework,
    Test,
    Exam,
    Oral,
    Lab,
    Project,
}

impl AssessmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Homework => "homework",
            Self::Test => "test",
            Self::Exam => "exam",
            Self::Oral => "oral",
            Self::Lab => "lab",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for AssessmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssessmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "homework" => Ok(Self::Homework),
            "test" | "quiz" => Ok(Self::Test),
            "exam" => Ok(Self::Exam),
            "oral" => Ok(Self::Oral),
            "lab" => Ok(Self::Lab),
            "project" => Ok(Self::Project),
            other => Err(format!("unknown assessment kind '{other}'")),
        }
    }
}

/// A single validated graded event. Only constructed through
/// [`Assessment::new`] or `TryFrom<AssessmentRow>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub module_id: Uuid,
    pub period_id: Option<Uuid>,
    pub date: NaiveDate,
    pub kind: AssessmentKind,
    pub score: Decimal,
    pub max_points: Decimal,
    pub weight: Decimal,
}

impl Assessment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        student_id: Uuid,
        module_id: Uuid,
        period_id: Option<Uuid>,
        date: NaiveDate,
        kind: AssessmentKind,
        score: Decimal,
        max_points: Decimal,
        weight: Decimal,
    ) -> EngineResult<Self> {
        let assessment = Self {
            id,
            student_id,
            module_id,
            period_id,
            date,
            kind,
            score,
            max_points,
            weight,
        };
        assessment.validate()?;
        Ok(assessment)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_points <= Decimal::ZERO {
            return Err(EngineError::invalid_assessment(
                self.id,
                format!("max points {} must be positive", self.max_points),
            ));
        }
        if self.score < Decimal::ZERO {
            return Err(EngineError::invalid_assessment(
                self.id,
                format!("score {} is negative", self.score),
            ));
        }
        if self.score > self.max_points {
            return Err(EngineError::invalid_assessment(
                self.id,
                format!("score {} exceeds max points {}", self.score, self.max_points),
            ));
        }
        if self.weight < Decimal::ZERO {
            return Err(EngineError::invalid_assessment(
                self.id,
                format!("weight {} is negative", self.weight),
            ));
        }
        Ok(())
    }
}

/// Assessment as it comes out of the store or an import file, before
/// validation. Missing score or max points are rejected; a missing weight
/// defaults to 1.
#[derive(Debug, Clone, Deserialize)]
pub struct AssessmentRow {
    pub id: Uuid,
    pub student_id: Uuid,
    pub module_id: Uuid,
    pub period_id: Option<Uuid>,
    pub date: NaiveDate,
    pub kind: Option<String>,
    pub score: Option<Decimal>,
    pub max_points: Option<Decimal>,
    pub weight: Option<Decimal>,
}

impl TryFrom<AssessmentRow> for Assessment {
    type Error = EngineError;

    fn try_from(row: AssessmentRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_deref() {
            Some(raw) => raw
                .parse::<AssessmentKind>()
                .map_err(|reason| EngineError::invalid_assessment(row.id, reason))?,
            None => AssessmentKind::Test,
        };
        let score = row
            .score
            .ok_or_else(|| EngineError::invalid_assessment(row.id, "score is missing"))?;
        let max_points = row
            .max_points
            .ok_or_else(|| EngineError::invalid_assessment(row.id, "max points is missing"))?;

        Assessment::new(
            row.id,
            row.student_id,
            row.module_id,
            row.period_id,
            row.date,
            kind,
            score,
            max_points,
            row.weight.unwrap_or(Decimal::ONE),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Semester {
    S1,
    S2,
}

impl FromStr for Semester {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "S1" => Ok(Self::S1),
            "S2" => Ok(Self::S2),
            other => Err(format!("unknown semester '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: Uuid,
    pub school_id: Uuid,
    pub track_id: Option<Uuid>,
    pub name: String,
    pub weekly_hours: Decimal,
    pub semester: Semester,
    /// Credit weight used when overall averages are weighted by module.
    pub coefficient: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingPeriod {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_active: bool,
}

impl GradingPeriod {
    pub fn validate(&self) -> EngineResult<()> {
        if self.start_date >= self.end_date {
            return Err(EngineError::InvalidPeriod {
                period_id: self.id,
                reason: format!(
                    "start date {} is not before end date {}",
                    self.start_date, self.end_date
                ),
            });
        }
        Ok(())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    Suspended,
    Withdrawn,
    Graduated,
}

impl EnrollmentStatus {
    /// Students counted in cohort reports.
    pub fn is_reportable(&self) -> bool {
        matches!(self, Self::Enrolled | Self::Suspended)
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enrolled" | "active" => Ok(Self::Enrolled),
            "suspended" => Ok(Self::Suspended),
            "withdrawn" => Ok(Self::Withdrawn),
            "graduated" => Ok(Self::Graduated),
            other => Err(format!("unknown enrollment status '{other}'")),
        }
    }
}

/// Track names are unique per school only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    pub school_id: Uuid,
    pub school_name: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub level: String,
    pub status: EnrollmentStatus,
    pub track_id: Option<Uuid>,
    pub school_id: Uuid,
}

/// Set of weekdays stored as a bitmask (bit 0 = Monday).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<Weekday>", from = "Vec<Weekday>")]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersects(&self, other: &WeekdaySet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        ALL_WEEKDAYS.iter().copied().filter(|day| self.contains(*day))
    }

    /// Parses a comma separated list such as `mon,wed` or `Monday, Friday`.
    pub fn parse_list(raw: &str) -> Result<Self, String> {
        let mut set = Self::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let day = part
                .parse::<Weekday>()
                .map_err(|_| format!("unknown weekday '{part}'"))?;
            set.insert(day);
        }
        Ok(set)
    }

    /// Weekday numbers as persisted (0 = Monday).
    pub fn to_numbers(&self) -> Vec<i16> {
        self.iter()
            .map(|day| day.num_days_from_monday() as i16)
            .collect()
    }

    pub fn from_numbers(numbers: &[i16]) -> Result<Self, String> {
        let mut set = Self::new();
        for number in numbers {
            let day = usize::try_from(*number)
                .ok()
                .and_then(|idx| ALL_WEEKDAYS.get(idx))
                .ok_or_else(|| format!("weekday number {number} out of range"))?;
            set.insert(*day);
        }
        Ok(set)
    }
}

const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<T: IntoIterator<Item = Weekday>>(iter: T) -> Self {
        let mut set = Self::new();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

impl From<Vec<Weekday>> for WeekdaySet {
    fn from(days: Vec<Weekday>) -> Self {
        days.into_iter().collect()
    }
}

impl From<WeekdaySet> for Vec<Weekday> {
    fn from(set: WeekdaySet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|day| day.to_string()).collect();
        f.write_str(&names.join(","))
    }
}

/// A recurring weekly slot assigned to a teacher, bounded by a date range.
/// Times form the half-open interval `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeachingBlock {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub module_id: Uuid,
    pub room: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub days: WeekdaySet,
    pub hours_per_occurrence: Decimal,
}

impl TeachingBlock {
    pub fn validate(&self) -> EngineResult<()> {
        if self.start_time >= self.end_time {
            return Err(EngineError::invalid_block(
                self.id,
                format!(
                    "start time {} is not before end time {}",
                    self.start_time, self.end_time
                ),
            ));
        }
        if self.start_date > self.end_date {
            return Err(EngineError::invalid_block(
                self.id,
                format!(
                    "start date {} is after end date {}",
                    self.start_date, self.end_date
                ),
            ));
        }
        if self.days.is_empty() {
            return Err(EngineError::invalid_block(self.id, "no weekdays selected"));
        }
        if self.hours_per_occurrence < Decimal::ZERO {
            return Err(EngineError::negative_hours(self.id, self.hours_per_occurrence));
        }
        Ok(())
    }

    pub fn dates_intersect(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && start <= self.end_date
    }
}

/// Teaching block as read from the store, weekdays still in numeric form.
#[derive(Debug, Clone)]
pub struct TeachingBlockRow {
    pub id: Uuid,
    pub teacher_id: Uuid,
    pub module_id: Uuid,
    pub room: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub weekdays: Vec<i16>,
    pub hours_per_occurrence: Decimal,
}

impl TryFrom<TeachingBlockRow> for TeachingBlock {
    type Error = EngineError;

    fn try_from(row: TeachingBlockRow) -> Result<Self, Self::Error> {
        let days = WeekdaySet::from_numbers(&row.weekdays)
            .map_err(|reason| EngineError::invalid_block(row.id, reason))?;
        let block = TeachingBlock {
            id: row.id,
            teacher_id: row.teacher_id,
            module_id: row.module_id,
            room: row.room,
            start_date: row.start_date,
            end_date: row.end_date,
            start_time: row.start_time,
            end_time: row.end_time,
            days,
            hours_per_occurrence: row.hours_per_occurrence,
        };
        block.validate()?;
        Ok(block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    FullTime,
    PartTime,
    PerSession,
}

impl FromStr for ContractType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full_time" | "permanent" => Ok(Self::FullTime),
            "part_time" => Ok(Self::PartTime),
            "per_session" | "vacataire" => Ok(Self::PerSession),
            other => Err(format!("unknown contract type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: Uuid,
    pub school_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub contract: ContractType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(score: Option<Decimal>, max_points: Option<Decimal>) -> AssessmentRow {
        AssessmentRow {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            module_id: Uuid::new_v4(),
            period_id: None,
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            kind: Some("exam".to_string()),
            score,
            max_points,
            weight: None,
        }
    }

    #[test]
    fn row_without_weight_defaults_to_one() {
        let assessment =
            Assessment::try_from(row(Some(Decimal::from(12)), Some(Decimal::from(20)))).unwrap();
        assert_eq!(assessment.weight, Decimal::ONE);
        assert_eq!(assessment.kind, AssessmentKind::Exam);
    }

    #[test]
    fn row_with_score_above_max_is_rejected() {
        let err = Assessment::try_from(row(Some(Decimal::from(21)), Some(Decimal::from(20))))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAssessment { .. }));
    }

    #[test]
    fn row_with_missing_max_points_is_rejected() {
        let err = Assessment::try_from(row(Some(Decimal::from(5)), None)).unwrap_err();
        assert!(err.to_string().contains("max points is missing"));
    }

    #[test]
    fn zero_max_points_is_rejected() {
        let err = Assessment::try_from(row(Some(Decimal::ZERO), Some(Decimal::ZERO))).unwrap_err();
        assert!(matches!(err, EngineError::InvalidAssessment { .. }));
    }

    #[test]
    fn weekday_set_parses_names_and_intersects() {
        let a = WeekdaySet::parse_list("mon, Wednesday").unwrap();
        let b = WeekdaySet::parse_list("wed").unwrap();
        let c = WeekdaySet::parse_list("tue").unwrap();
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.to_numbers(), vec![0, 2]);
        assert!(WeekdaySet::parse_list("someday").is_err());
    }

    #[test]
    fn weekday_numbers_out_of_range_are_rejected() {
        assert!(WeekdaySet::from_numbers(&[7]).is_err());
        assert!(WeekdaySet::from_numbers(&[-1]).is_err());
        let set = WeekdaySet::from_numbers(&[4, 0]).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Weekday::Mon, Weekday::Fri]);
    }

    #[test]
    fn period_requires_start_before_end() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let period = GradingPeriod {
            id: Uuid::new_v4(),
            school_id: Uuid::new_v4(),
            name: "T1".to_string(),
            start_date: day,
            end_date: day,
            is_active: true,
        };
        assert!(period.validate().is_err());
    }

    #[test]
    fn contract_types_parse_loosely() {
        assert_eq!("Full-Time".parse::<ContractType>(), Ok(ContractType::FullTime));
        assert_eq!("per_session".parse::<ContractType>(), Ok(ContractType::PerSession));
        assert!("intern".parse::<ContractType>().is_err());
    }
}
