use chrono::NaiveTime;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::TeachingBlock;

/// Half-open overlap test on `[start, end)` intervals; abutting intervals
/// do not overlap.
pub fn times_overlap(a: (NaiveTime, NaiveTime), b: (NaiveTime, NaiveTime)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// Two blocks conflict when they share a weekday, their times overlap and
/// their date ranges intersect.
pub fn blocks_conflict(a: &TeachingBlock, b: &TeachingBlock) -> bool {
    a.days.intersects(&b.days)
        && times_overlap((a.start_time, a.end_time), (b.start_time, b.end_time))
        && a.dates_intersect(b.start_date, b.end_date)
}

/// Blocks in `existing` that collide with `candidate` for the same teacher
/// or the same room. A block with the candidate's id is its own pre-edit
/// version and is skipped.
pub fn find_conflicts<'a>(
    candidate: &TeachingBlock,
    existing: &'a [TeachingBlock],
) -> Vec<&'a TeachingBlock> {
    existing
        .iter()
        .filter(|block| block.id != candidate.id)
        .filter(|block| shares_resource(candidate, block))
        .filter(|block| blocks_conflict(candidate, block))
        .collect()
}

pub fn has_conflict(candidate: &TeachingBlock, existing: &[TeachingBlock]) -> bool {
    !find_conflicts(candidate, existing).is_empty()
}

fn shares_resource(a: &TeachingBlock, b: &TeachingBlock) -> bool {
    if a.teacher_id == b.teacher_id {
        return true;
    }
    match (&a.room, &b.room) {
        (Some(left), Some(right)) => left.trim().eq_ignore_ascii_case(right.trim()),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictingBlock {
    pub block_id: Uuid,
    pub teacher_id: Uuid,
    pub room: Option<String>,
    pub days: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl From<&TeachingBlock> for ConflictingBlock {
    fn from(block: &TeachingBlock) -> Self {
        Self {
            block_id: block.id,
            teacher_id: block.teacher_id,
            room: block.room.clone(),
            days: block.days.to_string(),
            start_time: block.start_time,
            end_time: block.end_time,
        }
    }
}

/// Result of checking a proposed block. A conflict is an expected business
/// rejection, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "conflicts", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Clear,
    Conflict(Vec<ConflictingBlock>),
}

impl ScheduleOutcome {
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }

    pub fn message(&self) -> String {
        match self {
            Self::Clear => "no scheduling conflict".to_string(),
            Self::Conflict(conflicts) => {
                let details: Vec<String> = conflicts
                    .iter()
                    .map(|c| format!("{} ({} {}-{})", c.block_id, c.days, c.start_time, c.end_time))
                    .collect();
                format!("schedule conflicts with {}", details.join(", "))
            }
        }
    }
}

/// Validates `candidate` and checks it against `existing`.
pub fn check_block(candidate: &TeachingBlock, existing: &[TeachingBlock]) -> EngineResult<ScheduleOutcome> {
    candidate.validate()?;
    let conflicts = find_conflicts(candidate, existing);
    if conflicts.is_empty() {
        Ok(ScheduleOutcome::Clear)
    } else {
        Ok(ScheduleOutcome::Conflict(
            conflicts.into_iter().map(ConflictingBlock::from).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::models::WeekdaySet;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn block(teacher_id: Uuid, days: &str, start: u32, end: u32) -> TeachingBlock {
        TeachingBlock {
            id: Uuid::new_v4(),
            teacher_id,
            module_id: Uuid::new_v4(),
            room: None,
            start_date: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2027, 1, 31).unwrap(),
            start_time: NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
            days: WeekdaySet::parse_list(days).unwrap(),
            hours_per_occurrence: Decimal::from(2),
        }
    }

    #[test]
    fn overlapping_times_on_shared_day_conflict() {
        let teacher = Uuid::new_v4();
        let existing = vec![block(teacher, "mon,wed", 8, 10)];
        let candidate = block(teacher, "mon", 9, 11);
        assert!(has_conflict(&candidate, &existing));
    }

    #[test]
    fn different_days_do_not_conflict() {
        let teacher = Uuid::new_v4();
        let existing = vec![block(teacher, "mon", 8, 10)];
        let candidate = block(teacher, "tue", 8, 10);
        assert!(!has_conflict(&candidate, &existing));
    }

    #[test]
    fn abutting_intervals_do_not_conflict() {
        let teacher = Uuid::new_v4();
        let existing = vec![block(teacher, "mon", 8, 10)];
        let candidate = block(teacher, "mon", 10, 12);
        assert!(!has_conflict(&candidate, &existing));
    }

    #[test]
    fn disjoint_date_ranges_do_not_conflict() {
        let teacher = Uuid::new_v4();
        let existing = vec![block(teacher, "mon", 8, 10)];
        let mut candidate = block(teacher, "mon", 8, 10);
        candidate.start_date = NaiveDate::from_ymd_opt(2027, 2, 1).unwrap();
        candidate.end_date = NaiveDate::from_ymd_opt(2027, 6, 30).unwrap();
        assert!(!has_conflict(&candidate, &existing));
    }

    #[test]
    fn edited_block_ignores_its_previous_version() {
        let teacher = Uuid::new_v4();
        let original = block(teacher, "thu", 14, 16);
        let mut edited = original.clone();
        edited.end_time = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        assert!(!has_conflict(&edited, &[original]));
    }

    #[test]
    fn other_teachers_only_conflict_through_shared_rooms() {
        let existing = vec![block(Uuid::new_v4(), "fri", 8, 10)];
        let mut candidate = block(Uuid::new_v4(), "fri", 9, 10);
        assert!(!has_conflict(&candidate, &existing));

        let mut in_room = existing[0].clone();
        in_room.room = Some("B-204".to_string());
        candidate.room = Some("b-204 ".to_string());
        assert!(has_conflict(&candidate, &[in_room]));
    }

    #[test]
    fn find_conflicts_lists_every_collision() {
        let teacher = Uuid::new_v4();
        let existing = vec![
            block(teacher, "mon", 8, 10),
            block(teacher, "mon", 10, 12),
            block(teacher, "tue", 9, 11),
        ];
        let candidate = block(teacher, "mon,tue", 9, 11);
        assert_eq!(find_conflicts(&candidate, &existing).len(), 3);
    }

    #[test]
    fn check_block_reports_structured_conflicts() {
        let teacher = Uuid::new_v4();
        let existing = vec![block(teacher, "wed", 8, 10)];
        let candidate = block(teacher, "wed", 9, 10);
        let outcome = check_block(&candidate, &existing).unwrap();
        match &outcome {
            ScheduleOutcome::Conflict(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].block_id, existing[0].id);
            }
            ScheduleOutcome::Clear => panic!("expected a conflict"),
        }
        assert!(outcome.message().contains(&existing[0].id.to_string()));
    }

    #[test]
    fn check_block_rejects_inverted_times() {
        let candidate = block(Uuid::new_v4(), "wed", 10, 9);
        let err = check_block(&candidate, &[]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBlock { .. }));
    }
}
