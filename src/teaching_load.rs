use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::config::LoadPolicy;
use crate::error::{EngineError, EngineResult};
use crate::models::{GradingPeriod, TeachingBlock};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockContribution {
    pub block_id: Uuid,
    pub module_id: Uuid,
    /// Dated occurrences inside the window; only filled for per-occurrence loads.
    pub occurrences: Option<u32>,
    pub hours: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeachingLoad {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub policy: LoadPolicy,
    pub hours_taught: Decimal,
    pub hours_due: Decimal,
    pub overtime: Decimal,
    pub contributions: Vec<BlockContribution>,
}

/// Number of dates in `block ∩ [window_start, window_end]` falling on one of
/// the block's weekdays.
pub fn count_occurrences(block: &TeachingBlock, window_start: NaiveDate, window_end: NaiveDate) -> u32 {
    let from = block.start_date.max(window_start);
    let to = block.end_date.min(window_end);
    if from > to {
        return 0;
    }
    let count = from
        .iter_days()
        .take_while(|day| *day <= to)
        .filter(|day| block.days.contains(day.weekday()))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Hours taught in the window by the blocks that intersect it, and the
/// overtime beyond `hours_due`.
pub fn compute_teaching_load(
    blocks: &[TeachingBlock],
    window_start: NaiveDate,
    window_end: NaiveDate,
    hours_due: Decimal,
    policy: LoadPolicy,
) -> EngineResult<TeachingLoad> {
    if window_start > window_end {
        return Err(EngineError::InvalidWindow {
            start: window_start,
            end: window_end,
        });
    }

    let mut contributions = Vec::new();
    for block in blocks {
        if block.hours_per_occurrence < Decimal::ZERO {
            return Err(EngineError::negative_hours(block.id, block.hours_per_occurrence));
        }
        if !block.dates_intersect(window_start, window_end) {
            continue;
        }
        let contribution = match policy {
            LoadPolicy::PerBlock => BlockContribution {
                block_id: block.id,
                module_id: block.module_id,
                occurrences: None,
                hours: block.hours_per_occurrence,
            },
            LoadPolicy::PerOccurrence => {
                let occurrences = count_occurrences(block, window_start, window_end);
                BlockContribution {
                    block_id: block.id,
                    module_id: block.module_id,
                    occurrences: Some(occurrences),
                    hours: block.hours_per_occurrence * Decimal::from(occurrences),
                }
            }
        };
        contributions.push(contribution);
    }

    let hours_taught: Decimal = contributions.iter().map(|c| c.hours).sum();
    let overtime = (hours_taught - hours_due).max(Decimal::ZERO);

    Ok(TeachingLoad {
        window_start,
        window_end,
        policy,
        hours_taught,
        hours_due,
        overtime,
        contributions,
    })
}

/// Hours per module inside a computed load.
pub fn hours_by_module(load: &TeachingLoad) -> HashMap<Uuid, Decimal> {
    let mut totals: HashMap<Uuid, Decimal> = HashMap::new();
    for contribution in &load.contributions {
        *totals.entry(contribution.module_id).or_insert(Decimal::ZERO) += contribution.hours;
    }
    totals
}

/// Pairs of grading periods of the same school whose date ranges overlap.
pub fn overlapping_periods(periods: &[GradingPeriod]) -> Vec<(&GradingPeriod, &GradingPeriod)> {
    let mut pairs = Vec::new();
    for (idx, left) in periods.iter().enumerate() {
        for right in &periods[idx + 1..] {
            if left.school_id == right.school_id
                && left.start_date <= right.end_date
                && right.start_date <= left.end_date
            {
                pairs.push((left, right));
            }
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WeekdaySet;
    use chrono::NaiveTime;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn block(start: NaiveDate, end: NaiveDate, days: &str, hours: i64) -> TeachingBlock {
        TeachingBlock {
            id: Uuid::new_v4(),
            teacher_id: Uuid::nil(),
            module_id: Uuid::new_v4(),
            room: None,
            start_date: start,
            end_date: end,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            days: WeekdaySet::parse_list(days).unwrap(),
            hours_per_occurrence: Decimal::from(hours),
        }
    }

    fn period(school_id: Uuid, start: NaiveDate, end: NaiveDate) -> GradingPeriod {
        GradingPeriod {
            id: Uuid::new_v4(),
            school_id,
            name: format!("{start}..{end}"),
            start_date: start,
            end_date: end,
            is_active: true,
        }
    }

    #[test]
    fn per_block_load_sums_intersecting_blocks() {
        let blocks = vec![
            block(date(2026, 9, 1), date(2026, 12, 20), "mon", 2),
            block(date(2026, 9, 1), date(2026, 12, 20), "wed", 4),
            block(date(2027, 2, 1), date(2027, 6, 30), "fri", 3),
        ];
        let load = compute_teaching_load(
            &blocks,
            date(2026, 9, 1),
            date(2027, 1, 31),
            Decimal::from(20),
            LoadPolicy::PerBlock,
        )
        .unwrap();
        assert_eq!(load.hours_taught, Decimal::from(6));
        assert_eq!(load.overtime, Decimal::ZERO);
        assert_eq!(load.contributions.len(), 2);
    }

    #[test]
    fn overtime_is_hours_beyond_due() {
        let blocks = vec![
            block(date(2026, 9, 1), date(2026, 12, 20), "mon", 12),
            block(date(2026, 9, 1), date(2026, 12, 20), "tue", 11),
        ];
        let load = compute_teaching_load(
            &blocks,
            date(2026, 9, 1),
            date(2027, 1, 31),
            Decimal::from(20),
            LoadPolicy::PerBlock,
        )
        .unwrap();
        assert_eq!(load.overtime, Decimal::from(3));
    }

    #[test]
    fn per_session_teacher_overtime_is_everything_taught() {
        let blocks = vec![block(date(2026, 9, 1), date(2026, 9, 30), "thu", 2)];
        let load = compute_teaching_load(
            &blocks,
            date(2026, 9, 1),
            date(2026, 9, 30),
            Decimal::ZERO,
            LoadPolicy::PerBlock,
        )
        .unwrap();
        assert_eq!(load.overtime, Decimal::from(2));
    }

    #[test]
    fn per_occurrence_load_counts_weekdays_inside_window() {
        // September 2026 has 4 Mondays and 5 Wednesdays.
        let blocks = vec![block(date(2026, 8, 1), date(2026, 12, 31), "mon,wed", 2)];
        let load = compute_teaching_load(
            &blocks,
            date(2026, 9, 1),
            date(2026, 9, 30),
            Decimal::from(10),
            LoadPolicy::PerOccurrence,
        )
        .unwrap();
        assert_eq!(load.contributions[0].occurrences, Some(9));
        assert_eq!(load.hours_taught, Decimal::from(18));
        assert_eq!(load.overtime, Decimal::from(8));
    }

    #[test]
    fn occurrences_clip_to_block_dates() {
        let b = block(date(2026, 9, 14), date(2026, 9, 20), "mon,tue,sun", 1);
        assert_eq!(count_occurrences(&b, date(2026, 9, 1), date(2026, 9, 30)), 3);
        assert_eq!(count_occurrences(&b, date(2026, 10, 1), date(2026, 10, 30)), 0);
    }

    #[test]
    fn negative_hours_are_rejected() {
        let blocks = vec![block(date(2026, 9, 1), date(2026, 9, 30), "mon", -1)];
        let err = compute_teaching_load(
            &blocks,
            date(2026, 9, 1),
            date(2026, 9, 30),
            Decimal::ZERO,
            LoadPolicy::PerBlock,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidBlock { .. }));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let err = compute_teaching_load(
            &[],
            date(2026, 9, 30),
            date(2026, 9, 1),
            Decimal::ZERO,
            LoadPolicy::PerBlock,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWindow { .. }));
    }

    #[test]
    fn module_totals_group_contributions() {
        let mut a = block(date(2026, 9, 1), date(2026, 9, 30), "mon", 2);
        let mut b = block(date(2026, 9, 1), date(2026, 9, 30), "tue", 3);
        let module = Uuid::new_v4();
        a.module_id = module;
        b.module_id = module;
        let load = compute_teaching_load(
            &[a, b],
            date(2026, 9, 1),
            date(2026, 9, 30),
            Decimal::ZERO,
            LoadPolicy::PerBlock,
        )
        .unwrap();
        assert_eq!(hours_by_module(&load).get(&module), Some(&Decimal::from(5)));
    }

    #[test]
    fn overlapping_periods_are_detected_per_school() {
        let school = Uuid::new_v4();
        let periods = vec![
            period(school, date(2026, 9, 1), date(2026, 12, 15)),
            period(school, date(2026, 12, 10), date(2027, 3, 31)),
            period(school, date(2027, 4, 1), date(2027, 6, 30)),
            period(Uuid::new_v4(), date(2026, 9, 1), date(2027, 6, 30)),
        ];
        let pairs = overlapping_periods(&periods);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.id, periods[0].id);
        assert_eq!(pairs[0].1.id, periods[1].id);
    }
}
