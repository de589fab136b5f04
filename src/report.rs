use std::fmt::Write;

use clap::ValueEnum;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::grading::{CohortReport, CohortStatistics, ModuleCell, StudentBulletin};
use crate::models::ContractType;
use crate::schedule::ScheduleOutcome;
use crate::teaching_load::{hours_by_module, TeachingLoad};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Markdown,
    Json,
}

pub fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn format_average(value: Option<Decimal>) -> String {
    match value {
        Some(avg) => format!("{:.2}", avg),
        None => "N/A".to_string(),
    }
}

/// Failed cells and ungraded cells render differently, and neither as 0.
pub fn render_cell(cell: &ModuleCell) -> String {
    match cell {
        ModuleCell::Graded(module) => format!(
            "{:.2} ({} assessments)",
            module.average, module.assessment_count
        ),
        ModuleCell::NoData => "not graded".to_string(),
        ModuleCell::Unavailable { .. } => "N/A".to_string(),
    }
}

fn write_statistics(output: &mut String, stats: &CohortStatistics) {
    if stats.evaluated_count == 0 {
        let _ = writeln!(output, "No graded students.");
        return;
    }
    let _ = writeln!(output, "- Evaluated: {}", stats.evaluated_count);
    let _ = writeln!(output, "- Mean: {}", format_average(stats.mean));
    let _ = writeln!(output, "- Highest: {}", format_average(stats.max));
    let _ = writeln!(output, "- Lowest: {}", format_average(stats.min));
    if let Some(rate) = stats.pass_rate {
        let _ = writeln!(output, "- Pass rate: {rate}%");
    }
}

pub fn build_bulletin_report(bulletin: &StudentBulletin, scale: Decimal) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Bulletin: {}", bulletin.student.full_name);
    match &bulletin.period {
        Some(period) => {
            let _ = writeln!(
                output,
                "Period {} ({} to {}), level {}",
                period.name, period.start_date, period.end_date, bulletin.student.level
            );
        }
        None => {
            let _ = writeln!(output, "All periods, level {}", bulletin.student.level);
        }
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Modules (out of {})", scale.normalize());

    if bulletin.modules.is_empty() {
        let _ = writeln!(output, "No modules for this student.");
    }
    for line in &bulletin.modules {
        let _ = writeln!(
            output,
            "- {} (coef. {}): {}",
            line.module_name,
            line.coefficient.normalize(),
            render_cell(&line.cell)
        );
        if let ModuleCell::Unavailable { reason } = &line.cell {
            let _ = writeln!(output, "  - {reason}");
        }
    }

    let _ = writeln!(output);
    let verdict = match bulletin.passed {
        Some(true) => "passed",
        Some(false) => "not passed",
        None => "no result",
    };
    let _ = writeln!(
        output,
        "Overall average: {} ({verdict})",
        format_average(bulletin.overall_average)
    );
    output
}

pub fn build_class_report(label: &str, report: &CohortReport) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Class Report");
    match &report.period {
        Some(period) => {
            let _ = writeln!(
                output,
                "Generated for {} over {} ({} to {})",
                label, period.name, period.start_date, period.end_date
            );
        }
        None => {
            let _ = writeln!(output, "Generated for {} over all periods", label);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Overall");
    write_statistics(&mut output, &report.overall);

    for module in &report.per_module {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", module.module_name);
        write_statistics(&mut output, &module.statistics);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students");
    if report.bulletins.is_empty() {
        let _ = writeln!(output, "No enrolled students in this cohort.");
    }
    let mut ranked: Vec<&StudentBulletin> = report.bulletins.iter().collect();
    ranked.sort_by(|a, b| {
        b.overall_average
            .cmp(&a.overall_average)
            .then_with(|| a.student.full_name.cmp(&b.student.full_name))
    });
    for bulletin in ranked {
        let cells: Vec<String> = bulletin
            .modules
            .iter()
            .map(|line| format!("{} {}", line.module_name, format_average(line.cell.average())))
            .collect();
        let _ = writeln!(
            output,
            "- {}: {} [{}]",
            bulletin.student.full_name,
            format_average(bulletin.overall_average),
            cells.join(", ")
        );
    }

    output
}

pub fn build_load_report(teacher: &str, contract: ContractType, load: &TeachingLoad) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Teaching Load: {}", teacher);
    let _ = writeln!(
        output,
        "Window {} to {}, contract {:?}, counted {:?}",
        load.window_start, load.window_end, contract, load.policy
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "- Hours taught: {}", load.hours_taught.normalize());
    let _ = writeln!(output, "- Hours due: {}", load.hours_due.normalize());
    let _ = writeln!(output, "- Overtime: {}", load.overtime.normalize());

    let _ = writeln!(output);
    let _ = writeln!(output, "## Blocks");
    if load.contributions.is_empty() {
        let _ = writeln!(output, "No teaching blocks in this window.");
    }
    for contribution in &load.contributions {
        match contribution.occurrences {
            Some(count) => {
                let _ = writeln!(
                    output,
                    "- {}: {} hours over {} sessions",
                    contribution.block_id,
                    contribution.hours.normalize(),
                    count
                );
            }
            None => {
                let _ = writeln!(
                    output,
                    "- {}: {} hours",
                    contribution.block_id,
                    contribution.hours.normalize()
                );
            }
        }
    }

    let mut per_module: Vec<_> = hours_by_module(load).into_iter().collect();
    if !per_module.is_empty() {
        per_module.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let _ = writeln!(output);
        let _ = writeln!(output, "## Modules");
        for (module_id, hours) in per_module {
            let _ = writeln!(output, "- {}: {} hours", module_id, hours.normalize());
        }
    }
    output
}

pub fn build_schedule_report(outcome: &ScheduleOutcome) -> String {
    let mut output = String::new();
    match outcome {
        ScheduleOutcome::Clear => {
            let _ = writeln!(output, "No conflicts found.");
        }
        ScheduleOutcome::Conflict(conflicts) => {
            let _ = writeln!(output, "Conflicts with {} existing blocks:", conflicts.len());
            for conflict in conflicts {
                let room = conflict.room.as_deref().unwrap_or("no room");
                let _ = writeln!(
                    output,
                    "- {} ({}, {} {}-{})",
                    conflict.block_id, room, conflict.days, conflict.start_time, conflict.end_time
                );
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::grading::{build_cohort_report, GradeBook};
    use crate::models::{Assessment, AssessmentKind, EnrollmentStatus, Module, Semester, Student};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn student(name: &str) -> Student {
        Student {
            id: Uuid::new_v4(),
            full_name: name.to_string(),
            level: "L2".to_string(),
            status: EnrollmentStatus::Enrolled,
            track_id: None,
            school_id: Uuid::nil(),
        }
    }

    fn module(name: &str) -> Module {
        Module {
            id: Uuid::new_v4(),
            school_id: Uuid::nil(),
            track_id: None,
            name: name.to_string(),
            weekly_hours: Decimal::from(4),
            semester: Semester::S1,
            coefficient: Decimal::ONE,
        }
    }

    fn assessment(student: &Student, module: &Module, score: i64, max: i64) -> Assessment {
        Assessment {
            id: Uuid::new_v4(),
            student_id: student.id,
            module_id: module.id,
            period_id: None,
            date: NaiveDate::from_ymd_opt(2026, 10, 5).unwrap(),
            kind: AssessmentKind::Exam,
            score: Decimal::from(score),
            max_points: Decimal::from(max),
            weight: Decimal::ONE,
        }
    }

    fn sample_report() -> CohortReport {
        let (ana, ben, cai) = (student("Ana"), student("Ben"), student("Cai"));
        let (math, bio) = (module("Math"), module("Biology"));
        let rows = vec![
            assessment(&ana, &math, 18, 20),
            assessment(&ana, &bio, 14, 20),
            assessment(&ben, &math, 0, 20),
            assessment(&cai, &bio, 30, 20),
        ];
        build_cohort_report(
            &[ana, ben, cai],
            &[math, bio],
            &GradeBook::from(rows),
            None,
            &EngineConfig::default(),
        )
    }

    #[test]
    fn class_report_distinguishes_zero_from_missing() {
        let output = build_class_report("Track A", &sample_report());
        assert!(output.contains("# Class Report"));
        assert!(output.contains("- Ana: 16.00 [Math 18.00, Biology 14.00]"));
        assert!(output.contains("- Ben: 0.00 [Math 0.00, Biology N/A]"));
        assert!(output.contains("- Cai: N/A [Math N/A, Biology N/A]"));
        assert!(output.contains("- Pass rate: 50%"));
    }

    #[test]
    fn bulletin_report_shows_failure_reason() {
        let report = sample_report();
        let cai = report
            .bulletins
            .iter()
            .find(|b| b.student.full_name == "Cai")
            .unwrap();
        let output = build_bulletin_report(cai, Decimal::from(20));
        assert!(output.contains("- Math (coef. 1): not graded"));
        assert!(output.contains("- Biology (coef. 1): N/A"));
        assert!(output.contains("exceeds max points"));
        assert!(output.contains("Overall average: N/A (no result)"));
    }

    #[test]
    fn json_report_tags_cell_status() {
        let json = to_json(&sample_report()).unwrap();
        assert!(json.contains("\"status\": \"graded\""));
        assert!(json.contains("\"status\": \"no_data\""));
        assert!(json.contains("\"status\": \"unavailable\""));
    }

    #[test]
    fn class_report_for_a_track_without_students_keeps_its_period() {
        use crate::models::GradingPeriod;

        let period = GradingPeriod {
            id: Uuid::new_v4(),
            school_id: Uuid::nil(),
            name: "Trimester 1".to_string(),
            start_date: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 11, 30).unwrap(),
            is_active: true,
        };
        let report = build_cohort_report(
            &[],
            &[module("Math")],
            &GradeBook::default(),
            Some(&period),
            &EngineConfig::default(),
        );
        let output = build_class_report("Sciences L1", &report);
        assert!(output.contains("Generated for Sciences L1 over Trimester 1 (2026-09-01 to 2026-11-30)"));
        assert!(!output.contains("all periods"));
        assert!(output.contains("No enrolled students in this cohort."));
    }

    #[test]
    fn schedule_report_lists_conflicts() {
        assert_eq!(build_schedule_report(&ScheduleOutcome::Clear), "No conflicts found.\n");
    }

    #[test]
    fn load_report_lists_hours_and_overtime() {
        use crate::config::LoadPolicy;
        use crate::teaching_load::BlockContribution;

        let module_id = Uuid::new_v4();
        let load = TeachingLoad {
            window_start: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            window_end: NaiveDate::from_ymd_opt(2027, 1, 31).unwrap(),
            policy: LoadPolicy::PerBlock,
            hours_taught: Decimal::from(24),
            hours_due: Decimal::from(20),
            overtime: Decimal::from(4),
            contributions: vec![
                BlockContribution {
                    block_id: Uuid::new_v4(),
                    module_id,
                    occurrences: None,
                    hours: Decimal::from(12),
                },
                BlockContribution {
                    block_id: Uuid::new_v4(),
                    module_id,
                    occurrences: None,
                    hours: Decimal::from(12),
                },
            ],
        };
        let output = build_load_report("Karim Haddad", ContractType::FullTime, &load);
        assert!(output.contains("- Hours taught: 24"));
        assert!(output.contains("- Overtime: 4"));
        assert!(output.contains(&format!("- {module_id}: 24 hours")));
    }
}
