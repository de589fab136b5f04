use anyhow::{bail, Context};
use chrono::{NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    AssessmentRow, ContractType, EnrollmentStatus, GradingPeriod, Module, Semester, Student,
    Teacher, TeachingBlock, TeachingBlockRow, Track, WeekdaySet,
};
use crate::schedule::{self, ScheduleOutcome};

const EXCLUSION_VIOLATION: &str = "23P01";
const SERIALIZATION_FAILURE: &str = "40001";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let school_id = Uuid::parse_str("6b1f3c52-8f0e-4d8b-9a51-2f4a9d0c7e11")?;
    let track_id = Uuid::parse_str("a4c2e8d1-3b7f-4f61-8e2d-5c9b1a7f3e20")?;

    sqlx::query(
        r#"
        INSERT INTO academics.schools (id, name)
        VALUES ($1, $2)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(school_id)
    .bind("Lycee Horizon")
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO academics.tracks (id, school_id, name)
        VALUES ($1, $2, $3)
        ON CONFLICT (school_id, name) DO NOTHING
        "#,
    )
    .bind(track_id)
    .bind(school_id)
    .bind("Sciences L1")
    .execute(pool)
    .await?;

    let students = vec![
        ("Amina Diallo", "amina.diallo@horizon.edu", "enrolled"),
        ("Lucas Martin", "lucas.martin@horizon.edu", "enrolled"),
        ("Ines Benali", "ines.benali@horizon.edu", "enrolled"),
        ("Theo Petit", "theo.petit@horizon.edu", "withdrawn"),
    ];

    for (name, email, status) in students {
        sqlx::query(
            r#"
            INSERT INTO academics.students (id, school_id, track_id, full_name, email, level, status)
            VALUES ($1, $2, $3, $4, $5, 'L1', $6)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name, status = EXCLUDED.status
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(school_id)
        .bind(track_id)
        .bind(name)
        .bind(email)
        .bind(status)
        .execute(pool)
        .await?;
    }

    let modules = vec![
        ("Mathematics", Decimal::from(5), "S1", Decimal::from(3)),
        ("Physics", Decimal::from(4), "S1", Decimal::from(2)),
        ("French", Decimal::from(3), "S1", Decimal::ONE),
    ];

    for (name, weekly_hours, semester, coefficient) in modules {
        sqlx::query(
            r#"
            INSERT INTO academics.modules (id, school_id, track_id, name, weekly_hours, semester, coefficient)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (school_id, name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(school_id)
        .bind(track_id)
        .bind(name)
        .bind(weekly_hours)
        .bind(semester)
        .bind(coefficient)
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO academics.grading_periods (id, school_id, name, start_date, end_date, is_active)
        VALUES ($1, $2, $3, $4, $5, TRUE)
        ON CONFLICT (school_id, name) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(school_id)
    .bind("Trimester 1")
    .bind(NaiveDate::from_ymd_opt(2026, 9, 1).context("invalid date")?)
    .bind(NaiveDate::from_ymd_opt(2026, 12, 18).context("invalid date")?)
    .execute(pool)
    .await?;

    let assessments = vec![
        ("seed-001", "amina.diallo@horizon.edu", "Mathematics", "test", 15, 20, 1, (2026, 9, 22)),
        ("seed-002", "amina.diallo@horizon.edu", "Mathematics", "exam", 34, 40, 3, (2026, 11, 30)),
        ("seed-003", "amina.diallo@horizon.edu", "Physics", "lab", 12, 20, 1, (2026, 10, 8)),
        ("seed-004", "lucas.martin@horizon.edu", "Mathematics", "test", 8, 20, 1, (2026, 9, 22)),
        ("seed-005", "lucas.martin@horizon.edu", "French", "oral", 11, 20, 2, (2026, 10, 14)),
        ("seed-006", "ines.benali@horizon.edu", "Physics", "exam", 17, 20, 2, (2026, 12, 2)),
    ];

    for (source_key, email, module, kind, score, max_points, weight, (y, m, d)) in assessments {
        sqlx::query(
            r#"
            INSERT INTO academics.assessments
            (id, student_id, module_id, kind, score, max_points, weight, assessed_on, source_key)
            SELECT $1, s.id, m.id, $4, $5, $6, $7, $8, $9
            FROM academics.students s
            JOIN academics.modules m ON m.school_id = s.school_id AND m.name = $3
            WHERE s.email = $2
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(module)
        .bind(kind)
        .bind(Decimal::from(score))
        .bind(Decimal::from(max_points))
        .bind(Decimal::from(weight))
        .bind(NaiveDate::from_ymd_opt(y, m, d).context("invalid date")?)
        .bind(source_key)
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO academics.teachers (id, school_id, full_name, email, contract_type)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (email) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(school_id)
    .bind("Karim Haddad")
    .bind("karim.haddad@horizon.edu")
    .bind("full_time")
    .execute(pool)
    .await?;

    let teacher = fetch_teacher(pool, "karim.haddad@horizon.edu").await?;
    let block = TeachingBlock {
        id: Uuid::parse_str("e37b9c0a-51d4-4c8e-9f26-7a0d3b8e4f55")?,
        teacher_id: teacher.id,
        module_id: fetch_module_id(pool, school_id, "Mathematics").await?,
        room: Some("B-204".to_string()),
        start_date: NaiveDate::from_ymd_opt(2026, 9, 1).context("invalid date")?,
        end_date: NaiveDate::from_ymd_opt(2026, 12, 18).context("invalid date")?,
        start_time: NaiveTime::from_hms_opt(8, 0, 0).context("invalid time")?,
        end_time: NaiveTime::from_hms_opt(10, 0, 0).context("invalid time")?,
        days: WeekdaySet::parse_list("mon,wed").map_err(anyhow::Error::msg)?,
        hours_per_occurrence: Decimal::from(2),
    };
    let outcome = save_teaching_block(pool, &block).await?;
    if !outcome.is_clear() {
        warn!(message = %outcome.message(), "seed block not saved");
    }

    info!("seed data inserted");
    Ok(())
}

/// Imports assessments from a CSV keyed by student email and module name.
/// Rows already imported (same `source_key`) are skipped.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_email: String,
        module: String,
        period: Option<String>,
        kind: Option<String>,
        score: Option<Decimal>,
        max_points: Option<Decimal>,
        weight: Option<Decimal>,
        assessed_on: NaiveDate,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed CSV record {}", line + 1))?;

        let ids = sqlx::query(
            r#"
            SELECT s.id AS student_id, m.id AS module_id, p.id AS period_id
            FROM academics.students s
            JOIN academics.modules m ON m.school_id = s.school_id AND m.name = $2
            LEFT JOIN academics.grading_periods p ON p.school_id = s.school_id AND p.name = $3
            WHERE s.email = $1
            "#,
        )
        .bind(&row.student_email)
        .bind(&row.module)
        .bind(row.period.as_deref())
        .fetch_optional(pool)
        .await?;

        let Some(ids) = ids else {
            warn!(
                student = %row.student_email,
                module = %row.module,
                "skipping record with unknown student or module"
            );
            continue;
        };

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO academics.assessments
            (id, student_id, module_id, period_id, kind, score, max_points, weight, assessed_on, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(ids.get::<Uuid, _>("student_id"))
        .bind(ids.get::<Uuid, _>("module_id"))
        .bind(ids.get::<Option<Uuid>, _>("period_id"))
        .bind(&row.kind)
        .bind(row.score)
        .bind(row.max_points)
        .bind(row.weight)
        .bind(row.assessed_on)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn student_from_row(row: &PgRow) -> anyhow::Result<Student> {
    let status: String = row.get("status");
    Ok(Student {
        id: row.get("id"),
        full_name: row.get("full_name"),
        level: row.get("level"),
        status: status
            .parse::<EnrollmentStatus>()
            .map_err(anyhow::Error::msg)?,
        track_id: row.get("track_id"),
        school_id: row.get("school_id"),
    })
}

pub async fn fetch_student(pool: &PgPool, email: &str) -> anyhow::Result<Student> {
    let row = sqlx::query(
        "SELECT id, full_name, level, status, track_id, school_id \
         FROM academics.students WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("no student with email {email}"))?;
    student_from_row(&row)
}

/// Picks the one track a lookup by name refers to. Names repeat across
/// schools, so an ambiguous match needs the school to be named.
pub fn single_track(name: &str, school: Option<&str>, candidates: Vec<Track>) -> anyhow::Result<Track> {
    let mut matching: Vec<Track> = candidates
        .into_iter()
        .filter(|t| t.name == name && school.map_or(true, |s| t.school_name == s))
        .collect();
    match matching.len() {
        0 => match school {
            Some(school) => bail!("no track named {name} in school {school}"),
            None => bail!("no track named {name}"),
        },
        1 => Ok(matching.remove(0)),
        _ => {
            let schools: Vec<&str> = matching.iter().map(|t| t.school_name.as_str()).collect();
            bail!(
                "track {name} exists in several schools ({}); pass --school",
                schools.join(", ")
            )
        }
    }
}

pub async fn fetch_track(pool: &PgPool, name: &str, school: Option<&str>) -> anyhow::Result<Track> {
    let rows = sqlx::query(
        "SELECT t.id, t.school_id, s.name AS school_name, t.name \
         FROM academics.tracks t JOIN academics.schools s ON s.id = t.school_id \
         WHERE t.name = $1 ORDER BY s.name",
    )
    .bind(name)
    .fetch_all(pool)
    .await?;

    let candidates = rows
        .iter()
        .map(|row| Track {
            id: row.get("id"),
            school_id: row.get("school_id"),
            school_name: row.get("school_name"),
            name: row.get("name"),
        })
        .collect();
    single_track(name, school, candidates)
}

/// Students of a track ordered by name.
pub async fn fetch_track_students(pool: &PgPool, track_id: Uuid) -> anyhow::Result<Vec<Student>> {
    let rows = sqlx::query(
        "SELECT id, full_name, level, status, track_id, school_id \
         FROM academics.students WHERE track_id = $1 ORDER BY full_name",
    )
    .bind(track_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(student_from_row).collect()
}

pub async fn fetch_track_modules(pool: &PgPool, track_id: Uuid) -> anyhow::Result<Vec<Module>> {
    let rows = sqlx::query(
        "SELECT id, school_id, track_id, name, weekly_hours, semester, coefficient \
         FROM academics.modules WHERE track_id = $1 ORDER BY semester, name",
    )
    .bind(track_id)
    .fetch_all(pool)
    .await?;

    let mut modules = Vec::with_capacity(rows.len());
    for row in rows {
        let semester: String = row.get("semester");
        modules.push(Module {
            id: row.get("id"),
            school_id: row.get("school_id"),
            track_id: row.get("track_id"),
            name: row.get("name"),
            weekly_hours: row.get("weekly_hours"),
            semester: semester.parse::<Semester>().map_err(anyhow::Error::msg)?,
            coefficient: row.get("coefficient"),
        });
    }
    Ok(modules)
}

fn period_from_row(row: &PgRow) -> GradingPeriod {
    GradingPeriod {
        id: row.get("id"),
        school_id: row.get("school_id"),
        name: row.get("name"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        is_active: row.get("is_active"),
    }
}

pub async fn fetch_period(pool: &PgPool, school_id: Uuid, name: &str) -> anyhow::Result<GradingPeriod> {
    let row = sqlx::query(
        "SELECT id, school_id, name, start_date, end_date, is_active \
         FROM academics.grading_periods WHERE school_id = $1 AND name = $2",
    )
    .bind(school_id)
    .bind(name)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("no grading period named {name}"))?;
    Ok(period_from_row(&row))
}

pub async fn fetch_periods(pool: &PgPool) -> anyhow::Result<Vec<GradingPeriod>> {
    let rows = sqlx::query(
        "SELECT id, school_id, name, start_date, end_date, is_active \
         FROM academics.grading_periods ORDER BY school_id, start_date",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(period_from_row).collect())
}

/// Raw assessment rows for the given students; validation happens in the
/// engine so one bad row only affects its own cell.
pub async fn fetch_assessments(
    pool: &PgPool,
    student_ids: &[Uuid],
) -> anyhow::Result<Vec<AssessmentRow>> {
    let rows = sqlx::query(
        "SELECT id, student_id, module_id, period_id, assessed_on, kind, score, max_points, weight \
         FROM academics.assessments WHERE student_id = ANY($1) ORDER BY assessed_on",
    )
    .bind(student_ids)
    .fetch_all(pool)
    .await?;

    let mut assessments = Vec::with_capacity(rows.len());
    for row in rows {
        assessments.push(AssessmentRow {
            id: row.get("id"),
            student_id: row.get("student_id"),
            module_id: row.get("module_id"),
            period_id: row.get("period_id"),
            date: row.get("assessed_on"),
            kind: row.get("kind"),
            score: row.get("score"),
            max_points: row.get("max_points"),
            weight: row.get("weight"),
        });
    }
    debug!(count = assessments.len(), "fetched assessments");
    Ok(assessments)
}

pub async fn fetch_teacher(pool: &PgPool, email: &str) -> anyhow::Result<Teacher> {
    let row = sqlx::query(
        "SELECT id, school_id, full_name, email, contract_type \
         FROM academics.teachers WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("no teacher with email {email}"))?;

    let contract: String = row.get("contract_type");
    Ok(Teacher {
        id: row.get("id"),
        school_id: row.get("school_id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        contract: contract.parse::<ContractType>().map_err(anyhow::Error::msg)?,
    })
}

pub async fn fetch_module_id(pool: &PgPool, school_id: Uuid, name: &str) -> anyhow::Result<Uuid> {
    let row = sqlx::query("SELECT id FROM academics.modules WHERE school_id = $1 AND name = $2")
        .bind(school_id)
        .bind(name)
        .fetch_optional(pool)
        .await?
        .with_context(|| format!("no module named {name}"))?;
    Ok(row.get("id"))
}

/// Blocks taught by `teacher_id` or held in `room`.
pub async fn fetch_teaching_blocks(
    conn: &mut PgConnection,
    teacher_id: Uuid,
    room: Option<&str>,
) -> anyhow::Result<Vec<TeachingBlockRow>> {
    let rows = sqlx::query(
        r#"
        SELECT b.id, b.teacher_id, b.module_id, b.room, b.start_date, b.end_date,
               b.start_time, b.end_time, b.hours_per_occurrence,
               COALESCE(array_agg(d.weekday ORDER BY d.weekday)
                        FILTER (WHERE d.weekday IS NOT NULL), '{}')::SMALLINT[] AS weekdays
        FROM academics.teaching_blocks b
        LEFT JOIN academics.teaching_block_days d ON d.block_id = b.id
        WHERE b.teacher_id = $1
           OR ($2::TEXT IS NOT NULL AND lower(trim(b.room)) = lower(trim($2)))
        GROUP BY b.id
        ORDER BY b.start_date, b.start_time
        "#,
    )
    .bind(teacher_id)
    .bind(room)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| TeachingBlockRow {
            id: row.get("id"),
            teacher_id: row.get("teacher_id"),
            module_id: row.get("module_id"),
            room: row.get("room"),
            start_date: row.get("start_date"),
            end_date: row.get("end_date"),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            weekdays: row.get("weekdays"),
            hours_per_occurrence: row.get("hours_per_occurrence"),
        })
        .collect())
}

/// Validates stored rows, dropping (and logging) any that fail.
pub fn validated_blocks(rows: Vec<TeachingBlockRow>) -> Vec<TeachingBlock> {
    rows.into_iter()
        .filter_map(|row| match TeachingBlock::try_from(row) {
            Ok(block) => Some(block),
            Err(err) => {
                warn!(error = %err, "ignoring malformed teaching block");
                None
            }
        })
        .collect()
}

fn minutes_of(time: NaiveTime) -> i32 {
    (time.num_seconds_from_midnight() / 60) as i32
}

/// Inserts `block`, or replaces the stored block with the same id, after a
/// conflict check inside one serializable transaction. Nothing is written
/// when the check finds a conflict.
pub async fn save_teaching_block(pool: &PgPool, block: &TeachingBlock) -> anyhow::Result<ScheduleOutcome> {
    match write_block(pool, block).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            let code = err
                .as_database_error()
                .and_then(|db| db.code())
                .map(|code| code.into_owned());
            match code.as_deref() {
                Some(EXCLUSION_VIOLATION) | Some(SERIALIZATION_FAILURE) => {
                    warn!(block_id = %block.id, "concurrent schedule write rejected");
                    bail!("a concurrent schedule change overlapped block {}; retry", block.id)
                }
                _ => Err(err).context("failed to save teaching block"),
            }
        }
    }
}

async fn write_block(pool: &PgPool, block: &TeachingBlock) -> Result<ScheduleOutcome, WriteError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;

    let existing = fetch_teaching_blocks(&mut *tx, block.teacher_id, block.room.as_deref()).await?;
    let outcome = schedule::check_block(block, &validated_blocks(existing)).map_err(anyhow::Error::from)?;
    if !outcome.is_clear() {
        tx.rollback().await?;
        return Ok(outcome);
    }

    sqlx::query("DELETE FROM academics.teaching_blocks WHERE id = $1")
        .bind(block.id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO academics.teaching_blocks
        (id, teacher_id, module_id, room, start_date, end_date, start_time, end_time, hours_per_occurrence)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(block.id)
    .bind(block.teacher_id)
    .bind(block.module_id)
    .bind(block.room.as_deref())
    .bind(block.start_date)
    .bind(block.end_date)
    .bind(block.start_time)
    .bind(block.end_time)
    .bind(block.hours_per_occurrence)
    .execute(&mut *tx)
    .await?;

    for weekday in block.days.to_numbers() {
        sqlx::query(
            r#"
            INSERT INTO academics.teaching_block_days (block_id, teacher_id, weekday, minutes, dates)
            VALUES ($1, $2, $3, int4range($4, $5, '[)'), daterange($6, $7, '[]'))
            "#,
        )
        .bind(block.id)
        .bind(block.teacher_id)
        .bind(weekday)
        .bind(minutes_of(block.start_time))
        .bind(minutes_of(block.end_time))
        .bind(block.start_date)
        .bind(block.end_date)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    info!(block_id = %block.id, teacher_id = %block.teacher_id, "teaching block saved");
    Ok(ScheduleOutcome::Clear)
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WriteError {
    fn as_database_error(&self) -> Option<&dyn sqlx::error::DatabaseError> {
        match self {
            Self::Sql(err) => err.as_database_error(),
            Self::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(school: &str) -> Track {
        Track {
            id: Uuid::new_v4(),
            school_id: Uuid::new_v4(),
            school_name: school.to_string(),
            name: "Sciences L1".to_string(),
        }
    }

    #[test]
    fn unique_track_name_resolves_without_school() {
        let horizon = track("Lycee Horizon");
        let found = single_track("Sciences L1", None, vec![horizon.clone()]).unwrap();
        assert_eq!(found, horizon);
    }

    #[test]
    fn shared_track_name_needs_a_school() {
        let (horizon, voltaire) = (track("Lycee Horizon"), track("Lycee Voltaire"));
        let err = single_track("Sciences L1", None, vec![horizon.clone(), voltaire.clone()]).unwrap_err();
        assert!(err.to_string().contains("Lycee Horizon, Lycee Voltaire"));

        let found = single_track("Sciences L1", Some("Lycee Voltaire"), vec![horizon, voltaire.clone()]).unwrap();
        assert_eq!(found.school_id, voltaire.school_id);
    }

    #[test]
    fn unknown_school_is_reported() {
        let err = single_track("Sciences L1", Some("Lycee Moliere"), vec![track("Lycee Horizon")]).unwrap_err();
        assert_eq!(err.to_string(), "no track named Sciences L1 in school Lycee Moliere");
    }
}
