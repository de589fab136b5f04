use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

mod cache;
mod config;
mod db;
mod error;
mod grading;
mod models;
mod report;
mod schedule;
mod teaching_load;

use cache::{Cache, CacheBackend};
use config::{EngineConfig, LoadPolicy, OverallWeighting};
use grading::GradeBook;
use models::{TeachingBlock, WeekdaySet};
use report::ReportFormat;
use schedule::ScheduleOutcome;

#[derive(Parser)]
#[command(name = "academic-engine")]
#[command(about = "Grade aggregation, teaching load and schedule checks for school records", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Settings {
    /// Points denominator averages are expressed on
    #[arg(long, env = "GRADING_SCALE", default_value = "20", global = true)]
    scale: Decimal,
    /// Minimum average counted as a pass
    #[arg(long, env = "PASSING_THRESHOLD", default_value = "10", global = true)]
    passing_threshold: Decimal,
    /// `equal` or `coefficient`
    #[arg(long, env = "OVERALL_WEIGHTING", default_value = "equal", global = true)]
    weighting: OverallWeighting,
    /// `per_block` or `per_occurrence`
    #[arg(long, env = "LOAD_POLICY", default_value = "per_block", global = true)]
    load_policy: LoadPolicy,
    #[arg(long, env = "FULL_TIME_HOURS_DUE", default_value = "192", global = true)]
    full_time_hours_due: Decimal,
    #[arg(long, env = "PART_TIME_HOURS_DUE", default_value = "96", global = true)]
    part_time_hours_due: Decimal,
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 300, global = true)]
    cache_ttl_secs: u64,
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value_t = CacheBackend::File, global = true)]
    cache_backend: CacheBackend,
    /// Where the file backend keeps rendered reports
    #[arg(long, env = "CACHE_DIR", default_value = ".academic-engine-cache", global = true)]
    cache_dir: PathBuf,
}

impl Settings {
    fn to_config(&self) -> anyhow::Result<EngineConfig> {
        let config = EngineConfig {
            scale: self.scale,
            passing_threshold: self.passing_threshold,
            overall_weighting: self.weighting,
            load_policy: self.load_policy,
            full_time_hours_due: self.full_time_hours_due,
            part_time_hours_due: self.part_time_hours_due,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        };
        Ok(config.validate()?)
    }
}

#[derive(Args)]
struct BlockArgs {
    /// Existing block to replace; a new id is generated when omitted
    #[arg(long)]
    block_id: Option<Uuid>,
    #[arg(long)]
    teacher: String,
    #[arg(long)]
    module: String,
    #[arg(long)]
    room: Option<String>,
    /// Comma separated weekdays, e.g. `mon,wed`
    #[arg(long)]
    days: String,
    #[arg(long, value_parser = parse_time)]
    start: NaiveTime,
    #[arg(long, value_parser = parse_time)]
    end: NaiveTime,
    #[arg(long)]
    from: NaiveDate,
    #[arg(long)]
    to: NaiveDate,
    #[arg(long)]
    hours: Decimal,
}

fn parse_time(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| format!("expected HH:MM, got '{raw}'"))
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import assessments from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Render one student's bulletin
    Bulletin {
        #[arg(long)]
        email: String,
        #[arg(long)]
        period: Option<String>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Cohort statistics and bulletins for a track
    ClassReport {
        #[arg(long)]
        track: String,
        /// Needed when several schools have a track with this name
        #[arg(long)]
        school: Option<String>,
        #[arg(long)]
        period: Option<String>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Hours taught and overtime for a teacher over a window
    TeacherLoad {
        #[arg(long)]
        email: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,
    },
    /// Check a proposed teaching block for conflicts without saving it
    ScheduleCheck {
        #[command(flatten)]
        block: BlockArgs,
    },
    /// Save a teaching block if it does not conflict
    ScheduleAdd {
        #[command(flatten)]
        block: BlockArgs,
    },
    /// List grading periods that overlap within a school
    PeriodsCheck,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().without_time().with_target(false))
        .with(filter_layer)
        .init();

    let cli = Cli::parse();
    let config = cli.settings.to_config()?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let cache = cache::open_cache(cli.settings.cache_backend, &cli.settings.cache_dir, config.cache_ttl)
        .with_context(|| format!("failed to open cache at {}", cli.settings.cache_dir.display()))?;
    cache.sweep();

    run(cli.command, &pool, &config, cache.as_ref()).await
}

async fn run(
    command: Commands,
    pool: &PgPool,
    config: &EngineConfig,
    cache: &dyn Cache,
) -> anyhow::Result<()> {
    match command {
        Commands::InitDb => {
            db::init_db(pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(pool).await?;
            cache.clear();
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(pool, &csv).await?;
            cache.clear();
            println!("Inserted {inserted} assessments from {}.", csv.display());
        }
        Commands::Bulletin {
            email,
            period,
            format,
            out,
        } => {
            let key = format!(
                "bulletin:{email}:{}:{format:?}:{}",
                period.as_deref().unwrap_or("all"),
                config.cache_scope()
            );
            let output = cache::get_or_compute(cache, &key, || {
                render_bulletin(pool, config, &email, period.as_deref(), format)
            })
            .await?;
            emit(&output, out.as_deref())?;
        }
        Commands::ClassReport {
            track,
            school,
            period,
            format,
            out,
        } => {
            let key = format!(
                "class-report:{track}:{}:{}:{format:?}:{}",
                school.as_deref().unwrap_or("any"),
                period.as_deref().unwrap_or("all"),
                config.cache_scope()
            );
            let output = cache::get_or_compute(cache, &key, || {
                render_class_report(pool, config, &track, school.as_deref(), period.as_deref(), format)
            })
            .await?;
            emit(&output, Some(out.as_path()))?;
        }
        Commands::TeacherLoad {
            email,
            from,
            to,
            format,
        } => {
            let teacher = db::fetch_teacher(pool, &email).await?;
            let mut conn = pool.acquire().await?;
            let rows = db::fetch_teaching_blocks(&mut conn, teacher.id, None).await?;
            let blocks = db::validated_blocks(rows);
            let load = teaching_load::compute_teaching_load(
                &blocks,
                from,
                to,
                config.hours_due(teacher.contract),
                config.load_policy,
            )?;
            let output = match format {
                ReportFormat::Markdown => {
                    report::build_load_report(&teacher.full_name, teacher.contract, &load)
                }
                ReportFormat::Json => report::to_json(&load)?,
            };
            emit(&output, None)?;
        }
        Commands::ScheduleCheck { block } => {
            let candidate = resolve_block(pool, block).await?;
            let mut conn = pool.acquire().await?;
            let rows =
                db::fetch_teaching_blocks(&mut conn, candidate.teacher_id, candidate.room.as_deref())
                    .await?;
            let outcome = schedule::check_block(&candidate, &db::validated_blocks(rows))?;
            print!("{}", report::build_schedule_report(&outcome));
        }
        Commands::ScheduleAdd { block } => {
            let candidate = resolve_block(pool, block).await?;
            match db::save_teaching_block(pool, &candidate).await? {
                ScheduleOutcome::Clear => println!("Saved teaching block {}.", candidate.id),
                conflict => {
                    warn!(block_id = %candidate.id, "teaching block rejected");
                    print!("{}", report::build_schedule_report(&conflict));
                    anyhow::bail!(conflict.message());
                }
            }
        }
        Commands::PeriodsCheck => {
            let periods = db::fetch_periods(pool).await?;
            let mut invalid = 0usize;
            for period in &periods {
                if let Err(err) = period.validate() {
                    invalid += 1;
                    println!("- {err}");
                }
            }
            let overlaps = teaching_load::overlapping_periods(&periods);
            if overlaps.is_empty() && invalid == 0 {
                println!("All {} grading periods are consistent.", periods.len());
            }
            for (left, right) in overlaps {
                println!(
                    "- {} ({} to {}) overlaps {} ({} to {})",
                    left.name, left.start_date, left.end_date, right.name, right.start_date, right.end_date
                );
            }
        }
    }

    Ok(())
}

async fn render_bulletin(
    pool: &PgPool,
    config: &EngineConfig,
    email: &str,
    period: Option<&str>,
    format: ReportFormat,
) -> anyhow::Result<String> {
    let student = db::fetch_student(pool, email).await?;
    let modules = match student.track_id {
        Some(track_id) => db::fetch_track_modules(pool, track_id).await?,
        None => Vec::new(),
    };
    let period = match period {
        Some(name) => Some(db::fetch_period(pool, student.school_id, name).await?),
        None => None,
    };
    let book = GradeBook::from_rows(db::fetch_assessments(pool, &[student.id]).await?);
    let bulletin = grading::build_bulletin(&student, &modules, &book, period.as_ref(), config);
    info!(student_id = %student.id, overall = ?bulletin.overall_average, "bulletin built");

    match format {
        ReportFormat::Markdown => Ok(report::build_bulletin_report(&bulletin, config.scale)),
        ReportFormat::Json => report::to_json(&bulletin),
    }
}

async fn render_class_report(
    pool: &PgPool,
    config: &EngineConfig,
    track: &str,
    school: Option<&str>,
    period: Option<&str>,
    format: ReportFormat,
) -> anyhow::Result<String> {
    let track = db::fetch_track(pool, track, school).await?;
    let students = db::fetch_track_students(pool, track.id).await?;
    let modules = db::fetch_track_modules(pool, track.id).await?;
    let period = match period {
        Some(name) => Some(db::fetch_period(pool, track.school_id, name).await?),
        None => None,
    };
    let ids: Vec<Uuid> = students.iter().map(|s| s.id).collect();
    let book = GradeBook::from_rows(db::fetch_assessments(pool, &ids).await?);
    let cohort = grading::build_cohort_report(&students, &modules, &book, period.as_ref(), config);
    info!(
        track = %track.name,
        school = %track.school_name,
        evaluated = cohort.overall.evaluated_count,
        "class report built"
    );

    match format {
        ReportFormat::Markdown => Ok(report::build_class_report(&track.name, &cohort)),
        ReportFormat::Json => report::to_json(&cohort),
    }
}

async fn resolve_block(pool: &PgPool, args: BlockArgs) -> anyhow::Result<TeachingBlock> {
    let teacher = db::fetch_teacher(pool, &args.teacher).await?;
    let module_id = db::fetch_module_id(pool, teacher.school_id, &args.module).await?;
    let days = WeekdaySet::parse_list(&args.days).map_err(anyhow::Error::msg)?;
    Ok(TeachingBlock {
        id: args.block_id.unwrap_or_else(Uuid::new_v4),
        teacher_id: teacher.id,
        module_id,
        room: args.room,
        start_date: args.from,
        end_date: args.to,
        start_time: args.start,
        end_time: args.end,
        days,
        hours_per_occurrence: args.hours,
    })
}

fn emit(output: &str, out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, output)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Report written to {}.", path.display());
        }
        None => print!("{output}"),
    }
    Ok(())
}
