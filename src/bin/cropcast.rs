use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};

use cropcast::{
    CropcastResult,
    agronomy::{
        Crop, FeatureEngine, YieldModel, YieldOrchestrator, YieldValidator,
    },
    collect::contract::{Collector, FetchRequest},
    collect::sources::{self, TradeCollector},
    config::Config,
    pipeline::TradePipeline,
    queue::{SecurityGuard, TaskQueue, TaskType, task::NewTask},
    report::{self, ReportFormat},
    schedule::Scheduler,
    store::{LocalStore, Store},
    trade::Flow,
};

#[derive(Parser)]
#[command(
    name = "cropcast",
    about = "Multi-source agricultural data ingestion and yield forecasting",
    version
)]
struct Cli {
    /// Deployment root (data, logs, cache, models live below it).
    #[arg(long, env = "CROPCAST_ROOT", default_value = ".", global = true)]
    root: String,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trade collection pipeline.
    Trade {
        #[command(subcommand)]
        command: TradeCommand,
    },
    /// Weekly yield forecasting.
    Yield {
        #[command(subcommand)]
        command: YieldCommand,
    },
    /// Task queue administration.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
}

#[derive(Subcommand)]
enum TradeCommand {
    /// Fetch one country/period through the full collector lifecycle.
    Fetch(FetchArgs),
    /// Run the monthly pipeline across countries.
    Monthly(MonthlyArgs),
    /// Backfill a historical month range.
    Backfill(BackfillArgs),
    /// Inspect or drive the release-calendar scheduler.
    Schedule(ScheduleArgs),
    /// Collector health and run-state summary.
    Status,
    /// Re-run quality validation for a stored period.
    Validate(MonthlyArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long)]
    country: String,
    #[arg(long)]
    year: i32,
    #[arg(long)]
    month: u32,
    /// Comma-separated flow list.
    #[arg(long, default_value = "export,import")]
    flows: String,
    /// Also write the transformed records to this JSON file.
    #[arg(long)]
    output: Option<String>,
}

#[derive(Args)]
struct MonthlyArgs {
    #[arg(long)]
    year: i32,
    #[arg(long)]
    month: u32,
    /// Comma-separated reporter ISO-3 codes; default all configured.
    #[arg(long)]
    countries: Option<String>,
    /// Run collectors one at a time instead of the worker pool.
    #[arg(long)]
    sequential: bool,
}

#[derive(Args)]
struct BackfillArgs {
    #[arg(long)]
    start_year: i32,
    #[arg(long)]
    start_month: u32,
    #[arg(long)]
    end_year: Option<i32>,
    #[arg(long)]
    end_month: Option<u32>,
    #[arg(long)]
    countries: Option<String>,
}

#[derive(Args)]
struct ScheduleArgs {
    /// Print the schedule table.
    #[arg(long)]
    list: bool,
    /// Run the check loop in the foreground.
    #[arg(long)]
    start: bool,
    /// Run one named task immediately.
    #[arg(long)]
    trigger: Option<String>,
    /// Print the schedule as crontab lines.
    #[arg(long)]
    cron: bool,
    /// Check interval in seconds for --start.
    #[arg(long, default_value_t = 60)]
    interval: u64,
}

#[derive(Subcommand)]
enum YieldCommand {
    /// Weekly pass: features, predictions, alerts.
    Run(YieldRunArgs),
    /// Train the ensemble for a crop.
    Train(TrainArgs),
    /// Leave-one-year-out backtest with skill scores.
    Backtest(BacktestArgs),
    /// Render the latest backtest as a report.
    Report(YieldReportArgs),
    /// Current forecasts vs trend, per state.
    Monitor(MonitorArgs),
    /// Feature-table coverage summary.
    Check,
}

#[derive(Args)]
struct YieldRunArgs {
    #[arg(long)]
    week: Option<u32>,
    #[arg(long)]
    year: Option<i32>,
    #[arg(long)]
    crop: Option<Crop>,
    #[arg(long)]
    state: Option<String>,
}

#[derive(Args)]
struct TrainArgs {
    /// Training year span, e.g. 2005-2023.
    #[arg(long)]
    years: String,
    #[arg(long, default_value = "corn")]
    crop: Crop,
    /// Target weeks; repeatable.
    #[arg(long, default_values_t = [30u32])]
    week: Vec<u32>,
}

#[derive(Args)]
struct BacktestArgs {
    #[arg(long)]
    years: String,
    #[arg(long, default_value = "corn")]
    crop: Crop,
}

#[derive(Args)]
struct YieldReportArgs {
    #[arg(long)]
    years: String,
    #[arg(long, default_value = "corn")]
    crop: Crop,
    #[arg(long, default_value = "markdown")]
    format: String,
}

#[derive(Args)]
struct MonitorArgs {
    #[arg(long, default_value = "corn")]
    crop: Crop,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Queue a task from a free-form description.
    Submit {
        description: String,
        #[arg(long, default_value_t = 10)]
        priority: i32,
    },
    /// List queued tasks.
    List,
    /// Show one task in full.
    View { id: i64 },
    /// Run the executor worker loop in the foreground.
    Work {
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
}

fn parse_year_span(span: &str) -> Result<std::ops::RangeInclusive<i32>, String> {
    let (start, end) = span
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{span}'"))?;
    let start: i32 = start.trim().parse().map_err(|_| format!("bad year '{start}'"))?;
    let end: i32 = end.trim().parse().map_err(|_| format!("bad year '{end}'"))?;
    Ok(start..=end)
}

fn parse_flows(list: &str) -> Vec<Flow> {
    list.split(',')
        .filter_map(|f| f.trim().parse().ok())
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(success) if success => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CropcastResult<bool> {
    let app = Config::load(&cli.root)?;
    app.dirs.ensure()?;
    let store: Arc<dyn Store> = Arc::new(LocalStore::new(app.dirs.data_dir.clone()));

    match cli.command {
        Command::Trade { command } => trade(command, app, store).await,
        Command::Yield { command } => yield_cmd(command, app, store),
        Command::Task { command } => task(command, app, store).await,
    }
}

async fn trade(
    command: TradeCommand,
    app: Arc<Config>,
    store: Arc<dyn Store>,
) -> CropcastResult<bool> {
    match command {
        TradeCommand::Fetch(args) => {
            let collectors = sources::trade_collectors(app, store)?;
            let country = args.country.to_uppercase();
            let Some(collector) = collectors.get(&country) else {
                eprintln!("no collector configured for '{country}'");
                return Ok(false);
            };

            let mut ok = true;
            let mut exported: Vec<cropcast::trade::TradeRecord> = Vec::new();
            for flow in parse_flows(&args.flows) {
                let request = FetchRequest::month(args.year, args.month)
                    .with_param("flow", flow);
                if args.output.is_some() {
                    let output = collector.fetch_trade(args.year, args.month, flow).await?;
                    exported.extend(collector.transform_trade(&output.data, flow)?);
                }
                let result = collector.run(request).await;
                println!(
                    "{country} {flow}: {} — {} fetched, {} saved, {} updated, {} API calls",
                    result.status,
                    result.records_fetched,
                    result.records_saved,
                    result.records_updated,
                    result.api_calls_made,
                );
                for warning in result.warnings.iter().take(5) {
                    println!("  warn: {warning}");
                }
                for error in result.errors.iter().take(5) {
                    println!("  error: {error}");
                }
                ok &= result.success;
            }
            if let Some(path) = &args.output {
                std::fs::write(path, serde_json::to_string_pretty(&exported)?)?;
                println!("wrote {} records to {path}", exported.len());
            }
            Ok(ok)
        }
        TradeCommand::Monthly(args) => {
            let pipeline = TradePipeline::new(app, store)?;
            let countries = args
                .countries
                .map(|c| c.split(',').map(|s| s.trim().to_uppercase()).collect());
            let result = pipeline
                .run_monthly(args.year, args.month, countries, None, !args.sequential)
                .await;
            print!("{}", report::pipeline_summary(&result));
            Ok(result.success)
        }
        TradeCommand::Backfill(args) => {
            let pipeline = TradePipeline::new(app, store)?;
            let countries = args
                .countries
                .map(|c| c.split(',').map(|s| s.trim().to_uppercase()).collect());
            let results = pipeline
                .run_backfill(
                    args.start_year,
                    args.start_month,
                    args.end_year,
                    args.end_month,
                    countries,
                )
                .await;
            let failed = results.iter().filter(|r| !r.success).count();
            println!(
                "backfill complete: {} months, {} failed",
                results.len(),
                failed
            );
            Ok(failed == 0)
        }
        TradeCommand::Schedule(args) => {
            let scheduler = Arc::new(Scheduler::new(app.calendars.clone()));
            let pipeline = Arc::new(TradePipeline::new(app, store)?);

            if let Some(task_id) = args.trigger {
                let Some(task) = scheduler
                    .status()
                    .into_iter()
                    .find(|t| t.task_id == task_id)
                else {
                    eprintln!("unknown task '{task_id}'");
                    return Ok(false);
                };
                let (year, month) = scheduler
                    .target_period(&task.source, chrono::Utc::now().date_naive());
                let outcome = cropcast::schedule::TaskRunner::run(
                    pipeline.as_ref(),
                    &task,
                    year,
                    month,
                )
                .await;
                scheduler.record_outcome(&task_id, outcome)?;
                println!(
                    "{task_id}: success={} records={}",
                    outcome.success, outcome.records_loaded
                );
                return Ok(outcome.success);
            }

            if args.start {
                println!("scheduler running; Ctrl-C to stop");
                Arc::clone(&scheduler)
                    .run_loop(pipeline, Duration::from_secs(args.interval))
                    .await;
                return Ok(true);
            }

            if args.cron {
                for task in scheduler.status() {
                    // minute hour day-of-month month day-of-week
                    println!(
                        "{} {} {} * *  cropcast trade monthly --countries {}",
                        task.minute, task.hour, task.day_of_month, task.source
                    );
                }
                return Ok(true);
            }

            // Default (and --list): print the schedule table.
            println!(
                "{:<16} {:<6} {:<8} {:<22} {:<22} {}",
                "task", "source", "enabled", "last success", "next run", "failures"
            );
            for task in scheduler.status() {
                println!(
                    "{:<16} {:<6} {:<8} {:<22} {:<22} {}",
                    task.task_id,
                    task.source,
                    task.enabled,
                    task.last_success
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".into()),
                    task.next_run
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".into()),
                    task.consecutive_failures,
                );
            }
            Ok(true)
        }
        TradeCommand::Status => {
            let pipeline = TradePipeline::new(app, store)?;
            let status = pipeline.status();
            println!("configured countries: {}", status.enabled_countries.join(", "));
            println!(
                "{:<20} {:<8} {:<16} {:<10} {}",
                "source", "healthy", "last success", "failures", "requests"
            );
            for state in status.collector_states {
                let age = state
                    .last_success
                    .and_then(|t| (chrono::Utc::now() - t).to_std().ok())
                    .map(|d| {
                        // Whole-second resolution reads better in a table.
                        let secs = std::time::Duration::from_secs(d.as_secs());
                        format!("{} ago", humantime::format_duration(secs))
                    })
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<20} {:<8} {:<16} {:<10} {}",
                    state.source_name,
                    state.is_healthy(),
                    age,
                    state.consecutive_failures,
                    state.request_count,
                );
            }
            Ok(true)
        }
        TradeCommand::Validate(args) => {
            use cropcast::store::{TableRef, from_rows};
            use cropcast::trade::{QualityValidator, TradeRecord};

            let period = TradeRecord::period_of(args.year, args.month);
            let all: Vec<TradeRecord> =
                from_rows(store.scan(&TableRef::silver("trade_flows"))?);
            let records: Vec<TradeRecord> =
                all.into_iter().filter(|r| r.period == period).collect();

            let report = QualityValidator::default().validate(&records, &[]);
            println!(
                "{period}: {} records, {} fatal, {} warnings",
                report.records_checked, report.fatal_count, report.warning_count
            );
            for alert in report.alerts.iter().take(10) {
                println!("  [{}] {}", alert.severity, alert.message);
            }
            Ok(report.passed())
        }
    }
}

fn yield_cmd(
    command: YieldCommand,
    app: Arc<Config>,
    store: Arc<dyn Store>,
) -> CropcastResult<bool> {
    match command {
        YieldCommand::Run(args) => {
            let orchestrator = YieldOrchestrator::new(app, store);
            let summary = orchestrator.run(
                args.week,
                args.year,
                args.crop.map(|c| vec![c]),
                args.state.map(|s| vec![s]),
            )?;
            println!(
                "run {} — week {} {}: {} feature rows, {} predictions saved",
                summary.run_id,
                summary.forecast_week,
                summary.year,
                summary.feature_rows_built,
                summary.predictions_saved,
            );
            for crop in &summary.crops {
                println!(
                    "  {}: {} predictions, avg vs trend {}",
                    crop.crop,
                    crop.predictions,
                    crop.avg_vs_trend_pct
                        .map(|v| format!("{v:+.1}%"))
                        .unwrap_or_else(|| "-".into()),
                );
            }
            for alert in &summary.alerts {
                println!("  ALERT {}", alert.message);
            }
            for error in summary.errors.iter().take(5) {
                println!("  error: {error}");
            }
            Ok(summary.success)
        }
        YieldCommand::Train(args) => {
            let years = parse_year_span(&args.years)
                .map_err(cropcast::error::ConfigError::InvalidValue)?;
            let model = YieldModel::new(app, store);
            for week in &args.week {
                let metadata = model.train(args.crop, years.clone(), *week)?;
                println!(
                    "{} week {week}: {} samples, RMSE {:?}, MAE {:?}, R² {:?}",
                    args.crop,
                    metadata.n_samples,
                    metadata.rmse_cv,
                    metadata.mae_cv,
                    metadata.r2_cv,
                );
            }
            Ok(true)
        }
        YieldCommand::Backtest(args) => {
            let years = parse_year_span(&args.years)
                .map_err(cropcast::error::ConfigError::InvalidValue)?;
            let validator = YieldValidator::new(app, store);
            let result = validator.backtest(args.crop, years)?;
            print!(
                "{}",
                report::render_backtest(&result, ReportFormat::Text)?
            );
            Ok(true)
        }
        YieldCommand::Report(args) => {
            let years = parse_year_span(&args.years)
                .map_err(cropcast::error::ConfigError::InvalidValue)?;
            let format: ReportFormat = args
                .format
                .parse()
                .map_err(|_| cropcast::error::ConfigError::InvalidValue(args.format.clone()))?;
            let validator = YieldValidator::new(app, store);
            let result = validator.backtest(args.crop, years)?;
            print!("{}", report::render_backtest(&result, format)?);
            Ok(true)
        }
        YieldCommand::Monitor(args) => {
            use cropcast::agronomy::YieldPrediction;
            use cropcast::store::from_rows;

            let rows: Vec<YieldPrediction> = from_rows(store.scan(&YieldPrediction::table())?);
            let commodity = args.crop.nass_commodity();
            let mut latest: Vec<&YieldPrediction> = rows
                .iter()
                .filter(|p| p.commodity == commodity)
                .collect();
            latest.sort_by(|a, b| {
                (b.year, b.forecast_week, &a.state).cmp(&(a.year, a.forecast_week, &b.state))
            });

            println!(
                "{:<6} {:>5} {:>5} {:>9} {:>7} {:>9}  {}",
                "state", "year", "week", "forecast", "trend", "vs trend", "driver"
            );
            for p in latest.iter().take(30) {
                println!(
                    "{:<6} {:>5} {:>5} {:>9.1} {:>7.1} {:>8.1}%  {}",
                    p.state,
                    p.year,
                    p.forecast_week,
                    p.yield_forecast,
                    p.trend_yield,
                    p.vs_trend_pct,
                    p.primary_driver,
                );
            }
            Ok(true)
        }
        YieldCommand::Check => {
            let engine = FeatureEngine::new(app, store);
            let coverage = engine.verify_summary()?;
            if coverage.is_empty() {
                println!("no feature rows yet");
                return Ok(true);
            }
            println!(
                "{:<14} {:>5} {:>6} {:>7} {:>9} {:>7} {:>8} {:>6}",
                "crop", "year", "rows", "states", "weeks", "w/GDD", "w/cond", "w/GE"
            );
            for c in coverage {
                println!(
                    "{:<14} {:>5} {:>6} {:>7} {:>4}-{:<4} {:>7} {:>8} {:>6}",
                    c.crop.to_string(),
                    c.year,
                    c.rows,
                    c.states,
                    c.min_week,
                    c.max_week,
                    c.with_gdd,
                    c.with_condition,
                    c.with_good_excellent,
                );
            }
            Ok(true)
        }
    }
}

async fn task(
    command: TaskCommand,
    app: Arc<Config>,
    store: Arc<dyn Store>,
) -> CropcastResult<bool> {
    let queue = Arc::new(TaskQueue::persistent(app.dirs.data_dir.join("task_queue.json")));

    match command {
        TaskCommand::Submit {
            description,
            priority,
        } => {
            let task = queue.add_task(
                &description,
                TaskType::AiReasoning,
                serde_json::json!({"prompt": description}),
                NewTask {
                    priority: Some(priority),
                    ..NewTask::default()
                },
            )?;
            println!("created task {} ({})", task.id, task.status);
            Ok(true)
        }
        TaskCommand::List => {
            println!(
                "{:>5} {:<18} {:<16} {:>8}  {}",
                "id", "status", "type", "priority", "name"
            );
            for task in queue.all() {
                println!(
                    "{:>5} {:<18} {:<16} {:>8}  {}",
                    task.id,
                    task.status.to_string(),
                    task.task_type.to_string(),
                    task.priority,
                    task.name,
                );
            }
            Ok(true)
        }
        TaskCommand::View { id } => {
            let task = queue.get(id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(true)
        }
        TaskCommand::Work { poll_secs } => {
            let guard = SecurityGuard::new(&app.security);
            let mut executor = cropcast::queue::Executor::new(Arc::clone(&queue), guard);

            // Function registry assembled at init; SCRIPT payloads reference
            // these by symbolic name.
            let engine_app = Arc::clone(&app);
            let engine_store = Arc::clone(&store);
            executor.register_script(
                "build_yield_features",
                Arc::new(move |args: &serde_json::Value| {
                    use chrono::Datelike;
                    let year = args
                        .get("year")
                        .and_then(serde_json::Value::as_i64)
                        .map(|y| y as i32)
                        .unwrap_or_else(|| chrono::Utc::now().year());
                    let engine = FeatureEngine::new(
                        Arc::clone(&engine_app),
                        Arc::clone(&engine_store),
                    );
                    match engine.build_all_features(year, None, None) {
                        Ok(summary) => Ok(serde_json::json!({
                            "year": year,
                            "rows": summary.values().map(|(rows, _)| rows).sum::<usize>(),
                        })),
                        Err(e) => Err(cropcast::queue::HandlerError::Retryable(e.to_string())),
                    }
                }),
            );
            let coverage_app = Arc::clone(&app);
            let coverage_store = Arc::clone(&store);
            executor.register_script(
                "feature_coverage",
                Arc::new(move |_args: &serde_json::Value| {
                    let engine = FeatureEngine::new(
                        Arc::clone(&coverage_app),
                        Arc::clone(&coverage_store),
                    );
                    match engine.verify_summary() {
                        Ok(coverage) => Ok(serde_json::json!({"groups": coverage.len()})),
                        Err(e) => Err(cropcast::queue::HandlerError::Retryable(e.to_string())),
                    }
                }),
            );

            println!("executor running; Ctrl-C to stop");
            Arc::new(executor)
                .run_loop(Duration::from_secs(poll_secs))
                .await;
            Ok(true)
        }
    }
}
