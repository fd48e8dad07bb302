use clap::Parser;
use contest_engine::adapters::{DryRunAnnouncer, PostgresStore, TelegramAnnouncer};
use contest_engine::cli::{Cli, Commands};
use contest_engine::config::AppConfig;
use contest_engine::coordination::{Cadence, Clock, Scheduler, Shutdown, SystemClock};
use contest_engine::engine::traits::Announcer;
use contest_engine::error::{ContestError, Result};
use contest_engine::services::{CompetitionService, EngineSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    init_logging(&config.logging.level, cli.json_logs || config.logging.json);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        return Err(ContestError::Validation(errors.join("; ")));
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            info!("Migrations applied");
        }
        Commands::Sweep => {
            let service = build_service(&config).await?;
            let report = service.sweep_expired().await?;
            info!(
                "Sweep finished: examined={} advanced={} notified={} notify_failed={} skipped={}",
                report.examined, report.advanced, report.notified, report.notify_failed, report.skipped
            );
            for e in &report.errors {
                warn!("Sweep error: {}", e);
            }
        }
        Commands::Renew { agent } => {
            let service = build_service(&config).await?;
            let report = service.trigger_renewal(agent).await?;
            info!(
                "Renewal finished: examined={} renewed={} not_due={}",
                report.examined,
                report.renewed_count(),
                report.not_due
            );
            for e in &report.errors {
                warn!("Renewal error: {}", e);
            }
        }
        Commands::Serve => serve(&config).await?,
    }

    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},contest_engine=debug,sqlx=warn", level))
    });

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

async fn connect(config: &AppConfig) -> Result<PostgresStore> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    info!("Database connected");
    Ok(store)
}

async fn build_service(config: &AppConfig) -> Result<CompetitionService> {
    let store = connect(config).await?;
    store.migrate().await?;

    let announcer: Arc<dyn Announcer> = if config.telegram.enabled {
        Arc::new(TelegramAnnouncer::from_config(&config.telegram)?)
    } else {
        info!("Telegram disabled, announcements are logged only");
        Arc::new(DryRunAnnouncer::new())
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let settings = EngineSettings::from_config(&config.engine)?;

    Ok(CompetitionService::new(
        Arc::new(store),
        announcer,
        clock,
        settings,
    ))
}

async fn serve(config: &AppConfig) -> Result<()> {
    info!("Starting contest engine");
    let service = build_service(config).await?;
    let settings = service.settings().clone();

    let renewal_time = config
        .scheduler
        .renewal_time()
        .map_err(ContestError::Validation)?;
    let sweep_every = chrono::Duration::seconds(config.scheduler.sweep_interval_secs as i64);

    let scheduler = Scheduler::new(Arc::new(SystemClock), settings.timezone);
    scheduler
        .register(Cadence::Every(sweep_every), service.sweeper())
        .await?;
    scheduler
        .register(Cadence::DailyAt(renewal_time), service.renewal_job())
        .await?;
    scheduler
        .register(Cadence::Every(settings.announce_dedup_ttl), service.dedup())
        .await?;

    let shutdown = Shutdown::new();
    let signals = shutdown.clone();
    tokio::spawn(async move {
        signals.listen_for_signals().await;
    });

    info!(
        "Scheduler running: sweep every {}s, renewal daily at {} {}",
        config.scheduler.sweep_interval_secs, renewal_time, settings.timezone
    );
    scheduler
        .run(
            Duration::from_millis(config.scheduler.tick_resolution_ms),
            shutdown.subscribe(),
        )
        .await;

    service.dedup().clear();
    info!("Contest engine stopped");
    Ok(())
}
