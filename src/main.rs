mod aggregator;
mod alerts;
mod collectors;
mod config;
mod dashboard;
mod export;
mod input;
mod state;

use aggregator::{ProbeSet, SnapshotAggregator};
use alerts::AlertLedger;
use chrono::Local;
use clap::Parser;
use collectors::registry::SensorRegistry;
use colored::Colorize;
use config::{Config, ConfigError, ExportFormat};
use dashboard::{temp_grade, Presenter};
use export::Exporter;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "legionmon")]
#[command(version)]
#[command(about = "Монитор температур и производительности Legion 5 Pro")]
struct Cli {
    /// YAML-конфигурация; без неё используются значения по умолчанию
    #[arg(long)]
    config: Option<PathBuf>,
    /// Формат журнала снимков
    #[arg(long, value_enum)]
    export: Option<ExportFormat>,
    /// Интервал опроса в секундах
    #[arg(long)]
    interval: Option<u64>,
    /// Показать найденные датчики и выйти
    #[arg(long)]
    test: bool,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    if cli.test {
        run_discovery(&cfg).await;
        return;
    }

    let log_path = run_monitor(cfg).await;
    println!(
        "\n\n{}",
        format!("✅ Мониторинг остановлен. Данные сохранены в {}", log_path.display()).green()
    );
    // The stdin reader may still be parked on a blocking runtime thread.
    std::process::exit(0);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if let Some(format) = cli.export {
        cfg.export.format = format;
    }
    if let Some(interval) = cli.interval {
        cfg.interval_secs = interval;
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn run_discovery(cfg: &Config) {
    println!("{}", "🔍 Проверка датчиков Legion:".cyan());

    let registry = SensorRegistry::discover(&cfg.probes).await;
    println!("\n{}", "Привязанные датчики:".green());
    if registry.sensors().is_empty() {
        println!("  {}", "нет".yellow());
    }
    for (slot, handle) in registry.sensors() {
        println!(
            "  {slot}: {} [{}] ({})",
            handle.label,
            handle.source.as_str(),
            handle.input.display()
        );
    }
    println!("  GPU: {}", registry.gpu().describe());

    let aggregator = SnapshotAggregator::new(
        ProbeSet::from_host(&registry, cfg),
        cfg,
        AlertLedger::new(),
    );
    let snapshot = aggregator.tick().await;

    println!("\n{}", "Температуры:".green());
    for reading in &snapshot.temperatures {
        let grade = temp_grade(reading.celsius, reading.critical.unwrap_or(80.0));
        println!(
            "  {}",
            grade.paint(format!(
                "{}: {:.1}°C ({})",
                reading.name,
                reading.celsius,
                reading.source.as_str()
            ))
        );
    }

    println!("\n{}", "Состояние GPU:".green());
    let gpu = &snapshot.gpu;
    if gpu.is_working() {
        println!(
            "  🎮 RTX 3070: {:.1}°C, {:.1}W",
            gpu.temperature, gpu.power_draw
        );
    } else if gpu.available {
        println!("  🎮 RTX 3070: {}", gpu.status.as_str().yellow());
    } else {
        println!("  {}", "❌ GPU недоступна".red());
    }
}

/// Runs until `q`, end of stdin or a termination signal. Returns the export path.
async fn run_monitor(cfg: Config) -> PathBuf {
    let registry = SensorRegistry::discover(&cfg.probes).await;
    println!("{}", "🚀 Запуск Legion Monitor...".green());
    println!(
        "{}",
        format!("Датчики температуры: обнаружено {}", registry.sensors().len()).cyan()
    );
    println!(
        "{}",
        format!("GPU: {}", registry.gpu().describe()).cyan()
    );

    let exporter = Exporter::new(&cfg.export.dir, cfg.export.format, Local::now());
    let log_path = exporter.path().to_path_buf();
    let presenter = Presenter::new(cfg.thresholds.clone(), log_path.clone());
    let ledger = AlertLedger::new();
    let aggregator = SnapshotAggregator::new(
        ProbeSet::from_host(&registry, &cfg),
        &cfg,
        ledger.clone(),
    );

    info!(
        interval_secs = cfg.interval_secs,
        export = %log_path.display(),
        "запуск мониторинга"
    );

    let (running_tx, mut running_rx) = watch::channel(true);
    let input_task = tokio::spawn(input::run_input(
        BufReader::new(tokio::io::stdin()),
        running_tx,
        ledger,
        log_path.clone(),
    ));

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut export_error: Option<String> = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("получен сигнал остановки");
                break;
            }
            changed = running_rx.changed() => {
                if changed.is_err() || !*running_rx.borrow() {
                    break;
                }
            }
            _ = cycle(&mut ticker, &aggregator, &exporter, &presenter, &mut export_error) => {}
        }
    }

    input_task.abort();
    log_path
}

/// One polling cycle. Dropping it mid-flight kills any running probe commands.
async fn cycle(
    ticker: &mut Interval,
    aggregator: &SnapshotAggregator,
    exporter: &Exporter,
    presenter: &Presenter,
    export_error: &mut Option<String>,
) {
    ticker.tick().await;
    let snapshot = aggregator.tick().await;

    match exporter.append(&snapshot).await {
        Ok(()) => *export_error = None,
        Err(err) => {
            error!(error = %err, "не удалось записать снимок");
            *export_error = Some(err.to_string());
        }
    }

    if let Err(err) = presenter.draw(&snapshot, export_error.as_deref()) {
        warn!(error = %err, "не удалось отрисовать панель");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "не удалось дождаться Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "не удалось подписаться на SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
