//! Fallwatch CLI
//!
//! Streaming fall detection for wearable inertial sensors.

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Args, Parser, Subcommand};
use fallwatch_agent::{
    alert::{build_notifier, build_store, AlertCoordinator, AlertOutcome},
    config::Config,
    core::{
        compute_window_stats, decoder::encode_binary, inference::evaluate, Channel,
        ChannelSnapshots, ConstantModel, Decision, FallModel, SampleFuser, TickMode,
        WindowSnapshot,
    },
    link::{ScriptStep, ScriptedTransport},
    recorder::load_samples,
    runtime::{self, build_transport, load_model, RunOptions, RunSummary},
    stats::RunStats,
    status::{StatusEvent, StatusSender},
    VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "fallwatch")]
#[command(author = "Fallwatch")]
#[command(version = VERSION)]
#[command(about = "Streaming fall detection for wearable inertial sensors", long_about = None)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true, env = "FALLWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Per-run overrides of the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Samples per model window
    #[arg(long, env = "FALLWATCH_WINDOW_SIZE")]
    window_size: Option<usize>,

    /// Tick rate in Hz
    #[arg(long, env = "FALLWATCH_SAMPLE_RATE_HZ")]
    sample_rate_hz: Option<f64>,

    /// Gyroscope scale factor (must match training)
    #[arg(long, env = "FALLWATCH_GYRO_SCALE")]
    gyro_scale: Option<f32>,

    /// Milliseconds between model calls
    #[arg(long, env = "FALLWATCH_PREDICTION_INTERVAL_MS")]
    prediction_interval_ms: Option<u64>,

    /// Probability above which an alert is raised
    #[arg(long, env = "FALLWATCH_ALERT_THRESHOLD")]
    alert_threshold: Option<f32>,

    /// Seconds between two alert dispatches
    #[arg(long, env = "FALLWATCH_COOLDOWN_SECS")]
    cooldown_secs: Option<u64>,

    /// Channel used when only one sensor feeds the model (hip or leg)
    #[arg(long, env = "FALLWATCH_FALLBACK_CHANNEL")]
    fallback_channel: Option<Channel>,

    /// Tick source
    #[arg(long, value_enum, env = "FALLWATCH_TICK_MODE")]
    tick_mode: Option<TickMode>,

    /// Model weights file
    #[arg(long, env = "FALLWATCH_MODEL")]
    model: Option<PathBuf>,

    /// Alert message recipient
    #[arg(long, env = "FALLWATCH_RECIPIENT")]
    recipient: Option<String>,

    /// Monitored person's name
    #[arg(long, env = "FALLWATCH_PERSON")]
    person: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(v) = self.window_size {
            config.window_size = v;
        }
        if let Some(v) = self.sample_rate_hz {
            config.sample_rate_hz = v;
        }
        if let Some(v) = self.gyro_scale {
            config.gyro_scale = v;
        }
        if let Some(v) = self.prediction_interval_ms {
            config.prediction_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.alert_threshold {
            config.alert_threshold = v;
        }
        if let Some(v) = self.cooldown_secs {
            config.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = self.fallback_channel {
            config.fallback_channel = v;
        }
        if let Some(v) = self.tick_mode {
            config.tick_mode = v;
        }
        if let Some(v) = self.model {
            config.model_path = Some(v);
        }
        if let Some(v) = self.recipient {
            config.alerts.recipient = v;
        }
        if let Some(v) = self.person {
            config.alerts.person_name = v;
        }
        config.validate()?;
        Ok(())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the sensors and start detecting falls
    Start {
        #[command(flatten)]
        overrides: Overrides,

        /// Record every raw sample to a CSV file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Print every prediction, not only elevated ones
        #[arg(long, short)]
        verbose: bool,
    },

    /// Run the detector against a scripted pair of sensors
    Demo {
        #[command(flatten)]
        overrides: Overrides,

        /// Probability reported by the demo model
        #[arg(long, default_value = "0.99")]
        probability: f32,
    },

    /// Run the model once on a recorded CSV window
    Predict {
        #[command(flatten)]
        overrides: Overrides,

        /// CSV recording (12 or 6 values per row)
        #[arg(long, short)]
        input: PathBuf,

        /// First row of the window
        #[arg(long, default_value = "0")]
        start: usize,
    },

    /// Send one synthetic alert through the configured backends
    TestAlert {
        #[command(flatten)]
        overrides: Overrides,

        /// Probability to report
        #[arg(long, default_value = "0.99")]
        probability: f32,
    },

    /// Show cumulative statistics
    Status,

    /// Show configuration
    Config,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Start {
            overrides,
            record,
            verbose,
        } => cmd_start(&config_path, overrides, record, verbose).await,
        Commands::Demo {
            overrides,
            probability,
        } => cmd_demo(&config_path, overrides, probability).await,
        Commands::Predict {
            overrides,
            input,
            start,
        } => cmd_predict(&config_path, overrides, &input, start),
        Commands::TestAlert {
            overrides,
            probability,
        } => cmd_test_alert(&config_path, overrides, probability).await,
        Commands::Status => cmd_status(&config_path),
        Commands::Config => cmd_config(&config_path),
        Commands::Init { force } => cmd_init(&config_path, force),
    }
}

fn load_config(path: &std::path::Path, overrides: Overrides) -> Result<Config> {
    let mut config = Config::load_from(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    overrides.apply(&mut config)?;
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    Ok(config)
}

async fn cmd_start(
    config_path: &std::path::Path,
    overrides: Overrides,
    record: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let model = load_model(&config).context("failed to load the fall model")?;

    println!("Fallwatch Agent v{VERSION}");
    println!();
    print_settings(&config);
    if let Some(path) = &record {
        println!("  Recording to: {}", path.display());
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let transport = build_transport(&config.link);
    let summary = run_with_status(&config, transport, model, record, verbose).await?;
    print_summary(&summary);
    Ok(())
}

async fn cmd_demo(config_path: &std::path::Path, overrides: Overrides, probability: f32) -> Result<()> {
    let mut config = load_config(config_path, overrides)?;
    config.link.retry_delay = Duration::from_secs(1);
    config.link.discovery_timeout = Duration::from_millis(200);
    config.tick_mode = TickMode::OnPacket;
    config.alerts.store = Default::default();
    config.alerts.notifier = Default::default();

    let model: Arc<dyn FallModel> = Arc::new(ConstantModel::new(
        probability,
        config.window_size,
        config.feature_width,
    ));
    let transport = Arc::new(demo_script(config.window_size * 2));

    println!("Fallwatch Agent v{VERSION} (demo)");
    println!();
    print_settings(&config);
    println!("  Demo model probability: {:.1}%", probability * 100.0);
    println!();

    let summary = run_with_status(&config, transport, model, None, true).await?;
    print_summary(&summary);
    Ok(())
}

/// A first failed scan, one dual session cut short by a leg dropout, then a
/// hip-only session.
fn demo_script(packets: usize) -> ScriptedTransport {
    let period = Duration::from_millis(50);
    let steps = |axis: i16, count: usize| -> Vec<ScriptStep> {
        (0..count)
            .flat_map(|seq| {
                let spike = if seq % 20 == 19 { 8 } else { 1 };
                [
                    ScriptStep::Payload(
                        encode_binary(seq as u32, [axis * spike, 0, 1000, 10, -10, 5]).to_vec(),
                    ),
                    ScriptStep::Delay(period),
                ]
            })
            .collect()
    };

    let transport = ScriptedTransport::new();
    transport
        .push_discovery(&[])
        .push_discovery(&Channel::ALL)
        .push_discovery(&[Channel::Hip]);

    let mut hip = steps(120, packets);
    hip.push(ScriptStep::Disconnect("demo script finished".to_string()));
    let mut leg = steps(80, packets / 2);
    leg.push(ScriptStep::Disconnect("leg sensor out of range".to_string()));
    transport
        .push_session(Channel::Hip, steps(120, packets))
        .push_session(Channel::Leg, leg)
        .push_session(Channel::Hip, hip);
    transport
}

/// Run until Ctrl+C while printing status events.
async fn run_with_status(
    config: &Config,
    transport: Arc<dyn fallwatch_agent::link::Transport>,
    model: Arc<dyn FallModel>,
    record: Option<PathBuf>,
    verbose: bool,
) -> Result<RunSummary> {
    let (status, rx) = StatusSender::channel();
    let printer = tokio::spawn(print_status(rx, verbose));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("Stopping...");
        }
        signal_cancel.cancel();
    });

    let options = RunOptions {
        record,
        status,
        persist_stats: true,
    };
    let summary = runtime::run(config, transport, model, options, cancel)
        .await
        .context("detector failed to start")?;

    // The runtime dropped its senders; the printer drains and exits.
    let _ = printer.await;
    Ok(summary)
}

async fn print_status(mut rx: broadcast::Receiver<StatusEvent>, verbose: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let quiet = matches!(
                    event,
                    StatusEvent::Prediction(Decision::Normal { .. })
                        | StatusEvent::Link { .. }
                );
                if verbose || !quiet {
                    println!("[{}] {}", Local::now().format("%H:%M:%S"), event);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                eprintln!("Warning: status output fell behind, {missed} events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_settings(config: &Config) {
    println!("Settings:");
    println!(
        "  Window: {} samples at {} Hz",
        config.window_size, config.sample_rate_hz
    );
    println!(
        "  Model call every {} ticks ({:?} tick mode)",
        config.predict_every_n_ticks(),
        config.tick_mode
    );
    println!(
        "  Alert threshold: {:.0}%, cooldown {}s",
        config.alert_threshold * 100.0,
        config.cooldown.as_secs()
    );
    println!("  Gyro scale: {}", config.gyro_scale);
    println!("  Fallback channel: {}", config.fallback_channel);
}

fn print_summary(summary: &RunSummary) {
    println!();
    print_stats(&summary.stats);
    if let Some(rows) = summary.recorded_rows {
        println!("Recorded {rows} samples");
    }
    if let Some(path) = &summary.alerts_export {
        println!("Alert history exported to {path:?}");
    }
}

fn print_stats(s: &RunStats) {
    println!("Run Statistics:");
    println!("  Packets received: {} hip, {} leg", s.hip_packets, s.leg_packets);
    println!("  Malformed packets dropped: {}", s.malformed_packets);
    println!(
        "  Ticks: {} ({} samples pushed, {} zero samples suppressed)",
        s.ticks, s.samples_pushed, s.zero_samples_suppressed
    );
    println!("  Model calls: {} ({} failed)", s.inferences, s.inference_failures);
    println!("  Fall candidates: {}", s.fall_candidates);
    println!(
        "  Alerts: {} dispatched, {} suppressed, {} with delivery failures",
        s.alerts_dispatched, s.alerts_suppressed, s.alerts_failed
    );
    println!("  Sessions: {} ({} reconnect attempts)", s.sessions, s.reconnect_attempts);
}

fn cmd_predict(
    config_path: &std::path::Path,
    overrides: Overrides,
    input: &std::path::Path,
    start: usize,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let model = load_model(&config).context("failed to load the fall model")?;

    let fuser = SampleFuser::new(config.fusion());
    let samples = load_samples(input, &fuser)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let end = start + config.window_size;
    if samples.len() < end {
        bail!(
            "{} has {} rows; a window starting at row {start} needs {}",
            input.display(),
            samples.len(),
            end
        );
    }

    let window = WindowSnapshot::new(samples[start..end].to_vec());
    let stats = compute_window_stats(&window);

    println!("Window: rows {start}..{end} of {}", input.display());
    println!();
    println!("{:<8} {:>10} {:>10} {:>10}", "column", "min", "max", "mean");
    for (i, column) in stats.columns.iter().enumerate() {
        println!(
            "{:<8} {:>10.3} {:>10.3} {:>10.3}",
            fallwatch_agent::core::WindowStats::column_label(i),
            column.min,
            column.max,
            column.mean
        );
    }
    println!();
    println!(
        "Acceleration magnitude: peak {:.3}, mean {:.3}, std dev {:.3}",
        stats.peak_accel_magnitude, stats.mean_accel_magnitude, stats.accel_magnitude_std_dev
    );

    let decision = evaluate(model.as_ref(), &window, &config.thresholds());
    println!("Prediction: {decision}");
    if let Decision::NoDecision { reason } = &decision {
        bail!("model produced no decision: {reason}");
    }
    Ok(())
}

async fn cmd_test_alert(
    config_path: &std::path::Path,
    overrides: Overrides,
    probability: f32,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let store = build_store(&config.alerts.store).context("invalid alert store configuration")?;
    let notifier =
        build_notifier(&config.alerts.notifier).context("invalid notifier configuration")?;
    let mut coordinator = AlertCoordinator::new(config.alert_settings(), store, notifier);

    println!(
        "Sending test alert via {:?} / {:?}...",
        config.alerts.store, config.alerts.notifier
    );
    let snapshots = ChannelSnapshots {
        hip: Some(fallwatch_agent::SixAxisReading::from_array([
            9.5, 0.3, 1.2, 40.0, -12.0, 3.0,
        ])),
        leg: Some(fallwatch_agent::SixAxisReading::from_array([
            8.1, -0.4, 2.0, 35.0, 10.0, -2.0,
        ])),
    };

    match coordinator.maybe_alert(probability, snapshots).await {
        AlertOutcome::Dispatched(event) => {
            println!("[{}] Alert {}", Utc::now().format("%H:%M:%S"), event.id);
            println!("  Persistence: {}", event.persistence);
            println!("  Messaging: {}", event.messaging);
            if let Some(id) = &event.record_id {
                println!("  Record id: {id}");
            }
            if event.delivery().is_failed() {
                bail!("test alert was not fully delivered");
            }
        }
        AlertOutcome::Suppressed { .. } => bail!("test alert unexpectedly suppressed"),
    }
    Ok(())
}

fn cmd_status(config_path: &std::path::Path) -> Result<()> {
    let config = Config::load_from(config_path).unwrap_or_default();

    println!("Fallwatch Agent Status");
    println!("======================");
    println!();
    print_settings(&config);
    println!(
        "  Model: {}",
        config
            .model_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "not configured".to_string())
    );
    println!();

    let stats_path = config.stats_path();
    if !stats_path.exists() {
        println!("No previous run data found.");
        return Ok(());
    }
    let content = std::fs::read_to_string(&stats_path)
        .with_context(|| format!("failed to read {}", stats_path.display()))?;
    let stats: RunStats = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", stats_path.display()))?;

    println!("Cumulative statistics since {}:", stats.run_start.format("%Y-%m-%d %H:%M:%S"));
    print_stats(&stats);
    Ok(())
}

fn cmd_config(config_path: &std::path::Path) -> Result<()> {
    let config = Config::load_from(config_path)?;

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {config_path:?}");
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_init(config_path: &std::path::Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    let config = Config::default();
    config.save_to(config_path)?;
    config.ensure_directories()?;
    println!("Wrote default configuration to {config_path:?}");
    Ok(())
}
