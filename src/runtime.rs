//! Task wiring for a detector run.
//!
//! ```text
//!   link ─▶ ingest task (per channel) ─▶ ChannelSet ◀─ tick task ─▶ WindowBuffer
//!                                                         │ watch (latest window)
//!                                                         ▼
//!                                               inference task ─▶ AlertCoordinator
//! ```
//!
//! The tick task never waits on the model or on alert delivery: it hands
//! the latest full window to the inference task through a `watch` channel,
//! so a slow model skips windows instead of delaying ticks.

use crate::alert::{build_notifier, build_store, AlertCoordinator, DispatchError};
use crate::config::{Config, ConfigError};
use crate::core::inference::Thresholds;
use crate::core::model::{FallModel, LogisticModel, ModelError};
use crate::core::pipeline::{
    dispatch_decision, run_inference, Ingestor, Pipeline, PipelineSettings, TickMode,
};
use crate::core::types::{Channel, ChannelSnapshots, OperatingMode};
use crate::core::window::WindowSnapshot;
use crate::link::{
    ChannelStream, LinkConfig, LinkEvent, LinkSupervisor, SessionEnd, SessionHandler, SessionInfo,
    Transport, TransportConfig, UdpTransport,
};
use crate::recorder::{RecorderError, RecorderHandle, SessionRecorder};
use crate::stats::{create_shared_stats, Counter, RunStats, SharedStats};
use crate::status::{StatusEvent, StatusSender};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Startup failures. Everything after startup is logged, not returned.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Alert(#[from] DispatchError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("no model configured; set model_path or pass --model")]
    NoModel,
}

/// Shared handle to the run-wide alert coordinator.
pub type SharedCoordinator = Arc<Mutex<AlertCoordinator>>;

/// A full window waiting for the model, with the readings current when it
/// was taken.
#[derive(Debug, Clone)]
struct InferenceJob {
    snapshot: WindowSnapshot,
    readings: ChannelSnapshots,
}

/// [`SessionHandler`] that runs the detection pipeline.
///
/// Each session gets a fresh [`Pipeline`]; the model, the coordinator and
/// the counters are shared by every session of the run.
pub struct Detector {
    settings: PipelineSettings,
    tick_interval: Duration,
    model: Arc<dyn FallModel>,
    coordinator: SharedCoordinator,
    stats: SharedStats,
    status: StatusSender,
    recorder: Option<RecorderHandle>,
}

impl Detector {
    pub fn new(
        settings: PipelineSettings,
        tick_interval: Duration,
        model: Arc<dyn FallModel>,
        coordinator: AlertCoordinator,
        stats: SharedStats,
    ) -> Self {
        Self {
            settings,
            tick_interval,
            model,
            coordinator: Arc::new(Mutex::new(coordinator)),
            stats,
            status: StatusSender::disabled(),
            recorder: None,
        }
    }

    pub fn with_status(mut self, status: StatusSender) -> Self {
        self.status = status;
        self
    }

    pub fn with_recorder(mut self, recorder: Option<RecorderHandle>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn coordinator(&self) -> SharedCoordinator {
        Arc::clone(&self.coordinator)
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }
}

#[async_trait]
impl SessionHandler for Detector {
    async fn run_session(
        &mut self,
        info: SessionInfo,
        streams: Vec<ChannelStream>,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let pipeline = Pipeline::new(&self.settings, info.mode, Arc::clone(&self.stats))
            .with_status(self.status.clone())
            .with_recorder(self.recorder.clone());

        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        let (end_tx, mut end_rx) = mpsc::channel::<String>(Channel::ALL.len());

        let packet_tick = match pipeline.tick_mode() {
            TickMode::OnPacket => Some((pipeline.driving_channel(), Arc::new(Notify::new()))),
            TickMode::Fixed => None,
        };

        for stream in streams {
            let notify = packet_tick
                .as_ref()
                .filter(|(driving, _)| *driving == stream.channel)
                .map(|(_, notify)| Arc::clone(notify));
            tasks.spawn(ingest_loop(
                stream,
                pipeline.ingestor(),
                notify,
                end_tx.clone(),
                stop.clone(),
            ));
        }
        drop(end_tx);

        let (job_tx, job_rx) = watch::channel::<Option<InferenceJob>>(None);
        let trigger = match packet_tick {
            Some((_, notify)) => TickTrigger::Packet(notify),
            None => TickTrigger::Interval(self.tick_interval),
        };
        let thresholds = pipeline.thresholds();
        tasks.spawn(tick_loop(pipeline, trigger, job_tx, stop.clone()));
        tasks.spawn(inference_loop(
            job_rx,
            InferenceContext {
                model: Arc::clone(&self.model),
                thresholds,
                mode: info.mode,
                coordinator: Arc::clone(&self.coordinator),
                stats: Arc::clone(&self.stats),
                status: self.status.clone(),
            },
            stop.clone(),
        ));

        let end = tokio::select! {
            _ = cancel.cancelled() => SessionEnd::Cancelled,
            reason = end_rx.recv() => SessionEnd::Disconnected(
                reason.unwrap_or_else(|| "all channel streams closed".to_string()),
            ),
        };

        stop.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "session task failed");
            }
        }
        end
    }
}

async fn ingest_loop(
    mut stream: ChannelStream,
    ingestor: Ingestor,
    tick: Option<Arc<Notify>>,
    end: mpsc::Sender<String>,
    stop: CancellationToken,
) {
    let channel = stream.channel;
    let state = ingestor.channels().get(channel);
    state.set_live(true);

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = stream.events.recv() => event,
        };
        match event {
            Some(LinkEvent::Payload(raw)) => {
                if ingestor.ingest(channel, &raw).is_ok() {
                    if let Some(tick) = &tick {
                        tick.notify_one();
                    }
                }
            }
            Some(LinkEvent::Disconnected(reason)) => {
                let _ = end.send(format!("{channel}: {reason}")).await;
                break;
            }
            None => {
                let _ = end.send(format!("{channel}: event stream closed")).await;
                break;
            }
        }
    }

    state.set_live(false);
}

enum TickTrigger {
    Interval(Duration),
    Packet(Arc<Notify>),
}

async fn tick_loop(
    mut pipeline: Pipeline,
    trigger: TickTrigger,
    jobs: watch::Sender<Option<InferenceJob>>,
    stop: CancellationToken,
) {
    let mut interval = match &trigger {
        TickTrigger::Interval(period) => {
            let mut interval = tokio::time::interval(*period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            Some(interval)
        }
        TickTrigger::Packet(_) => None,
    };

    loop {
        let fired = match (&mut interval, &trigger) {
            (Some(interval), _) => tokio::select! {
                _ = stop.cancelled() => false,
                _ = interval.tick() => true,
            },
            (None, TickTrigger::Packet(notify)) => tokio::select! {
                _ = stop.cancelled() => false,
                _ = notify.notified() => true,
            },
            (None, TickTrigger::Interval(_)) => false,
        };
        if !fired {
            break;
        }

        let report = pipeline.tick();
        if let Some(snapshot) = report.inference {
            jobs.send_replace(Some(InferenceJob {
                snapshot,
                readings: pipeline.channel_snapshots(),
            }));
        }
    }
}

struct InferenceContext {
    model: Arc<dyn FallModel>,
    thresholds: Thresholds,
    mode: OperatingMode,
    coordinator: SharedCoordinator,
    stats: SharedStats,
    status: StatusSender,
}

async fn inference_loop(
    mut jobs: watch::Receiver<Option<InferenceJob>>,
    ctx: InferenceContext,
    stop: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            _ = stop.cancelled() => break,
            changed = jobs.changed() => changed,
        };
        if changed.is_err() {
            break;
        }
        let Some(job) = jobs.borrow_and_update().clone() else {
            continue;
        };

        let model = Arc::clone(&ctx.model);
        let stats = Arc::clone(&ctx.stats);
        let thresholds = ctx.thresholds;
        let snapshot = job.snapshot.clone();
        let decision = match tokio::task::spawn_blocking(move || {
            run_inference(model.as_ref(), &snapshot, &thresholds, &stats)
        })
        .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, "model call panicked");
                ctx.stats.record(Counter::InferenceFailures);
                continue;
            }
        };
        ctx.status.emit(StatusEvent::Prediction(decision.clone()));

        // Delivery in progress finishes even if a stop arrives meanwhile.
        let mut coordinator = ctx.coordinator.lock().await;
        dispatch_decision(
            &decision,
            &job.snapshot,
            job.readings,
            ctx.mode,
            &mut coordinator,
            &ctx.stats,
            &ctx.status,
        )
        .await;
    }
}

/// Build the configured transport.
pub fn build_transport(config: &LinkConfig) -> Arc<dyn Transport> {
    match &config.transport {
        TransportConfig::Udp(udp) => Arc::new(UdpTransport::new(udp.clone())),
    }
}

/// Load the model named by `config.model_path` and check it fits the pipeline.
pub fn load_model(config: &Config) -> Result<Arc<dyn FallModel>, RuntimeError> {
    let path = config.model_path.as_deref().ok_or(RuntimeError::NoModel)?;
    let model = LogisticModel::load(path)?;
    config.check_model(&model)?;
    tracing::info!(path = %path.display(), "model loaded");
    Ok(Arc::new(model))
}

/// Optional pieces of a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Write every raw sample to this CSV file
    pub record: Option<PathBuf>,
    pub status: StatusSender,
    /// Persist counters to the data directory
    pub persist_stats: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            record: None,
            status: StatusSender::disabled(),
            persist_stats: true,
        }
    }
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stats: RunStats,
    pub alerts_export: Option<PathBuf>,
    pub recorded_rows: Option<u64>,
}

/// Run the detector until `cancel` fires.
///
/// Configuration, model shape and alert backends are checked before the
/// link is touched; any failure there is returned. On shutdown the counters
/// are saved and the alert history is exported.
pub async fn run(
    config: &Config,
    transport: Arc<dyn Transport>,
    model: Arc<dyn FallModel>,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunSummary, RuntimeError> {
    config.validate()?;
    config.check_model(model.as_ref())?;

    let store = build_store(&config.alerts.store)?;
    let notifier = build_notifier(&config.alerts.notifier)?;
    let coordinator = AlertCoordinator::new(config.alert_settings(), store, notifier);

    let stats = create_shared_stats(options.persist_stats.then(|| config.stats_path()));
    let recorder = match &options.record {
        Some(path) => Some(SessionRecorder::start(path, config.feature_width)?),
        None => None,
    };

    let mut detector = Detector::new(
        config.pipeline_settings(),
        config.tick_interval()?,
        model,
        coordinator,
        Arc::clone(&stats),
    )
    .with_status(options.status.clone())
    .with_recorder(recorder.as_ref().map(SessionRecorder::handle));

    tracing::info!(
        window = config.window_size,
        rate_hz = config.sample_rate_hz,
        every_n_ticks = config.predict_every_n_ticks(),
        tick_mode = ?config.tick_mode,
        "detector starting"
    );

    let supervisor = LinkSupervisor::new(transport, config.link.clone())
        .with_status(options.status.clone())
        .with_stats(Arc::clone(&stats));
    supervisor.run(&mut detector, cancel).await;

    let recorded_rows = match recorder {
        Some(recorder) => match recorder.finish() {
            Ok(rows) => Some(rows),
            Err(e) => {
                tracing::error!(error = %e, "recording did not finish cleanly");
                None
            }
        },
        None => None,
    };

    if options.persist_stats {
        if let Err(e) = stats.save() {
            tracing::warn!(error = %e, "failed to save statistics");
        }
    }

    let alerts_export = {
        let coordinator = detector.coordinator();
        let coordinator = coordinator.lock().await;
        match coordinator.export_history(&config.export_path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "failed to export alert history");
                None
            }
        }
    };

    Ok(RunSummary {
        stats: stats.stats(),
        alerts_export,
        recorded_rows,
    })
}
