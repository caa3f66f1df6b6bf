//! One session's worth of detector state.
//!
//! A [`Pipeline`] is built when a connection session starts and dropped
//! when it ends, so nothing from a previous session (channel readings,
//! window contents, gate state) can leak into the next one. The alert
//! coordinator is not part of it: cooldown spans reconnects.
//!
//! The three stages can run in one task (tests, replays) through
//! [`Pipeline::run_tick`], or be split across tasks: [`Ingestor`] per
//! channel, [`Pipeline::tick`] in the tick task, [`run_inference`] and
//! [`dispatch_decision`] in the inference task.

use crate::alert::{AlertCoordinator, AlertDetails, AlertOutcome};
use crate::core::channel::{ChannelSet, SharedChannels};
use crate::core::decoder::{DecodeError, DecoderConfig, PacketDecoder};
use crate::core::features::compute_window_stats;
use crate::core::fuser::{FusionConfig, SampleFuser};
use crate::core::inference::{evaluate, Decision, GateState, InferenceGate, Thresholds};
use crate::core::model::FallModel;
use crate::core::types::{Channel, ChannelSnapshots, OperatingMode, SixAxisReading};
use crate::core::window::{WindowBuffer, WindowSnapshot};
use crate::recorder::RecorderHandle;
use crate::stats::{Counter, SharedStats};
use crate::status::{StatusEvent, StatusSender};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What produces a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TickMode {
    /// Fixed-rate timer at the sample rate
    #[default]
    Fixed,
    /// Each valid packet of the driving channel
    #[value(alias = "on_packet")]
    OnPacket,
}

/// Everything needed to build a session pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub window_size: usize,
    pub predict_every_n_ticks: u64,
    pub thresholds: Thresholds,
    pub fusion: FusionConfig,
    pub decoder: DecoderConfig,
    pub tick_mode: TickMode,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window_size: 40,
            predict_every_n_ticks: 5,
            thresholds: Thresholds::default(),
            fusion: FusionConfig::default(),
            decoder: DecoderConfig::default(),
            tick_mode: TickMode::Fixed,
        }
    }
}

/// Decode-and-store half of the pipeline. Cheap to clone, one per channel task.
#[derive(Clone)]
pub struct Ingestor {
    decoder: PacketDecoder,
    channels: SharedChannels,
    stats: SharedStats,
}

impl Ingestor {
    /// Decode a payload into the channel's latest-value cell.
    ///
    /// Malformed payloads are counted and dropped; the error is returned
    /// for the caller's information only.
    pub fn ingest(&self, channel: Channel, raw: &[u8]) -> Result<SixAxisReading, DecodeError> {
        match self.decoder.decode(channel, raw) {
            Ok(reading) => {
                self.channels.get(channel).update(reading);
                self.stats.record(Counter::packets(channel));
                Ok(reading)
            }
            Err(e) => {
                self.stats.record(Counter::MalformedPackets);
                tracing::debug!(%channel, len = raw.len(), error = %e, "dropping malformed packet");
                Err(e)
            }
        }
    }

    pub fn channels(&self) -> &SharedChannels {
        &self.channels
    }
}

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// A sample entered the window
    pub pushed: bool,
    pub window_len: usize,
    /// This tick completed the warm-up
    pub became_ready: bool,
    /// Window to evaluate, when the gate scheduled a model call
    pub inference: Option<WindowSnapshot>,
}

/// Everything one tick produced, when run in a single task.
#[derive(Debug, Clone)]
pub struct TickResult {
    pub report: TickReport,
    pub decision: Option<Decision>,
    pub alert: Option<AlertOutcome>,
}

/// Per-session detector state.
pub struct Pipeline {
    ingestor: Ingestor,
    fuser: SampleFuser,
    window: WindowBuffer,
    gate: InferenceGate,
    mode: OperatingMode,
    tick_mode: TickMode,
    status: StatusSender,
    recorder: Option<RecorderHandle>,
}

impl Pipeline {
    pub fn new(settings: &PipelineSettings, mode: OperatingMode, stats: SharedStats) -> Self {
        Self {
            ingestor: Ingestor {
                decoder: PacketDecoder::new(settings.decoder.clone()),
                channels: Arc::new(ChannelSet::new()),
                stats,
            },
            fuser: SampleFuser::new(settings.fusion.clone()),
            window: WindowBuffer::new(settings.window_size),
            gate: InferenceGate::new(settings.predict_every_n_ticks, settings.thresholds),
            mode,
            tick_mode: settings.tick_mode,
            status: StatusSender::disabled(),
            recorder: None,
        }
    }

    pub fn with_status(mut self, status: StatusSender) -> Self {
        self.status = status;
        self
    }

    /// Also write every raw sample to a recording.
    pub fn with_recorder(mut self, recorder: Option<RecorderHandle>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn ingestor(&self) -> Ingestor {
        self.ingestor.clone()
    }

    pub fn ingest(&self, channel: Channel, raw: &[u8]) -> Result<SixAxisReading, DecodeError> {
        self.ingestor.ingest(channel, raw)
    }

    pub fn channels(&self) -> &SharedChannels {
        &self.ingestor.channels
    }

    pub fn channel_snapshots(&self) -> ChannelSnapshots {
        self.ingestor.channels.snapshots()
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn tick_mode(&self) -> TickMode {
        self.tick_mode
    }

    pub fn window(&self) -> &WindowBuffer {
        &self.window
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.gate.thresholds()
    }

    pub fn stats(&self) -> &SharedStats {
        &self.ingestor.stats
    }

    /// The channel whose packets produce ticks in [`TickMode::OnPacket`].
    pub fn driving_channel(&self) -> Channel {
        match self.mode {
            OperatingMode::Dual => self.fuser.config().fallback_channel,
            OperatingMode::SingleHip => Channel::Hip,
            OperatingMode::SingleLeg => Channel::Leg,
        }
    }

    /// Fuse the latest readings into the window and consult the gate.
    pub fn tick(&mut self) -> TickReport {
        let stats = &self.ingestor.stats;
        stats.record(Counter::Ticks);

        let pushed = match self.fuser.raw_sample(self.mode, &self.ingestor.channels) {
            Some(raw) => {
                if let Some(recorder) = &self.recorder {
                    recorder.record(&raw);
                }
                self.window.push(self.fuser.scale(raw));
                stats.record(Counter::SamplesPushed);
                true
            }
            None => {
                stats.record(Counter::ZeroSamplesSuppressed);
                false
            }
        };

        let verdict = self.gate.on_tick(&self.window);
        let window_len = self.window.len();

        if verdict.became_ready {
            tracing::info!(capacity = self.window.capacity(), "window full, inference enabled");
            self.status.emit(StatusEvent::WindowReady {
                capacity: self.window.capacity(),
            });
        } else if pushed && self.gate.state() == GateState::Filling {
            let step = (self.window.capacity() / 8).max(1);
            if window_len % step == 0 {
                self.status.emit(StatusEvent::Filling {
                    len: window_len,
                    capacity: self.window.capacity(),
                });
            }
        }

        TickReport {
            pushed,
            window_len,
            became_ready: verdict.became_ready,
            inference: verdict.infer.then(|| self.window.snapshot()),
        }
    }

    /// Tick, then run inference and alerting inline.
    pub async fn run_tick(
        &mut self,
        model: &dyn FallModel,
        coordinator: &mut AlertCoordinator,
    ) -> TickResult {
        let report = self.tick();
        let Some(snapshot) = report.inference.clone() else {
            return TickResult {
                report,
                decision: None,
                alert: None,
            };
        };

        let decision = run_inference(model, &snapshot, &self.thresholds(), self.stats());
        self.status.emit(StatusEvent::Prediction(decision.clone()));
        let alert = dispatch_decision(
            &decision,
            &snapshot,
            self.channel_snapshots(),
            self.mode,
            coordinator,
            self.stats(),
            &self.status,
        )
        .await;

        TickResult {
            report,
            decision: Some(decision),
            alert,
        }
    }
}

/// Evaluate the model on a window, counting the call.
pub fn run_inference(
    model: &dyn FallModel,
    snapshot: &WindowSnapshot,
    thresholds: &Thresholds,
    stats: &SharedStats,
) -> Decision {
    stats.record(Counter::Inferences);
    let decision = evaluate(model, snapshot, thresholds);
    match &decision {
        Decision::NoDecision { .. } => stats.record(Counter::InferenceFailures),
        Decision::Fall { .. } => stats.record(Counter::FallCandidates),
        Decision::Normal { .. } | Decision::Elevated { .. } => {}
    }
    decision
}

/// Hand a fall decision to the coordinator. Other decisions are a no-op.
pub async fn dispatch_decision(
    decision: &Decision,
    snapshot: &WindowSnapshot,
    readings: ChannelSnapshots,
    mode: OperatingMode,
    coordinator: &mut AlertCoordinator,
    stats: &SharedStats,
    status: &StatusSender,
) -> Option<AlertOutcome> {
    let Decision::Fall { probability } = *decision else {
        return None;
    };

    let details = AlertDetails {
        mode,
        peak_accel_magnitude: Some(compute_window_stats(snapshot).peak_accel_magnitude),
    };
    let outcome = coordinator
        .maybe_alert_with(probability, readings, details)
        .await;

    match &outcome {
        AlertOutcome::Dispatched(event) => {
            stats.record(Counter::AlertsDispatched);
            let delivery = event.delivery();
            if delivery.is_failed() {
                stats.record(Counter::AlertsFailed);
            }
            status.emit(StatusEvent::AlertDispatched {
                probability,
                delivery,
                record_id: event.record_id.clone(),
            });
        }
        AlertOutcome::Suppressed { remaining } => {
            stats.record(Counter::AlertsSuppressed);
            status.emit(StatusEvent::AlertSuppressed {
                probability,
                remaining: remaining.to_std().unwrap_or_default(),
            });
        }
    }
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertSettings, LogNotifier, LogStore};
    use crate::core::decoder::encode_binary;
    use crate::core::model::ConstantModel;
    use crate::stats::StatsLog;

    fn pipeline(window_size: usize, every: u64, mode: OperatingMode) -> Pipeline {
        let settings = PipelineSettings {
            window_size,
            predict_every_n_ticks: every,
            ..PipelineSettings::default()
        };
        Pipeline::new(&settings, mode, Arc::new(StatsLog::new()))
    }

    fn coordinator() -> AlertCoordinator {
        AlertCoordinator::new(
            AlertSettings::default(),
            Arc::new(LogStore),
            Arc::new(LogNotifier),
        )
    }

    #[test]
    fn test_ingest_updates_channel_and_counts() {
        let pipeline = pipeline(4, 1, OperatingMode::Dual);
        pipeline
            .ingest(Channel::Leg, &encode_binary(1, [1, 2, 3, 4, 5, 6]))
            .unwrap();
        assert!(pipeline.ingest(Channel::Leg, b"garbage").is_err());

        assert_eq!(pipeline.channel_snapshots().leg.unwrap().ax, 1.0);
        let stats = pipeline.stats().stats();
        assert_eq!(stats.leg_packets, 1);
        assert_eq!(stats.malformed_packets, 1);
    }

    #[test]
    fn test_tick_without_data_is_suppressed() {
        let mut pipeline = pipeline(4, 1, OperatingMode::Dual);
        let report = pipeline.tick();
        assert!(!report.pushed);
        assert_eq!(report.window_len, 0);
        assert_eq!(pipeline.stats().get(Counter::ZeroSamplesSuppressed), 1);
    }

    #[test]
    fn test_tick_schedules_inference_after_warmup() {
        let mut pipeline = pipeline(3, 1, OperatingMode::SingleHip);
        pipeline.ingest(Channel::Hip, b"1,2,3,4,5,6").unwrap();

        assert!(pipeline.tick().inference.is_none());
        assert!(pipeline.tick().inference.is_none());
        let third = pipeline.tick();
        assert!(third.became_ready);
        let snapshot = third.inference.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.width(), 12);
        assert_eq!(pipeline.gate_state(), GateState::Ready);
    }

    #[test]
    fn test_first_inference_on_the_filling_tick_after_suppressed_ticks() {
        let mut pipeline = pipeline(3, 5, OperatingMode::SingleHip);
        for _ in 0..3 {
            assert!(!pipeline.tick().pushed);
        }
        pipeline.ingest(Channel::Hip, b"1,2,3,4,5,6").unwrap();

        assert!(pipeline.tick().inference.is_none());
        assert!(pipeline.tick().inference.is_none());
        let filling = pipeline.tick();
        assert!(filling.became_ready);
        assert!(filling.inference.is_some());

        let later: Vec<bool> = (0..5).map(|_| pipeline.tick().inference.is_some()).collect();
        assert_eq!(later, vec![false, false, false, false, true]);
    }

    #[tokio::test]
    async fn test_run_tick_alerts_on_fall() {
        let mut pipeline = pipeline(2, 1, OperatingMode::Dual);
        let model = ConstantModel::new(0.99, 2, 12);
        let mut coordinator = coordinator();
        pipeline.ingest(Channel::Hip, b"1,0,0,0,0,0").unwrap();

        let first = pipeline.run_tick(&model, &mut coordinator).await;
        assert!(first.decision.is_none());

        let second = pipeline.run_tick(&model, &mut coordinator).await;
        assert!(second.decision.unwrap().is_fall());
        let outcome = second.alert.unwrap();
        let event = outcome.event().unwrap();
        assert_eq!(event.peak_accel_magnitude, Some(1.0));

        let third = pipeline.run_tick(&model, &mut coordinator).await;
        assert!(matches!(third.alert, Some(AlertOutcome::Suppressed { .. })));
        assert_eq!(pipeline.stats().get(Counter::AlertsDispatched), 1);
        assert_eq!(pipeline.stats().get(Counter::AlertsSuppressed), 1);
    }

    #[test]
    fn test_driving_channel() {
        assert_eq!(pipeline(1, 1, OperatingMode::Dual).driving_channel(), Channel::Hip);
        assert_eq!(pipeline(1, 1, OperatingMode::SingleLeg).driving_channel(), Channel::Leg);
    }

    #[test]
    fn test_tick_mode_cli_names() {
        assert_eq!(TickMode::from_str("fixed", true), Ok(TickMode::Fixed));
        assert_eq!(TickMode::from_str("on-packet", true), Ok(TickMode::OnPacket));
        assert_eq!(TickMode::from_str("on_packet", true), Ok(TickMode::OnPacket));
        assert!(TickMode::from_str("sometimes", true).is_err());
    }
}
