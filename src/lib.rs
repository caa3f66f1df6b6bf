//! Fallwatch Agent - streaming fall detection for wearable inertial sensors.
//!
//! Two six-axis IMUs (one at the hip, one on the leg) stream readings over
//! a sensor link. The agent fuses their latest values into fixed-rate
//! samples, keeps a sliding window of them, runs a fall classifier on the
//! window and, when the classifier is confident, persists an alert record
//! and notifies a caregiver.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Fallwatch Agent                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐             │
//! │  │    Link     │──▶│   Decoder   │──▶│  Channels   │             │
//! │  │ (supervisor)│   │ (per packet)│   │ (latest val)│             │
//! │  └─────────────┘   └─────────────┘   └─────────────┘             │
//! │                                             │ tick               │
//! │                                             ▼                    │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐             │
//! │  │   Alerts    │◀──│  Inference  │◀──│   Window    │             │
//! │  │ (cooldown)  │   │   (gate)    │   │  (sliding)  │             │
//! │  └─────────────┘   └─────────────┘   └─────────────┘             │
//! │         │                                                        │
//! │         ▼                                                        │
//! │   store + notifier                                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fallwatch_agent::{config::Config, core::ConstantModel, link::ScriptedTransport, runtime};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), runtime::RuntimeError> {
//! let config = Config::default();
//! let transport = Arc::new(ScriptedTransport::new());
//! let model = Arc::new(ConstantModel::new(0.1, config.window_size, config.feature_width));
//!
//! let cancel = CancellationToken::new();
//! let summary = runtime::run(&config, transport, model, Default::default(), cancel).await?;
//! println!("{}", summary.stats.inferences);
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod config;
pub mod core;
pub mod link;
pub mod recorder;
pub mod runtime;
pub mod stats;
pub mod status;

// Re-export key types at crate root for convenience
pub use alert::{AlertCoordinator, AlertEvent, AlertOutcome, AlertSettings};
pub use config::{Config, ConfigError};
pub use core::{
    Channel, Decision, FallModel, OperatingMode, Pipeline, PipelineSettings, SixAxisReading,
    WindowBuffer,
};
pub use link::{LinkState, LinkSupervisor, Transport};
pub use runtime::{Detector, RunOptions, RunSummary, RuntimeError};
pub use stats::{create_shared_stats, SharedStats, StatsLog};
pub use status::{StatusEvent, StatusSender};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
