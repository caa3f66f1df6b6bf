//! Core detector functionality.
//!
//! This module contains:
//! - Sensor types and packet decoding
//! - Per-channel latest-value state
//! - Sample fusion and the sliding window
//! - The inference gate, the model boundary and window statistics
//! - The per-session pipeline tying them together

pub mod channel;
pub mod decoder;
pub mod features;
pub mod fuser;
pub mod inference;
pub mod model;
pub mod pipeline;
pub mod types;
pub mod window;

// Re-export commonly used types
pub use channel::{ChannelSet, ChannelState, SharedChannels};
pub use decoder::{DecodeError, DecoderConfig, PacketDecoder};
pub use features::{compute_window_stats, WindowStats};
pub use fuser::{FusionConfig, SampleFuser};
pub use inference::{Decision, GateState, InferenceGate, Thresholds};
pub use model::{ConstantModel, FallModel, LogisticModel, ModelError, WindowTensor};
pub use pipeline::{
    dispatch_decision, run_inference, Ingestor, Pipeline, PipelineSettings, TickMode, TickReport,
    TickResult,
};
pub use types::{Channel, ChannelSnapshots, FusedSample, OperatingMode, SixAxisReading};
pub use window::{WindowBuffer, WindowSnapshot};
