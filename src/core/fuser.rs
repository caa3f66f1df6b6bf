//! Sample fusion: latest channel readings in, one model-width sample out.
//!
//! Layout of a 12-wide sample is fixed: hip `ax ay az gx gy gz`, then leg
//! `ax ay az gx gy gz`. When only one sensor is live its six values fill
//! both halves so the model still sees a full-width input. This is an
//! approximation; accuracy in that mode is not equivalent to dual mode.
//!
//! Gyroscope axes are multiplied by `gyro_scale` before the sample enters
//! the window. The factor must be the one used when the model was trained.

use crate::core::channel::ChannelSet;
use crate::core::types::{Channel, FusedSample, OperatingMode, SixAxisReading, AXES};
use serde::{Deserialize, Serialize};

/// Feature width for models trained on both sensors.
pub const DUAL_WIDTH: usize = 2 * AXES;

/// Feature width for models trained on a single sensor.
pub const SINGLE_WIDTH: usize = AXES;

/// Fusion parameters. Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Model feature width (12 for hip + leg, 6 for one sensor)
    pub feature_width: usize,
    /// Multiplier applied to gx, gy, gz
    pub gyro_scale: f32,
    /// Channel used when only one can feed the sample
    pub fallback_channel: Channel,
    /// Push samples built only from channels that never reported
    pub push_zero_samples: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            feature_width: DUAL_WIDTH,
            gyro_scale: 4.0,
            fallback_channel: Channel::Hip,
            push_zero_samples: false,
        }
    }
}

/// Builds fused samples from a [`ChannelSet`].
#[derive(Debug, Clone)]
pub struct SampleFuser {
    config: FusionConfig,
}

impl SampleFuser {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn feature_width(&self) -> usize {
        self.config.feature_width
    }

    /// Channels whose readings go into the sample for `mode`.
    pub fn sources(&self, mode: OperatingMode) -> Vec<Channel> {
        match (mode, self.config.feature_width) {
            (OperatingMode::Dual, DUAL_WIDTH) => Channel::ALL.to_vec(),
            (OperatingMode::Dual, _) => vec![self.config.fallback_channel],
            (OperatingMode::SingleHip, _) => vec![Channel::Hip],
            (OperatingMode::SingleLeg, _) => vec![Channel::Leg],
        }
    }

    /// Build this tick's sample.
    ///
    /// Returns `None` when every source channel is still without data and
    /// zero samples are not pushed.
    pub fn fuse(&self, mode: OperatingMode, channels: &ChannelSet) -> Option<FusedSample> {
        self.raw_sample(mode, channels).map(|sample| self.scale(sample))
    }

    /// Like [`fuse`](Self::fuse) but without gyroscope scaling, in the units
    /// the sensors reported.
    pub fn raw_sample(&self, mode: OperatingMode, channels: &ChannelSet) -> Option<FusedSample> {
        let sources = self.sources(mode);
        let any_data = sources.iter().any(|c| channels.get(*c).has_reading());
        if !any_data && !self.config.push_zero_samples {
            return None;
        }

        let blocks: Vec<SixAxisReading> = sources
            .iter()
            .map(|c| channels.get(*c).snapshot())
            .collect();

        let mut values = Vec::with_capacity(self.config.feature_width);
        if self.config.feature_width == DUAL_WIDTH && blocks.len() == 1 {
            // One live sensor feeding a two-sensor model: duplicate.
            values.extend_from_slice(&blocks[0].to_array());
            values.extend_from_slice(&blocks[0].to_array());
        } else {
            for block in &blocks {
                values.extend_from_slice(&block.to_array());
            }
        }

        Some(FusedSample::new(values))
    }

    /// Build a raw sample from explicit readings (offline prediction).
    pub fn raw_from_readings(&self, hip: &SixAxisReading, leg: Option<&SixAxisReading>) -> FusedSample {
        let leg = leg.unwrap_or(hip);
        let mut values = Vec::with_capacity(self.config.feature_width);
        if self.config.feature_width == DUAL_WIDTH {
            values.extend_from_slice(&hip.to_array());
            values.extend_from_slice(&leg.to_array());
        } else {
            let single = match self.config.fallback_channel {
                Channel::Hip => hip,
                Channel::Leg => leg,
            };
            values.extend_from_slice(&single.to_array());
        }
        FusedSample::new(values)
    }

    /// Apply the gyroscope scale to every 6-axis block of a raw sample.
    pub fn scale(&self, sample: FusedSample) -> FusedSample {
        let scale = self.config.gyro_scale;
        let values = sample
            .values()
            .iter()
            .enumerate()
            .map(|(i, v)| if i % AXES >= 3 { v * scale } else { *v })
            .collect();
        FusedSample::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(base: f32) -> SixAxisReading {
        SixAxisReading::from_array([base, base + 1.0, base + 2.0, 1.0, 2.0, 3.0])
    }

    #[test]
    fn test_dual_concatenates_hip_then_leg() {
        let fuser = SampleFuser::new(FusionConfig::default());
        let channels = ChannelSet::new();
        channels.get(Channel::Hip).update(reading(10.0));
        channels.get(Channel::Leg).update(reading(20.0));

        let sample = fuser.fuse(OperatingMode::Dual, &channels).unwrap();
        assert_eq!(
            sample.values(),
            &[10.0, 11.0, 12.0, 4.0, 8.0, 12.0, 20.0, 21.0, 22.0, 4.0, 8.0, 12.0]
        );
    }

    #[test]
    fn test_single_mode_duplicates_halves() {
        let fuser = SampleFuser::new(FusionConfig::default());
        let channels = ChannelSet::new();
        channels.get(Channel::Hip).update(reading(1.5));
        channels.get(Channel::Leg).update(reading(99.0));

        let sample = fuser.fuse(OperatingMode::SingleHip, &channels).unwrap();
        assert_eq!(sample.width(), 12);
        assert_eq!(sample.block(0), sample.block(1));
        assert_eq!(sample.values()[0], 1.5);
    }

    #[test]
    fn test_gyro_scale_only_touches_gyro_axes() {
        let fuser = SampleFuser::new(FusionConfig {
            gyro_scale: 2.0,
            ..FusionConfig::default()
        });
        let channels = ChannelSet::new();
        channels
            .get(Channel::Leg)
            .update(SixAxisReading::from_array([1.0, 1.0, 1.0, 1.0, 1.0, 1.0]));

        let sample = fuser.fuse(OperatingMode::SingleLeg, &channels).unwrap();
        assert_eq!(sample.block(0).unwrap(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_zero_samples_suppressed_by_default() {
        let fuser = SampleFuser::new(FusionConfig::default());
        let channels = ChannelSet::new();
        assert!(fuser.fuse(OperatingMode::Dual, &channels).is_none());

        // One channel reporting is enough; the other contributes zeros.
        channels.get(Channel::Leg).update(reading(5.0));
        let sample = fuser.fuse(OperatingMode::Dual, &channels).unwrap();
        assert_eq!(sample.block(0).unwrap(), &[0.0; 6]);
    }

    #[test]
    fn test_zero_samples_pushed_when_enabled() {
        let fuser = SampleFuser::new(FusionConfig {
            push_zero_samples: true,
            ..FusionConfig::default()
        });
        let sample = fuser.fuse(OperatingMode::Dual, &ChannelSet::new()).unwrap();
        assert_eq!(sample.values(), &[0.0; 12]);
    }

    #[test]
    fn test_raw_sample_is_unscaled() {
        let fuser = SampleFuser::new(FusionConfig::default());
        let channels = ChannelSet::new();
        channels.get(Channel::Hip).update(reading(0.0));

        let raw = fuser.raw_sample(OperatingMode::SingleHip, &channels).unwrap();
        assert_eq!(raw.block(0).unwrap(), &[0.0, 1.0, 2.0, 1.0, 2.0, 3.0]);
        assert_eq!(fuser.scale(raw), fuser.fuse(OperatingMode::SingleHip, &channels).unwrap());
    }

    #[test]
    fn test_raw_from_readings_duplicates_missing_leg() {
        let fuser = SampleFuser::new(FusionConfig::default());
        let sample = fuser.raw_from_readings(&reading(7.0), None);
        assert_eq!(sample.block(0), sample.block(1));
    }

    #[test]
    fn test_single_width_uses_fallback_channel() {
        let fuser = SampleFuser::new(FusionConfig {
            feature_width: SINGLE_WIDTH,
            fallback_channel: Channel::Leg,
            ..FusionConfig::default()
        });
        assert_eq!(fuser.sources(OperatingMode::Dual), vec![Channel::Leg]);

        let channels = ChannelSet::new();
        channels.get(Channel::Leg).update(reading(3.0));
        let sample = fuser.fuse(OperatingMode::Dual, &channels).unwrap();
        assert_eq!(sample.width(), 6);
        assert_eq!(sample.values()[0], 3.0);
    }
}
