//! Sensor data types shared by the pipeline stages.
//!
//! Readings are kept in the units the firmware sends them in. Scaling only
//! happens once, in the fuser, right before samples enter the window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of values in one sensor reading (3 accelerometer + 3 gyroscope axes).
pub const AXES: usize = 6;

/// A physical sensor, identified by where it is worn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Hip,
    Leg,
}

impl Channel {
    /// All channels, in fused-sample order (hip axes first, then leg axes).
    pub const ALL: [Channel; 2] = [Channel::Hip, Channel::Leg];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Hip => "hip",
            Channel::Leg => "leg",
        }
    }

    /// The other channel of the pair.
    pub fn other(&self) -> Channel {
        match self {
            Channel::Hip => Channel::Leg,
            Channel::Leg => Channel::Hip,
        }
    }

    /// Key prefixes accepted in JSON payloads for this channel.
    pub(crate) fn json_prefixes(&self) -> &'static [&'static str] {
        match self {
            Channel::Hip => &["hip", "cadera"],
            Channel::Leg => &["leg", "pierna"],
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hip" | "cadera" => Ok(Channel::Hip),
            "leg" | "pierna" => Ok(Channel::Leg),
            other => Err(format!("unknown channel '{other}' (expected hip or leg)")),
        }
    }
}

/// One 6-axis reading from a single sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SixAxisReading {
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    pub gx: f32,
    pub gy: f32,
    pub gz: f32,
}

impl SixAxisReading {
    /// The reading reported for a channel that has not produced data yet.
    pub const ZERO: SixAxisReading = SixAxisReading {
        ax: 0.0,
        ay: 0.0,
        az: 0.0,
        gx: 0.0,
        gy: 0.0,
        gz: 0.0,
    };

    pub fn from_array(values: [f32; AXES]) -> Self {
        let [ax, ay, az, gx, gy, gz] = values;
        Self {
            ax,
            ay,
            az,
            gx,
            gy,
            gz,
        }
    }

    pub fn to_array(&self) -> [f32; AXES] {
        [self.ax, self.ay, self.az, self.gx, self.gy, self.gz]
    }

    /// Euclidean norm of the accelerometer axes.
    pub fn accel_magnitude(&self) -> f64 {
        let (x, y, z) = (self.ax as f64, self.ay as f64, self.az as f64);
        (x * x + y * y + z * z).sqrt()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// A reading together with the time it was received.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedReading {
    pub reading: SixAxisReading,
    pub received_at: DateTime<Utc>,
}

/// Which channels feed the fused sample during one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Both sensors live.
    Dual,
    /// Only the hip sensor is live; its values stand in for the leg.
    SingleHip,
    /// Only the leg sensor is live; its values stand in for the hip.
    SingleLeg,
}

impl OperatingMode {
    /// The mode for a single live channel.
    pub fn single(channel: Channel) -> Self {
        match channel {
            Channel::Hip => OperatingMode::SingleHip,
            Channel::Leg => OperatingMode::SingleLeg,
        }
    }

    /// Channels that must be subscribed in this mode.
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            OperatingMode::Dual => &Channel::ALL,
            OperatingMode::SingleHip => &[Channel::Hip],
            OperatingMode::SingleLeg => &[Channel::Leg],
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, OperatingMode::Dual)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Dual => write!(f, "dual (hip + leg)"),
            OperatingMode::SingleHip => write!(f, "single (hip only)"),
            OperatingMode::SingleLeg => write!(f, "single (leg only)"),
        }
    }
}

/// One tick's reconciled reading across the active channels.
///
/// The length is fixed for a run and matches the model's feature width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSample {
    values: Vec<f32>,
}

impl FusedSample {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    /// The 6-axis block at `index` (0 = first channel, 1 = second channel).
    pub fn block(&self, index: usize) -> Option<&[f32]> {
        let start = index * AXES;
        self.values.get(start..start + AXES)
    }
}

/// Latest raw readings of both channels, attached to alerts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshots {
    pub hip: Option<SixAxisReading>,
    pub leg: Option<SixAxisReading>,
}

impl ChannelSnapshots {
    pub fn get(&self, channel: Channel) -> Option<SixAxisReading> {
        match channel {
            Channel::Hip => self.hip,
            Channel::Leg => self.leg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parsing() {
        assert_eq!("hip".parse::<Channel>().unwrap(), Channel::Hip);
        assert_eq!(" Pierna ".parse::<Channel>().unwrap(), Channel::Leg);
        assert!("wrist".parse::<Channel>().is_err());
    }

    #[test]
    fn test_mode_channels() {
        assert_eq!(OperatingMode::Dual.channels(), &[Channel::Hip, Channel::Leg]);
        assert_eq!(OperatingMode::single(Channel::Leg), OperatingMode::SingleLeg);
        assert!(OperatingMode::SingleHip.is_degraded());
        assert!(!OperatingMode::Dual.is_degraded());
    }

    #[test]
    fn test_accel_magnitude() {
        let reading = SixAxisReading::from_array([3.0, 4.0, 0.0, 9.0, 9.0, 9.0]);
        assert!((reading.accel_magnitude() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_fused_sample_blocks() {
        let sample = FusedSample::new((0..12).map(|v| v as f32).collect());
        assert_eq!(sample.block(1).unwrap(), &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        assert!(sample.block(2).is_none());
    }
}
