//! Descriptive statistics over a window.
//!
//! These are not model inputs. They are attached to alerts (peak
//! acceleration) and printed by the offline `predict` command so an operator
//! can sanity-check what the classifier saw.

use crate::core::types::AXES;
use crate::core::window::WindowSnapshot;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Axis names in per-block order.
pub const AXIS_NAMES: [&str; AXES] = ["ax", "ay", "az", "gx", "gy", "gz"];

/// Min / max / mean of one feature column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Summary of one window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    /// Number of samples summarised
    pub samples: usize,
    /// Largest accelerometer norm over all blocks and steps
    pub peak_accel_magnitude: f64,
    /// Mean accelerometer norm
    pub mean_accel_magnitude: f64,
    /// Sample standard deviation of the accelerometer norm
    pub accel_magnitude_std_dev: f64,
    /// One entry per feature column
    pub columns: Vec<AxisStats>,
}

impl WindowStats {
    /// Column label, e.g. `hip_gx` or `leg_az`.
    pub fn column_label(index: usize) -> String {
        let block = if index < AXES { "hip" } else { "leg" };
        format!("{}_{}", block, AXIS_NAMES[index % AXES])
    }
}

/// Compute statistics for a window snapshot.
pub fn compute_window_stats(window: &WindowSnapshot) -> WindowStats {
    if window.is_empty() {
        return WindowStats::default();
    }

    let width = window.width();
    let magnitudes = accel_magnitudes(window);

    let columns = (0..width)
        .map(|col| {
            let values: Vec<f64> = window
                .samples()
                .iter()
                .filter_map(|s| s.values().get(col))
                .map(|v| *v as f64)
                .collect();
            AxisStats {
                min: Statistics::min(values.iter()),
                max: Statistics::max(values.iter()),
                mean: values.iter().mean(),
            }
        })
        .collect();

    WindowStats {
        samples: window.len(),
        peak_accel_magnitude: Statistics::max(magnitudes.iter()),
        mean_accel_magnitude: magnitudes.iter().mean(),
        accel_magnitude_std_dev: std_dev(&magnitudes),
        columns,
    }
}

/// Accelerometer norms of every 6-axis block in the window.
fn accel_magnitudes(window: &WindowSnapshot) -> Vec<f64> {
    window
        .samples()
        .iter()
        .flat_map(|sample| {
            (0..sample.width() / AXES).filter_map(move |i| {
                sample.block(i).map(|b| {
                    let (x, y, z) = (b[0] as f64, b[1] as f64, b[2] as f64);
                    (x * x + y * y + z * z).sqrt()
                })
            })
        })
        .collect()
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().std_dev()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FusedSample;

    fn sample(accel: [f32; 3]) -> FusedSample {
        let mut values = vec![accel[0], accel[1], accel[2], 0.0, 0.0, 0.0];
        values.extend_from_slice(&[0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        FusedSample::new(values)
    }

    #[test]
    fn test_empty_window() {
        let stats = compute_window_stats(&WindowSnapshot::new(vec![]));
        assert_eq!(stats.samples, 0);
        assert!(stats.columns.is_empty());
    }

    #[test]
    fn test_peak_accel_magnitude() {
        let window = WindowSnapshot::new(vec![sample([3.0, 4.0, 0.0]), sample([0.0, 0.0, 1.0])]);
        let stats = compute_window_stats(&window);
        assert_eq!(stats.samples, 2);
        assert!((stats.peak_accel_magnitude - 5.0).abs() < 1e-9);
        // Norms: 5, 1 (hip) and 1, 1 (leg)
        assert!((stats.mean_accel_magnitude - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_column_stats() {
        let window = WindowSnapshot::new(vec![sample([1.0, 0.0, 0.0]), sample([3.0, 0.0, 0.0])]);
        let stats = compute_window_stats(&window);
        assert_eq!(stats.columns.len(), 12);
        assert_eq!(stats.columns[0].min, 1.0);
        assert_eq!(stats.columns[0].max, 3.0);
        assert_eq!(stats.columns[0].mean, 2.0);
    }

    #[test]
    fn test_column_labels() {
        assert_eq!(WindowStats::column_label(0), "hip_ax");
        assert_eq!(WindowStats::column_label(9), "leg_gx");
    }

    #[test]
    fn test_single_sample_std_dev_is_zero() {
        let window = WindowSnapshot::new(vec![FusedSample::new(vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0])]);
        assert_eq!(compute_window_stats(&window).accel_magnitude_std_dev, 0.0);
    }
}
