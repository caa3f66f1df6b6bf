//! Session recording and offline replay.
//!
//! While recording, the tick task hands each raw (unscaled) sample to a
//! bounded crossbeam channel and a dedicated thread writes it as a CSV row.
//! When the channel is full the row is dropped rather than blocking the
//! tick. The same CSV layout is what `fallwatch predict` reads back.

use crate::core::features::{WindowStats, AXIS_NAMES};
use crate::core::fuser::{SampleFuser, DUAL_WIDTH};
use crate::core::types::{FusedSample, SixAxisReading, AXES};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recording I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("recording writer thread panicked")]
    WriterPanicked,
}

enum Row {
    Sample(Vec<f32>),
    Stop,
}

/// CSV header for a sample width.
pub fn csv_header(width: usize) -> String {
    let columns: Vec<String> = if width == DUAL_WIDTH {
        (0..width).map(WindowStats::column_label).collect()
    } else {
        AXIS_NAMES.iter().map(|s| s.to_string()).collect()
    };
    format!("seq,{}", columns.join(","))
}

/// Cloneable sending side, given to each session's pipeline.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: Sender<Row>,
    dropped: Arc<AtomicU64>,
}

impl RecorderHandle {
    pub fn record(&self, sample: &FusedSample) {
        match self.tx.try_send(Row::Sample(sample.values().to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Owns the writer thread.
pub struct SessionRecorder {
    path: PathBuf,
    handle: RecorderHandle,
    worker: Option<JoinHandle<Result<u64, RecorderError>>>,
}

impl SessionRecorder {
    /// Create (truncate) `path`, write the header and start the writer.
    pub fn start(path: &Path, width: usize) -> Result<Self, RecorderError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", csv_header(width))?;

        let (tx, rx) = bounded::<Row>(QUEUE_CAPACITY);
        let worker = std::thread::Builder::new()
            .name("fallwatch-recorder".to_string())
            .spawn(move || -> Result<u64, RecorderError> {
                let mut seq = 0u64;
                for row in rx {
                    let Row::Sample(values) = row else { break };
                    let line: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    writeln!(writer, "{},{}", seq, line.join(","))?;
                    seq += 1;
                }
                writer.flush()?;
                Ok(seq)
            })?;

        tracing::info!(path = %path.display(), "recording fused samples");
        Ok(Self {
            path: path.to_path_buf(),
            handle: RecorderHandle {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> RecorderHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the writer and return the number of rows written.
    pub fn finish(mut self) -> Result<u64, RecorderError> {
        let _ = self.handle.tx.send(Row::Stop);
        let worker = self.worker.take().ok_or(RecorderError::WriterPanicked)?;
        let written = worker.join().map_err(|_| RecorderError::WriterPanicked)??;

        let dropped = self.handle.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(dropped, "recording queue overflowed, rows were lost");
        }
        Ok(written)
    }
}

/// Read raw samples from a CSV recording.
///
/// Accepted rows: 12 values (hip then leg) or 6 values (one sensor,
/// duplicated as needed), either optionally preceded by a sequence column.
/// A non-numeric first line is taken as a header. Samples come back scaled
/// by `fuser`, ready for a window.
pub fn load_samples(path: &Path, fuser: &SampleFuser) -> Result<Vec<FusedSample>, RecorderError> {
    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parsed: Result<Vec<f32>, _> = trimmed.split(',').map(|t| t.trim().parse::<f32>()).collect();
        let values = match parsed {
            Ok(values) => values,
            Err(_) if index == 0 => continue,
            Err(e) => {
                return Err(RecorderError::Malformed {
                    line: index + 1,
                    message: e.to_string(),
                })
            }
        };

        let axes = match values.len() {
            n if n == 2 * AXES || n == AXES => &values[..],
            n if n == 2 * AXES + 1 || n == AXES + 1 => &values[1..],
            n => {
                return Err(RecorderError::Malformed {
                    line: index + 1,
                    message: format!("expected 6 or 12 values, found {n}"),
                })
            }
        };

        let hip = reading_at(axes, 0);
        let leg = (axes.len() == 2 * AXES).then(|| reading_at(axes, AXES));
        let raw = fuser.raw_from_readings(&hip, leg.as_ref());
        samples.push(fuser.scale(raw));
    }

    Ok(samples)
}

fn reading_at(values: &[f32], start: usize) -> SixAxisReading {
    let mut block = [0.0f32; AXES];
    block.copy_from_slice(&values[start..start + AXES]);
    SixAxisReading::from_array(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fuser::FusionConfig;

    #[test]
    fn test_header() {
        assert!(csv_header(12).starts_with("seq,hip_ax,hip_ay"));
        assert!(csv_header(12).ends_with("leg_gz"));
        assert_eq!(csv_header(6), "seq,ax,ay,az,gx,gy,gz");
    }

    #[test]
    fn test_record_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");

        let recorder = SessionRecorder::start(&path, 12).unwrap();
        let handle = recorder.handle();
        for i in 0..3 {
            handle.record(&FusedSample::new(vec![i as f32; 12]));
        }
        assert_eq!(recorder.finish().unwrap(), 3);

        let fuser = SampleFuser::new(FusionConfig {
            gyro_scale: 2.0,
            ..FusionConfig::default()
        });
        let samples = load_samples(&path, &fuser).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].values()[0], 2.0);
        // Gyro columns come back scaled.
        assert_eq!(samples[2].values()[3], 4.0);
    }

    #[test]
    fn test_load_six_value_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hip.csv");
        std::fs::write(&path, "ax,ay,az,gx,gy,gz\n1,2,3,0,0,0\n4,5,6,0,0,0\n").unwrap();

        let fuser = SampleFuser::new(FusionConfig::default());
        let samples = load_samples(&path, &fuser).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].width(), 12);
        assert_eq!(samples[0].block(0), samples[0].block(1));
    }

    #[test]
    fn test_load_rejects_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "1,2,3,4,5,6\n1,2,3\n").unwrap();

        let fuser = SampleFuser::new(FusionConfig::default());
        assert!(matches!(
            load_samples(&path, &fuser),
            Err(RecorderError::Malformed { line: 2, .. })
        ));
    }
}
