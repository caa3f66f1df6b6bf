//! Inference scheduling and interpretation.
//!
//! The gate starts in `Filling` and switches to `Ready` the first time the
//! window is full. From then on every `every_n_ticks`-th tick hands a window
//! snapshot to the model. Model failures produce no decision: the detector
//! stays silent rather than raising a false alarm.

use crate::core::model::{checked_predict, FallModel};
use crate::core::window::{WindowBuffer, WindowSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Warm-up state of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Filling,
    Ready,
}

/// The two independent probability thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Above this a fall alert is raised
    pub alert: f32,
    /// Above this the status output flags a possible fall (no alert)
    pub display: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            alert: 0.95,
            display: 0.5,
        }
    }
}

impl Thresholds {
    pub fn classify(&self, probability: f32) -> Decision {
        if probability > self.alert {
            Decision::Fall { probability }
        } else if probability > self.display {
            Decision::Elevated { probability }
        } else {
            Decision::Normal { probability }
        }
    }
}

/// Outcome of one model evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// The model could not be queried; nothing is concluded this tick.
    NoDecision { reason: String },
    Normal { probability: f32 },
    /// Above the display threshold, below the alert threshold.
    Elevated { probability: f32 },
    /// Candidate fall event.
    Fall { probability: f32 },
}

impl Decision {
    pub fn probability(&self) -> Option<f32> {
        match self {
            Decision::NoDecision { .. } => None,
            Decision::Normal { probability }
            | Decision::Elevated { probability }
            | Decision::Fall { probability } => Some(*probability),
        }
    }

    pub fn is_fall(&self) -> bool {
        matches!(self, Decision::Fall { .. })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::NoDecision { reason } => write!(f, "no decision ({reason})"),
            Decision::Normal { probability } => write!(f, "normal ({:.1}%)", probability * 100.0),
            Decision::Elevated { probability } => {
                write!(f, "possible fall ({:.1}%)", probability * 100.0)
            }
            Decision::Fall { probability } => write!(f, "FALL ({:.1}%)", probability * 100.0),
        }
    }
}

/// What the gate wants done after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateVerdict {
    /// This tick completed the warm-up
    pub became_ready: bool,
    /// The model should be queried on this tick's window
    pub infer: bool,
}

/// Per-session inference scheduler.
///
/// The model runs on the tick that fills the window and on every
/// `every_n_ticks`-th tick after it, however many ticks the warm-up took.
#[derive(Debug, Clone)]
pub struct InferenceGate {
    state: GateState,
    every_n_ticks: u64,
    ticks: u64,
    /// Ticks since the Filling -> Ready transition
    ready_ticks: u64,
    thresholds: Thresholds,
}

impl InferenceGate {
    pub fn new(every_n_ticks: u64, thresholds: Thresholds) -> Self {
        Self {
            state: GateState::Filling,
            every_n_ticks: every_n_ticks.max(1),
            ticks: 0,
            ready_ticks: 0,
            thresholds,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Record a tick; `window` is the buffer after this tick's push (if any).
    pub fn on_tick(&mut self, window: &WindowBuffer) -> GateVerdict {
        self.ticks += 1;

        let became_ready = self.state == GateState::Filling && window.is_full();
        match (became_ready, self.state) {
            (true, _) => {
                self.state = GateState::Ready;
                self.ready_ticks = 0;
            }
            (false, GateState::Ready) => self.ready_ticks += 1,
            (false, GateState::Filling) => {}
        }

        GateVerdict {
            became_ready,
            infer: self.state == GateState::Ready && self.ready_ticks % self.every_n_ticks == 0,
        }
    }
}

/// Run the model on a window snapshot and classify the result.
pub fn evaluate(model: &dyn FallModel, snapshot: &WindowSnapshot, thresholds: &Thresholds) -> Decision {
    let tensor = match snapshot.to_tensor() {
        Ok(tensor) => tensor,
        Err(e) => {
            tracing::warn!(error = %e, "could not build model input");
            return Decision::NoDecision {
                reason: e.to_string(),
            };
        }
    };

    match checked_predict(model, &tensor) {
        Ok(probability) => thresholds.classify(probability),
        Err(e) => {
            tracing::warn!(error = %e, "model call failed, skipping this window");
            Decision::NoDecision {
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ConstantModel, ModelError, WindowTensor};
    use crate::core::types::FusedSample;

    fn push(window: &mut WindowBuffer) {
        window.push(FusedSample::new(vec![0.0; 12]));
    }

    #[test]
    fn test_gate_ready_exactly_when_window_fills() {
        let mut window = WindowBuffer::new(4);
        let mut gate = InferenceGate::new(1, Thresholds::default());
        let mut transitions = Vec::new();

        for tick in 1..=20 {
            push(&mut window);
            let verdict = gate.on_tick(&window);
            if verdict.became_ready {
                transitions.push(tick);
            }
            assert_eq!(gate.state() == GateState::Ready, tick >= 4);
        }
        assert_eq!(transitions, vec![4]);
    }

    #[test]
    fn test_gate_infers_every_n_ticks_once_ready() {
        let mut window = WindowBuffer::new(3);
        let mut gate = InferenceGate::new(5, Thresholds::default());
        let mut infer_ticks = Vec::new();
        for tick in 1..=20u64 {
            push(&mut window);
            if gate.on_tick(&window).infer {
                infer_ticks.push(tick);
            }
        }
        assert_eq!(infer_ticks, vec![3, 8, 13, 18]);
    }

    #[test]
    fn test_cadence_starts_when_window_fills() {
        let mut window = WindowBuffer::new(3);
        let mut gate = InferenceGate::new(5, Thresholds::default());
        let mut infer_ticks = Vec::new();
        for tick in 1..=20u64 {
            // No sample for the first three ticks.
            if tick > 3 {
                push(&mut window);
            }
            let verdict = gate.on_tick(&window);
            if verdict.became_ready {
                assert_eq!(tick, 6);
            }
            if verdict.infer {
                infer_ticks.push(tick);
            }
        }
        assert_eq!(infer_ticks, vec![6, 11, 16]);
        assert_eq!(gate.ticks(), 20);
    }

    #[test]
    fn test_gate_does_not_infer_while_filling() {
        let mut window = WindowBuffer::new(10);
        let mut gate = InferenceGate::new(1, Thresholds::default());
        for _ in 0..9 {
            push(&mut window);
            assert!(!gate.on_tick(&window).infer);
        }
        push(&mut window);
        assert!(gate.on_tick(&window).infer);
    }

    #[test]
    fn test_classification_uses_both_thresholds() {
        let t = Thresholds {
            alert: 0.95,
            display: 0.5,
        };
        assert!(matches!(t.classify(0.3), Decision::Normal { .. }));
        assert!(matches!(t.classify(0.7), Decision::Elevated { .. }));
        assert!(matches!(t.classify(0.95), Decision::Elevated { .. }));
        assert!(t.classify(0.96).is_fall());
    }

    struct FailingModel;

    impl FallModel for FailingModel {
        fn input_shape(&self) -> (usize, usize) {
            (2, 12)
        }

        fn predict(&self, _input: &WindowTensor) -> Result<f32, ModelError> {
            Err(ModelError::Inference("backend crashed".to_string()))
        }
    }

    #[test]
    fn test_model_failure_is_no_decision() {
        let mut window = WindowBuffer::new(2);
        push(&mut window);
        push(&mut window);
        let decision = evaluate(&FailingModel, &window.snapshot(), &Thresholds::default());
        assert!(matches!(decision, Decision::NoDecision { .. }));
        assert_eq!(decision.probability(), None);
    }

    #[test]
    fn test_evaluate_fall() {
        let mut window = WindowBuffer::new(2);
        push(&mut window);
        push(&mut window);
        let model = ConstantModel::new(0.99, 2, 12);
        let decision = evaluate(&model, &window.snapshot(), &Thresholds::default());
        assert!(decision.is_fall());
        assert_eq!(decision.probability(), Some(0.99));
    }
}
