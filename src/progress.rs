//! # Progress Tracker
//!
//! Live progress for long-running migration runs: per-step status, overall
//! percentage, a windowed throughput estimate, and a deliberately pessimistic
//! ETA. The tracker is passive; the orchestrator and transformer feed it.
//!
//! Throughput is computed over a short recent window so it reacts to the
//! current batch, not the whole run. The ETA takes the larger of the linear
//! whole-run estimate and the average-step estimate, so it only ever
//! surprises in the good direction.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Samples retained for rate calculations.
const SAMPLE_WINDOW: usize = 30;
/// Most recent samples used for the throughput estimate.
const THROUGHPUT_SAMPLES: usize = 10;

/// Status of one tracked step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One migration step as seen by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub version: u64,
    pub description: String,
    pub status: StepStatus,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Point-in-time view of a run, safe to serialize for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub started_at: DateTime<Utc>,
    pub total_units: u64,
    pub processed_units: u64,
    /// 0.0 to 100.0
    pub percent: f64,
    /// Units per second over the recent window; `None` before two samples
    pub throughput_per_sec: Option<f64>,
    /// Estimated remaining milliseconds; `None` until measurable
    pub eta_ms: Option<u64>,
    pub current_step: Option<u64>,
    pub steps: Vec<StepProgress>,
    pub paused: bool,
    pub finished: bool,
}

struct TrackerState {
    started: Instant,
    started_at: DateTime<Utc>,
    total_units: u64,
    processed_units: u64,
    samples: VecDeque<(Instant, u64)>,
    steps: Vec<StepProgress>,
    current_step: Option<u64>,
    paused: bool,
    finished: bool,
    succeeded: bool,
}

/// Thread-safe progress tracker for one run.
pub struct ProgressTracker {
    state: RwLock<TrackerState>,
}

impl ProgressTracker {
    /// Begin tracking a run of `steps` covering `total_units` work units.
    pub fn start(total_units: u64, steps: Vec<(u64, String)>) -> Self {
        let steps = steps
            .into_iter()
            .map(|(version, description)| StepProgress {
                version,
                description,
                status: StepStatus::Pending,
                duration_ms: None,
                error: None,
            })
            .collect();
        Self {
            state: RwLock::new(TrackerState {
                started: Instant::now(),
                started_at: Utc::now(),
                total_units,
                processed_units: 0,
                samples: VecDeque::with_capacity(SAMPLE_WINDOW),
                steps,
                current_step: None,
                paused: false,
                finished: false,
                succeeded: false,
            }),
        }
    }

    /// Record cumulative processed units. Ignored while paused or finished.
    pub fn update_progress(&self, processed: u64) {
        let mut state = self.state.write().unwrap();
        if state.paused || state.finished {
            return;
        }
        state.processed_units = processed;
        if state.samples.len() >= SAMPLE_WINDOW {
            state.samples.pop_front();
        }
        state.samples.push_back((Instant::now(), processed));
    }

    pub fn start_step(&self, version: u64) {
        let mut state = self.state.write().unwrap();
        state.current_step = Some(version);
        if let Some(step) = state.steps.iter_mut().find(|s| s.version == version) {
            step.status = StepStatus::Running;
        }
    }

    pub fn complete_step(&self, version: u64, duration_ms: u64) {
        let mut state = self.state.write().unwrap();
        if state.current_step == Some(version) {
            state.current_step = None;
        }
        if let Some(step) = state.steps.iter_mut().find(|s| s.version == version) {
            step.status = StepStatus::Completed;
            step.duration_ms = Some(duration_ms);
        }
    }

    pub fn fail_step(&self, version: u64, error: impl Into<String>) {
        let mut state = self.state.write().unwrap();
        if state.current_step == Some(version) {
            state.current_step = None;
        }
        if let Some(step) = state.steps.iter_mut().find(|s| s.version == version) {
            step.status = StepStatus::Failed;
            step.error = Some(error.into());
        }
    }

    pub fn skip_step(&self, version: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(step) = state.steps.iter_mut().find(|s| s.version == version) {
            step.status = StepStatus::Skipped;
        }
    }

    /// Stop accepting progress updates until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.state.write().unwrap().paused = true;
    }

    /// Resume updates. The sample window is cleared so the pause gap never
    /// enters a rate calculation.
    pub fn resume(&self) {
        let mut state = self.state.write().unwrap();
        state.paused = false;
        state.samples.clear();
    }

    /// Stop accepting updates. A successful finish pins the percentage at
    /// 100; a failed one leaves it wherever the run got to.
    pub fn finish(&self, success: bool) {
        let mut state = self.state.write().unwrap();
        state.finished = true;
        state.succeeded = success;
        if success {
            state.processed_units = state.total_units;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().unwrap().paused
    }

    /// Current view of the run.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.read().unwrap();

        let percent = if state.succeeded {
            100.0
        } else if state.total_units == 0 {
            0.0
        } else {
            (state.processed_units as f64 / state.total_units as f64 * 100.0).min(100.0)
        };

        let throughput = recent_throughput(&state.samples);
        let eta_ms = estimate_eta_ms(&state, throughput);

        ProgressSnapshot {
            started_at: state.started_at,
            total_units: state.total_units,
            processed_units: state.processed_units,
            percent,
            throughput_per_sec: throughput,
            eta_ms,
            current_step: state.current_step,
            steps: state.steps.clone(),
            paused: state.paused,
            finished: state.finished,
        }
    }
}

/// Two-point rate over the most recent samples.
fn recent_throughput(samples: &VecDeque<(Instant, u64)>) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let start = samples.len().saturating_sub(THROUGHPUT_SAMPLES);
    let (first_t, first_n) = samples[start];
    let (last_t, last_n) = *samples.back()?;
    let elapsed = last_t.duration_since(first_t).as_secs_f64();
    if elapsed <= 0.0 || last_n <= first_n {
        return None;
    }
    Some((last_n - first_n) as f64 / elapsed)
}

/// Larger of the linear whole-run estimate and the average-step estimate.
fn estimate_eta_ms(state: &TrackerState, throughput: Option<f64>) -> Option<u64> {
    if state.finished || state.processed_units == 0 {
        return None;
    }
    let remaining_units = state.total_units.saturating_sub(state.processed_units);

    let linear = throughput
        .filter(|rate| *rate > 0.0)
        .map(|rate| (remaining_units as f64 / rate * 1000.0) as u64)
        .or_else(|| {
            let elapsed_ms = state.started.elapsed().as_millis() as u64;
            if elapsed_ms == 0 {
                return None;
            }
            let rate = state.processed_units as f64 / elapsed_ms as f64;
            if rate > 0.0 {
                Some((remaining_units as f64 / rate) as u64)
            } else {
                None
            }
        });

    let completed: Vec<u64> = state
        .steps
        .iter()
        .filter_map(|s| match s.status {
            StepStatus::Completed => s.duration_ms,
            _ => None,
        })
        .collect();
    let by_steps = if completed.is_empty() {
        None
    } else {
        let average = completed.iter().sum::<u64>() / completed.len() as u64;
        let remaining_steps = state
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::Running))
            .count() as u64;
        Some(average * remaining_steps)
    };

    match (linear, by_steps) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
