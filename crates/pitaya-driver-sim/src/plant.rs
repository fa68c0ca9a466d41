//! First-order-plus-dead-time (FOPDT) plant.
//!
//! ```text
//! tau * dy/dt = -y(t) + K * u(t - theta)
//! ```
//!
//! Each [`FopdtPlant::step`] integrates the model exactly over `dt` for the
//! input that emerges from the dead-time line, then adds measurement noise.
//! The measured value is appended to a bounded history used for step
//! response metrics.

use crate::rng::NoiseSource;
use parking_lot::Mutex;
use pitaya_core::config::SimulatorSettings;
use pitaya_core::payload::StepMetrics;
use std::collections::VecDeque;
use std::sync::Arc;

/// Plant shared by every backend simulating the same address.
pub type SharedPlant = Arc<Mutex<FopdtPlant>>;

/// Simulated process with first-order dynamics and transport delay.
#[derive(Debug)]
pub struct FopdtPlant {
    gain: f64,
    time_constant: f64,
    dead_time: f64,
    noise_std: f64,
    noise: NoiseSource,

    time: f64,
    process_variable: f64,
    last_input: f64,
    delayed_input: f64,
    /// `(time applied, input)`, oldest first
    dead_time_buffer: VecDeque<(f64, f64)>,
    /// `(time, measured value)`, oldest first
    history: VecDeque<(f64, f64)>,
    history_len: usize,
}

impl FopdtPlant {
    /// Plant at rest (zero output, zero input).
    pub fn new(settings: &SimulatorSettings) -> Self {
        Self {
            gain: settings.gain,
            time_constant: settings.time_constant.max(f64::MIN_POSITIVE),
            dead_time: settings.dead_time.max(0.0),
            noise_std: settings.noise_std.max(0.0),
            noise: NoiseSource::new(settings.seed),
            time: 0.0,
            process_variable: 0.0,
            last_input: 0.0,
            delayed_input: 0.0,
            dead_time_buffer: VecDeque::new(),
            history: VecDeque::with_capacity(settings.history_len.min(65_536)),
            history_len: settings.history_len.max(1),
        }
    }

    /// Advance by `dt` seconds with `controller_output` applied now.
    ///
    /// Returns the measured (noisy) process variable. Non-positive or
    /// non-finite `dt` leaves the state untouched.
    pub fn step(&mut self, controller_output: f64, dt: f64) -> f64 {
        if !dt.is_finite() || dt <= 0.0 {
            return self.process_variable;
        }
        let input = if controller_output.is_finite() {
            controller_output
        } else {
            self.last_input
        };

        self.time += dt;
        self.last_input = input;
        self.dead_time_buffer.push_back((self.time, input));

        let emerged = self.time - self.dead_time;
        while let Some(&(applied, value)) = self.dead_time_buffer.front() {
            if applied > emerged {
                break;
            }
            self.delayed_input = value;
            self.dead_time_buffer.pop_front();
        }

        let target = self.gain * self.delayed_input;
        let decay = (-dt / self.time_constant).exp();
        self.process_variable = target + (self.process_variable - target) * decay;

        let measured = self.process_variable + self.noise.gaussian(self.noise_std);
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back((self.time, measured));
        measured
    }

    /// Noise-free process variable.
    pub fn process_variable(&self) -> f64 {
        self.process_variable
    }

    /// Measured value: process variable plus a fresh noise sample.
    pub fn measure(&mut self) -> f64 {
        self.process_variable + self.noise.gaussian(self.noise_std)
    }

    /// Input most recently applied.
    pub fn last_input(&self) -> f64 {
        self.last_input
    }

    /// Simulated time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Inputs still travelling through the dead-time line.
    pub fn pending_inputs(&self) -> usize {
        self.dead_time_buffer.len()
    }

    /// Recorded `(time, measured)` history, oldest first.
    pub fn history(&self) -> Vec<(f64, f64)> {
        self.history.iter().copied().collect()
    }

    /// Return to rest and clear the history.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.process_variable = 0.0;
        self.last_input = 0.0;
        self.delayed_input = 0.0;
        self.dead_time_buffer.clear();
        self.history.clear();
    }

    /// Overshoot and settling time of the recorded history against `target`.
    ///
    /// Overshoot is the peak excursion beyond `target` in the direction of
    /// travel, as a fraction of `|target|`. The settling time is measured from
    /// the first recorded sample to the first sample after which the response
    /// stays within `tolerance * |target|`; `None` when it never settles.
    pub fn metrics(&self, target: f64, tolerance: f64) -> StepMetrics {
        let samples = self.history.len();
        let Some(&(start, _)) = self.history.front() else {
            return StepMetrics {
                overshoot: 0.0,
                settling_time: None,
                samples,
            };
        };

        let scale = target.abs();
        let overshoot = if scale > 0.0 {
            let direction = target.signum();
            self.history
                .iter()
                .map(|&(_, v)| direction * (v - target) / scale)
                .fold(0.0_f64, f64::max)
        } else {
            0.0
        };

        let band = tolerance.abs() * if scale > 0.0 { scale } else { 1.0 };
        let last_outside = self
            .history
            .iter()
            .rposition(|&(_, v)| (v - target).abs() > band);
        let settling_time = match last_outside {
            None => Some(0.0),
            Some(i) if i + 1 == samples => None,
            Some(i) => Some(self.history[i + 1].0 - start),
        };

        StepMetrics {
            overshoot,
            settling_time,
            samples,
        }
    }
}
