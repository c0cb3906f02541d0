//! Setpoint sweeps and derived quantities.
//!
//! Every measurement in this crate walks a precomputed list of setpoints:
//!
//! - a gate sweep ([`GateSweep`]) approaches one extremum, holds it for a dwell
//!   period, then returns to the opposite bound;
//! - a field loop ([`hysteresis_loop`]) ramps the coil current `0 → +B → -B → +B`.
//!
//! Ranges are half-open with `ceil((stop - start) / step)` points
//! so that setpoint counts match what operators already expect from the bench.
//!
//! ```
//! use transport_daq::sweep::{GateSweep, Leg};
//!
//! let sweep = GateSweep::new(-100.0, 100.0, 50.0, 2.0).unwrap();
//! let approach: Vec<f64> = sweep.leg(Leg::Approach).to_vec();
//! assert_eq!(approach.len(), 4); // -0.1, -0.05, 0.0, 0.05 V
//! ```

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Currents at or below this magnitude are treated as an open circuit.
pub const MIN_CURRENT_A: f64 = 1e-10;

/// Fraction of one step ignored when counting points, so exact multiples stay half-open.
const ARANGE_TOLERANCE: f64 = 1e-9;

/// Most samples a single sweep or field loop may take.
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// Longest single wait a procedure accepts (one week).
pub const MAX_WAIT_S: f64 = 7.0 * 24.0 * 3600.0;

/// Duration of a configured wait, rejecting NaN, infinities and waits above [`MAX_WAIT_S`].
///
/// Negative values mean no wait.
pub fn wait_duration(name: &str, seconds: f64) -> AppResult<Duration> {
    if !seconds.is_finite() || seconds > MAX_WAIT_S {
        return Err(DaqError::Configuration(format!(
            "{} must be a finite wait of at most {} s, got {}",
            name, MAX_WAIT_S, seconds
        )));
    }
    Ok(Duration::from_secs_f64(seconds.max(0.0)))
}

/// Reject a range of about `span / step` points that is not finite or
/// exceeds [`MAX_SWEEP_POINTS`].
pub fn check_point_count(name: &str, span: f64, step: f64) -> AppResult<()> {
    let points = (span / step).abs();
    if !span.is_finite() || !step.is_finite() || !points.is_finite() || points > MAX_SWEEP_POINTS as f64 {
        return Err(DaqError::Configuration(format!(
            "{} would take {} points with span {} and step {}; at most {} are allowed",
            name, points, span, step, MAX_SWEEP_POINTS
        )));
    }
    Ok(())
}

/// Half-open range `[start, stop)` in increments of `step`.
///
/// Negative `step` counts down. Returns an empty vector when the range is
/// empty or `step` is zero or not finite. Callers bound the point count with
/// [`check_point_count`] first.
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step == 0.0 || !step.is_finite() || !start.is_finite() || !stop.is_finite() {
        return Vec::new();
    }
    let span = (stop - start) / step;
    let n = (span - ARANGE_TOLERANCE).ceil();
    if n <= 0.0 {
        return Vec::new();
    }
    (0..n as usize).map(|i| start + i as f64 * step).collect()
}

/// Ohmic resistance `voltage / current`, or `NaN` when the current is below
/// [`MIN_CURRENT_A`] in magnitude.
pub fn resistance(voltage: f64, current: f64) -> f64 {
    if current.abs() <= MIN_CURRENT_A {
        f64::NAN
    } else {
        voltage / current
    }
}

/// Coil-current loop `0 → +B → -B → +B` used for Hall hysteresis measurements.
///
/// The final leg includes `+B`; the first two legs exclude their end points.
pub fn hysteresis_loop(bound: f64, step: f64) -> Vec<f64> {
    let mut steps = arange(0.0, bound, step);
    steps.extend(arange(bound, -bound, -step));
    steps.extend(arange(-bound, bound + step, step));
    steps
}

/// Which extremum a gate sweep visits first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepDirection {
    /// `min → max`, dwell at `max`, return to `min`
    Positive,
    /// `max → min`, dwell at `min`, return to `max`
    Negative,
}

impl SweepDirection {
    /// Direction follows the sign of the configured upper bound.
    pub fn from_upper_bound(max: f64) -> Self {
        if max > 0.0 {
            SweepDirection::Positive
        } else {
            SweepDirection::Negative
        }
    }
}

/// Segment of a gate sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Leg {
    /// Ramp toward the extremum
    Approach,
    /// Hold at the extremum, one sample per second
    Dwell,
    /// Ramp back to the opposite bound
    Return,
}

impl Leg {
    /// Lower-case name used in progress reports.
    pub fn label(&self) -> &'static str {
        match self {
            Leg::Approach => "approach",
            Leg::Dwell => "dwell",
            Leg::Return => "return",
        }
    }
}

/// One setpoint of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepStep {
    /// Position in the whole sweep (0-based)
    pub index: usize,
    /// Segment this step belongs to
    pub leg: Leg,
    /// Target output in volts
    pub setpoint: f64,
}

/// Gate-voltage sweep with a dwell at the extremum.
///
/// Bounds and step are given in millivolts (as entered by the operator);
/// setpoints are stored in volts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSweep {
    direction: SweepDirection,
    approach: Vec<f64>,
    ret: Vec<f64>,
    extremum: f64,
    dwell_samples: usize,
}

impl GateSweep {
    /// Build the setpoint arrays for a sweep between `min_mv` and `max_mv`.
    pub fn new(min_mv: f64, max_mv: f64, step_mv: f64, dwell_s: f64) -> AppResult<Self> {
        if !(step_mv > 0.0) {
            return Err(DaqError::Configuration(format!(
                "voltage step must be positive, got {} mV",
                step_mv
            )));
        }
        if !(min_mv < max_mv) {
            return Err(DaqError::Configuration(format!(
                "minimum voltage {} mV must be below maximum {} mV",
                min_mv, max_mv
            )));
        }
        // Approach and return together cover the span twice.
        check_point_count("gate sweep", 2.0 * (max_mv - min_mv), step_mv)?;
        wait_duration("dwell time", dwell_s)?;

        let direction = SweepDirection::from_upper_bound(max_mv);
        let (approach, ret, extremum) = match direction {
            SweepDirection::Positive => (
                arange(min_mv, max_mv, step_mv),
                arange(max_mv, min_mv - step_mv, -step_mv),
                max_mv,
            ),
            SweepDirection::Negative => (
                arange(max_mv, min_mv, -step_mv),
                arange(min_mv, max_mv + step_mv, step_mv),
                min_mv,
            ),
        };

        Ok(Self {
            direction,
            approach: approach.into_iter().map(|v| v * 1e-3).collect(),
            ret: ret.into_iter().map(|v| v * 1e-3).collect(),
            extremum: extremum * 1e-3,
            dwell_samples: dwell_samples(dwell_s),
        })
    }

    /// Direction chosen from the sign of the upper bound.
    pub fn direction(&self) -> SweepDirection {
        self.direction
    }

    /// Extremum held during the dwell, in volts.
    pub fn extremum(&self) -> f64 {
        self.extremum
    }

    /// Number of one-second samples taken while dwelling.
    pub fn dwell_samples(&self) -> usize {
        self.dwell_samples
    }

    /// Setpoints of a ramp leg. The dwell leg is a single repeated value and returns empty.
    pub fn leg(&self, leg: Leg) -> &[f64] {
        match leg {
            Leg::Approach => &self.approach,
            Leg::Dwell => &[],
            Leg::Return => &self.ret,
        }
    }

    /// Total number of samples (approach + dwell + return).
    pub fn len(&self) -> usize {
        self.approach.len() + self.dwell_samples + self.ret.len()
    }

    /// True when the sweep would take no samples at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = SweepStep> + '_ {
        let approach = self.approach.iter().map(|&v| (Leg::Approach, v));
        let dwell = std::iter::repeat((Leg::Dwell, self.extremum)).take(self.dwell_samples);
        let ret = self.ret.iter().map(|&v| (Leg::Return, v));
        approach
            .chain(dwell)
            .chain(ret)
            .enumerate()
            .map(|(index, (leg, setpoint))| SweepStep {
                index,
                leg,
                setpoint,
            })
    }
}

/// `temp = dwell; while temp > -1 { ...; temp -= 1 }` takes `floor(dwell) + 1` samples.
fn dwell_samples(dwell_s: f64) -> usize {
    if dwell_s < 0.0 || !dwell_s.is_finite() {
        0
    } else {
        dwell_s.floor() as usize + 1
    }
}

/// Percentage progress over a fixed number of samples.
///
/// The reported value never decreases and is clamped to `[0, 100]`.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: usize,
    done: usize,
}

impl ProgressTracker {
    /// Tracker for `total` samples.
    pub fn new(total: usize) -> Self {
        Self { total, done: 0 }
    }

    /// Record one completed sample and return the new percentage.
    pub fn advance(&mut self) -> f64 {
        self.done = (self.done + 1).min(self.total);
        self.percent()
    }

    /// Current percentage.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (100.0 * self.done as f64 / self.total as f64).clamp(0.0, 100.0)
    }

    /// Samples completed so far.
    pub fn completed(&self) -> usize {
        self.done
    }

    /// Samples expected in total.
    pub fn total(&self) -> usize {
        self.total
    }
}

/// Expected run time of a procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    /// Expected wall-clock duration
    pub duration: Duration,
    /// Local time the run should finish if started now
    pub finished_at: DateTime<Local>,
}

impl Estimate {
    /// Estimate from a duration in seconds, starting now.
    ///
    /// Negative durations count as zero; NaN and durations past the calendar
    /// range are configuration errors.
    pub fn from_secs_f64(seconds: f64) -> AppResult<Self> {
        let out_of_range = || {
            DaqError::Configuration(format!("estimated run time of {} s is out of range", seconds))
        };
        let duration = Duration::try_from_secs_f64(if seconds < 0.0 { 0.0 } else { seconds })
            .map_err(|_| out_of_range())?;
        let finished_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Local::now().checked_add_signed(d))
            .ok_or_else(out_of_range)?;
        Ok(Self {
            duration,
            finished_at,
        })
    }

    /// Sum of two estimates, both starting now.
    pub fn then(&self, other: &Estimate) -> AppResult<Estimate> {
        Estimate::from_secs_f64(self.duration.as_secs_f64() + other.duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-12, "{} != {}", a, b);
    }

    #[test]
    fn arange_is_half_open() {
        let v = arange(0.0, 1.0, 0.25);
        assert_eq!(v.len(), 4);
        assert_close(v[3], 0.75);
    }

    #[test]
    fn arange_counts_down() {
        let v = arange(2.0, -2.0, -1.0);
        assert_eq!(v, vec![2.0, 1.0, 0.0, -1.0]);
    }

    #[test]
    fn arange_exact_multiple_with_float_step() {
        // 4.0 / 0.1 is 40.000000000000004 in floating point
        assert_eq!(arange(0.0, 4.0, 0.1).len(), 40);
        assert_eq!(arange(-2000.0, 2000.0, 20.0).len(), 200);
    }

    #[test]
    fn arange_empty_cases() {
        assert!(arange(1.0, 0.0, 0.1).is_empty());
        assert!(arange(0.0, 1.0, 0.0).is_empty());
        assert!(arange(0.0, f64::NAN, 0.1).is_empty());
    }

    #[test]
    fn resistance_guards_tiny_current() {
        assert_close(resistance(2.0, 1e-3), 2000.0);
        assert!(resistance(1.0, 1e-10).is_nan());
        assert!(resistance(1.0, -1e-11).is_nan());
        assert!(resistance(1.0, 0.0).is_nan());
        assert_close(resistance(-1.0, -2e-10), 5e9);
    }

    #[test]
    fn hysteresis_loop_lengths() {
        let steps = hysteresis_loop(4.0, 0.1);
        let expected = arange(0.0, 4.0, 0.1).len()
            + arange(4.0, -4.0, -0.1).len()
            + arange(-4.0, 4.1, 0.1).len();
        assert_eq!(steps.len(), expected);
        assert_eq!(steps.len(), 40 + 80 + 81);
        assert_close(steps[0], 0.0);
        assert!((steps[steps.len() - 1] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn positive_sweep_legs() {
        let sweep = GateSweep::new(-2000.0, 2000.0, 20.0, 30.0).unwrap();
        assert_eq!(sweep.direction(), SweepDirection::Positive);
        assert_eq!(sweep.leg(Leg::Approach).len(), 200);
        assert_eq!(sweep.leg(Leg::Return).len(), 201);
        assert_eq!(sweep.dwell_samples(), 31);
        assert_close(sweep.extremum(), 2.0);
        assert_close(sweep.leg(Leg::Approach)[0], -2.0);
        let ret = sweep.leg(Leg::Return);
        assert_close(ret[0], 2.0);
        assert!((ret[ret.len() - 1] + 2.0).abs() < 1e-9);
        assert_eq!(sweep.len(), 200 + 31 + 201);
    }

    #[test]
    fn negative_sweep_legs() {
        let sweep = GateSweep::new(-1000.0, 0.0, 100.0, 2.0).unwrap();
        assert_eq!(sweep.direction(), SweepDirection::Negative);
        let approach = sweep.leg(Leg::Approach);
        assert_eq!(approach.len(), 10);
        assert_close(approach[0], 0.0);
        assert_close(sweep.extremum(), -1.0);
        let ret = sweep.leg(Leg::Return);
        assert_close(ret[0], -1.0);
        assert!((ret[ret.len() - 1]).abs() < 1e-9);
        assert_eq!(sweep.dwell_samples(), 3);
    }

    #[test]
    fn legs_are_monotonic() {
        for (min, max) in [(-2000.0, 2000.0), (-500.0, -100.0), (0.0, 750.0)] {
            let sweep = GateSweep::new(min, max, 25.0, 0.0).unwrap();
            let approach = sweep.leg(Leg::Approach);
            let ret = sweep.leg(Leg::Return);
            match sweep.direction() {
                SweepDirection::Positive => {
                    assert!(approach.windows(2).all(|w| w[1] > w[0]));
                    assert!(ret.windows(2).all(|w| w[1] < w[0]));
                }
                SweepDirection::Negative => {
                    assert!(approach.windows(2).all(|w| w[1] < w[0]));
                    assert!(ret.windows(2).all(|w| w[1] > w[0]));
                }
            }
        }
    }

    #[test]
    fn fractional_dwell_rounds_down_plus_one() {
        let sweep = GateSweep::new(0.0, 100.0, 50.0, 2.5).unwrap();
        assert_eq!(sweep.dwell_samples(), 3);
        let sweep = GateSweep::new(0.0, 100.0, 50.0, 0.0).unwrap();
        assert_eq!(sweep.dwell_samples(), 1);
    }

    #[test]
    fn steps_follow_leg_order() {
        let sweep = GateSweep::new(0.0, 100.0, 50.0, 1.0).unwrap();
        let legs: Vec<Leg> = sweep.steps().map(|s| s.leg).collect();
        assert_eq!(
            legs,
            vec![
                Leg::Approach,
                Leg::Approach,
                Leg::Dwell,
                Leg::Dwell,
                Leg::Return,
                Leg::Return,
                Leg::Return,
            ]
        );
        let indices: Vec<usize> = sweep.steps().map(|s| s.index).collect();
        assert_eq!(indices, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(GateSweep::new(0.0, 100.0, 0.0, 1.0).is_err());
        assert!(GateSweep::new(100.0, 100.0, 10.0, 1.0).is_err());
        assert!(GateSweep::new(0.0, 100.0, f64::NAN, 1.0).is_err());
        assert!(GateSweep::new(f64::NEG_INFINITY, 100.0, 10.0, 1.0).is_err());
        assert!(GateSweep::new(-2000.0, 2000.0, 1e-300, 1.0).is_err());
        assert!(GateSweep::new(-2000.0, 2000.0, 20.0, f64::INFINITY).is_err());
    }

    #[test]
    fn estimate_out_of_range_is_an_error() {
        for secs in [4e300, f64::INFINITY, f64::NAN] {
            match Estimate::from_secs_f64(secs) {
                Err(DaqError::Configuration(msg)) => assert!(msg.contains("out of range")),
                other => panic!("{} s gave {:?}", secs, other),
            }
        }
        assert_eq!(
            Estimate::from_secs_f64(-3.0).unwrap().duration,
            Duration::ZERO
        );
    }

    #[test]
    fn point_count_is_bounded() {
        assert!(check_point_count("loop", 20.0, 0.1).is_ok());
        assert!(check_point_count("loop", 20.0, 1e-300).is_err());
        assert!(check_point_count("loop", f64::INFINITY, 0.1).is_err());
        assert!(check_point_count("loop", 20.0, 0.0).is_err());
    }

    #[test]
    fn waits_must_be_finite_and_bounded() {
        assert_eq!(wait_duration("delay", 0.5).unwrap(), Duration::from_millis(500));
        assert_eq!(wait_duration("delay", -1.0).unwrap(), Duration::ZERO);
        assert!(wait_duration("delay", f64::NAN).is_err());
        assert!(wait_duration("delay", f64::INFINITY).is_err());
        assert!(wait_duration("delay", MAX_WAIT_S * 2.0).is_err());
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_100() {
        let mut tracker = ProgressTracker::new(3);
        let mut last = tracker.percent();
        for _ in 0..5 {
            let p = tracker.advance();
            assert!(p >= last);
            last = p;
        }
        assert_close(last, 100.0);
        assert_eq!(tracker.completed(), 3);
        assert_close(ProgressTracker::new(0).percent(), 100.0);
    }

    #[test]
    fn estimate_adds_up() {
        let a = Estimate::from_secs_f64(10.0).unwrap();
        let b = Estimate::from_secs_f64(2.5).unwrap();
        assert_eq!(a.then(&b).unwrap().duration, Duration::from_secs_f64(12.5));
        assert!(a.finished_at >= Local::now() - chrono::Duration::seconds(1));
    }
}
