//! Stage scheduler: maps elapsed run time to a target virtual user count.
//!
//! A [`Schedule`] is built from an ordered list of [`Stage`]s. Inside a stage
//! the target moves linearly from the previous stage's target (or the start
//! target for the first stage) to the stage's own target. Once the summed
//! duration has elapsed the schedule clamps to the last target and reports
//! completion.
//!
//! A zero-duration stage occupies no time at all, so its target takes effect
//! as a step at the stage boundary.

use std::time::Duration;

use crate::loadtest::error::LoadTestError;

/// A load-shaping stage: reach `target` virtual users over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// Time taken to move from the previous target to this one.
    pub duration: Duration,
    /// Virtual user count at the end of the stage.
    pub target: u32,
}

impl Stage {
    /// Creates a stage from a duration and a target count.
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Scheduler output for one instant of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTick {
    /// Rounded target concurrency for pool sizing.
    pub target: u32,
    /// Zero-based index of the active stage (the last stage once finished).
    pub stage_index: usize,
    /// `true` once the total schedule duration has elapsed.
    pub finished: bool,
}

/// Piecewise-linear concurrency schedule derived from a stage list.
///
/// Immutable once built; safe to share between the engine and display tasks.
#[derive(Debug, Clone)]
pub struct Schedule {
    start_target: u32,
    stages: Vec<Stage>,
    /// Cumulative end time of each stage.
    ends: Vec<Duration>,
}

impl Schedule {
    /// Builds a schedule that ramps up from zero virtual users.
    ///
    /// Returns [`LoadTestError::ConfigValidation`] if `stages` is empty or the
    /// summed duration is zero.
    pub fn new(stages: Vec<Stage>) -> Result<Self, LoadTestError> {
        Self::with_start_target(stages, 0)
    }

    /// Builds a schedule whose first stage ramps from `start_target`.
    pub fn with_start_target(stages: Vec<Stage>, start_target: u32) -> Result<Self, LoadTestError> {
        if stages.is_empty() {
            return Err(LoadTestError::validation(
                "Schedule requires at least one [[stage]]",
            ));
        }

        let mut ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for stage in &stages {
            acc += stage.duration;
            ends.push(acc);
        }

        if acc.is_zero() {
            return Err(LoadTestError::validation(
                "Total stage duration must be greater than zero",
            ));
        }

        Ok(Self {
            start_target,
            stages,
            ends,
        })
    }

    /// The stages this schedule was built from, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Target count at `t = 0` before any stage has progressed.
    pub fn start_target(&self) -> u32 {
        self.start_target
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.ends.last().copied().unwrap_or(Duration::ZERO)
    }

    /// Highest target reached anywhere in the schedule.
    pub fn max_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, u32::max)
    }

    /// Un-rounded target at `elapsed`, used for smoothing and tests.
    pub fn exact_target_at(&self, elapsed: Duration) -> f64 {
        let Some(idx) = self.stage_index_at(elapsed) else {
            return f64::from(self.last_target());
        };

        let stage = &self.stages[idx];
        let from = f64::from(self.stage_start_target(idx));
        let to = f64::from(stage.target);
        let stage_start = self.ends[idx] - stage.duration;
        // stage_index_at never returns a zero-duration stage
        let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
        from + (to - from) * progress
    }

    /// Rounded target count at `elapsed`.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        self.exact_target_at(elapsed).round().max(0.0) as u32
    }

    /// Full scheduler output for `elapsed`: rounded target, stage, completion.
    pub fn tick(&self, elapsed: Duration) -> ScheduleTick {
        match self.stage_index_at(elapsed) {
            Some(stage_index) => ScheduleTick {
                target: self.target_at(elapsed),
                stage_index,
                finished: false,
            },
            None => ScheduleTick {
                target: self.last_target(),
                stage_index: self.stages.len() - 1,
                finished: true,
            },
        }
    }

    /// Index of the stage whose `[start, end)` interval contains `elapsed`,
    /// or `None` once the schedule has finished.
    fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let idx = self.ends.partition_point(|end| *end <= elapsed);
        (idx < self.stages.len()).then_some(idx)
    }

    fn stage_start_target(&self, idx: usize) -> u32 {
        if idx == 0 {
            self.start_target
        } else {
            self.stages[idx - 1].target
        }
    }

    fn last_target(&self) -> u32 {
        self.stages.last().map_or(self.start_target, |s| s.target)
    }
}
