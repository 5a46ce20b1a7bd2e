//! LoadShape (§4.7, GLOSSARY): a stateful callback controlling target
//! concurrency over time. Implements the fixed and stepped profiles.

use std::time::Duration;

use crate::models::LoadConfig;

/// What the controller should do on the next tick (§4.7).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    Continue { target_users: u32, spawn_rate: f64 },
    Stop,
}

/// Drives target concurrency over elapsed wall-clock time. `tick` is called
/// once per second by the Swarm Controller (§4.7).
pub trait LoadShape: Send {
    fn tick(&mut self, elapsed: Duration) -> Tick;
}

/// Fixed profile (§4.7): single tick returns `(users, spawn_rate)` forever
/// until run-time elapses.
pub struct FixedShape {
    users: u32,
    spawn_rate: f64,
    run_time: Duration,
}

impl FixedShape {
    pub fn new(users: u32, spawn_rate: f64, run_time: Duration) -> Self {
        Self {
            users,
            spawn_rate,
            run_time,
        }
    }
}

impl LoadShape for FixedShape {
    fn tick(&mut self, elapsed: Duration) -> Tick {
        if elapsed > self.run_time {
            return Tick::Stop;
        }
        Tick::Continue {
            target_users: self.users,
            spawn_rate: self.spawn_rate,
        }
    }
}

/// Stepped profile (§4.7, GLOSSARY "Stepped profile", S2):
/// target = min(start + floor(t/step_duration)*increment, max) during ramp;
/// target = max during sustain; stop once t > ramp_time + sustain_duration.
pub struct SteppedShape {
    start_users: u32,
    increment: u32,
    step_duration: Duration,
    max_users: u32,
    sustain_duration: Duration,
    spawn_rate: f64,
    ramp_time: Duration,
}

impl SteppedShape {
    pub fn new(
        start_users: u32,
        increment: u32,
        step_duration: Duration,
        max_users: u32,
        sustain_duration: Duration,
        spawn_rate: f64,
    ) -> Self {
        let steps = if increment == 0 {
            0
        } else {
            (max_users.saturating_sub(start_users)) / increment
        };
        let ramp_time = step_duration * (steps + 1);
        Self {
            start_users,
            increment,
            step_duration,
            max_users,
            sustain_duration,
            spawn_rate,
            ramp_time,
        }
    }

    pub fn from_config(
        start_users: u32,
        increment: u32,
        step_duration: u64,
        max_users: u32,
        sustain_duration: u64,
        spawn_rate: f64,
    ) -> Self {
        Self::new(
            start_users,
            increment,
            Duration::from_secs(step_duration),
            max_users,
            Duration::from_secs(sustain_duration),
            spawn_rate,
        )
    }
}

impl LoadShape for SteppedShape {
    fn tick(&mut self, elapsed: Duration) -> Tick {
        if elapsed > self.ramp_time + self.sustain_duration {
            return Tick::Stop;
        }

        let target = if elapsed > self.ramp_time {
            self.max_users
        } else {
            let step_secs = self.step_duration.as_secs_f64().max(0.001);
            let steps_elapsed = (elapsed.as_secs_f64() / step_secs).floor() as u32;
            let grown = self.start_users.saturating_add(steps_elapsed.saturating_mul(self.increment));
            grown.min(self.max_users)
        };

        Tick::Continue {
            target_users: target,
            spawn_rate: self.spawn_rate,
        }
    }
}

/// Builds the concrete [`LoadShape`] for a job's [`LoadConfig`].
pub fn from_load_config(config: &LoadConfig) -> Box<dyn LoadShape> {
    match config {
        LoadConfig::Fixed {
            users,
            spawn_rate,
            duration_seconds,
        } => Box::new(FixedShape::new(
            *users,
            *spawn_rate,
            Duration::from_secs(*duration_seconds),
        )),
        LoadConfig::Stepped {
            start_users,
            increment,
            step_duration,
            max_users,
            sustain_duration,
        } => Box::new(SteppedShape::from_config(
            *start_users,
            *increment,
            *step_duration,
            *max_users,
            *sustain_duration,
            *increment as f64,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S2: start=1, increment=2, step_duration=2s, max=5, sustain=2s.
    /// Expect target sequence at t=0,2,4,6,8: 1,3,5,5,5; stop at t=10 (> 8).
    #[test]
    fn stepped_ramp_scenario_s2() {
        let mut shape = SteppedShape::from_config(1, 2, 2, 5, 2, 1.0);
        let expect = [(0u64, 1u32), (2, 3), (4, 5), (6, 5), (8, 5)];
        for (t, target) in expect {
            match shape.tick(Duration::from_secs(t)) {
                Tick::Continue { target_users, .. } => assert_eq!(target_users, target, "t={t}"),
                Tick::Stop => panic!("unexpected stop at t={t}"),
            }
        }
        assert_eq!(shape.tick(Duration::from_secs(10)), Tick::Stop);
    }

    #[test]
    fn total_run_time_matches_formula_s2() {
        let config = LoadConfig::Stepped {
            start_users: 1,
            increment: 2,
            step_duration: 2,
            max_users: 5,
            sustain_duration: 2,
        };
        assert_eq!(config.total_run_time_secs(), 8);
    }

    #[test]
    fn fixed_shape_continues_until_run_time_elapsed() {
        let mut shape = FixedShape::new(10, 5.0, Duration::from_secs(5));
        assert_eq!(
            shape.tick(Duration::from_secs(4)),
            Tick::Continue { target_users: 10, spawn_rate: 5.0 }
        );
        assert_eq!(shape.tick(Duration::from_secs(6)), Tick::Stop);
    }

    #[test]
    fn stepped_target_matches_min_formula_for_arbitrary_config() {
        // For all stepped configs, target at time t during ramp == min(s + floor(t/step_d)*inc, max).
        let (s, inc, step_d, max) = (3u32, 4u32, 3u64, 20u32);
        let mut shape = SteppedShape::from_config(s, inc, step_d, max, 5, 1.0);
        for t in [0u64, 1, 3, 6, 9, 12] {
            let expected = (s + ((t / step_d) as u32) * inc).min(max);
            match shape.tick(Duration::from_secs(t)) {
                Tick::Continue { target_users, .. } => assert_eq!(target_users, expected, "t={t}"),
                Tick::Stop => panic!("unexpected stop at t={t}"),
            }
        }
    }
}
