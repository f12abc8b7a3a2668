//! Run plans and the scheduler that turns them into a target VU count.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::utils::format_duration;

/// Default upper bound for iteration-budget runs.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPlan {
    /// Fixed concurrency for a fixed time.
    Constant { vus: u64, duration: Duration },
    /// Linear ramps between stage targets, starting from `start_vus`.
    Ramping { start_vus: u64, stages: Vec<Stage> },
    /// Every user runs exactly `iterations` iterations, bounded by `max_duration`.
    PerVuIterations {
        vus: u64,
        iterations: u64,
        max_duration: Duration,
    },
}

impl RunPlan {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            RunPlan::Constant { vus, duration } => {
                if *vus == 0 {
                    return Err(ConfigError::NonPositive("vus".into()));
                }
                if duration.is_zero() {
                    return Err(ConfigError::NonPositive("duration".into()));
                }
            }
            RunPlan::Ramping { stages, .. } => {
                if stages.is_empty() {
                    return Err(ConfigError::NoPlan);
                }
                if self.total_duration().is_zero() {
                    return Err(ConfigError::NonPositive("total duration of stages".into()));
                }
            }
            RunPlan::PerVuIterations {
                vus,
                iterations,
                max_duration,
            } => {
                if *vus == 0 {
                    return Err(ConfigError::NonPositive("vus".into()));
                }
                if *iterations == 0 {
                    return Err(ConfigError::NonPositive("iterations".into()));
                }
                if max_duration.is_zero() {
                    return Err(ConfigError::NonPositive("max_duration".into()));
                }
            }
        }
        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        match self {
            RunPlan::Constant { duration, .. } => *duration,
            RunPlan::Ramping { stages, .. } => stages.iter().map(|s| s.duration).sum(),
            RunPlan::PerVuIterations { max_duration, .. } => *max_duration,
        }
    }

    /// Highest concurrency the plan can ask for.
    pub fn max_vus(&self) -> u64 {
        match self {
            RunPlan::Constant { vus, .. } | RunPlan::PerVuIterations { vus, .. } => *vus,
            RunPlan::Ramping { start_vus, stages } => stages
                .iter()
                .map(|s| s.target)
                .max()
                .unwrap_or(0)
                .max(*start_vus),
        }
    }

    pub fn iterations_per_vu(&self) -> Option<u64> {
        match self {
            RunPlan::PerVuIterations { iterations, .. } => Some(*iterations),
            _ => None,
        }
    }
}

impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPlan::Constant { vus, duration } => {
                write!(f, "{} VUs for {}", vus, format_duration(*duration))
            }
            RunPlan::Ramping { start_vus, stages } => {
                write!(f, "ramping from {} VUs:", start_vus)?;
                for stage in stages {
                    write!(f, " {}→{}", format_duration(stage.duration), stage.target)?;
                }
                Ok(())
            }
            RunPlan::PerVuIterations {
                vus,
                iterations,
                max_duration,
            } => write!(
                f,
                "{} VUs x {} iterations (max {})",
                vus,
                iterations,
                format_duration(*max_duration)
            ),
        }
    }
}

/// Pure mapping from elapsed run time to the number of VUs that should be live.
#[derive(Debug, Clone)]
pub struct Scheduler {
    plan: RunPlan,
}

impl Scheduler {
    pub fn new(plan: RunPlan) -> Result<Self, ConfigError> {
        plan.validate()?;
        Ok(Self { plan })
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub fn target_vus(&self, elapsed: Duration) -> u64 {
        match &self.plan {
            RunPlan::Constant { vus, duration } => {
                if elapsed < *duration {
                    *vus
                } else {
                    0
                }
            }
            RunPlan::PerVuIterations {
                vus, max_duration, ..
            } => {
                if elapsed < *max_duration {
                    *vus
                } else {
                    0
                }
            }
            RunPlan::Ramping { start_vus, stages } => ramp_target(*start_vus, stages, elapsed),
        }
    }
}

fn ramp_target(start_vus: u64, stages: &[Stage], elapsed: Duration) -> u64 {
    let mut stage_start = Duration::ZERO;
    let mut from = start_vus as f64;
    for stage in stages {
        let stage_end = stage_start + stage.duration;
        // A zero-length stage never contains `elapsed`, so its level is
        // picked up as the next stage's starting point.
        if elapsed < stage_end {
            let progress =
                (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
            let target = from + (stage.target as f64 - from) * progress;
            return target.round().max(0.0) as u64;
        }
        stage_start = stage_end;
        from = stage.target as f64;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn cached_get_plan() -> Scheduler {
        Scheduler::new(RunPlan::Ramping {
            start_vus: 0,
            stages: vec![
                Stage::new(secs(10), 10),
                Stage::new(secs(20), 50),
                Stage::new(secs(10), 0),
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_constant_plan() {
        let s = Scheduler::new(RunPlan::Constant {
            vus: 25,
            duration: secs(30),
        })
        .unwrap();
        assert_eq!(s.target_vus(Duration::ZERO), 25);
        assert_eq!(s.target_vus(Duration::from_millis(29_999)), 25);
        assert_eq!(s.target_vus(secs(30)), 0);
        assert_eq!(s.plan().total_duration(), secs(30));
    }

    #[test]
    fn test_per_vu_iterations_plan() {
        let plan = RunPlan::PerVuIterations {
            vus: 1,
            iterations: 10,
            max_duration: DEFAULT_MAX_DURATION,
        };
        assert_eq!(plan.iterations_per_vu(), Some(10));
        let s = Scheduler::new(plan).unwrap();
        assert_eq!(s.target_vus(secs(5)), 1);
        assert_eq!(s.target_vus(DEFAULT_MAX_DURATION), 0);
    }

    #[test]
    fn test_ramping_interpolates() {
        let s = cached_get_plan();
        assert_eq!(s.target_vus(Duration::ZERO), 0);
        assert_eq!(s.target_vus(secs(5)), 5);
        assert_eq!(s.target_vus(secs(20)), 30);
        assert_eq!(s.target_vus(secs(35)), 25);
        assert_eq!(s.target_vus(secs(40)), 0);
        assert_eq!(s.plan().max_vus(), 50);
        assert_eq!(s.plan().total_duration(), secs(40));
    }

    #[test]
    fn test_ramping_rounds_to_nearest() {
        let s = Scheduler::new(RunPlan::Ramping {
            start_vus: 0,
            stages: vec![Stage::new(secs(4), 1)],
        })
        .unwrap();
        assert_eq!(s.target_vus(Duration::from_millis(1_999)), 0);
        assert_eq!(s.target_vus(secs(2)), 1);
    }

    #[test]
    fn test_ramping_exact_at_stage_boundaries() {
        let s = cached_get_plan();
        assert_eq!(s.target_vus(secs(10)), 10);
        assert_eq!(s.target_vus(secs(30)), 50);
        // Continuity: one millisecond either side stays next to the boundary value.
        for (boundary, level) in [(10_000u64, 10i64), (30_000, 50)] {
            let before = s.target_vus(Duration::from_millis(boundary - 1)) as i64;
            let after = s.target_vus(Duration::from_millis(boundary + 1)) as i64;
            assert!((before - level).abs() <= 1, "before {} was {}", boundary, before);
            assert!((after - level).abs() <= 1, "after {} was {}", boundary, after);
        }
    }

    #[test]
    fn test_ramping_monotonic_within_stage() {
        let s = cached_get_plan();
        let mut prev = s.target_vus(Duration::ZERO);
        for ms in (0..30_000).step_by(10) {
            let now = s.target_vus(Duration::from_millis(ms));
            assert!(now >= prev, "ramp-up decreased at {}ms", ms);
            prev = now;
        }
        let mut prev = s.target_vus(secs(30));
        for ms in (30_000..40_000).step_by(10) {
            let now = s.target_vus(Duration::from_millis(ms));
            assert!(now <= prev, "ramp-down increased at {}ms", ms);
            prev = now;
        }
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let s = Scheduler::new(RunPlan::Ramping {
            start_vus: 0,
            stages: vec![
                Stage::new(Duration::ZERO, 20),
                Stage::new(secs(10), 20),
                Stage::new(Duration::ZERO, 5),
                Stage::new(secs(10), 5),
            ],
        })
        .unwrap();
        assert_eq!(s.target_vus(Duration::ZERO), 20);
        assert_eq!(s.target_vus(secs(9)), 20);
        assert_eq!(s.target_vus(secs(10)), 5);
        assert_eq!(s.target_vus(secs(19)), 5);
        assert_eq!(s.target_vus(secs(20)), 0);
    }

    #[test]
    fn test_start_vus() {
        let s = Scheduler::new(RunPlan::Ramping {
            start_vus: 10,
            stages: vec![Stage::new(secs(10), 0)],
        })
        .unwrap();
        assert_eq!(s.target_vus(Duration::ZERO), 10);
        assert_eq!(s.target_vus(secs(5)), 5);
    }

    #[test]
    fn test_invalid_plans() {
        assert!(matches!(
            Scheduler::new(RunPlan::Ramping {
                start_vus: 0,
                stages: vec![]
            }),
            Err(ConfigError::NoPlan)
        ));
        assert!(Scheduler::new(RunPlan::Ramping {
            start_vus: 0,
            stages: vec![Stage::new(Duration::ZERO, 5)]
        })
        .is_err());
        assert!(Scheduler::new(RunPlan::Constant {
            vus: 0,
            duration: secs(1)
        })
        .is_err());
        assert!(Scheduler::new(RunPlan::Constant {
            vus: 1,
            duration: Duration::ZERO
        })
        .is_err());
        assert!(Scheduler::new(RunPlan::PerVuIterations {
            vus: 1,
            iterations: 0,
            max_duration: secs(1)
        })
        .is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RunPlan::Constant {
                vus: 25,
                duration: secs(30)
            }
            .to_string(),
            "25 VUs for 30s"
        );
        assert_eq!(
            cached_get_plan().plan().to_string(),
            "ramping from 0 VUs: 10s→10 20s→50 10s→0"
        );
    }
}
