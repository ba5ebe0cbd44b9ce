//! Built-in decision policies.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::config::PolicyConfig;
use crate::domain::{ExecutionError, Job};
use crate::ports::DecisionPolicy;

/// Succeeds with the first input value while it is `<= threshold`.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    threshold: f64,
}

impl ThresholdPolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl DecisionPolicy for ThresholdPolicy {
    fn decide(&self, job: &Job) -> Result<Value, ExecutionError> {
        let first = job
            .input
            .first()
            .ok_or_else(|| ExecutionError::new("job has no input"))?;
        let number = first
            .as_f64()
            .ok_or_else(|| ExecutionError::new(format!("first input {first} is not a number")))?;

        if number <= self.threshold {
            Ok(first.clone())
        } else {
            Err(ExecutionError::new(format!(
                "input {first} exceeds threshold {}",
                self.threshold
            )))
        }
    }
}

/// Random value in 1..=10; fails with probability `1 - success_rate`.
pub struct RandomPolicy {
    success_rate: f64,
    rng: Mutex<StdRng>,
}

impl RandomPolicy {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn seeded(success_rate: f64, seed: u64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl DecisionPolicy for RandomPolicy {
    fn decide(&self, _job: &Job) -> Result<Value, ExecutionError> {
        let mut rng = self.rng.lock();
        let value: u32 = rng.gen_range(1..=10);
        if rng.gen_bool(self.success_rate) {
            Ok(Value::from(value))
        } else {
            Err(ExecutionError::new(format!("random decision failed with {value}")))
        }
    }
}

/// Build the configured policy.
pub fn from_config(config: &PolicyConfig) -> Box<dyn DecisionPolicy> {
    match config {
        PolicyConfig::Threshold { threshold } => Box::new(ThresholdPolicy::new(*threshold)),
        PolicyConfig::Random { success_rate } => Box::new(RandomPolicy::new(*success_rate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, TaskId};
    use rstest::rstest;
    use serde_json::json;

    fn job_with(input: Vec<Value>) -> Job {
        Job::new(JobId::new("j"), TaskId::new("t"), input)
    }

    #[rstest]
    #[case::below(json!(3), true)]
    #[case::equal(json!(10), true)]
    #[case::float_below(json!(9.5), true)]
    #[case::above(json!(11), false)]
    fn threshold_policy_compares_first_input(#[case] first: Value, #[case] succeeds: bool) {
        let policy = ThresholdPolicy::new(10.0);
        let result = policy.decide(&job_with(vec![first.clone(), json!(100)]));
        assert_eq!(result.is_ok(), succeeds);
        if succeeds {
            assert_eq!(result.unwrap(), first);
        }
    }

    #[test]
    fn threshold_policy_reports_why_it_failed() {
        let policy = ThresholdPolicy::new(10.0);

        let err = policy.decide(&job_with(vec![json!(11)])).unwrap_err();
        assert!(err.message().contains("exceeds threshold"));

        let err = policy.decide(&job_with(vec![])).unwrap_err();
        assert_eq!(err.message(), "job has no input");

        let err = policy.decide(&job_with(vec![json!("x")])).unwrap_err();
        assert!(err.message().contains("not a number"));
    }

    #[test]
    fn random_policy_respects_success_rate_extremes() {
        let always = RandomPolicy::seeded(1.0, 7);
        let never = RandomPolicy::seeded(0.0, 7);
        for _ in 0..20 {
            let v = always.decide(&job_with(vec![])).unwrap();
            let n = v.as_u64().unwrap();
            assert!((1..=10).contains(&n));
            assert!(never.decide(&job_with(vec![])).is_err());
        }
    }
}
