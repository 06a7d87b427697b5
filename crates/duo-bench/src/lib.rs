//! Duo Bench - Workload generation for merger benchmarks

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One step of a merger workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    External(Option<u32>),
    Internal(u32),
    Flush,
}

/// Workload configuration
#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub steps: usize,
    /// Number of distinct values written to either cell
    pub value_range: u32,
    /// Probability that an external write clears the cell
    pub clear_prob: f64,
    /// Probability of a flush after any step
    pub flush_prob: f64,
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            steps: 1000,
            value_range: 16,
            clear_prob: 0.1,
            flush_prob: 0.25,
            seed: 42,
        }
    }
}

pub fn generate(config: &WorkloadConfig) -> Vec<Step> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut steps = Vec::with_capacity(config.steps);

    for _ in 0..config.steps {
        let value = rng.gen_range(0..config.value_range.max(1));
        let step = if rng.gen_bool(0.7) {
            if rng.gen_bool(config.clear_prob) {
                Step::External(None)
            } else {
                Step::External(Some(value))
            }
        } else {
            Step::Internal(value)
        };
        steps.push(step);

        if rng.gen_bool(config.flush_prob) {
            steps.push(Step::Flush);
        }
    }

    steps
}
