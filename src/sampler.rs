use rand::Rng;
use rand_mt::Mt64;

/// Default number of retained latency samples per sampler.  Average and
/// standard deviation use exact whole-population accumulators, so only tail
/// percentiles are subject to reservoir error.
pub const RESERVOIR_CAPACITY: usize = 100_000;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OpKind {
    Get,
    Set,
    OpQ,
}

/// One completed operation.  Times are seconds relative to process boot.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Operation {
    pub start_time: f64,
    pub end_time: f64,
    pub kind: OpKind,
}

impl Operation {
    pub fn time(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Bounded-memory reservoir over operation latencies.  Mergeable; keeps the
/// retained samples in capture order for `--save`.
#[derive(Clone)]
pub struct Sampler {
    samples: Vec<Operation>,
    capacity: usize,
    total: u64,
    sum: f64,
    sum_sq: f64,
    rng: Mt64,
}

impl Sampler {
    pub fn new() -> Sampler {
        Sampler::with_capacity(RESERVOIR_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Sampler {
        assert!(capacity > 0);
        Sampler {
            samples: Vec::new(),
            capacity,
            total: 0,
            sum: 0.0,
            sum_sq: 0.0,
            rng: Mt64::new(rand::thread_rng().gen::<u64>()),
        }
    }

    pub fn sample(&mut self, op: Operation) {
        debug_assert!(op.end_time >= op.start_time);
        self.total += 1;
        let t = op.time();
        self.sum += t;
        self.sum_sq += t * t;

        if self.samples.len() < self.capacity {
            self.samples.push(op);
        } else {
            let j = self.rng.gen_range(0..self.total) as usize;
            if j < self.capacity {
                self.samples[j] = op;
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Mean latency in seconds over the whole population.
    pub fn get_avg(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.sum / self.total as f64
    }

    /// Population standard deviation in seconds.
    pub fn get_stddev(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let n = self.total as f64;
        let var = (self.sum_sq / n) - (self.sum / n) * (self.sum / n);
        var.max(0.0).sqrt()
    }

    /// p-th percentile in seconds over the retained samples.  `get_nth(0.0)`
    /// is the minimum retained sample, `get_nth(100.0)` the maximum.
    pub fn get_nth(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut v: Vec<f64> = self.samples.iter().map(|op| op.time()).collect();
        v.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = ((p / 100.0) * (v.len() as f64 - 1.0)).round() as usize;
        v[rank.min(v.len() - 1)]
    }

    /// Retained samples in capture order.
    pub fn samples(&self) -> &[Operation] {
        &self.samples
    }

    pub fn merge(&mut self, other: &Sampler) {
        self.total += other.total;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.samples.extend_from_slice(&other.samples);

        if self.samples.len() > self.capacity {
            // Partial Fisher-Yates: after shuffling the first `capacity`
            // positions against the whole vector, truncation keeps a
            // uniform subset.
            for i in 0..self.capacity {
                let j = self.rng.gen_range(i..self.samples.len());
                self.samples.swap(i, j);
            }
            self.samples.truncate(self.capacity);
        }
    }
}

impl Default for Sampler {
    fn default() -> Sampler {
        Sampler::new()
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("total", &self.total)
            .field("retained", &self.samples.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
