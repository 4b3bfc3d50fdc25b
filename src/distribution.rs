use rand::Rng;
use rand_distr::{Distribution as DistR, Exp, Normal, Uniform};

/// Inter-arrival time distribution, normalized to unit mean.  The caller
/// scales each sample by `1 / lambda` to reach the configured rate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Distribution {
    Exponential,
    Uniform,
    Fixed,
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match *self {
            Distribution::Exponential => "exponential",
            Distribution::Uniform => "uniform",
            Distribution::Fixed => "fixed",
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match *self {
            Distribution::Exponential => Exp::new(1.0).unwrap().sample(rng),
            // [0, 2) has unit mean.
            Distribution::Uniform => Uniform::new(0.0, 2.0).sample(rng),
            Distribution::Fixed => 1.0,
        }
    }

    pub fn create(spec: &str) -> Result<Self, &'static str> {
        match spec {
            "exp" | "exponential" => Ok(Distribution::Exponential),
            "uniform" => Ok(Distribution::Uniform),
            "fixed" => Ok(Distribution::Fixed),
            _ => Err("bad inter-arrival distribution"),
        }
    }
}

/// Key/value size generator.  Sizes are derived deterministically from the
/// key index so that every process in a fleet agrees on the record layout.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SizeGenerator {
    Fixed(usize),
    Uniform(usize, usize),
    Normal(f64, f64),
}

impl SizeGenerator {
    pub fn create(spec: &str) -> Result<Self, &'static str> {
        if let Ok(n) = spec.parse::<usize>() {
            return Ok(SizeGenerator::Fixed(n.max(1)));
        }

        let tokens: Vec<&str> = spec.split(':').collect();
        match tokens[0] {
            "fixed" if tokens.len() == 2 => {
                let n: usize = tokens[1].parse().map_err(|_| "bad fixed size")?;
                Ok(SizeGenerator::Fixed(n.max(1)))
            }
            "uniform" if tokens.len() == 3 => {
                let lo: usize = tokens[1].parse().map_err(|_| "bad uniform bound")?;
                let hi: usize = tokens[2].parse().map_err(|_| "bad uniform bound")?;
                if lo == 0 || hi < lo {
                    return Err("uniform bounds must satisfy 1 <= LO <= HI");
                }
                Ok(SizeGenerator::Uniform(lo, hi))
            }
            "normal" if tokens.len() == 3 => {
                let mean: f64 = tokens[1].parse().map_err(|_| "bad normal mean")?;
                let sd: f64 = tokens[2].parse().map_err(|_| "bad normal stddev")?;
                if mean <= 0.0 || sd < 0.0 {
                    return Err("normal parameters must be positive");
                }
                Ok(SizeGenerator::Normal(mean, sd))
            }
            _ => Err("bad size generator spec"),
        }
    }

    /// Size for a given key index.  Randomized generators hash the index
    /// into a private RNG so repeated calls agree.
    pub fn generate(&self, index: u64) -> usize {
        match *self {
            SizeGenerator::Fixed(n) => n,
            SizeGenerator::Uniform(lo, hi) => {
                let mut rng = index_rng(index);
                rng.gen_range(lo..=hi)
            }
            SizeGenerator::Normal(mean, sd) => {
                let mut rng = index_rng(index);
                let v = Normal::new(mean, sd).unwrap().sample(&mut rng);
                v.max(1.0) as usize
            }
        }
    }
}

/// RNG keyed on a record index; everything derived from a key (sizes,
/// payload offsets) draws from this so repeated runs agree.
pub(crate) fn index_rng(index: u64) -> rand_mt::Mt64 {
    // SplitMix-style scramble so neighboring indices decorrelate.
    let mut z = index.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    rand_mt::Mt64::new(z ^ (z >> 31))
}
