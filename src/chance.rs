//! Randomness for the default choice/choose callbacks, grounded on the same
//! predictable-vs-uniform split the teacher's dice/rng module uses.
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

/// Selects between reproducible and true randomness, mirroring `ZRand`'s
/// `RandMode` split so tests can pin a seed via [`crate::vm::VmOptions`].
pub enum RandMode {
    Predictable(u64),
    RandomUniform,
}

pub struct Rand {
    rng: Box<dyn RngCore>,
}

impl Rand {
    pub fn new(mode: RandMode) -> Rand {
        match mode {
            RandMode::RandomUniform => Rand {
                rng: Box::new(rand::thread_rng()),
            },
            RandMode::Predictable(seed) => Rand {
                rng: Box::new(StdRng::seed_from_u64(seed)),
            },
        }
    }

    /// Uniform float in `[0, 1)`.
    pub fn uniform_01(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }

    /// Uniform float in `[low, high)`.
    pub fn uniform_range(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..high)
    }
}

/// Default `choice_add`/`choice_add_truthy` gate: always true at `c == 1`,
/// otherwise a uniform draw under `c`.
pub fn default_chance_callback(rand: &mut Rand, chance: f64) -> bool {
    if chance == 1.0 {
        true
    } else {
        rand.uniform_01() < chance
    }
}

/// Default `choose_select` weighted pick: textbook prefix-sum sampling.
pub fn default_weighted_chance_callback(rand: &mut Rand, weights: &[f64]) -> i64 {
    if weights.is_empty() {
        return -1;
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0;
    }
    let r = rand.uniform_range(0.0, total);
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if r < cumulative {
            return i as i64;
        }
    }
    (weights.len() - 1) as i64
}
