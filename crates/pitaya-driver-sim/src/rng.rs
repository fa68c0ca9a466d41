//! Seeded noise source for reproducible simulations.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Gaussian noise generator backed by a seeded ChaCha RNG.
pub struct NoiseSource {
    rng: ChaCha8Rng,
    spare: Option<f64>,
}

impl NoiseSource {
    /// Create a generator with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { rng, spare: None }
    }

    /// Uniform sample in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Standard normal sample (Box-Muller, second value cached).
    pub fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        // 1 - U is in (0, 1], keeping ln() finite
        let u1 = 1.0 - self.uniform();
        let u2 = self.uniform();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = std::f64::consts::TAU * u2;
        self.spare = Some(radius * angle.sin());
        radius * angle.cos()
    }

    /// Zero-mean normal sample with standard deviation `std`.
    pub fn gaussian(&mut self, std: f64) -> f64 {
        if std <= 0.0 {
            return 0.0;
        }
        std * self.standard_normal()
    }
}

impl std::fmt::Debug for NoiseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSource")
            .field("rng", &"<ChaCha8Rng>")
            .finish()
    }
}
