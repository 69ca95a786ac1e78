//! Wilson score lower bound
//!
//! Ranks a location for a species by the lower end of the confidence
//! interval around `obs / samples`, so that 1 of 1 checklists does not
//! outrank 40 of 50.

/// Default z-value (~95% confidence)
pub const DEFAULT_Z: f64 = 1.96;

/// Precomputed Wilson constants for one z-value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WilsonScorer {
    z: f64,
    z_sq: f64,
    z_sq_half: f64,
    z_sq_quarter: f64,
}

impl Default for WilsonScorer {
    fn default() -> Self {
        Self::new(DEFAULT_Z)
    }
}

impl WilsonScorer {
    pub fn new(z: f64) -> Self {
        let z_sq = z * z;
        Self {
            z,
            z_sq,
            z_sq_half: z_sq / 2.0,
            z_sq_quarter: z_sq / 4.0,
        }
    }

    /// Lower bound for `obs` successes out of `samples`
    ///
    /// `samples == 0` yields 0.0; aggregates never reach this because the
    /// minimum-evidence threshold is at least 1.
    pub fn score(&self, obs: u32, samples: u32) -> f64 {
        if samples == 0 {
            return 0.0;
        }
        let obs = f64::from(obs.min(samples));
        let n = f64::from(samples);

        let spread = (obs * (n - obs) / n + self.z_sq_quarter).sqrt();
        let score = (obs + self.z_sq_half - self.z * spread) / (n + self.z_sq);

        // obs = 0 is exactly 0 analytically; clamp the rounding residue
        score.max(0.0)
    }
}

/// One-off convenience over [`WilsonScorer`]
pub fn wilson_lower_bound(obs: u32, samples: u32, z: f64) -> f64 {
    WilsonScorer::new(z).score(obs, samples)
}
