//! Next-token selection: top-k, then nucleus (top-p), then temperature.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::engine::Token;

pub const DEFAULT_TOP_K: usize = 40;
pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Sampling parameters for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Seed for the draw sequence. `None` draws from OS entropy and is the only
    /// non-reproducible setting.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Candidate pool size (0 = no limit)
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Nucleus mass, in (0, 1]
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Sharpening factor; 0.0 selects the most likely token
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_top_p() -> f32 {
    DEFAULT_TOP_P
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            seed: None,
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
        }
    }
}

impl SamplingConfig {
    /// Default policy with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Default::default()
        }
    }

    /// Always pick the most likely token.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    token: Token,
    logit: f32,
}

/// Stateful sampler; one per request so a seed reproduces the whole request.
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
    candidates: Vec<Candidate>,
    weights: Vec<f32>,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            candidates: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Draw the next token from `logits`.
    ///
    /// NaN entries are ignored. Returns `None` when nothing is drawable: the
    /// slice is empty, or every entry is NaN or negative infinity.
    pub fn sample(&mut self, logits: &[f32]) -> Option<Token> {
        self.candidates.clear();
        self.candidates.extend(logits.iter().enumerate().filter_map(|(id, &logit)| {
            if logit.is_nan() {
                return None;
            }
            let id = i32::try_from(id).ok()?;
            Some(Candidate {
                token: Token(id),
                logit,
            })
        }));

        // Stable sort keeps lower ids first among ties.
        self.candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));

        let best = *self.candidates.first()?;
        if best.logit == f32::NEG_INFINITY {
            return None;
        }
        if self.config.is_greedy() || best.logit == f32::INFINITY {
            return Some(best.token);
        }

        if self.config.top_k > 0 {
            self.candidates.truncate(self.config.top_k);
        }

        self.apply_top_p(best.logit);

        let temperature = self.config.temperature;
        self.weights.clear();
        self.weights.extend(
            self.candidates
                .iter()
                .map(|c| ((c.logit - best.logit) / temperature).exp()),
        );

        match WeightedIndex::new(&self.weights) {
            Ok(dist) => Some(self.candidates[dist.sample(&mut self.rng)].token),
            // Underflow to all-zero weights; the top candidate is the only sane pick.
            Err(_) => Some(best.token),
        }
    }

    /// Keep the smallest prefix whose probability mass reaches `top_p`.
    fn apply_top_p(&mut self, max_logit: f32) {
        if self.config.top_p >= 1.0 {
            return;
        }
        self.weights.clear();
        self.weights
            .extend(self.candidates.iter().map(|c| (c.logit - max_logit).exp()));
        let total: f32 = self.weights.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return;
        }

        let mut cumulative = 0.0;
        let mut keep = self.candidates.len();
        for (i, w) in self.weights.iter().enumerate() {
            cumulative += w / total;
            if cumulative >= self.config.top_p {
                keep = i + 1;
                break;
            }
        }
        self.candidates.truncate(keep.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw(config: SamplingConfig, logits: &[f32], n: usize) -> Vec<Token> {
        let mut sampler = Sampler::new(config);
        (0..n).map(|_| sampler.sample(logits).unwrap()).collect()
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let logits = [0.1, 2.5, -1.0, 2.4];
        let picks = draw(SamplingConfig::greedy(), &logits, 5);
        assert!(picks.iter().all(|&t| t == Token(1)));
    }

    #[test]
    fn test_top_k_one_is_deterministic() {
        let config = SamplingConfig {
            top_k: 1,
            ..SamplingConfig::default()
        };
        let logits = [0.5, 0.4, 0.3, 0.2];
        assert!(draw(config, &logits, 20).iter().all(|&t| t == Token(0)));
    }

    #[test]
    fn test_same_seed_same_draws() {
        let logits: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        let a = draw(SamplingConfig::seeded(42), &logits, 50);
        let b = draw(SamplingConfig::seeded(42), &logits, 50);
        assert_eq!(a, b);
    }

    #[test]
    fn test_top_k_limits_pool() {
        let config = SamplingConfig {
            top_k: 2,
            top_p: 1.0,
            ..SamplingConfig::seeded(3)
        };
        let logits = [1.0, 1.0, 0.9, 0.9, 0.9];
        let picks = draw(config, &logits, 200);
        assert!(picks.iter().all(|t| t.0 < 2));
        assert!(picks.contains(&Token(0)));
        assert!(picks.contains(&Token(1)));
    }

    #[test]
    fn test_small_nucleus_keeps_only_best() {
        let config = SamplingConfig {
            top_p: 0.01,
            ..SamplingConfig::seeded(9)
        };
        let logits = [0.0, 3.0, 1.0];
        assert!(draw(config, &logits, 30).iter().all(|&t| t == Token(1)));
    }

    #[test]
    fn test_nan_logits_are_ignored() {
        let logits = [f32::NAN, 1.0, f32::NAN];
        assert!(draw(SamplingConfig::seeded(1), &logits, 10)
            .iter()
            .all(|&t| t == Token(1)));
    }

    #[test]
    fn test_nothing_drawable() {
        let mut sampler = Sampler::new(SamplingConfig::seeded(1));
        assert_eq!(sampler.sample(&[]), None);
        assert_eq!(sampler.sample(&[f32::NAN, f32::NEG_INFINITY]), None);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let bad_p = SamplingConfig {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad_p.validate().is_err());
        let bad_p = SamplingConfig {
            top_p: 1.5,
            ..Default::default()
        };
        assert!(bad_p.validate().is_err());
        let bad_t = SamplingConfig {
            temperature: -0.5,
            ..Default::default()
        };
        assert!(bad_t.validate().is_err());
        assert!(SamplingConfig::default().validate().is_ok());
    }
}
