//! Neighbourhood expansion for range membership inference.
//!
//! Each audited sample becomes a range of `sample_size` perturbed copies
//! that keep the sample's label. Range `i` occupies rows `i*k .. i*k + k`.

use super::Dataset;
use crate::models::{RangeConfig, RangeFunction, Result, SampleSet, SampleSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Draws neighbours around samples.
#[derive(Debug, Clone)]
pub struct RangeSampler {
    pub function: RangeFunction,
    pub radius: f32,
    pub sample_size: usize,
    pub seed: u64,
}

impl RangeSampler {
    pub fn from_config(config: &RangeConfig, seed: u64) -> Self {
        Self {
            function: config.range_function,
            radius: config.radius,
            sample_size: config.sample_size,
            seed,
        }
    }

    /// Expand `samples` (rows of `data`) into a dataset of ranges.
    pub fn expand(&self, data: &Dataset, samples: &SampleSet) -> Result<(Dataset, SampleSet)> {
        let k = self.sample_size;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut features = Vec::with_capacity(samples.len() * k);
        let mut labels = Vec::with_capacity(samples.len() * k);

        for &index in &samples.indices {
            let center = data.features(index);
            for _ in 0..k {
                features.push(self.perturb(center, &mut rng));
                labels.push(data.label(index));
            }
        }

        let expanded = Dataset::new(features, labels, Some(data.num_classes()))?;
        let set = SampleSet::new(
            SampleSource::Range(self.tag(samples)),
            (0..expanded.len()).collect(),
            false,
        );
        Ok((expanded, set))
    }

    fn perturb(&self, center: &[f32], rng: &mut StdRng) -> Vec<f32> {
        match self.function {
            RangeFunction::Gaussian => center
                .iter()
                .map(|&x| x + self.radius * standard_normal(rng))
                .collect(),
            RangeFunction::UniformBox => center
                .iter()
                .map(|&x| x + rng.random_range(-1.0f32..=1.0) * self.radius)
                .collect(),
        }
    }

    /// Identity of the expanded set: sampler parameters plus the base set.
    fn tag(&self, base: &SampleSet) -> String {
        let mut hasher = Sha256::new();
        hasher.update(base.source.to_string().as_bytes());
        for index in &base.indices {
            hasher.update((*index as u64).to_le_bytes());
        }
        let digest = hasher.finalize();
        format!(
            "{:?}-r{}-k{}-s{}-{}",
            self.function,
            self.radius,
            self.sample_size,
            self.seed,
            hex::encode(&digest[..8])
        )
    }
}

/// Box-Muller draw from N(0, 1).
fn standard_normal(rng: &mut StdRng) -> f32 {
    let u1: f32 = 1.0 - rng.random::<f32>();
    let u2: f32 = rng.random::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> (Dataset, SampleSet) {
        let data = Dataset::new(
            vec![vec![0.0, 0.0], vec![10.0, 10.0], vec![-5.0, 5.0]],
            vec![0, 1, 0],
            None,
        )
        .unwrap();
        let set = SampleSet::new(SampleSource::Universe, vec![2, 0], false);
        (data, set)
    }

    #[test]
    fn test_expand_layout_keeps_labels_and_order() {
        let (data, set) = base();
        let sampler = RangeSampler {
            function: RangeFunction::UniformBox,
            radius: 0.5,
            sample_size: 4,
            seed: 7,
        };

        let (expanded, range_set) = sampler.expand(&data, &set).unwrap();
        assert_eq!(expanded.len(), 8);
        assert_eq!(range_set.indices, (0..8).collect::<Vec<_>>());
        assert!(!range_set.is_population());

        // Rows 0..4 surround sample 2, rows 4..8 surround sample 0.
        for row in 0..4 {
            let f = expanded.features(row);
            assert!((f[0] + 5.0).abs() <= 0.5 && (f[1] - 5.0).abs() <= 0.5);
        }
        for row in 4..8 {
            let f = expanded.features(row);
            assert!(f[0].abs() <= 0.5 && f[1].abs() <= 0.5);
            assert_eq!(expanded.label(row), 0);
        }
    }

    #[test]
    fn test_expand_is_seeded() {
        let (data, set) = base();
        let sampler = RangeSampler {
            function: RangeFunction::Gaussian,
            radius: 0.1,
            sample_size: 3,
            seed: 11,
        };
        let (a, set_a) = sampler.expand(&data, &set).unwrap();
        let (b, set_b) = sampler.expand(&data, &set).unwrap();
        assert_eq!(set_a, set_b);
        for row in 0..a.len() {
            assert_eq!(a.features(row), b.features(row));
        }
    }

    #[test]
    fn test_tag_depends_on_base_set() {
        let (data, set) = base();
        let sampler = RangeSampler {
            function: RangeFunction::Gaussian,
            radius: 0.1,
            sample_size: 2,
            seed: 1,
        };
        let other = SampleSet::new(SampleSource::Universe, vec![0, 2], false);
        let (_, a) = sampler.expand(&data, &set).unwrap();
        let (_, b) = sampler.expand(&data, &other).unwrap();
        assert_ne!(a.source, b.source);
    }
}
