//! Paired split design for the model pool.
//!
//! Invariants:
//! - Each `Paired` slot's two rows are complements over assigned samples
//! - Every assigned sample is `In` for ⌊M/2⌋ or ⌊M/2⌋+1 models
//! - `Unassigned` samples are outside every split
//! - The same seed yields the same design

use crate::models::{AuditError, Membership, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Which half of a split a model trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
    Solo,
}

/// One split of the universe and the model(s) trained on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "slot", rename_all = "lowercase")]
pub enum ModelSlot {
    /// Two models trained on complementary halves
    Paired { split: usize, a: usize, b: usize },
    /// Remainder model of an odd-sized pool
    Solo { split: usize, model: usize },
}

impl ModelSlot {
    pub fn split(&self) -> usize {
        match *self {
            Self::Paired { split, .. } | Self::Solo { split, .. } => split,
        }
    }

    /// Models in this slot with their side.
    pub fn models(&self) -> Vec<(usize, Side)> {
        match *self {
            Self::Paired { a, b, .. } => vec![(a, Side::A), (b, Side::B)],
            Self::Solo { model, .. } => vec![(model, Side::Solo)],
        }
    }
}

/// Train/test membership of every sample for every pool model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitDesign {
    universe_size: usize,
    slots: Vec<ModelSlot>,
    /// M rows of N entries
    membership: Vec<Vec<Membership>>,
}

/// Builds split designs.
pub struct SplitDesigner;

impl SplitDesigner {
    /// Partition `universe_size` samples across `num_models` models.
    ///
    /// A `holdout_fraction` of the universe is left `Unassigned` for every model.
    pub fn design(
        universe_size: usize,
        num_models: usize,
        seed: u64,
        holdout_fraction: f64,
    ) -> Result<SplitDesign> {
        if num_models == 0 {
            return Err(AuditError::InvalidInput("pool needs at least one model".into()));
        }
        if !(0.0..1.0).contains(&holdout_fraction) {
            return Err(AuditError::InvalidInput(format!(
                "holdout fraction {holdout_fraction} is outside [0, 1)"
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..universe_size).collect();
        order.shuffle(&mut rng);
        let holdout = (universe_size as f64 * holdout_fraction).floor() as usize;
        let mut assigned = order.split_off(holdout);
        assigned.sort_unstable();

        let mut membership = vec![vec![Membership::Unassigned; universe_size]; num_models];
        let mut slots = Vec::with_capacity(num_models.div_ceil(2));

        for split in 0..num_models / 2 {
            let (a, b) = (2 * split, 2 * split + 1);
            let mut shuffled = assigned.clone();
            shuffled.shuffle(&mut rng);
            let (first, second) = shuffled.split_at(shuffled.len() / 2);
            for &i in first {
                membership[a][i] = Membership::In;
                membership[b][i] = Membership::Out;
            }
            for &i in second {
                membership[a][i] = Membership::Out;
                membership[b][i] = Membership::In;
            }
            slots.push(ModelSlot::Paired { split, a, b });
        }

        if num_models % 2 == 1 {
            let model = num_models - 1;
            let mut shuffled = assigned.clone();
            shuffled.shuffle(&mut rng);
            let (first, second) = shuffled.split_at(shuffled.len() / 2);
            for &i in first {
                membership[model][i] = Membership::In;
            }
            for &i in second {
                membership[model][i] = Membership::Out;
            }
            slots.push(ModelSlot::Solo {
                split: num_models / 2,
                model,
            });
        }

        Ok(SplitDesign {
            universe_size,
            slots,
            membership,
        })
    }
}

impl SplitDesign {
    pub fn universe_size(&self) -> usize {
        self.universe_size
    }

    pub fn num_models(&self) -> usize {
        self.membership.len()
    }

    pub fn slots(&self) -> &[ModelSlot] {
        &self.slots
    }

    /// Membership row of `model`.
    pub fn membership(&self, model: usize) -> &[Membership] {
        &self.membership[model]
    }

    pub fn is_member(&self, model: usize, sample: usize) -> bool {
        self.membership[model][sample].is_member()
    }

    /// Slot holding `model`, with the model's side.
    pub fn slot_of(&self, model: usize) -> Option<(&ModelSlot, Side)> {
        self.slots.iter().find_map(|slot| {
            slot.models()
                .into_iter()
                .find(|(m, _)| *m == model)
                .map(|(_, side)| (slot, side))
        })
    }

    /// Model trained on the complementary half, if `model` is paired.
    pub fn pair_of(&self, model: usize) -> Option<usize> {
        match self.slot_of(model)?.0 {
            ModelSlot::Paired { a, b, .. } if *a == model => Some(*b),
            ModelSlot::Paired { a, .. } => Some(*a),
            ModelSlot::Solo { .. } => None,
        }
    }

    /// Indices `model` trains on.
    pub fn train_indices(&self, model: usize) -> Vec<usize> {
        self.indices_with(model, Membership::In)
    }

    /// Indices held out of `model`'s training, used as its test data.
    pub fn test_indices(&self, model: usize) -> Vec<usize> {
        self.indices_with(model, Membership::Out)
    }

    fn indices_with(&self, model: usize, role: Membership) -> Vec<usize> {
        self.membership[model]
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == role)
            .map(|(i, _)| i)
            .collect()
    }

    /// Samples no pool model trains on.
    pub fn never_trained(&self) -> Vec<usize> {
        (0..self.universe_size)
            .filter(|&i| self.membership.iter().all(|row| !row[i].is_member()))
            .collect()
    }

    /// Number of models each sample is a training member of.
    pub fn in_counts(&self) -> Vec<usize> {
        (0..self.universe_size)
            .map(|i| self.membership.iter().filter(|row| row[i].is_member()).count())
            .collect()
    }

    /// Boolean membership of `samples` for every model, `[model][position]`.
    pub fn membership_matrix(&self, samples: &[usize]) -> Vec<Vec<bool>> {
        self.membership
            .iter()
            .map(|row| samples.iter().map(|&i| row[i].is_member()).collect())
            .collect()
    }
}
