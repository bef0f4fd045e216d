//! Audit and population sample selection.

use crate::models::{AuditError, ConfigError, Result, SampleSet, SampleSource};
use crate::split::SplitDesign;
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use tracing::{debug, info};

/// Member and non-member pools of `target` over the universe, minus `reserved`.
///
/// `reserved` must be sorted.
fn pools(design: &SplitDesign, target: usize, reserved: &[usize]) -> (Vec<usize>, Vec<usize>) {
    (0..design.universe_size())
        .filter(|i| reserved.binary_search(i).is_err())
        .partition(|&i| design.is_member(target, i))
}

/// Universe rows [`select_population`] will take, given the same arguments.
pub fn universe_population_size(
    design: &SplitDesign,
    population_len: Option<usize>,
    cap: usize,
) -> usize {
    match population_len {
        Some(len) if len > 0 => 0,
        _ => cap.min(design.never_trained().len()),
    }
}

/// Members and non-members a balanced set of `size` needs.
fn balanced_counts(size: usize) -> (usize, usize) {
    (size.div_ceil(2), size / 2)
}

/// Whether `size` is satisfiable for `target`, checked before any training.
///
/// `reserved` universe rows go to the population. They are never trained on,
/// so they come out of the target's non-members.
pub fn check_capacity(
    design: &SplitDesign,
    target: usize,
    size: Option<usize>,
    reserved: usize,
) -> Result<()> {
    let Some(size) = size.filter(|&s| s < design.universe_size()) else {
        return Ok(());
    };
    let (members, non_members) = pools(design, target, &[]);
    let non_members = non_members.len().saturating_sub(reserved);
    let (want_in, want_out) = balanced_counts(size);
    if members.len() < want_in || non_members < want_out {
        return Err(ConfigError::Invalid {
            field: "audit.data_size".into(),
            reason: format!(
                "{size} balanced samples need {want_in} members and {want_out} non-members, \
                 model {target} has {} and {non_members}",
                members.len(),
            ),
        }
        .into());
    }
    Ok(())
}

/// Choose the audited samples for `target`, never one of the `reserved` rows.
///
/// Without a size, or with one covering the universe, every unreserved sample
/// is audited. Otherwise the set holds ⌈size/2⌉ members and ⌊size/2⌋
/// non-members of the target, in ascending index order.
pub fn select_audit_sample<R: Rng + ?Sized>(
    design: &SplitDesign,
    target: usize,
    size: Option<usize>,
    reserved: &SampleSet,
    rng: &mut R,
) -> Result<SampleSet> {
    let n = design.universe_size();
    let reserved: &[usize] = match reserved.source {
        SampleSource::Universe => &reserved.indices,
        _ => &[],
    };
    let Some(size) = size.filter(|&s| s < n) else {
        let indices: Vec<usize> = (0..n)
            .filter(|i| reserved.binary_search(i).is_err())
            .collect();
        debug!(target, samples = indices.len(), "Auditing the whole universe");
        return Ok(SampleSet::new(SampleSource::Universe, indices, false));
    };

    let (mut members, mut non_members) = pools(design, target, reserved);
    let (want_in, want_out) = balanced_counts(size);
    if members.len() < want_in || non_members.len() < want_out {
        return Err(AuditError::insufficient(format!(
            "model {target} has {} members and {} non-members, {size} balanced samples need \
             {want_in} and {want_out}",
            members.len(),
            non_members.len()
        )));
    }

    members.shuffle(rng);
    non_members.shuffle(rng);
    let mut indices: Vec<usize> = members[..want_in]
        .iter()
        .chain(&non_members[..want_out])
        .copied()
        .collect();
    indices.sort_unstable();

    info!(target, members = want_in, non_members = want_out, "Audit sample selected");
    Ok(SampleSet::new(SampleSource::Universe, indices, false))
}

/// Choose up to `cap` population samples, never trained on by any pool model.
///
/// Draws from the disjoint population pool when one is loaded (`population_len`),
/// otherwise from universe samples unassigned in every split.
pub fn select_population<R: Rng + ?Sized>(
    design: &SplitDesign,
    population_len: Option<usize>,
    cap: usize,
    rng: &mut R,
) -> Result<SampleSet> {
    let (source, candidates) = match population_len {
        Some(len) if len > 0 => (SampleSource::Population, (0..len).collect::<Vec<_>>()),
        _ => (SampleSource::Universe, design.never_trained()),
    };
    if candidates.is_empty() {
        return Err(AuditError::insufficient(
            "no population samples: provide data.population_path or a holdout_fraction > 0",
        ));
    }

    let take = cap.min(candidates.len());
    let mut indices: Vec<usize> = candidates.choose_multiple(rng, take).copied().collect();
    indices.sort_unstable();

    info!(source = %source, samples = take, "Population selected");
    Ok(SampleSet::new(source, indices, true))
}
