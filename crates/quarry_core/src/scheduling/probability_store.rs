use std::collections::BTreeMap;

use quarry_error::{DbError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Numerator and derived probability for a single object in the store.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ObjectProbability {
    numerator: f64,
    probability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CumulativeProbability {
    key: u64,
    /// Sum of probabilities of this and all preceding objects.
    cumulative: f64,
}

/// Weighted discrete probability distribution over a dynamic set of keys.
///
/// Every object has a numerator, and all objects share a common denominator.
/// The probability of an object is `numerator / denominator`.
///
/// Cumulative probabilities are kept up to date on every mutation. This is
/// linear in the number of objects, which is fine since stores hold one entry
/// per active query or per priority level.
#[derive(Debug)]
pub struct ProbabilityStore {
    individual: BTreeMap<u64, ObjectProbability>,
    cumulative: Vec<CumulativeProbability>,
    common_denominator: f64,
    rng: StdRng,
}

impl Default for ProbabilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbabilityStore {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Create a store with a deterministic random number generator.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        ProbabilityStore {
            individual: BTreeMap::new(),
            cumulative: Vec::new(),
            common_denominator: 1.0,
            rng,
        }
    }

    pub fn num_objects(&self) -> usize {
        debug_assert_eq!(self.individual.len(), self.cumulative.len());
        self.individual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individual.is_empty()
    }

    pub fn denominator(&self) -> f64 {
        self.common_denominator
    }

    pub fn has_object(&self, key: u64) -> bool {
        self.individual.contains_key(&key)
    }

    /// Add or update a single object keeping the current denominator.
    pub fn add_or_update_object(&mut self, key: u64, numerator: f64) -> Result<()> {
        self.check_numerator(key, numerator, self.common_denominator)?;
        self.individual.insert(
            key,
            ObjectProbability {
                numerator,
                probability: numerator / self.common_denominator,
            },
        );
        self.update_cumulative_probabilities();
        Ok(())
    }

    /// Add or update multiple objects keeping the current denominator.
    pub fn add_or_update_objects(&mut self, keys: &[u64], numerators: &[f64]) -> Result<()> {
        check_lengths(keys, numerators)?;
        for (&key, &numerator) in keys.iter().zip(numerators) {
            self.check_numerator(key, numerator, self.common_denominator)?;
        }

        for (&key, &numerator) in keys.iter().zip(numerators) {
            self.individual.insert(
                key,
                ObjectProbability {
                    numerator,
                    probability: numerator / self.common_denominator,
                },
            );
        }
        self.update_cumulative_probabilities();
        Ok(())
    }

    /// Set the numerator for an object and replace the denominator shared by
    /// all objects.
    ///
    /// Probabilities for every object are recomputed using the new
    /// denominator.
    pub fn add_or_update_object_new_denominator(
        &mut self,
        key: u64,
        numerator: f64,
        new_denominator: f64,
    ) -> Result<()> {
        self.add_or_update_objects_new_denominator(&[key], &[numerator], new_denominator)
    }

    /// Batched version of [`Self::add_or_update_object_new_denominator`].
    pub fn add_or_update_objects_new_denominator(
        &mut self,
        keys: &[u64],
        numerators: &[f64],
        new_denominator: f64,
    ) -> Result<()> {
        check_lengths(keys, numerators)?;
        if !(new_denominator > 0.0) {
            return Err(DbError::new("Probability store denominator must be positive")
                .with_field("denominator", new_denominator));
        }
        for (&key, &numerator) in keys.iter().zip(numerators) {
            self.check_numerator(key, numerator, new_denominator)?;
        }

        self.common_denominator = new_denominator;
        for (&key, &numerator) in keys.iter().zip(numerators) {
            // Probability filled in below.
            self.individual.insert(
                key,
                ObjectProbability {
                    numerator,
                    probability: 0.0,
                },
            );
        }
        self.update_probabilities_new_denominator();
        Ok(())
    }

    /// Remove an object from the store.
    ///
    /// The denominator is reduced by the removed object's numerator. The
    /// remaining numerators are left untouched so their relative weights are
    /// preserved.
    pub fn remove_object(&mut self, key: u64) -> Result<()> {
        let removed = self.individual.remove(&key).ok_or_else(|| {
            DbError::new("Cannot remove missing object from probability store")
                .with_field("key", key)
        })?;

        if self.individual.is_empty() {
            self.common_denominator = 1.0;
            self.cumulative.clear();
            return Ok(());
        }

        let mut new_denominator = self.common_denominator - removed.numerator;
        if new_denominator <= f64::EPSILON {
            // Remaining objects only had zero (or rounding level) weight left,
            // fall back to their actual sum, or uniform if there's nothing.
            new_denominator = self.individual.values().map(|p| p.numerator).sum();
            if new_denominator <= 0.0 {
                for p in self.individual.values_mut() {
                    p.numerator = 1.0;
                }
                new_denominator = self.individual.len() as f64;
            }
        }

        self.common_denominator = new_denominator;
        self.update_probabilities_new_denominator();
        Ok(())
    }

    /// Get the individual (not cumulative) probability for an object.
    pub fn individual_probability(&self, key: u64) -> Result<f64> {
        let obj = self.individual.get(&key).ok_or_else(|| {
            DbError::new("Missing object in probability store").with_field("key", key)
        })?;
        if self.common_denominator == 0.0 {
            return Err(DbError::new("Probability store has a zero denominator"));
        }
        Ok(obj.probability)
    }

    /// Iterate over (key, probability) pairs ordered by key.
    pub fn individual_probabilities(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.individual.iter().map(|(k, p)| (*k, p.probability))
    }

    /// Pick a key at random, weighted by the objects' probabilities.
    pub fn pick_random_key(&mut self) -> Result<u64> {
        let chosen: f64 = self.rng.random_range(0.0..1.0);
        self.pick_random_key_for(chosen)
    }

    /// Find the key for the given cumulative probability.
    ///
    /// Returns the first object whose cumulative probability is greater than
    /// `probability`.
    pub fn pick_random_key_for(&self, probability: f64) -> Result<u64> {
        if self.cumulative.is_empty() {
            return Err(DbError::new("Cannot pick a key from an empty probability store"));
        }

        let idx = self
            .cumulative
            .partition_point(|ent| ent.cumulative <= probability);
        // Last cumulative probability is pinned to 1.0, so anything in [0, 1)
        // finds an entry. Clamp anyways for inputs outside that range.
        let idx = idx.min(self.cumulative.len() - 1);

        Ok(self.cumulative[idx].key)
    }

    fn check_numerator(&self, key: u64, numerator: f64, denominator: f64) -> Result<()> {
        if !(numerator >= 0.0) || numerator > denominator {
            return Err(DbError::new("Numerator must be between zero and the denominator")
                .with_field("key", key)
                .with_field("numerator", numerator)
                .with_field("denominator", denominator));
        }
        Ok(())
    }

    fn update_probabilities_new_denominator(&mut self) {
        for p in self.individual.values_mut() {
            p.probability = p.numerator / self.common_denominator;
        }
        self.update_cumulative_probabilities();
    }

    fn update_cumulative_probabilities(&mut self) {
        self.cumulative.clear();
        if self.individual.is_empty() {
            return;
        }

        let mut cumulative = 0.0;
        for (&key, p) in &self.individual {
            cumulative += p.probability;
            self.cumulative.push(CumulativeProbability { key, cumulative });
        }

        // Pin the last entry to exactly 1.0 to avoid floating point error
        // causing a pick to fall off the end.
        if let Some(last) = self.cumulative.last_mut() {
            last.cumulative = 1.0;
        }
    }
}

fn check_lengths(keys: &[u64], numerators: &[f64]) -> Result<()> {
    if keys.len() != numerators.len() {
        return Err(DbError::new("Mismatched number of keys and numerators")
            .with_field("keys", keys.len())
            .with_field("numerators", numerators.len()));
    }
    Ok(())
}
