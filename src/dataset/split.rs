use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::config::check_validation_fraction;
use super::error::{DatasetError, DatasetResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Val,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Train, Phase::Val];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Picks the seed for the split: the configured one, or a fresh one drawn
/// from thread entropy so the run can still be replayed from the logs.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| rand::thread_rng().gen())
}

/// One holdout split of the file list indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitAssignment {
    train: Vec<usize>,
    val: Vec<usize>,
    seed: u64,
}

impl SplitAssignment {
    /// Shuffles `0..len` with `seed` and cuts `floor(len * validation_fraction)`
    /// indices off the front for validation; the rest is training.
    pub fn partition(len: usize, validation_fraction: f64, seed: u64) -> DatasetResult<Self> {
        if len == 0 {
            return Err(DatasetError::invalid("file list is empty, nothing to split"));
        }
        check_validation_fraction(validation_fraction)?;

        let mut indices: Vec<usize> = (0..len).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let val_size = (len as f64 * validation_fraction).floor() as usize;
        let train = indices.split_off(val_size);

        Ok(SplitAssignment { train, val: indices, seed })
    }

    pub fn indices(&self, phase: Phase) -> &[usize] {
        match phase {
            Phase::Train => &self.train,
            Phase::Val => &self.val,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.val.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phases(&self) -> impl Iterator<Item = (Phase, &[usize])> {
        Phase::ALL.into_iter().map(move |p| (p, self.indices(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_every_index_once() {
        for len in [1, 2, 7, 10, 101, 1000] {
            for fraction in [0.01, 0.1, 0.5, 0.99] {
                let split = SplitAssignment::partition(len, fraction, 11).unwrap();
                let mut all: Vec<usize> = split
                    .indices(Phase::Train)
                    .iter()
                    .chain(split.indices(Phase::Val))
                    .copied()
                    .collect();
                all.sort_unstable();
                assert_eq!(all, (0..len).collect::<Vec<_>>(), "len={len} fraction={fraction}");
            }
        }
    }

    #[test]
    fn validation_size_is_floored() {
        let split = SplitAssignment::partition(10, 0.1, 3).unwrap();
        assert_eq!(split.indices(Phase::Val).len(), 1);
        assert_eq!(split.indices(Phase::Train).len(), 9);

        let split = SplitAssignment::partition(19, 0.1, 3).unwrap();
        assert_eq!(split.indices(Phase::Val).len(), 1);

        let split = SplitAssignment::partition(5, 0.1, 3).unwrap();
        assert!(split.indices(Phase::Val).is_empty());
    }

    #[test]
    fn same_seed_same_split() {
        let a = SplitAssignment::partition(200, 0.25, 727).unwrap();
        let b = SplitAssignment::partition(200, 0.25, 727).unwrap();
        assert_eq!(a, b);

        let c = SplitAssignment::partition(200, 0.25, 728).unwrap();
        assert_ne!(a.indices(Phase::Val), c.indices(Phase::Val));
    }

    #[test]
    fn rejects_empty_list_and_bad_fractions() {
        assert!(matches!(
            SplitAssignment::partition(0, 0.1, 1),
            Err(DatasetError::InvalidConfiguration(_))
        ));
        for bad in [0.0, 1.0] {
            assert!(matches!(
                SplitAssignment::partition(10, bad, 1),
                Err(DatasetError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn phases_iterate_train_then_val() {
        let split = SplitAssignment::partition(4, 0.5, 9).unwrap();
        let order: Vec<Phase> = split.phases().map(|(p, _)| p).collect();
        assert_eq!(order, vec![Phase::Train, Phase::Val]);
        assert_eq!(split.seed(), 9);
    }
}
