//! Class splits of the supported few-shot datasets.
//!
//! Meta-training draws episodes from the train classes held by each client;
//! held-out evaluation draws them from the test classes.

use fedmeta_core::{DpError, Result};

/// A set of class ids, either a contiguous range or an explicit list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassIds {
    /// `start..end`.
    Range {
        /// First id.
        start: usize,
        /// One past the last id.
        end: usize,
    },
    /// Explicit, sorted ids.
    List(&'static [usize]),
}

impl ClassIds {
    /// Number of classes.
    pub fn len(&self) -> usize {
        match self {
            ClassIds::Range { start, end } => end.saturating_sub(*start),
            ClassIds::List(ids) => ids.len(),
        }
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is in the set.
    pub fn contains(&self, id: usize) -> bool {
        match self {
            ClassIds::Range { start, end } => (*start..*end).contains(&id),
            ClassIds::List(ids) => ids.binary_search(&id).is_ok(),
        }
    }

    /// Position of `id` within the set, used as the dense label.
    pub fn position(&self, id: usize) -> Option<usize> {
        match self {
            ClassIds::Range { start, end } => (*start..*end).contains(&id).then(|| id - start),
            ClassIds::List(ids) => ids.binary_search(&id).ok(),
        }
    }

    /// Materialize the ids in ascending order.
    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            ClassIds::Range { start, end } => (*start..*end).collect(),
            ClassIds::List(ids) => ids.to_vec(),
        }
    }
}

/// Class split of one dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatasetSplit {
    /// Dataset identifier.
    pub name: &'static str,
    /// Number of classes the classifier head is sized for.
    pub total_classes: usize,
    /// Classes episodes are drawn from during meta-training.
    pub train_class_ids: ClassIds,
    /// Classes episodes are drawn from during held-out evaluation.
    pub test_class_ids: ClassIds,
}

const FEWREL_TRAIN: &[usize] = &[
    0, 1, 2, 3, 4, 5, 6, 8, 10, 11, 12, 13, 14, 15, 16, 19, 21, 22, 24, 25, 26, 27, 28, 30, 31,
    32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 43, 44, 45, 46, 48, 49, 50, 52, 53, 56, 57, 58, 59,
    61, 62, 63, 64, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78,
];
const FEWREL_TEST: &[usize] = &[23, 29, 42, 47, 51, 54, 55, 60, 65, 79];
const NEWSGROUP_TRAIN: &[usize] = &[1, 5, 10, 11, 13, 14, 16, 18];
const NEWSGROUP_TEST: &[usize] = &[0, 2, 3, 8, 9, 15, 19];

/// Every supported dataset.
pub const DATASET_SPLITS: &[DatasetSplit] = &[
    DatasetSplit {
        name: "FC100",
        total_classes: 60,
        train_class_ids: ClassIds::Range { start: 0, end: 60 },
        test_class_ids: ClassIds::Range { start: 80, end: 100 },
    },
    // The test split is a separate file with its own 20 labels.
    DatasetSplit {
        name: "miniImageNet",
        total_classes: 64,
        train_class_ids: ClassIds::Range { start: 0, end: 64 },
        test_class_ids: ClassIds::Range { start: 0, end: 20 },
    },
    DatasetSplit {
        name: "20newsgroup",
        total_classes: 8,
        train_class_ids: ClassIds::List(NEWSGROUP_TRAIN),
        test_class_ids: ClassIds::List(NEWSGROUP_TEST),
    },
    DatasetSplit {
        name: "fewrel",
        total_classes: 65,
        train_class_ids: ClassIds::List(FEWREL_TRAIN),
        test_class_ids: ClassIds::List(FEWREL_TEST),
    },
    DatasetSplit {
        name: "huffpost",
        total_classes: 20,
        train_class_ids: ClassIds::Range { start: 0, end: 20 },
        test_class_ids: ClassIds::Range { start: 25, end: 41 },
    },
];

/// Look up a dataset by identifier (ASCII case-insensitive).
pub fn dataset_split(name: &str) -> Result<&'static DatasetSplit> {
    DATASET_SPLITS
        .iter()
        .find(|split| split.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| {
            let known: Vec<&str> = DATASET_SPLITS.iter().map(|s| s.name).collect();
            DpError::config(format!("unknown dataset `{name}`, expected one of {known:?}"))
        })
}
