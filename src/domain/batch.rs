//! Batches and the grouper that produces them.
//!
//! A batch is one wire-protocol submission unit. Batches only live for the
//! duration of one submission.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{BroadsideError, Result};

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Key function used for by-key grouping.
pub type KeyFn<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;

/// How records are partitioned into batches.
pub enum Grouping<R> {
    /// Consecutive chunks of at most `n` records.
    FixedSize(usize),
    /// One batch per distinct key, in first-seen key order.
    ByKey(KeyFn<R>),
}

impl<R> Clone for Grouping<R> {
    fn clone(&self) -> Self {
        match self {
            Grouping::FixedSize(n) => Grouping::FixedSize(*n),
            Grouping::ByKey(f) => Grouping::ByKey(f.clone()),
        }
    }
}

impl<R> std::fmt::Debug for Grouping<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grouping::FixedSize(n) => write!(f, "FixedSize({})", n),
            Grouping::ByKey(_) => write!(f, "ByKey(..)"),
        }
    }
}

/// An ordered, non-empty group of records submitted together.
#[derive(Debug, Clone)]
pub struct Batch<R> {
    /// 0-based position in the submission
    pub index: usize,
    pub id: BatchId,
    /// The grouping key, for by-key batches
    pub key: Option<String>,
    pub records: Vec<R>,
}

impl<R> Batch<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Partition records into ordered batches.
///
/// Empty input yields no batches. A fixed size of zero is rejected.
pub fn partition<R>(records: Vec<R>, grouping: &Grouping<R>) -> Result<Vec<Batch<R>>> {
    match grouping {
        Grouping::FixedSize(0) => Err(BroadsideError::InvalidBatchSize(0)),
        Grouping::FixedSize(size) => {
            let size = *size;
            let mut batches = Vec::with_capacity(records.len().div_ceil(size));
            let mut current = Vec::with_capacity(size.min(records.len()));

            for record in records {
                current.push(record);
                if current.len() == size {
                    let index = batches.len();
                    batches.push(new_batch(index, None, std::mem::take(&mut current)));
                }
            }
            if !current.is_empty() {
                let index = batches.len();
                batches.push(new_batch(index, None, current));
            }

            Ok(batches)
        }
        Grouping::ByKey(key_fn) => {
            let mut order: Vec<String> = Vec::new();
            let mut groups: HashMap<String, Vec<R>> = HashMap::new();

            for record in records {
                let key = key_fn(&record);
                groups
                    .entry(key.clone())
                    .or_insert_with(|| {
                        order.push(key);
                        Vec::new()
                    })
                    .push(record);
            }

            Ok(order
                .into_iter()
                .enumerate()
                .filter_map(|(index, key)| {
                    let records = groups.remove(&key)?;
                    Some(new_batch(index, Some(key), records))
                })
                .collect())
        }
    }
}

fn new_batch<R>(index: usize, key: Option<String>, records: Vec<R>) -> Batch<R> {
    Batch {
        index,
        id: BatchId::from(Uuid::new_v4()),
        key,
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes<R>(batches: &[Batch<R>]) -> Vec<usize> {
        batches.iter().map(|b| b.len()).collect()
    }

    #[test]
    fn test_fixed_size_partition() {
        let batches = partition((0..25).collect(), &Grouping::FixedSize(10)).unwrap();
        assert_eq!(sizes(&batches), vec![10, 10, 5]);
        assert_eq!(
            batches.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_fixed_size_concatenation_preserves_order() {
        for n in 1..40usize {
            for size in 1..12usize {
                let input: Vec<usize> = (0..n).collect();
                let batches = partition(input.clone(), &Grouping::FixedSize(size)).unwrap();
                assert_eq!(batches.len(), n.div_ceil(size));
                let flat: Vec<usize> = batches.into_iter().flat_map(|b| b.records).collect();
                assert_eq!(flat, input);
            }
        }
    }

    #[test]
    fn test_empty_input_yields_no_batches() {
        let batches = partition(Vec::<u32>::new(), &Grouping::FixedSize(10)).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = partition(vec![1, 2, 3], &Grouping::FixedSize(0)).unwrap_err();
        assert!(matches!(err, BroadsideError::InvalidBatchSize(0)));
    }

    #[test]
    fn test_by_key_first_seen_order() {
        let records = vec![("doc-2", 1), ("doc-1", 2), ("doc-2", 3), ("doc-3", 4), ("doc-1", 5)];
        let grouping: Grouping<(&str, i32)> = Grouping::ByKey(Arc::new(|r| r.0.to_string()));

        let batches = partition(records, &grouping).unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].key.as_deref(), Some("doc-2"));
        assert_eq!(batches[0].records, vec![("doc-2", 1), ("doc-2", 3)]);
        assert_eq!(batches[1].key.as_deref(), Some("doc-1"));
        assert_eq!(batches[1].records, vec![("doc-1", 2), ("doc-1", 5)]);
        assert_eq!(batches[2].records, vec![("doc-3", 4)]);
        assert_eq!(
            batches.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_by_key_ignores_size() {
        let records: Vec<u32> = (0..500).collect();
        let grouping: Grouping<u32> = Grouping::ByKey(Arc::new(|_| "same".to_string()));
        let batches = partition(records, &grouping).unwrap();
        assert_eq!(sizes(&batches), vec![500]);
    }
}
