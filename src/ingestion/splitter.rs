//! Batch Splitter - Pure partitioning of an ordered row set
//!
//! Boundaries depend only on the input length and the size, so re-running a
//! split after a restart reproduces the same batches. Checkpoint resumption
//! relies on that.

use std::num::NonZeroUsize;

use super::Row;

/// A checkpointed slice of a file's rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub rows: Vec<Row>,
}

/// A slice of a batch written by a single insert call.
#[derive(Clone, Debug, PartialEq)]
pub struct SubBatch {
    pub batch_index: usize,
    pub index: usize,
    pub rows: Vec<Row>,
}

/// Number of chunks `len` items produce at the given size.
pub fn chunk_count(len: usize, size: NonZeroUsize) -> usize {
    len.div_ceil(size.get())
}

fn chunk<T>(items: Vec<T>, size: NonZeroUsize) -> Vec<Vec<T>> {
    let mut chunks = Vec::with_capacity(chunk_count(items.len(), size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(size.get()).collect());
    }
    chunks
}

/// Split rows into `ceil(len / batch_size)` batches indexed in input order.
pub fn split(rows: Vec<Row>, batch_size: NonZeroUsize) -> Vec<Batch> {
    chunk(rows, batch_size)
        .into_iter()
        .enumerate()
        .map(|(index, rows)| Batch { index, rows })
        .collect()
}

/// Split one batch into sub-batches with the same slicing rule.
pub fn sub_split(batch: Batch, sub_batch_size: NonZeroUsize) -> Vec<SubBatch> {
    let batch_index = batch.index;
    chunk(batch.rows, sub_batch_size)
        .into_iter()
        .enumerate()
        .map(|(index, rows)| SubBatch {
            batch_index,
            index,
            rows,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), json!(i.to_string()));
                row
            })
            .collect()
    }

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_split_counts_and_reconstruction() {
        for n in [0usize, 1, 7, 99, 100, 101, 1000, 2500] {
            for b in [1usize, 3, 100, 1000] {
                let source = rows(n);
                let batches = split(source.clone(), size(b));
                assert_eq!(batches.len(), n.div_ceil(b), "n={} b={}", n, b);

                let rebuilt: Vec<Row> = batches.iter().flat_map(|b| b.rows.clone()).collect();
                assert_eq!(rebuilt, source);

                for (i, batch) in batches.iter().enumerate() {
                    assert_eq!(batch.index, i);
                    assert!(!batch.rows.is_empty());
                    assert!(batch.rows.len() <= b);
                }
            }
        }
    }

    #[test]
    fn test_scenario_2500_rows() {
        let batches = split(rows(2500), size(1000));
        let lens: Vec<usize> = batches.iter().map(|b| b.rows.len()).collect();
        assert_eq!(lens, vec![1000, 1000, 500]);

        let sub_counts: Vec<usize> = batches
            .into_iter()
            .map(|b| sub_split(b, size(100)).len())
            .collect();
        assert_eq!(sub_counts, vec![10, 10, 5]);
    }

    #[test]
    fn test_sub_split_keeps_order_and_batch_index() {
        let batch = Batch {
            index: 4,
            rows: rows(250),
        };
        let expected = batch.rows.clone();
        let subs = sub_split(batch, size(100));

        assert_eq!(subs.len(), 3);
        assert!(subs.iter().all(|s| s.batch_index == 4));
        assert_eq!(subs[2].rows.len(), 50);
        let rebuilt: Vec<Row> = subs.into_iter().flat_map(|s| s.rows).collect();
        assert_eq!(rebuilt, expected);
    }

    #[test]
    fn test_split_is_deterministic() {
        let a = split(rows(1234), size(100));
        let b = split(rows(1234), size(100));
        assert_eq!(a, b);
    }
}
