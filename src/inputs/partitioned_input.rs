use std::collections::VecDeque;

use crate::errors::BspResult;
use crate::registry::{PeerCount, PeerIndex};

use super::{InputBuilder, RecordReader};

/// Read records out of memory.
pub struct VecReader<K, V> {
    records: VecDeque<(K, V)>,
}

impl<K, V> VecReader<K, V> {
    pub fn new(records: Vec<(K, V)>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

impl<K, V> RecordReader<K, V> for VecReader<K, V> {
    fn next(&mut self) -> BspResult<Option<(K, V)>> {
        Ok(self.records.pop_front())
    }
}

/// Give each peer an explicit, in-memory partition.
///
/// Partition `i` goes to peer `i`. Peers without a partition read
/// nothing; partitions without a peer are never read.
#[derive(Debug, Clone)]
pub struct PartitionedInput<K, V> {
    partitions: Vec<Vec<(K, V)>>,
}

impl<K, V> PartitionedInput<K, V> {
    pub fn new(partitions: Vec<Vec<(K, V)>>) -> Self {
        Self { partitions }
    }
}

impl PartitionedInput<String, String> {
    /// Text partitions of values only, keys are the record's position
    /// in its partition.
    pub fn from_values<S: ToString>(partitions: Vec<Vec<S>>) -> Self {
        Self::new(
            partitions
                .into_iter()
                .map(|values| {
                    values
                        .into_iter()
                        .enumerate()
                        .map(|(i, value)| (i.to_string(), value.to_string()))
                        .collect()
                })
                .collect(),
        )
    }
}

impl<K, V> InputBuilder<K, V> for PartitionedInput<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn build(&self, index: PeerIndex, _count: PeerCount) -> BspResult<Box<dyn RecordReader<K, V>>> {
        let records = self.partitions.get(index.0).cloned().unwrap_or_default();
        tracing::debug!(peer = %index, records = records.len(), "Built partitioned input");
        Ok(Box::new(VecReader::new(records)))
    }
}
