//! Stable mapping from aggregate streams to log partitions.

use crate::id::{AggregateId, PartitionId};

/// Assigns every aggregate stream to exactly one partition.
///
/// The mapping depends only on the aggregate id bytes and the partition count,
/// so it is identical across processes and restarts. All events of one
/// aggregate land in the same partition, which keeps per-aggregate order intact
/// for a single sequential consumer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Partitioner {
    partitions: u32,
}

impl Partitioner {
    /// A partitioner over `partitions` partitions (at least one).
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// All partitions, in index order.
    pub fn all(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.partitions).map(PartitionId::new)
    }

    pub fn partition_for(&self, aggregate_id: &AggregateId) -> PartitionId {
        let hash = fnv1a(aggregate_id.as_str().as_bytes());
        PartitionId::new((hash % u64::from(self.partitions)) as u32)
    }
}

// 64-bit FNV-1a; fixed constants keep the mapping stable across toolchains.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
