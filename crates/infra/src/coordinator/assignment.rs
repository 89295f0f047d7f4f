//! Splitting log partitions across projector instances.

use factline_core::PartitionId;

/// The partitions one projector instance is responsible for.
///
/// Every partition is assigned to exactly one instance, so each partition has
/// a single sequential consumer per projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub instance: usize,
    pub partitions: Vec<PartitionId>,
}

impl PartitionAssignment {
    /// Deal `partitions` out to `instances` instances round-robin
    /// (partition `p` goes to instance `p % instances`).
    pub fn round_robin(partitions: u32, instances: usize) -> Vec<PartitionAssignment> {
        let instances = instances.max(1);
        let mut out: Vec<PartitionAssignment> = (0..instances)
            .map(|instance| PartitionAssignment {
                instance,
                partitions: Vec::new(),
            })
            .collect();
        for p in 0..partitions {
            out[p as usize % instances].partitions.push(PartitionId::new(p));
        }
        out
    }

    /// The share of a single instance.
    pub fn for_instance(partitions: u32, instances: usize, instance: usize) -> PartitionAssignment {
        let instances = instances.max(1);
        PartitionAssignment {
            instance,
            partitions: (0..partitions)
                .filter(|p| *p as usize % instances == instance)
                .map(PartitionId::new)
                .collect(),
        }
    }

    pub fn owns(&self, partition: PartitionId) -> bool {
        self.partitions.contains(&partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_partition_has_exactly_one_owner() {
        let assignments = PartitionAssignment::round_robin(10, 3);
        for p in 0..10 {
            let owners = assignments.iter().filter(|a| a.owns(PartitionId::new(p))).count();
            assert_eq!(owners, 1);
        }
        assert_eq!(assignments[1], PartitionAssignment::for_instance(10, 3, 1));
    }

    #[test]
    fn more_instances_than_partitions_leaves_some_idle() {
        let assignments = PartitionAssignment::round_robin(2, 4);
        assert_eq!(assignments.iter().filter(|a| a.partitions.is_empty()).count(), 2);
    }
}
