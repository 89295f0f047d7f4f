//! Projection runner utilities (pure fold with partition cursor tracking).
//!
//! Read models are **disposable**; events are the source of truth.
//! This module provides deterministic replay and offset tracking without
//! making storage assumptions. The projector in `factline-infra` uses it to
//! build the staged state of a batch before committing it.

use factline_core::PartitionId;
use thiserror::Error;

use crate::{EventEnvelope, Projection};

/// Tracks projection progress inside a single partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    partition: PartitionId,
    last_offset: Option<u64>,
}

impl ProjectionCursor {
    pub fn new(partition: PartitionId, last_offset: Option<u64>) -> Self {
        Self {
            partition,
            last_offset,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Last applied offset; `None` when nothing has been applied.
    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    /// The only offset that may be applied next.
    pub fn next_offset(&self) -> u64 {
        self.last_offset.map_or(0, |o| o + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("event from partition {found} delivered to runner for {expected}")]
    PartitionMismatch {
        expected: PartitionId,
        found: PartitionId,
    },

    #[error("offset gap in {partition}: expected {expected}, found {found}")]
    Gap {
        partition: PartitionId,
        expected: u64,
        found: u64,
    },
}

/// Runs envelopes of one partition through a projection and tracks progress.
#[derive(Debug, Clone)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursor: ProjectionCursor,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    /// A runner over an empty read model, starting at offset 0.
    pub fn new(partition: PartitionId) -> Self {
        Self::resume(partition, None, P::default())
    }

    /// Continue from a committed `(checkpoint, state)` pair.
    pub fn resume(partition: PartitionId, checkpoint: Option<u64>, projection: P) -> Self {
        Self {
            projection,
            cursor: ProjectionCursor::new(partition, checkpoint),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    pub fn cursor(&self) -> ProjectionCursor {
        self.cursor
    }

    /// Apply a single envelope, enforcing partition consistency and gapless offsets.
    ///
    /// Envelopes at or below the cursor were already folded and are no-ops.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<Vec<P::Effect>, ProjectionError> {
        self.check(envelope.partition(), envelope.offset())?;
        if Some(envelope.offset()) <= self.cursor.last_offset {
            return Ok(Vec::new());
        }
        let effects = self.projection.apply(envelope);
        self.cursor.last_offset = Some(envelope.offset());
        Ok(effects)
    }

    /// Advance past an offset that carries no event for this projection
    /// (another aggregate type sharing the partition).
    pub fn pass(&mut self, partition: PartitionId, offset: u64) -> Result<(), ProjectionError> {
        self.check(partition, offset)?;
        if Some(offset) > self.cursor.last_offset {
            self.cursor.last_offset = Some(offset);
        }
        Ok(())
    }

    fn check(&self, partition: PartitionId, offset: u64) -> Result<(), ProjectionError> {
        if partition != self.cursor.partition {
            return Err(ProjectionError::PartitionMismatch {
                expected: self.cursor.partition,
                found: partition,
            });
        }
        let expected = self.cursor.next_offset();
        if offset > expected {
            return Err(ProjectionError::Gap {
                partition,
                expected,
                found: offset,
            });
        }
        Ok(())
    }
}
