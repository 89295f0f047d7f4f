//! `factline-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, partitioning, the aggregate contract and the domain error model.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;
pub mod partition;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CommandId, EventId, PartitionId};
pub use partition::Partitioner;
pub use value_object::ValueObject;
