//! Event, command and projection contracts shared by the domain and the engine.

pub mod bus;
pub mod claims;
pub mod command;
pub mod effect;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;

pub use bus::{EventBus, Subscription};
pub use claims::{ClaimChange, ClaimKey, UniqueClaims};
pub use command::Command;
pub use effect::{Effect, NoEffect};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::Projection;
pub use runner::{ProjectionCursor, ProjectionError, ProjectionRunner};
