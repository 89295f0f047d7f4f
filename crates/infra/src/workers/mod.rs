//! Background projector workers.

pub mod pool;
pub mod projection_worker;

pub use pool::ProjectorPool;
pub use projection_worker::{ProjectorWorker, WorkerExit, WorkerHandle, WorkerSettings};
