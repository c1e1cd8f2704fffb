//! # pvlink-core
//!
//! Discipline-agnostic connection machinery for pvlink:
//! - Request correlation registry: multiplexes many concurrent
//!   request/response exchanges over one connection
//! - Monitor queue: a bounded pool of value slots decoupling a
//!   must-not-block producer from a slower subscription consumer
//!
//! Both are safe under either transport discipline (blocking thread pair
//! or shared-runtime tasks); all mutable state sits behind a mutex held
//! only for the duration of the table operation, never across I/O.

pub mod monitor;
pub mod registry;

pub use monitor::{Delivered, MonitorQueue, SlotToken};
pub use registry::{Completion, RequestId, RequestRegistry, SyncWaiter, Waiter};
