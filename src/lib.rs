//! A Bulk Synchronous Parallel runtime.
//!
//! A task runs the same [`BspProgram`] on `N` peers. Computation
//! proceeds in supersteps: peers read their own input partition,
//! compute, send messages to each other and then meet at a barrier.
//! Messages sent during a superstep are readable by their target
//! exactly when the next superstep starts, ordered by sender and then
//! by send order.
//!
//! Start reading at [`execution::execute`]. The pieces, bottom up:
//!
//! - [`registry`]: ordinal to address table shared by all peers.
//! - [`inputs`] and [`outputs`]: per-peer record readers and
//!   append-only writers.
//! - [`message`]: envelopes, outbox and mailbox.
//! - [`coordinator`]: the barrier, between threads or between timely
//!   workers.
//! - [`context`]: the only thing a program talks to.
//! - [`runner`]: drives one peer through its life cycle.
//! - [`programs`]: reference programs.

pub mod context;
pub mod coordinator;
pub mod errors;
pub mod execution;
pub mod inputs;
pub mod message;
pub mod metrics;
pub mod outputs;
pub mod programs;
pub mod registry;
pub mod runner;
pub mod tracing;
pub mod webserver;

pub use context::{BspContext, BspProgram, PeerPhase};
pub use errors::{BspError, BspResult};
pub use execution::{execute, ExecutionConfig, Job};
pub use registry::{PeerAddress, PeerCount, PeerIndex};
pub use runner::TaskReport;
