//! The concurrent download engine.
//!
//! Components are organized by responsibility:
//! - [`probe`] - HEAD/ranged-GET probing, mirror validation
//! - [`task_queue`] - pending byte ranges with idle-worker counting
//! - [`active`] - per-worker registry of in-flight ranges
//! - [`transport`] - per-protocol client set (H1/H2/H3) with fallback order
//! - [`worker`] - the range-GET → write-at-offset loop
//! - [`balancer`] - dynamic splitting, stealing, and hedging
//! - [`health`] - stall detection and slow-worker flagging
//! - [`progress`] - shared counters, chunk bitmap, pause flag
//! - [`sequential`] - single-connection fallback
//! - [`sizing`] - connection-count and chunk-size heuristics
//! - [`coordinator`] - the top-level `download()` lifecycle

mod active;
mod balancer;
mod coordinator;
mod health;
pub(crate) mod probe;
mod progress;
mod sequential;
mod sizing;
mod task_queue;
mod transport;
mod worker;

pub use coordinator::{DownloadRequest, EngineContext, download};
pub use probe::ProbeOutcome;
pub use progress::ProgressState;
