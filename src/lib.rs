//! # hotseq
//!
//! Asynchronous execution and sharing core for push-based sequences.
//!
//! A cold [`Source`] performs its work every time it is driven. This crate
//! gives it a lifecycle: an execution strategy ([`Async`]) runs it in the
//! background, and sharing structures turn the one-shot push stream into
//! something several readers can observe.
//!
//! - [`Async`]: one contract (`submit` / `join` / `join_all`) over three
//!   backends: thread-per-task, a bounded worker pool, and a rayon
//!   work-stealing pool.
//! - [`HotChannel`]: point-to-point hand-off between one producer and one
//!   foreground reader, drain-fully-before-waiting.
//! - [`SharedFeed`]: bounded ring-buffer multicast with drop-oldest
//!   backpressure; every reader keeps its own cursor.
//! - [`StateFeed`]: latest-distinct-value cell; readers observe changes,
//!   never repeats.
//! - [`AsyncSeq`]: single-consumption wrapper with cooperative
//!   cancellation, start/completion hooks and inline mapping.
//! - [`Lazy`]: memoized evaluation graph with fork/join-parallel demand of
//!   its dependencies, safe under concurrent access.

pub mod async_seq;
pub mod channel;
pub mod error;
pub mod exec;
pub mod lazy;
pub mod share;
pub mod source;
pub mod state;

mod activation;
mod monitor;

pub use async_seq::AsyncSeq;
pub use channel::HotChannel;
pub use error::{Error, Result};
pub use exec::{delay, Async, ExecStats, ForkJoin, PoolConfig, TaskHandle, Work};
pub use lazy::{all, zip, zip3, Lazy, Mutable};
pub use share::SharedFeed;
pub use source::{Reducer, Source, Step};
pub use state::StateFeed;
