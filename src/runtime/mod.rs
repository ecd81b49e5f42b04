//! Non-blocking request runtime.
//!
//! Worker threads each run a poll epoch and drive per-connection state
//! machines:
//! - `connection`: buffers, reply fragment lists, freelist
//! - `machine`: the state machine (`drive`)
//! - `event_loop`: accept path and readiness dispatch

pub mod connection;
pub mod event_loop;
pub mod machine;

pub use connection::{ConnPool, Connection, State};
pub use event_loop::Reactor;
pub use machine::{drive, DriveOutcome};
