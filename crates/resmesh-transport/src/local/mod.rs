//! In-process message bus.
//!
//! This module provides a bus living inside the current process, with the
//! subject semantics of a NATS server.

mod bus;
mod subject;

pub use bus::{DEFAULT_CAPACITY, INBOX_PREFIX, LocalBus};
pub use subject::subject_matches;
