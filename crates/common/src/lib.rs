//! Common utilities for hso-modem
//!
//! This crate provides the ambient services shared by the driver crates:
//! error handling, tracing setup, the bounded event bridge used between
//! worker threads and the Tokio runtime, and deferred work queues.

pub mod channel;
pub mod error;
pub mod logging;
pub mod workqueue;

pub use channel::{EventReceiver, EventSender, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use workqueue::{Job, ThreadWorkQueue, TokioWorkQueue, WorkQueue};
