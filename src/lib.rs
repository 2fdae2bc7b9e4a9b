//! Workload driver for AMQP 1.0 message buses.
//!
//! A run opens a connection, session and link through a [`transport`],
//! then hands control to the [`engine`], which streams messages under the
//! configured pacing, batching, transaction and acknowledgment policies
//! while the [`checkpoint`] recorder captures timing for the final report.

pub mod ack;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod format;
pub mod message;
pub mod pacing;
pub mod transport;
pub mod value;

pub use config::RunConfig;
pub use driver::{run, MessageLog, NoopLog, RunResult};
pub use engine::{BatchEngine, EngineReport, Exchange, Progress};
pub use error::{Error, ExitStatus, Result};
pub use transport::memory::MemoryBroker;
