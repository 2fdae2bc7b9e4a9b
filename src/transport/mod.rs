//! Blocking AMQP 1.0 transport abstraction.
//!
//! The engine and drivers only talk to these traits. A wire implementation
//! lives outside this crate; [`memory`] provides an in-process broker with
//! the same semantics for tests, benchmarks and loopback runs.

pub mod memory;

use std::time::Duration;

use crate::config::SettleMode;
use crate::error::TransportResult;
use crate::message::Message;

/// Where a connection goes and who it authenticates as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ConnectTarget {
    pub const DEFAULT_PORT: u16 = 5672;

    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            user: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderOptions {
    pub settle_mode: SettleMode,
    pub send_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    pub settle_mode: SettleMode,
    /// Accept every delivery as it is handed out.
    pub auto_accept: bool,
    /// Settle automatically once a disposition is applied.
    pub auto_settle: bool,
    /// Non-destructive (copy) distribution.
    pub browse: bool,
    pub selector: Option<String>,
    /// `None` keeps an unbounded window; `Some(n)` starts with `n` credits and
    /// only grows through [`ReceiverLink::add_credit`].
    pub credit: Option<u32>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            settle_mode: SettleMode::AtLeastOnce,
            auto_accept: true,
            auto_settle: true,
            browse: false,
            selector: None,
            credit: None,
        }
    }
}

/// Remote outcome of a settled transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
}

/// Counters exposed for the `endpoints` statistics category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub transferred: u64,
    pub settled: u64,
    pub credit: Option<u32>,
}

pub trait Transport {
    fn connect(&self, target: &ConnectTarget) -> TransportResult<Box<dyn Connection>>;
}

pub trait Connection: Send {
    fn open_session(&mut self) -> TransportResult<Box<dyn Session>>;
    /// Opens a sender on the connection's implicit, non-transactional session.
    fn open_sender(
        &mut self,
        address: &str,
        options: &SenderOptions,
    ) -> TransportResult<Box<dyn SenderLink>>;
    fn open_receiver(
        &mut self,
        address: &str,
        options: &ReceiverOptions,
    ) -> TransportResult<Box<dyn ReceiverLink>>;
    fn close(&mut self) -> TransportResult<()>;
}

/// Local transaction control on a session. At most one transaction is
/// declared at a time.
pub trait Transactional {
    fn begin(&mut self) -> TransportResult<()>;
    fn commit(&mut self) -> TransportResult<()>;
    fn rollback(&mut self) -> TransportResult<()>;
}

pub trait Session: Transactional + Send {
    fn open_sender(
        &mut self,
        address: &str,
        options: &SenderOptions,
    ) -> TransportResult<Box<dyn SenderLink>>;
    fn open_receiver(
        &mut self,
        address: &str,
        options: &ReceiverOptions,
    ) -> TransportResult<Box<dyn ReceiverLink>>;
    fn close(&mut self) -> TransportResult<()>;
}

pub trait SenderLink: Send {
    fn send(&mut self, message: Message) -> TransportResult<Box<dyn Tracker>>;
    fn stats(&self) -> LinkStats;
    fn close(&mut self) -> TransportResult<()>;
}

/// Handle on an in-flight send.
pub trait Tracker {
    /// Blocks until the transfer is settled; `None` waits forever.
    fn await_settlement(&mut self, timeout: Option<Duration>) -> TransportResult<Outcome>;
}

pub trait ReceiverLink: Send {
    /// Waits for the next delivery; `None` timeout blocks until one arrives.
    /// Returns `Ok(None)` when the timeout elapses.
    fn receive(&mut self, timeout: Option<Duration>)
        -> TransportResult<Option<Box<dyn Delivery>>>;
    fn add_credit(&mut self, credit: u32) -> TransportResult<()>;
    fn stats(&self) -> LinkStats;
    fn close(&mut self) -> TransportResult<()>;
}

/// One received transfer, owned by its link until settled.
pub trait Delivery: Send {
    fn message(&self) -> &Message;
    fn is_settled(&self) -> bool;
    fn accept(&mut self) -> TransportResult<()>;
    fn reject(&mut self, condition: &str, description: &str) -> TransportResult<()>;
    fn release(&mut self) -> TransportResult<()>;
    /// Settles without a terminal outcome.
    fn settle(&mut self) -> TransportResult<()>;
}
