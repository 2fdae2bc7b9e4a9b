//! In-process broker implementing the transport traits.
//!
//! Queues are keyed by address. Sessions support one declared transaction at a
//! time: transactional sends are staged until commit, and deliveries accepted
//! inside a transaction are returned to the head of their queue on rollback.
//! Faults can be injected per operation to exercise error paths.
//!
//! ```
//! use amqp_driver::message::Message;
//! use amqp_driver::transport::memory::MemoryBroker;
//! use amqp_driver::transport::{ConnectTarget, ReceiverOptions, SenderOptions, Transport};
//! use std::time::Duration;
//!
//! let broker = MemoryBroker::new();
//! let mut conn = broker.connect(&ConnectTarget::new("localhost"))?;
//! let mut sender = conn.open_sender("jobs", &SenderOptions::default())?;
//! sender.send(Message::with_body("hello"))?;
//!
//! let mut receiver = conn.open_receiver("jobs", &ReceiverOptions::default())?;
//! let delivery = receiver.receive(Some(Duration::from_millis(10)))?;
//! assert!(delivery.is_some());
//! # Ok::<(), amqp_driver::error::TransportError>(())
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::SettleMode;
use crate::error::{TransportError, TransportResult};
use crate::message::Message;
use crate::value::Value;

use super::{
    ConnectTarget, Connection, Delivery, LinkStats, Outcome, ReceiverLink, ReceiverOptions,
    SenderLink, SenderOptions, Session, Tracker, Transactional, Transport,
};

/// Operation at which an injected fault fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Connect,
    OpenSession,
    OpenLink,
    Send,
    Receive,
    Commit,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Lifecycle record kept by the broker, in the order things happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionOpened(u64),
    ConnectionClosed(u64),
    SessionBegun(u64),
    SessionEnded(u64),
    LinkAttached {
        link: u64,
        address: String,
        role: LinkRole,
    },
    LinkDetached(u64),
    TxDeclared(u64),
    TxCommitted(u64),
    TxRolledBack(u64),
    TxDiscarded(u64),
}

/// Disposition counters across all receivers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dispositions {
    pub accepted: u64,
    pub rejected: u64,
    pub released: u64,
    pub settled: u64,
}

#[derive(Clone, Debug)]
struct Stored {
    id: u64,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Stored>>,
    next_message_id: u64,
    next_object_id: u64,
    events: Vec<BrokerEvent>,
    faults: Vec<(Fault, u32)>,
    dispositions: Dispositions,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_object_id += 1;
        self.next_object_id
    }

    fn enqueue(&mut self, address: &str, message: Message) {
        self.next_message_id += 1;
        let stored = Stored {
            id: self.next_message_id,
            message,
        };
        self.queues
            .entry(address.to_string())
            .or_default()
            .push_back(stored);
    }

    fn requeue_front(&mut self, address: &str, stored: Stored) {
        self.queues
            .entry(address.to_string())
            .or_default()
            .push_front(stored);
    }

    fn trip(&mut self, fault: Fault) -> bool {
        let Some(pos) = self.faults.iter().position(|(kind, _)| *kind == fault) else {
            return false;
        };
        if self.faults[pos].1 == 0 {
            self.faults.remove(pos);
            true
        } else {
            self.faults[pos].1 -= 1;
            false
        }
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    arrived: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                arrived: Condvar::new(),
            }),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a message directly on a queue.
    pub fn enqueue(&self, address: &str, message: Message) {
        self.inner.lock().enqueue(address, message);
        self.inner.arrived.notify_all();
    }

    /// Number of messages available on a queue.
    pub fn depth(&self, address: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(address)
            .map_or(0, VecDeque::len)
    }

    /// Removes and returns every message on a queue.
    pub fn drain(&self, address: &str) -> Vec<Message> {
        self.inner
            .lock()
            .queues
            .remove(address)
            .map(|queue| queue.into_iter().map(|stored| stored.message).collect())
            .unwrap_or_default()
    }

    /// Fails the next operation of kind `fault`.
    pub fn inject(&self, fault: Fault) {
        self.inject_after(fault, 0);
    }

    /// Fails the operation of kind `fault` after `successes` successful ones.
    pub fn inject_after(&self, fault: Fault, successes: u32) {
        self.inner.lock().faults.push((fault, successes));
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.inner.lock().events.clone()
    }

    pub fn dispositions(&self) -> Dispositions {
        self.inner.lock().dispositions
    }

    fn record(&self, event: BrokerEvent) {
        self.inner.lock().events.push(event);
    }
}

impl Transport for MemoryBroker {
    fn connect(&self, target: &ConnectTarget) -> TransportResult<Box<dyn Connection>> {
        let id = {
            let mut state = self.inner.lock();
            if state.trip(Fault::Connect) {
                return Err(TransportError::Connect(format!(
                    "{}:{} refused",
                    target.host, target.port
                )));
            }
            let id = state.next_id();
            state.events.push(BrokerEvent::ConnectionOpened(id));
            id
        };
        log::debug!("memory connection {id} opened to {}:{}", target.host, target.port);
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
            implicit: Arc::new(Mutex::new(TxState::default())),
            closed: false,
        }))
    }
}

#[derive(Default)]
struct TxState {
    declared: bool,
    staged: Vec<(String, Message)>,
    accepted: Vec<(String, Stored)>,
}

fn lock_tx(tx: &Mutex<TxState>) -> MutexGuard<'_, TxState> {
    tx.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_sender_on(
    broker: &MemoryBroker,
    tx: &Arc<Mutex<TxState>>,
    address: &str,
    options: &SenderOptions,
) -> TransportResult<Box<dyn SenderLink>> {
    let id = attach(broker, address, LinkRole::Sender)?;
    Ok(Box::new(MemorySender {
        broker: broker.clone(),
        id,
        address: address.to_string(),
        tx: Arc::clone(tx),
        settle_mode: options.settle_mode,
        stats: LinkStats::default(),
        closed: false,
    }))
}

fn open_receiver_on(
    broker: &MemoryBroker,
    tx: &Arc<Mutex<TxState>>,
    address: &str,
    options: &ReceiverOptions,
) -> TransportResult<Box<dyn ReceiverLink>> {
    let selector = options.selector.as_deref().map(Selector::parse).transpose()?;
    let id = attach(broker, address, LinkRole::Receiver)?;
    Ok(Box::new(MemoryReceiver {
        broker: broker.clone(),
        id,
        address: address.to_string(),
        tx: Arc::clone(tx),
        options: options.clone(),
        selector,
        credit: options.credit,
        cursor: 0,
        held: Arc::new(Mutex::new(Held::default())),
        stats: LinkStats {
            credit: options.credit,
            ..LinkStats::default()
        },
        closed: false,
    }))
}

fn attach(broker: &MemoryBroker, address: &str, role: LinkRole) -> TransportResult<u64> {
    let mut state = broker.inner.lock();
    if state.trip(Fault::OpenLink) {
        return Err(TransportError::Link(format!("attach to '{address}' refused")));
    }
    let link = state.next_id();
    state.events.push(BrokerEvent::LinkAttached {
        link,
        address: address.to_string(),
        role,
    });
    Ok(link)
}

fn close_with_fault(broker: &MemoryBroker, closed: &mut bool) -> TransportResult<bool> {
    if *closed {
        return Ok(false);
    }
    *closed = true;
    if broker.inner.lock().trip(Fault::Close) {
        return Err(TransportError::Closed);
    }
    Ok(true)
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    implicit: Arc<Mutex<TxState>>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Connection for MemoryConnection {
    fn open_session(&mut self) -> TransportResult<Box<dyn Session>> {
        self.ensure_open()?;
        let id = {
            let mut state = self.broker.inner.lock();
            if state.trip(Fault::OpenSession) {
                return Err(TransportError::Session("begin refused".to_string()));
            }
            let id = state.next_id();
            state.events.push(BrokerEvent::SessionBegun(id));
            id
        };
        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            id,
            tx: Arc::new(Mutex::new(TxState::default())),
            closed: false,
        }))
    }

    fn open_sender(
        &mut self,
        address: &str,
        options: &SenderOptions,
    ) -> TransportResult<Box<dyn SenderLink>> {
        self.ensure_open()?;
        open_sender_on(&self.broker, &self.implicit, address, options)
    }

    fn open_receiver(
        &mut self,
        address: &str,
        options: &ReceiverOptions,
    ) -> TransportResult<Box<dyn ReceiverLink>> {
        self.ensure_open()?;
        open_receiver_on(&self.broker, &self.implicit, address, options)
    }

    fn close(&mut self) -> TransportResult<()> {
        let was_open = !self.closed;
        let result = close_with_fault(&self.broker, &mut self.closed);
        if was_open {
            self.broker.record(BrokerEvent::ConnectionClosed(self.id));
        }
        result.map(|_| ())
    }
}

struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    tx: Arc<Mutex<TxState>>,
    closed: bool,
}

impl MemorySession {
    /// Ends the declared transaction, publishing or restoring its work.
    fn discharge(&mut self, commit: bool) -> TransportResult<()> {
        let (staged, accepted) = {
            let mut tx = lock_tx(&self.tx);
            if !tx.declared {
                return Err(TransportError::Transaction(
                    "no transaction declared".to_string(),
                ));
            }
            tx.declared = false;
            (std::mem::take(&mut tx.staged), std::mem::take(&mut tx.accepted))
        };
        let mut state = self.broker.inner.lock();
        if commit {
            for (address, message) in staged {
                state.enqueue(&address, message);
            }
        } else {
            for (address, stored) in accepted.into_iter().rev() {
                state.requeue_front(&address, stored);
            }
        }
        drop(state);
        self.broker.inner.arrived.notify_all();
        Ok(())
    }
}

impl Transactional for MemorySession {
    fn begin(&mut self) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut tx = lock_tx(&self.tx);
        if tx.declared {
            return Err(TransportError::Transaction(
                "transaction already declared".to_string(),
            ));
        }
        tx.declared = true;
        drop(tx);
        self.broker.record(BrokerEvent::TxDeclared(self.id));
        Ok(())
    }

    fn commit(&mut self) -> TransportResult<()> {
        if self.broker.inner.lock().trip(Fault::Commit) {
            // A refused commit leaves the transaction rolled back.
            self.discharge(false)?;
            self.broker.record(BrokerEvent::TxRolledBack(self.id));
            return Err(TransportError::Transaction("commit refused".to_string()));
        }
        self.discharge(true)?;
        self.broker.record(BrokerEvent::TxCommitted(self.id));
        Ok(())
    }

    fn rollback(&mut self) -> TransportResult<()> {
        self.discharge(false)?;
        self.broker.record(BrokerEvent::TxRolledBack(self.id));
        Ok(())
    }
}

impl Session for MemorySession {
    fn open_sender(
        &mut self,
        address: &str,
        options: &SenderOptions,
    ) -> TransportResult<Box<dyn SenderLink>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        open_sender_on(&self.broker, &self.tx, address, options)
    }

    fn open_receiver(
        &mut self,
        address: &str,
        options: &ReceiverOptions,
    ) -> TransportResult<Box<dyn ReceiverLink>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        open_receiver_on(&self.broker, &self.tx, address, options)
    }

    fn close(&mut self) -> TransportResult<()> {
        if !self.closed && lock_tx(&self.tx).declared {
            self.discharge(false)?;
            self.broker.record(BrokerEvent::TxDiscarded(self.id));
        }
        let was_open = !self.closed;
        let result = close_with_fault(&self.broker, &mut self.closed);
        if was_open {
            self.broker.record(BrokerEvent::SessionEnded(self.id));
        }
        result.map(|_| ())
    }
}

struct MemorySender {
    broker: MemoryBroker,
    id: u64,
    address: String,
    tx: Arc<Mutex<TxState>>,
    settle_mode: SettleMode,
    stats: LinkStats,
    closed: bool,
}

impl SenderLink for MemorySender {
    fn send(&mut self, message: Message) -> TransportResult<Box<dyn Tracker>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.broker.inner.lock().trip(Fault::Send) {
            return Err(TransportError::Transfer(format!(
                "transfer to '{}' refused",
                self.address
            )));
        }
        {
            let mut tx = lock_tx(&self.tx);
            if tx.declared {
                tx.staged.push((self.address.clone(), message));
            } else {
                drop(tx);
                self.broker.inner.lock().enqueue(&self.address, message);
                self.broker.inner.arrived.notify_all();
            }
        }
        self.stats.transferred += 1;
        self.stats.settled += 1;
        let outcome = match self.settle_mode {
            SettleMode::AtMostOnce => None,
            _ => Some(Outcome::Accepted),
        };
        Ok(Box::new(MemoryTracker { outcome }))
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }

    fn close(&mut self) -> TransportResult<()> {
        let was_open = !self.closed;
        let result = close_with_fault(&self.broker, &mut self.closed);
        if was_open {
            self.broker.record(BrokerEvent::LinkDetached(self.id));
        }
        result.map(|_| ())
    }
}

struct MemoryTracker {
    /// `None` for pre-settled transfers.
    outcome: Option<Outcome>,
}

impl Tracker for MemoryTracker {
    fn await_settlement(&mut self, _timeout: Option<Duration>) -> TransportResult<Outcome> {
        Ok(self.outcome.unwrap_or(Outcome::Accepted))
    }
}

/// Deliveries dropped without settlement stay with the link until it detaches.
#[derive(Default)]
struct Held {
    detached: bool,
    messages: Vec<(String, Stored)>,
}

struct MemoryReceiver {
    broker: MemoryBroker,
    id: u64,
    address: String,
    tx: Arc<Mutex<TxState>>,
    options: ReceiverOptions,
    selector: Option<Selector>,
    credit: Option<u32>,
    cursor: u64,
    held: Arc<Mutex<Held>>,
    stats: LinkStats,
    closed: bool,
}

impl MemoryReceiver {
    fn take(&mut self, state: &mut BrokerState) -> Option<Stored> {
        let queue = state.queues.get_mut(&self.address)?;
        let selector = self.selector.as_ref();
        let matches = |stored: &Stored| selector.map_or(true, |sel| sel.matches(&stored.message));
        if self.options.browse {
            let cursor = self.cursor;
            let stored = queue
                .iter()
                .find(|stored| stored.id > cursor && matches(*stored))?
                .clone();
            self.cursor = stored.id;
            Some(stored)
        } else {
            let pos = queue.iter().position(matches)?;
            queue.remove(pos)
        }
    }

    fn release_held(&mut self) {
        let held = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            held.detached = true;
            std::mem::take(&mut held.messages)
        };
        if held.is_empty() {
            return;
        }
        let mut state = self.broker.inner.lock();
        for (address, stored) in held.into_iter().rev() {
            state.requeue_front(&address, stored);
        }
        drop(state);
        self.broker.inner.arrived.notify_all();
    }
}

impl ReceiverLink for MemoryReceiver {
    fn receive(
        &mut self,
        timeout: Option<Duration>,
    ) -> TransportResult<Option<Box<dyn Delivery>>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.credit == Some(0) {
            return match timeout {
                Some(timeout) => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
                None => Err(TransportError::Link(
                    "receive without credit would never complete".to_string(),
                )),
            };
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let inner = Arc::clone(&self.broker.inner);
        let mut state = inner.lock();
        if state.trip(Fault::Receive) {
            return Err(TransportError::Link(format!(
                "receive from '{}' failed",
                self.address
            )));
        }
        let stored = loop {
            if let Some(stored) = self.take(&mut state) {
                break stored;
            }
            state = match deadline {
                None => inner
                    .arrived
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    inner
                        .arrived
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        };
        drop(state);

        if let Some(credit) = self.credit.as_mut() {
            *credit -= 1;
        }
        self.stats.transferred += 1;
        self.stats.credit = self.credit;

        let presettled = self.options.browse || self.options.settle_mode == SettleMode::AtMostOnce;
        let mut delivery = MemoryDelivery {
            broker: self.broker.clone(),
            address: self.address.clone(),
            message: stored.message.clone(),
            stored: Some(stored),
            tx: Arc::clone(&self.tx),
            held: Arc::clone(&self.held),
            auto_settle: self.options.auto_settle,
            state: if presettled {
                DeliveryState::Settled
            } else {
                DeliveryState::Unsettled
            },
        };
        if presettled {
            self.stats.settled += 1;
        } else if self.options.auto_accept {
            delivery.accept()?;
            self.stats.settled += 1;
        }
        Ok(Some(Box::new(delivery)))
    }

    fn add_credit(&mut self, credit: u32) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Some(current) = self.credit.as_mut() {
            *current = current.saturating_add(credit);
        }
        self.stats.credit = self.credit;
        Ok(())
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }

    fn close(&mut self) -> TransportResult<()> {
        if !self.closed {
            self.release_held();
        }
        let was_open = !self.closed;
        let result = close_with_fault(&self.broker, &mut self.closed);
        if was_open {
            self.broker.record(BrokerEvent::LinkDetached(self.id));
        }
        result.map(|_| ())
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        if !self.closed {
            self.release_held();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeliveryState {
    Unsettled,
    /// Outcome applied, settlement still pending.
    Disposed,
    Settled,
}

struct MemoryDelivery {
    broker: MemoryBroker,
    address: String,
    message: Message,
    /// Broker-side copy, present until an outcome decides its fate.
    stored: Option<Stored>,
    tx: Arc<Mutex<TxState>>,
    held: Arc<Mutex<Held>>,
    auto_settle: bool,
    state: DeliveryState,
}

impl MemoryDelivery {
    fn dispose(&mut self, outcome: Outcome) -> TransportResult<()> {
        if self.state != DeliveryState::Unsettled {
            return Err(TransportError::AlreadySettled);
        }
        let stored = self.stored.take().ok_or(TransportError::AlreadySettled)?;
        match outcome {
            Outcome::Accepted => {
                let mut tx = lock_tx(&self.tx);
                if tx.declared {
                    tx.accepted.push((self.address.clone(), stored));
                }
                drop(tx);
                self.broker.inner.lock().dispositions.accepted += 1;
            }
            Outcome::Rejected => {
                self.broker.inner.lock().dispositions.rejected += 1;
            }
            Outcome::Released => {
                let mut state = self.broker.inner.lock();
                state.dispositions.released += 1;
                state.requeue_front(&self.address, stored);
                drop(state);
                self.broker.inner.arrived.notify_all();
            }
        }
        self.state = if self.auto_settle {
            DeliveryState::Settled
        } else {
            DeliveryState::Disposed
        };
        Ok(())
    }
}

impl Delivery for MemoryDelivery {
    fn message(&self) -> &Message {
        &self.message
    }

    fn is_settled(&self) -> bool {
        self.state == DeliveryState::Settled
    }

    fn accept(&mut self) -> TransportResult<()> {
        self.dispose(Outcome::Accepted)
    }

    fn reject(&mut self, condition: &str, description: &str) -> TransportResult<()> {
        log::debug!("rejecting delivery on '{}': {condition} {description}", self.address);
        self.dispose(Outcome::Rejected)
    }

    fn release(&mut self) -> TransportResult<()> {
        self.dispose(Outcome::Released)
    }

    /// Settling without an outcome consumes the message.
    fn settle(&mut self) -> TransportResult<()> {
        match self.state {
            DeliveryState::Settled => Err(TransportError::AlreadySettled),
            DeliveryState::Disposed => {
                self.state = DeliveryState::Settled;
                Ok(())
            }
            DeliveryState::Unsettled => {
                self.stored = None;
                self.state = DeliveryState::Settled;
                self.broker.inner.lock().dispositions.settled += 1;
                Ok(())
            }
        }
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if self.state != DeliveryState::Unsettled {
            return;
        }
        let Some(stored) = self.stored.take() else {
            return;
        };
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.detached {
            drop(held);
            self.broker.inner.lock().requeue_front(&self.address, stored);
            self.broker.inner.arrived.notify_all();
        } else {
            held.messages.push((self.address.clone(), stored));
        }
    }
}

/// Equality filter on an application property: `key = 'text'` or `key = 42`.
#[derive(Debug, Clone, PartialEq)]
struct Selector {
    key: String,
    value: Value,
}

impl Selector {
    fn parse(text: &str) -> TransportResult<Self> {
        let unsupported = || TransportError::NotSupported(format!("selector '{text}'"));
        let (key, value) = text.split_once('=').ok_or_else(unsupported)?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() || key.contains(char::is_whitespace) {
            return Err(unsupported());
        }
        let value = match value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
            Some(text) => Value::String(text.to_string()),
            None => match Value::infer(value) {
                Value::String(_) => return Err(unsupported()),
                other => other,
            },
        };
        Ok(Self {
            key: key.to_string(),
            value,
        })
    }

    fn matches(&self, message: &Message) -> bool {
        message.application_properties.get(&self.key) == Some(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(broker: &MemoryBroker) -> Box<dyn Connection> {
        broker
            .connect(&ConnectTarget::new("localhost"))
            .expect("connect")
    }

    fn manual_ack() -> ReceiverOptions {
        ReceiverOptions {
            auto_accept: false,
            ..ReceiverOptions::default()
        }
    }

    #[test]
    fn transactional_send_visible_only_after_commit() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker);
        let mut session = conn.open_session().expect("session");
        let mut sender = session
            .open_sender("q", &SenderOptions::default())
            .expect("sender");

        session.begin().expect("begin");
        sender.send(Message::with_body("a")).expect("send");
        assert_eq!(broker.depth("q"), 0);
        session.commit().expect("commit");
        assert_eq!(broker.depth("q"), 1);

        session.begin().expect("begin");
        sender.send(Message::with_body("b")).expect("send");
        session.rollback().expect("rollback");
        assert_eq!(broker.depth("q"), 1);
    }

    #[test]
    fn refused_commit_drops_staged_messages() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker);
        let mut session = conn.open_session().expect("session");
        let mut sender = session
            .open_sender("q", &SenderOptions::default())
            .expect("sender");

        broker.inject(Fault::Commit);
        session.begin().expect("begin");
        sender.send(Message::with_body("lost")).expect("send");
        assert!(session.commit().is_err());

        session.begin().expect("begin");
        sender.send(Message::with_body("kept")).expect("send");
        session.commit().expect("commit");
        let bodies: Vec<_> = broker.drain("q").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![Value::from("kept")]);
    }

    #[test]
    fn rollback_restores_accepted_deliveries_in_order() {
        let broker = MemoryBroker::new();
        for body in ["a", "b", "c"] {
            broker.enqueue("q", Message::with_body(body));
        }
        let mut conn = connect(&broker);
        let mut session = conn.open_session().expect("session");
        let mut receiver = session
            .open_receiver("q", &ReceiverOptions::default())
            .expect("receiver");

        session.begin().expect("begin");
        for _ in 0..2 {
            receiver
                .receive(Some(Duration::ZERO))
                .expect("receive")
                .expect("delivery");
        }
        session.rollback().expect("rollback");

        let bodies: Vec<_> = broker.drain("q").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
    }

    #[test]
    fn double_disposition_is_rejected() {
        let broker = MemoryBroker::new();
        broker.enqueue("q", Message::with_body("x"));
        let mut conn = connect(&broker);
        let mut receiver = conn.open_receiver("q", &manual_ack()).expect("receiver");
        let mut delivery = receiver
            .receive(Some(Duration::ZERO))
            .expect("receive")
            .expect("delivery");
        delivery.reject("amqp:internal-error", "test").expect("reject");
        assert_eq!(delivery.release(), Err(TransportError::AlreadySettled));
        assert_eq!(broker.dispositions().rejected, 1);
    }

    #[test]
    fn release_requeues_and_unsettled_returns_on_detach() {
        let broker = MemoryBroker::new();
        broker.enqueue("q", Message::with_body("x"));
        broker.enqueue("q", Message::with_body("y"));
        let mut conn = connect(&broker);
        let mut receiver = conn.open_receiver("q", &manual_ack()).expect("receiver");

        let mut first = receiver
            .receive(Some(Duration::ZERO))
            .expect("receive")
            .expect("delivery");
        first.release().expect("release");
        assert_eq!(broker.depth("q"), 2);

        let held = receiver
            .receive(Some(Duration::ZERO))
            .expect("receive")
            .expect("delivery");
        drop(held);
        assert_eq!(broker.depth("q"), 1);
        receiver.close().expect("close");
        assert_eq!(broker.depth("q"), 2);
    }

    #[test]
    fn receive_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker);
        let mut receiver = conn
            .open_receiver("q", &ReceiverOptions::default())
            .expect("receiver");
        let start = Instant::now();
        let delivery = receiver
            .receive(Some(Duration::from_millis(20)))
            .expect("receive");
        assert!(delivery.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn browse_does_not_consume() {
        let broker = MemoryBroker::new();
        broker.enqueue("q", Message::with_body("x"));
        broker.enqueue("q", Message::with_body("y"));
        let mut conn = connect(&broker);
        let options = ReceiverOptions {
            browse: true,
            ..ReceiverOptions::default()
        };
        let mut receiver = conn.open_receiver("q", &options).expect("receiver");
        let mut seen = 0;
        while let Some(delivery) = receiver.receive(Some(Duration::ZERO)).expect("receive") {
            assert!(delivery.is_settled());
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert_eq!(broker.depth("q"), 2);
    }

    #[test]
    fn selector_filters_by_property() {
        let broker = MemoryBroker::new();
        let mut red = Message::with_body("red");
        red.application_properties
            .insert("color".into(), Value::from("red"));
        broker.enqueue("q", Message::with_body("plain"));
        broker.enqueue("q", red);
        let mut conn = connect(&broker);
        let options = ReceiverOptions {
            selector: Some("color = 'red'".into()),
            ..ReceiverOptions::default()
        };
        let mut receiver = conn.open_receiver("q", &options).expect("receiver");
        let delivery = receiver
            .receive(Some(Duration::ZERO))
            .expect("receive")
            .expect("delivery");
        assert_eq!(delivery.message().body, Value::from("red"));
        assert!(receiver.receive(Some(Duration::ZERO)).expect("receive").is_none());

        let bad = ReceiverOptions {
            selector: Some("color LIKE 'r%'".into()),
            ..ReceiverOptions::default()
        };
        assert!(matches!(
            conn.open_receiver("q", &bad),
            Err(TransportError::NotSupported(_))
        ));
    }

    #[test]
    fn credit_limits_deliveries() {
        let broker = MemoryBroker::new();
        for _ in 0..3 {
            broker.enqueue("q", Message::with_body("x"));
        }
        let mut conn = connect(&broker);
        let options = ReceiverOptions {
            credit: Some(1),
            ..ReceiverOptions::default()
        };
        let mut receiver = conn.open_receiver("q", &options).expect("receiver");
        assert!(receiver.receive(Some(Duration::ZERO)).expect("receive").is_some());
        assert!(receiver.receive(Some(Duration::ZERO)).expect("receive").is_none());
        receiver.add_credit(2).expect("credit");
        assert!(receiver.receive(Some(Duration::ZERO)).expect("receive").is_some());
        assert_eq!(receiver.stats().credit, Some(1));
    }

    #[test]
    fn injected_faults_fire_once() {
        let broker = MemoryBroker::new();
        broker.inject(Fault::Connect);
        assert!(broker.connect(&ConnectTarget::new("h")).is_err());
        assert!(broker.connect(&ConnectTarget::new("h")).is_ok());

        broker.inject_after(Fault::Send, 1);
        let mut conn = connect(&broker);
        let mut sender = conn
            .open_sender("q", &SenderOptions::default())
            .expect("sender");
        assert!(sender.send(Message::default()).is_ok());
        assert!(sender.send(Message::default()).is_err());
        assert!(sender.send(Message::default()).is_ok());
    }

    #[test]
    fn session_close_discards_open_transaction() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker);
        let mut session = conn.open_session().expect("session");
        let mut sender = session
            .open_sender("q", &SenderOptions::default())
            .expect("sender");
        session.begin().expect("begin");
        sender.send(Message::default()).expect("send");
        sender.close().expect("close sender");
        session.close().expect("close session");
        assert_eq!(broker.depth("q"), 0);
        assert!(broker
            .events()
            .iter()
            .any(|event| matches!(event, BrokerEvent::TxDiscarded(_))));
    }
}
