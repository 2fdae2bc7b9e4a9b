use std::collections::HashMap;
use std::time::Duration;

use super::{with_resources, MessageLog, RoleReport};
use crate::ack::{self, AckTally};
use crate::checkpoint::{CheckpointRecorder, Phase};
use crate::clock::Clock;
use crate::config::{AckAction, ReceiveTimeout, RunConfig};
use crate::engine::{BatchEngine, Exchange, Progress};
use crate::error::Result;
use crate::message::Message;
use crate::transport::{
    Connection, ReceiverLink, ReceiverOptions, SenderLink, SenderOptions, Transport,
};

/// Manually granted link credit.
#[derive(Debug, Clone, Copy)]
struct Credit {
    capacity: u32,
    outstanding: u32,
}

/// Forwards received messages to their `reply_to` address, one sender per
/// address opened on demand.
struct ReplyRouter<'a> {
    connection: &'a mut dyn Connection,
    senders: &'a mut Vec<Box<dyn SenderLink>>,
    by_address: HashMap<String, usize>,
    options: SenderOptions,
}

impl ReplyRouter<'_> {
    fn forward(&mut self, message: &Message) -> Result<()> {
        let Some(address) = message.properties.reply_to.as_deref() else {
            return Ok(());
        };
        let slot = match self.by_address.get(address) {
            Some(&slot) => slot,
            None => {
                let link = self.connection.open_sender(address, &self.options)?;
                log::debug!("opened reply sender for '{address}'");
                self.senders.push(link);
                let slot = self.senders.len() - 1;
                self.by_address.insert(address.to_string(), slot);
                slot
            }
        };
        let mut reply = message.clone();
        reply.properties.to = Some(address.to_string());
        reply.properties.reply_to = None;
        self.senders[slot].send(reply)?;
        Ok(())
    }
}

struct ReceiverExchange<'a> {
    link: &'a mut dyn ReceiverLink,
    sink: &'a mut dyn MessageLog,
    /// `None` blocks until a delivery arrives.
    timeout: Option<Duration>,
    ack_action: Option<AckAction>,
    auto_settle: bool,
    acks: AckTally,
    credit: Option<Credit>,
    replies: Option<ReplyRouter<'a>>,
    last_size: usize,
}

impl Exchange for ReceiverExchange<'_> {
    fn exchange(&mut self, _index: u64) -> Result<Progress> {
        if let Some(credit) = self.credit.as_mut().filter(|credit| credit.outstanding == 0) {
            self.link.add_credit(credit.capacity)?;
            credit.outstanding = credit.capacity;
        }

        let Some(mut delivery) = self.link.receive(self.timeout)? else {
            log::debug!("no message within {:?}", self.timeout);
            return Ok(Progress::Idle);
        };
        if let Some(credit) = self.credit.as_mut() {
            credit.outstanding = credit.outstanding.saturating_sub(1);
        }

        let message = delivery.message();
        self.last_size = message.body_len();
        self.sink.on_message(message);
        if let Some(replies) = self.replies.as_mut() {
            replies.forward(message)?;
        }

        if let Some(action) = self.ack_action {
            let call = ack::apply(delivery.as_mut(), action, self.auto_settle)?;
            self.acks.count(call);
        }
        Ok(Progress::Transferred)
    }
}

pub(super) fn run<C: Clock>(
    config: &RunConfig,
    transport: &dyn Transport,
    recorder: &mut CheckpointRecorder<C>,
    sink: &mut dyn MessageLog,
    report: &mut RoleReport,
) -> Result<()> {
    with_resources(config, |res| {
        let connection = res.connection.insert(transport.connect(&config.target)?);
        recorder.record(Phase::Connected);
        let session = res.session.insert(connection.open_session()?);
        recorder.record(Phase::SessionOpen);

        let options = ReceiverOptions {
            settle_mode: config.settle_mode,
            auto_accept: config.ack_action.is_none(),
            auto_settle: config.auto_settle,
            browse: config.browse,
            selector: config.selector.clone(),
            credit: config.recv_credit,
        };
        let link = if config.is_transactional() {
            session.open_receiver(&config.address, &options)?
        } else {
            connection.open_receiver(&config.address, &options)?
        };
        let slot = res.receivers.len();
        res.receivers.push(link);
        recorder.record(Phase::LinkReady);
        log::info!("receiver attached to '{}'", config.address);

        let replies = if config.process_reply_to {
            Some(ReplyRouter {
                connection: connection.as_mut(),
                senders: &mut res.senders,
                by_address: HashMap::new(),
                options: SenderOptions {
                    settle_mode: config.settle_mode,
                    send_timeout: config.send_timeout,
                },
            })
        } else {
            None
        };
        let mut exchange = ReceiverExchange {
            link: res.receivers[slot].as_mut(),
            sink,
            timeout: match config.recv_timeout {
                ReceiveTimeout::After(timeout) => Some(timeout),
                ReceiveTimeout::Infinite => None,
            },
            ack_action: config.ack_action,
            auto_settle: config.auto_settle,
            acks: AckTally::default(),
            credit: config.recv_credit.map(|capacity| Credit {
                capacity,
                outstanding: capacity,
            }),
            replies,
            last_size: 0,
        };

        let mut engine = BatchEngine::new(config, recorder);
        let result = engine.run(&mut exchange, session.as_mut());
        report.engine = engine.report();
        report.acks = exchange.acks;
        report.content_size = exchange.last_size;
        report.endpoint = Some(exchange.link.stats());
        result.map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::config::Role;
    use crate::driver::{run_with_clock, NoopLog};
    use crate::transport::memory::MemoryBroker;
    use crate::value::Value;

    fn receiver(count: u64) -> RunConfig {
        RunConfig {
            role: Role::Receiver,
            address: "inbox".into(),
            count,
            recv_timeout: ReceiveTimeout::After(Duration::from_millis(20)),
            ..RunConfig::default()
        }
    }

    fn fill(broker: &MemoryBroker, n: usize) {
        for i in 0..n {
            broker.enqueue("inbox", Message::with_body(format!("m{i}")));
        }
    }

    #[test]
    fn release_puts_every_message_back() {
        let broker = MemoryBroker::new();
        fill(&broker, 3);
        let config = RunConfig {
            ack_action: Some(AckAction::Release),
            ..receiver(3)
        };
        let result = run_with_clock(&config, &broker, &mut NoopLog, MonotonicClock::new());
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.acks.released, 3);
        assert_eq!(broker.dispositions().released, 3);
        assert_eq!(broker.depth("inbox"), 3);
    }

    #[test]
    fn unset_action_leaves_acknowledgment_to_the_link() {
        let broker = MemoryBroker::new();
        fill(&broker, 3);
        let config = receiver(3);
        assert!(config.ack_action.is_none());
        let result = run_with_clock(&config, &broker, &mut NoopLog, MonotonicClock::new());
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.processed, 3);
        assert_eq!(result.acks.total(), 0);

        let dispositions = broker.dispositions();
        assert_eq!(dispositions.accepted, 3);
        assert_eq!(dispositions.rejected + dispositions.released + dispositions.settled, 0);
        assert_eq!(broker.depth("inbox"), 0);
    }

    #[test]
    fn small_credit_is_regranted() {
        let broker = MemoryBroker::new();
        fill(&broker, 5);
        let config = RunConfig {
            recv_credit: Some(2),
            ..receiver(5)
        };
        let result = run_with_clock(&config, &broker, &mut NoopLog, MonotonicClock::new());
        assert_eq!(result.processed, 5);
        assert_eq!(broker.depth("inbox"), 0);
    }

    #[test]
    fn reply_to_is_forwarded() {
        let broker = MemoryBroker::new();
        let mut request = Message::with_body("ping");
        request.properties.reply_to = Some("replies".into());
        broker.enqueue("inbox", request);
        broker.enqueue("inbox", Message::with_body("no reply wanted"));

        let config = RunConfig {
            process_reply_to: true,
            ..receiver(2)
        };
        let result = run_with_clock(&config, &broker, &mut NoopLog, MonotonicClock::new());
        assert!(result.is_success(), "{:?}", result.error);

        let replies = broker.drain("replies");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, Value::from("ping"));
        assert_eq!(replies[0].properties.to.as_deref(), Some("replies"));
    }
}
