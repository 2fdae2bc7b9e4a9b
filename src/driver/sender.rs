use std::time::Duration;

use super::{with_resources, MessageLog, RoleReport};
use crate::checkpoint::{CheckpointRecorder, Phase};
use crate::clock::Clock;
use crate::config::{RunConfig, SettleMode};
use crate::engine::{BatchEngine, Exchange, Progress};
use crate::error::Result;
use crate::message::MessageFactory;
use crate::transport::{Outcome, SenderLink, SenderOptions, Transport};

struct SenderExchange<'a> {
    link: &'a mut dyn SenderLink,
    factory: MessageFactory,
    sink: &'a mut dyn MessageLog,
    /// Wait for each transfer to settle before producing the next.
    await_settlement: bool,
    send_timeout: Option<Duration>,
}

impl Exchange for SenderExchange<'_> {
    fn exchange(&mut self, index: u64) -> Result<Progress> {
        let message = self.factory.create(index);
        self.sink.on_message(&message);
        let mut tracker = self.link.send(message)?;
        if self.await_settlement {
            match tracker.await_settlement(self.send_timeout)? {
                Outcome::Accepted => {}
                outcome => log::warn!("message {index} settled as {outcome:?}"),
            }
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

        let options = SenderOptions {
            settle_mode: config.settle_mode,
            send_timeout: config.send_timeout,
        };
        let link = if config.is_transactional() {
            session.open_sender(&config.address, &options)?
        } else {
            connection.open_sender(&config.address, &options)?
        };
        let slot = res.senders.len();
        res.senders.push(link);
        recorder.record(Phase::LinkReady);
        log::info!("sender attached to '{}'", config.address);

        let factory = MessageFactory::new(&config.message);
        report.content_size = factory.content_len();
        let mut exchange = SenderExchange {
            link: res.senders[slot].as_mut(),
            factory,
            sink,
            await_settlement: !config.is_transactional()
                && config.settle_mode == SettleMode::AtLeastOnce,
            send_timeout: config.send_timeout,
        };

        let mut engine = BatchEngine::new(config, recorder);
        let result = engine.run(&mut exchange, session.as_mut());
        report.engine = engine.report();
        report.endpoint = Some(exchange.link.stats());
        result.map(|_| ())
    })
}
