//! Role drivers: own the connection/session/link lifetimes around one engine
//! run and turn its outcome into a [`RunResult`].

mod connector;
mod receiver;
mod sender;

use crate::ack::AckTally;
use crate::checkpoint::{CheckpointRecorder, Phase, ReportMode, StatsSummary};
use crate::clock::{Clock, QuantaClock};
use crate::config::{Role, RunConfig};
use crate::engine::EngineReport;
use crate::error::{Error, ExitStatus, Result, TransportError};
use crate::message::Message;
use crate::transport::{Connection, LinkStats, ReceiverLink, SenderLink, Session, Transport};

/// Receives every message the driver sends or receives.
pub trait MessageLog {
    fn on_message(&mut self, message: &Message);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl MessageLog for NoopLog {
    fn on_message(&mut self, _message: &Message) {}
}

/// Classified outcome of one run.
#[derive(Debug)]
pub struct RunResult {
    pub status: ExitStatus,
    pub processed: u64,
    pub stats: Option<StatsSummary>,
    pub engine: EngineReport,
    pub acks: AckTally,
    /// Link statistics snapshot, present when the `endpoints` category is on.
    pub endpoint: Option<LinkStats>,
    pub error: Option<Error>,
}

impl RunResult {
    fn rejected(error: Error) -> Self {
        Self {
            status: error.exit_status(),
            processed: 0,
            stats: None,
            engine: EngineReport::default(),
            acks: AckTally::default(),
            endpoint: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExitStatus::Success
    }
}

/// Progress collected by a role, kept even when the role fails.
#[derive(Debug, Default)]
struct RoleReport {
    engine: EngineReport,
    acks: AckTally,
    endpoint: Option<LinkStats>,
    /// Body size used for throughput.
    content_size: usize,
}

/// Runs the configured role against `transport` with the default clock.
pub fn run(config: &RunConfig, transport: &dyn Transport, sink: &mut dyn MessageLog) -> RunResult {
    run_with_clock(config, transport, sink, QuantaClock::new())
}

pub fn run_with_clock<C: Clock>(
    config: &RunConfig,
    transport: &dyn Transport,
    sink: &mut dyn MessageLog,
    clock: C,
) -> RunResult {
    if let Err(err) = config.validate().and_then(|()| config.check_supported()) {
        log::error!("{err}");
        return RunResult::rejected(err);
    }

    let mut recorder = CheckpointRecorder::with_clock(config.stats, clock);
    let mut report = RoleReport::default();
    recorder.record(Phase::Begin);
    log::info!("starting {:?} on '{}'", config.role, config.address);

    let result = match config.role {
        Role::Sender => sender::run(config, transport, &mut recorder, sink, &mut report),
        Role::Receiver => receiver::run(config, transport, &mut recorder, sink, &mut report),
        Role::Connector => connector::run(config, transport, &mut recorder, &mut report),
    };
    recorder.record(Phase::End);

    let (status, mode, error) = match result {
        Ok(()) => (ExitStatus::Success, ReportMode::Full, None),
        Err(err) => {
            log::error!("run failed after {} messages: {err}", report.engine.processed);
            (err.exit_status(), ReportMode::Partial, Some(err))
        }
    };
    let processed = report.engine.processed;
    let endpoint = report.endpoint.filter(|_| recorder.endpoints_enabled());
    if let Some(stats) = endpoint {
        log::info!(
            "endpoint '{}': transferred={} settled={} credit={:?}",
            config.address,
            stats.transferred,
            stats.settled,
            stats.credit
        );
    }

    RunResult {
        status,
        processed,
        stats: recorder.report(processed, report.content_size, mode),
        engine: report.engine,
        acks: report.acks,
        endpoint,
        error,
    }
}

/// Transport objects owned by one role, closed in reverse creation order.
#[derive(Default)]
struct Resources {
    connection: Option<Box<dyn Connection>>,
    session: Option<Box<dyn Session>>,
    senders: Vec<Box<dyn SenderLink>>,
    receivers: Vec<Box<dyn ReceiverLink>>,
}

impl Resources {
    fn close_all(&mut self) -> Vec<TransportError> {
        let mut errors = Vec::new();
        for mut receiver in self.receivers.drain(..).rev() {
            errors.extend(receiver.close().err());
        }
        for mut sender in self.senders.drain(..).rev() {
            errors.extend(sender.close().err());
        }
        if let Some(mut session) = self.session.take() {
            errors.extend(session.close().err());
        }
        if let Some(mut connection) = self.connection.take() {
            errors.extend(connection.close().err());
        }
        errors
    }

    /// Orderly close; the first failure is returned after everything was tried.
    fn close(&mut self) -> Result<()> {
        match self.close_all().into_iter().next() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Best-effort close after a failure.
    fn abort(&mut self) {
        for err in self.close_all() {
            log::warn!("teardown: {err}");
        }
    }
}

/// Runs `body` over fresh resources, then closes them: orderly after
/// `close_sleep` on success, best-effort on failure.
fn with_resources<F>(config: &RunConfig, body: F) -> Result<()>
where
    F: FnOnce(&mut Resources) -> Result<()>,
{
    let mut resources = Resources::default();
    match body(&mut resources) {
        Ok(()) => {
            if !config.close_sleep.is_zero() {
                log::debug!("sleeping {:?} before close", config.close_sleep);
                std::thread::sleep(config.close_sleep);
            }
            resources.close()
        }
        Err(err) => {
            resources.abort();
            Err(err)
        }
    }
}
