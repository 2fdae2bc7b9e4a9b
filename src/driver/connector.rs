//! Connection-storm role: opens `count` independent connections, each with
//! the objects selected by the object-control letters, then closes them.

use super::{Resources, RoleReport};
use crate::checkpoint::{CheckpointRecorder, Phase};
use crate::clock::Clock;
use crate::config::RunConfig;
use crate::error::Result;
use crate::transport::{ReceiverOptions, SenderOptions, Transport};

pub(super) fn run<C: Clock>(
    config: &RunConfig,
    transport: &dyn Transport,
    recorder: &mut CheckpointRecorder<C>,
    report: &mut RoleReport,
) -> Result<()> {
    let mut sets = Vec::new();
    if let Err(err) = open_all(config, transport, recorder, report, &mut sets) {
        for set in sets.iter_mut().rev() {
            set.abort();
        }
        return Err(err);
    }

    if !config.close_sleep.is_zero() {
        std::thread::sleep(config.close_sleep);
    }
    let mut first_error = None;
    for set in sets.iter_mut().rev() {
        if let Err(err) = set.close() {
            log::warn!("connector close: {err}");
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn open_all<C: Clock>(
    config: &RunConfig,
    transport: &dyn Transport,
    recorder: &mut CheckpointRecorder<C>,
    report: &mut RoleReport,
    sets: &mut Vec<Resources>,
) -> Result<()> {
    if !config.object_control.wants_connections() {
        log::info!("object control selects nothing to open");
        return Ok(());
    }
    let connections = config.count.max(1);
    for _ in 0..connections {
        let mut set = Resources::default();
        let opened = open_set(config, transport, recorder, &mut set);
        sets.push(set);
        opened?;
        recorder.record(Phase::Message);
        report.engine.processed += 1;
    }
    log::info!("connector opened {connections} connections");
    Ok(())
}

fn open_set<C: Clock>(
    config: &RunConfig,
    transport: &dyn Transport,
    recorder: &mut CheckpointRecorder<C>,
    set: &mut Resources,
) -> Result<()> {
    let control = config.object_control;
    let connection = set.connection.insert(transport.connect(&config.target)?);
    recorder.record(Phase::Connected);
    if !control.wants_sessions() {
        return Ok(());
    }

    let session = set.session.insert(connection.open_session()?);
    recorder.record(Phase::SessionOpen);
    if control.sender {
        let options = SenderOptions {
            settle_mode: config.settle_mode,
            send_timeout: config.send_timeout,
        };
        set.senders.push(session.open_sender(&config.address, &options)?);
    }
    if control.receiver {
        let options = ReceiverOptions {
            settle_mode: config.settle_mode,
            ..ReceiverOptions::default()
        };
        set.receivers.push(session.open_receiver(&config.address, &options)?);
    }
    if control.sender || control.receiver {
        recorder.record(Phase::LinkReady);
    }
    Ok(())
}
