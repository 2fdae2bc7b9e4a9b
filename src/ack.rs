//! Mapping from the configured acknowledgment action onto a delivery.

use crate::config::AckAction;
use crate::error::TransportResult;
use crate::transport::Delivery;

const REJECT_CONDITION: &str = "amqp:internal-error";
const REJECT_DESCRIPTION: &str = "rejected by workload driver";

/// Transport call made for one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckCall {
    Accept,
    Reject,
    Release,
    Settle,
    /// `no-ack` with auto-settle: the delivery stays unsettled.
    Nothing,
}

/// Applies `action` to `delivery` with exactly one transport call (or none
/// for `no-ack` under auto-settle).
///
/// Must be called at most once per delivery; the transport rejects a second
/// disposition.
pub fn apply(
    delivery: &mut dyn Delivery,
    action: AckAction,
    auto_settle: bool,
) -> TransportResult<AckCall> {
    match action {
        AckAction::Accept => delivery.accept().map(|()| AckCall::Accept),
        AckAction::Reject => delivery
            .reject(REJECT_CONDITION, REJECT_DESCRIPTION)
            .map(|()| AckCall::Reject),
        AckAction::Release => delivery.release().map(|()| AckCall::Release),
        AckAction::NoAck if auto_settle => Ok(AckCall::Nothing),
        AckAction::NoAck => delivery.settle().map(|()| AckCall::Settle),
    }
}

/// Per-call counters over a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckTally {
    pub accepted: u64,
    pub rejected: u64,
    pub released: u64,
    pub settled: u64,
    pub unsettled: u64,
}

impl AckTally {
    pub fn count(&mut self, call: AckCall) {
        match call {
            AckCall::Accept => self.accepted += 1,
            AckCall::Reject => self.rejected += 1,
            AckCall::Release => self.released += 1,
            AckCall::Settle => self.settled += 1,
            AckCall::Nothing => self.unsettled += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.accepted + self.rejected + self.released + self.settled + self.unsettled
    }
}
