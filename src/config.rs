//! Run configuration.
//!
//! A [`RunConfig`] is assembled once (by the CLI or a test), validated, and
//! then only ever borrowed by the engine and drivers.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::MessageOptions;
use crate::transport::ConnectTarget;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Sender,
    Receiver,
    Connector,
}

/// Outcome applied to a transaction boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TxAction {
    #[default]
    Commit,
    Rollback,
}

impl FromStr for TxAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "commit" => Ok(TxAction::Commit),
            "rollback" => Ok(TxAction::Rollback),
            other => Err(Error::argument(format!("unknown transaction action '{other}'"))),
        }
    }
}

/// Disposition applied to each received delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckAction {
    Accept,
    Reject,
    Release,
    NoAck,
}

impl FromStr for AckAction {
    type Err = Error;

    /// Unknown non-empty values map to `Accept`.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" => Err(Error::argument("empty acknowledgment action")),
            "reject" => Ok(AckAction::Reject),
            "release" => Ok(AckAction::Release),
            "no-ack" => Ok(AckAction::NoAck),
            _ => Ok(AckAction::Accept),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SettleMode {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl FromStr for SettleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "at-most-once" => Ok(SettleMode::AtMostOnce),
            "at-least-once" => Ok(SettleMode::AtLeastOnce),
            "exactly-once" => Ok(SettleMode::ExactlyOnce),
            other => Err(Error::argument(format!("unknown settlement mode '{other}'"))),
        }
    }
}

/// Where in the per-message cycle duration pacing sleeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DurationMode {
    BeforeSend,
    #[default]
    AfterSendBeforeTxAction,
    AfterSendAfterTxAction,
}

impl FromStr for DurationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "before-send" => Ok(DurationMode::BeforeSend),
            "after-send-before-tx-action" => Ok(DurationMode::AfterSendBeforeTxAction),
            "after-send-after-tx-action" => Ok(DurationMode::AfterSendAfterTxAction),
            other => Err(Error::argument(format!("unknown duration mode '{other}'"))),
        }
    }
}

/// How long a single receive may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveTimeout {
    After(Duration),
    /// Poll forever; an empty poll is never treated as end of data.
    Infinite,
}

impl Default for ReceiveTimeout {
    fn default() -> Self {
        ReceiveTimeout::After(Duration::ZERO)
    }
}

/// Statistics categories requested by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StatsCategories {
    pub stats: bool,
    pub endpoints: bool,
}

impl StatsCategories {
    pub fn all() -> Self {
        Self {
            stats: true,
            endpoints: true,
        }
    }
}

impl FromStr for StatsCategories {
    type Err = Error;

    /// Parses a comma separated list such as `stats,endpoints`.
    fn from_str(s: &str) -> Result<Self> {
        let mut categories = StatsCategories::default();
        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            match item {
                "stats" => categories.stats = true,
                "endpoints" => categories.endpoints = true,
                "none" => {}
                other => return Err(Error::argument(format!("unknown stats category '{other}'"))),
            }
        }
        Ok(categories)
    }
}

/// Which objects the connector role opens per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectControl {
    pub connection: bool,
    pub session: bool,
    pub sender: bool,
    pub receiver: bool,
}

impl Default for ObjectControl {
    fn default() -> Self {
        Self {
            connection: true,
            session: false,
            sender: false,
            receiver: false,
        }
    }
}

impl ObjectControl {
    pub fn wants_connections(&self) -> bool {
        self.connection || self.wants_sessions()
    }

    pub fn wants_sessions(&self) -> bool {
        self.session || self.sender || self.receiver
    }
}

impl FromStr for ObjectControl {
    type Err = Error;

    /// Parses the `CESR` letter set (connection, session, sender, receiver).
    fn from_str(s: &str) -> Result<Self> {
        let mut control = ObjectControl {
            connection: false,
            session: false,
            sender: false,
            receiver: false,
        };
        for letter in s.chars() {
            match letter {
                'C' => control.connection = true,
                'E' => control.session = true,
                'S' => control.sender = true,
                'R' => control.receiver = true,
                other => {
                    return Err(Error::argument(format!(
                        "unknown object control letter '{other}'"
                    )))
                }
            }
        }
        Ok(control)
    }
}

/// Immutable configuration for one invocation.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub role: Role,
    /// Broker to connect to.
    pub target: ConnectTarget,
    pub address: String,
    /// Target message count; `0` runs unbounded.
    pub count: u64,
    /// Messages per transaction; `0` disables batching.
    pub tx_size: u32,
    pub tx_action: TxAction,
    /// Outcome of the final (tail) boundary.
    pub tx_final_action: Option<TxAction>,
    pub ack_action: Option<AckAction>,
    pub settle_mode: SettleMode,
    pub auto_settle: bool,
    pub duration: Duration,
    pub duration_mode: DurationMode,
    pub recv_timeout: ReceiveTimeout,
    /// Settlement wait bound for sends; `None` waits forever.
    pub send_timeout: Option<Duration>,
    /// Receive link capacity; `None` leaves credit to the transport.
    pub recv_credit: Option<u32>,
    pub stats: StatsCategories,
    pub close_sleep: Duration,
    pub browse: bool,
    pub selector: Option<String>,
    pub process_reply_to: bool,
    pub listener: bool,
    pub object_control: ObjectControl,
    pub message: MessageOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            target: ConnectTarget::new("localhost"),
            address: String::new(),
            count: 1,
            tx_size: 0,
            tx_action: TxAction::default(),
            tx_final_action: None,
            ack_action: None,
            settle_mode: SettleMode::default(),
            auto_settle: true,
            duration: Duration::ZERO,
            duration_mode: DurationMode::default(),
            recv_timeout: ReceiveTimeout::default(),
            send_timeout: None,
            recv_credit: None,
            stats: StatsCategories::default(),
            close_sleep: Duration::ZERO,
            browse: false,
            selector: None,
            process_reply_to: false,
            listener: false,
            object_control: ObjectControl::default(),
            message: MessageOptions::default(),
        }
    }
}

impl RunConfig {
    /// Transactions are used when batching or when a final outcome is requested.
    pub fn is_transactional(&self) -> bool {
        self.tx_size > 0 || self.tx_final_action.is_some()
    }

    /// Rejects malformed combinations before any transport resource exists.
    pub fn validate(&self) -> Result<()> {
        let needs_address = match self.role {
            Role::Connector => self.object_control.sender || self.object_control.receiver,
            Role::Sender | Role::Receiver => true,
        };
        if needs_address && self.address.is_empty() {
            return Err(Error::argument("an address is required"));
        }
        if self.recv_credit == Some(0) {
            return Err(Error::argument("receive credit must be positive"));
        }
        if self.role == Role::Receiver && self.ack_action.is_some() {
            if self.browse {
                return Err(Error::argument(
                    "browsed deliveries cannot be acknowledged",
                ));
            }
            if self.settle_mode == SettleMode::AtMostOnce {
                return Err(Error::argument(
                    "acknowledgment actions require at-least-once settlement",
                ));
            }
        }
        if self.message.priority.is_some_and(|priority| priority > 9) {
            return Err(Error::argument("priority must be within 0..=9"));
        }
        Ok(())
    }

    /// Rejects features the driver cannot provide.
    pub fn check_supported(&self) -> Result<()> {
        if self.settle_mode == SettleMode::ExactlyOnce {
            return Err(Error::not_supported("exactly-once settlement"));
        }
        if self.listener {
            return Err(Error::not_supported("listener mode"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> RunConfig {
        RunConfig {
            role: Role::Receiver,
            address: "q".into(),
            ..RunConfig::default()
        }
    }

    #[test]
    fn unknown_ack_values_mean_accept() {
        assert_eq!("accept".parse::<AckAction>().unwrap(), AckAction::Accept);
        assert_eq!("modify".parse::<AckAction>().unwrap(), AckAction::Accept);
        assert_eq!("No-Ack".parse::<AckAction>().unwrap(), AckAction::NoAck);
        assert!("".parse::<AckAction>().is_err());
    }

    #[test]
    fn transactional_when_batching_or_final_outcome() {
        let mut config = receiver();
        assert!(!config.is_transactional());
        config.tx_final_action = Some(TxAction::Rollback);
        assert!(config.is_transactional());
        config.tx_final_action = None;
        config.tx_size = 3;
        assert!(config.is_transactional());
    }

    #[test]
    fn exactly_once_is_not_supported() {
        let config = RunConfig {
            settle_mode: "exactly-once".parse().unwrap(),
            ..receiver()
        };
        assert!(config.validate().is_ok());
        assert!(matches!(config.check_supported(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn browse_with_ack_is_argument_error() {
        let config = RunConfig {
            browse: true,
            ack_action: Some(AckAction::Accept),
            ..receiver()
        };
        assert!(matches!(config.validate(), Err(Error::Argument(_))));
    }

    #[test]
    fn parse_categories_and_object_control() {
        let stats: StatsCategories = "stats, endpoints".parse().unwrap();
        assert_eq!(stats, StatsCategories::all());
        assert!("stats,bogus".parse::<StatsCategories>().is_err());

        let control: ObjectControl = "CES".parse().unwrap();
        assert!(control.connection && control.session && control.sender);
        assert!(!control.receiver);
        assert!("CX".parse::<ObjectControl>().is_err());
    }

    #[test]
    fn missing_address_rejected() {
        let config = RunConfig::default();
        assert!(matches!(config.validate(), Err(Error::Argument(_))));
    }
}
