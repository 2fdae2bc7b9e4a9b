use std::thread;
use std::time::{Duration, Instant};

use amqp_driver::clock::MonotonicClock;
use amqp_driver::config::{
    AckAction, DurationMode, ReceiveTimeout, Role, RunConfig, SettleMode, StatsCategories,
    TxAction,
};
use amqp_driver::driver::{self, run_with_clock, NoopLog};
use amqp_driver::error::{Error, ExitStatus, TransportError};
use amqp_driver::message::Message;
use amqp_driver::transport::memory::{BrokerEvent, Fault, MemoryBroker};

fn config(role: Role, count: u64) -> RunConfig {
    RunConfig {
        role,
        address: "work".into(),
        count,
        stats: StatsCategories::all(),
        ..RunConfig::default()
    }
}

fn fill(broker: &MemoryBroker, n: usize) {
    for i in 0..n {
        broker.enqueue("work", Message::with_body(format!("job {i}")));
    }
}

#[test]
fn exactly_once_fails_before_connecting() {
    let broker = MemoryBroker::new();
    let cfg = RunConfig {
        settle_mode: SettleMode::ExactlyOnce,
        ..config(Role::Sender, 3)
    };
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert_eq!(result.status, ExitStatus::OtherError);
    assert!(matches!(result.error, Some(Error::NotSupported(_))));
    assert!(result.stats.is_none());
    assert!(broker.events().is_empty());
}

#[test]
fn listener_mode_is_not_supported() {
    let broker = MemoryBroker::new();
    let cfg = RunConfig {
        listener: true,
        ..config(Role::Receiver, 1)
    };
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert!(matches!(result.error, Some(Error::NotSupported(_))));
}

#[test]
fn argument_errors_exit_with_code_two() {
    let broker = MemoryBroker::new();
    let cfg = RunConfig {
        address: String::new(),
        ..config(Role::Sender, 1)
    };
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert_eq!(result.status.code(), 2);
    assert!(broker.events().is_empty());

    let browse_ack = RunConfig {
        browse: true,
        ack_action: Some(AckAction::Accept),
        ..config(Role::Receiver, 1)
    };
    let result = driver::run(&browse_ack, &broker, &mut NoopLog);
    assert_eq!(result.status, ExitStatus::ArgumentError);
}

#[test]
fn unbounded_receive_on_empty_queue_succeeds() {
    let broker = MemoryBroker::new();
    let cfg = RunConfig {
        recv_timeout: ReceiveTimeout::After(Duration::from_secs(1)),
        ..config(Role::Receiver, 0)
    };
    let start = Instant::now();
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.processed, 0);
    assert!(start.elapsed() >= Duration::from_secs(1));
    let stats = result.stats.expect("stats");
    assert_eq!(stats.messages, Some(0));
    assert!(stats.transfer.is_none());
}

#[test]
fn send_failure_tears_down_in_reverse_order() {
    let broker = MemoryBroker::new();
    broker.inject_after(Fault::Send, 4);
    let result = run_with_clock(
        &config(Role::Sender, 10),
        &broker,
        &mut NoopLog,
        MonotonicClock::new(),
    );
    assert_eq!(result.status, ExitStatus::OtherError);
    assert!(matches!(
        result.error,
        Some(Error::Transport(TransportError::Transfer(_)))
    ));
    assert_eq!(result.processed, 4);

    let stats = result.stats.expect("partial stats");
    assert!(stats.elapsed.is_some());
    assert!(stats.transfer.is_some());
    assert!(stats.messages.is_none());
    assert!(stats.rate.is_none());

    let events = broker.events();
    let tail: Vec<_> = events[events.len() - 3..].to_vec();
    assert!(matches!(tail[0], BrokerEvent::LinkDetached(_)));
    assert!(matches!(tail[1], BrokerEvent::SessionEnded(_)));
    assert!(matches!(tail[2], BrokerEvent::ConnectionClosed(_)));
}

#[test]
fn connect_failure_still_reports_elapsed() {
    let broker = MemoryBroker::new();
    broker.inject(Fault::Connect);
    let result = driver::run(&config(Role::Receiver, 1), &broker, &mut NoopLog);
    assert_eq!(result.status.code(), 1);
    let stats = result.stats.expect("stats");
    assert!(stats.elapsed.is_some());
    assert!(stats.connect.is_none());
}

#[test]
fn close_failure_on_success_path_is_reported() {
    let broker = MemoryBroker::new();
    broker.inject(Fault::Close);
    let result = driver::run(&config(Role::Sender, 2), &broker, &mut NoopLog);
    assert_eq!(result.processed, 2);
    assert!(matches!(
        result.error,
        Some(Error::Transport(TransportError::Closed))
    ));
    let closed = broker
        .events()
        .iter()
        .filter(|event| matches!(event, BrokerEvent::ConnectionClosed(_)))
        .count();
    assert_eq!(closed, 1);
}

#[test]
fn ack_distribution_is_deterministic() {
    let run_once = |action| {
        let broker = MemoryBroker::new();
        fill(&broker, 6);
        let cfg = RunConfig {
            ack_action: Some(action),
            ..config(Role::Receiver, 6)
        };
        let result = driver::run(&cfg, &broker, &mut NoopLog);
        (result.processed, result.acks, broker.dispositions())
    };

    for action in [AckAction::Accept, AckAction::Reject, AckAction::NoAck] {
        let first = run_once(action);
        assert_eq!(first, run_once(action));
        assert_eq!(first.0, 6);
        assert_eq!(first.1.total(), 6);
    }

    let (_, acks, dispositions) = run_once(AckAction::Reject);
    assert_eq!(acks.rejected, 6);
    assert_eq!(dispositions.rejected, 6);
}

#[test]
fn no_ack_without_auto_settle_settles_explicitly() {
    let broker = MemoryBroker::new();
    fill(&broker, 3);
    let cfg = RunConfig {
        ack_action: Some(AckAction::NoAck),
        auto_settle: false,
        ..config(Role::Receiver, 3)
    };
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert_eq!(result.acks.settled, 3);
    assert_eq!(broker.dispositions().settled, 3);
    assert_eq!(broker.depth("work"), 0);
}

#[test]
fn no_ack_with_auto_settle_leaves_messages_unsettled() {
    let broker = MemoryBroker::new();
    fill(&broker, 3);
    let cfg = RunConfig {
        ack_action: Some(AckAction::NoAck),
        ..config(Role::Receiver, 3)
    };
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert_eq!(result.acks.unsettled, 3);
    // Unsettled deliveries return to the queue when the link detaches.
    assert_eq!(broker.depth("work"), 3);
}

#[test]
fn sender_and_receiver_share_a_broker_across_threads() {
    let broker = MemoryBroker::new();
    let receiver_broker = broker.clone();
    let receiver = thread::spawn(move || {
        let cfg = RunConfig {
            recv_timeout: ReceiveTimeout::Infinite,
            ..config(Role::Receiver, 5)
        };
        driver::run(&cfg, &receiver_broker, &mut NoopLog)
    });

    thread::sleep(Duration::from_millis(20));
    let sent = driver::run(&config(Role::Sender, 5), &broker, &mut NoopLog);
    assert!(sent.is_success(), "{:?}", sent.error);

    let received = receiver.join().expect("receiver thread");
    assert!(received.is_success(), "{:?}", received.error);
    assert_eq!(received.processed, 5);
    assert_eq!(broker.depth("work"), 0);
}

#[test]
fn paced_sender_spreads_messages_over_duration() {
    let broker = MemoryBroker::new();
    let cfg = RunConfig {
        duration: Duration::from_millis(200),
        ..config(Role::Sender, 4)
    };
    let start = Instant::now();
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert!(result.is_success());
    assert!(start.elapsed() >= Duration::from_millis(195));
    let latency = result.stats.and_then(|s| s.latency).expect("latency");
    assert_eq!(latency.samples, 4);
}

#[test]
fn paced_transactional_tail_still_meets_duration() {
    let broker = MemoryBroker::new();
    let cfg = RunConfig {
        duration: Duration::from_millis(200),
        duration_mode: DurationMode::AfterSendAfterTxAction,
        tx_size: 3,
        tx_final_action: Some(TxAction::Commit),
        ..config(Role::Sender, 4)
    };
    let start = Instant::now();
    let result = driver::run(&cfg, &broker, &mut NoopLog);
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.processed, 4);
    assert_eq!(result.engine.committed, 2);
    assert!(start.elapsed() >= Duration::from_millis(195));
    assert_eq!(broker.depth("work"), 4);
}
