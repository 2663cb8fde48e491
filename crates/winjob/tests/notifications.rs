//! Integration tests for job notification subscriptions.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use proptest::prelude::*;
use winjob::api::sim::{ApiCall, SimulatedJobApi};
use winjob::api::{JobApi, msg};
use winjob::notify::SubscriptionState;
use winjob::{JobObject, Limit, Notification, NotificationType, OsErrorCode, notify};

const WAIT: Duration = Duration::from_secs(5);

fn recv(rx: &Receiver<Notification>) -> Notification {
    rx.recv_timeout(WAIT).expect("notification")
}

fn subscribed_job(
    sim: &Arc<SimulatedJobApi>,
    limits: &[Limit],
) -> (JobObject, winjob::Subscription, Receiver<Notification>) {
    let job = JobObject::create(sim.clone(), "", limits).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    let subscription = notify(tx, &job).unwrap();
    (job, subscription, rx)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn messages_arrive_in_post_order(
        posted in prop::collection::vec((1u32..=13, 0u32..10_000), 1..20),
    ) {
        let sim = Arc::new(SimulatedJobApi::new());
        let (job, subscription, rx) = subscribed_job(&sim, &[]);

        for (code, pid) in &posted {
            sim.post_message(job.handle(), *code, *pid).unwrap();
        }
        for (code, pid) in &posted {
            let notification = recv(&rx);
            prop_assert_eq!(notification.kind, NotificationType::from_code(*code));
            prop_assert_eq!(notification.pid, *pid);
        }
        subscription.close().unwrap();
    }
}

#[test_log::test]
fn process_lifecycle_is_reported() {
    let sim = Arc::new(SimulatedJobApi::new());
    let (job, _subscription, rx) = subscribed_job(&sim, &[]);

    let process = winjob::launch::start_in_job(&mut Command::new("worker.exe"), &job).unwrap();
    sim.exit_process(process.pid(), 0);

    let kinds: Vec<_> = (0..3).map(|_| recv(&rx)).collect();
    assert_eq!(
        kinds,
        [
            Notification {
                kind: NotificationType::NewProcess,
                pid: process.pid()
            },
            Notification {
                kind: NotificationType::ExitProcess,
                pid: process.pid()
            },
            Notification {
                kind: NotificationType::ActiveProcessZero,
                pid: 0
            },
        ]
    );
}

#[test_log::test]
fn crash_is_reported_as_abnormal_exit() {
    let sim = Arc::new(SimulatedJobApi::new());
    let (job, _subscription, rx) = subscribed_job(&sim, &[]);

    let process = winjob::launch::start_in_job(&mut Command::new("crash.exe"), &job).unwrap();
    assert_eq!(recv(&rx).kind, NotificationType::NewProcess);

    sim.exit_process(process.pid(), 0xC000_0005);
    assert_eq!(recv(&rx).kind, NotificationType::AbnormalExitProcess);
    assert_eq!(recv(&rx).kind, NotificationType::ActiveProcessZero);
}

#[test]
fn process_time_limit_is_reported() {
    let sim = Arc::new(SimulatedJobApi::new());
    let (job, _subscription, rx) =
        subscribed_job(&sim, &[Limit::process_time(Duration::from_millis(10))]);

    let process = winjob::launch::start_in_job(&mut Command::new("spin.exe"), &job).unwrap();
    sim.run_process(process.pid(), Duration::from_millis(20), Duration::ZERO);

    let kinds: Vec<_> = (0..4).map(|_| recv(&rx).kind).collect();
    assert_eq!(
        kinds,
        [
            NotificationType::NewProcess,
            NotificationType::EndOfProcessTime,
            NotificationType::ExitProcess,
            NotificationType::ActiveProcessZero,
        ]
    );
}

#[test]
fn close_twice_succeeds_and_disconnects_once() {
    let sim = Arc::new(SimulatedJobApi::new());
    let (_job, mut subscription, rx) = subscribed_job(&sim, &[]);

    subscription.close().unwrap();
    subscription.close().unwrap();
    subscription.join();

    assert_eq!(subscription.state(), SubscriptionState::Closed);
    assert_eq!(subscription.err(), None);
    assert_eq!(rx.recv_timeout(WAIT), Err(RecvTimeoutError::Disconnected));
}

#[test]
fn close_right_after_subscribe_is_clean() {
    let sim = Arc::new(SimulatedJobApi::new());

    for _ in 0..200 {
        let (_job, mut subscription, rx) = subscribed_job(&sim, &[]);
        subscription.close().unwrap();
        subscription.join();

        assert_eq!(subscription.err(), None);
        assert_eq!(subscription.state(), SubscriptionState::Closed);
        assert_eq!(rx.recv_timeout(WAIT), Err(RecvTimeoutError::Disconnected));
    }
    assert_eq!(sim.port_count(), 0);
}

#[test]
fn closing_the_port_directly_is_an_error() {
    let sim = Arc::new(SimulatedJobApi::new());
    let (_job, mut subscription, rx) = subscribed_job(&sim, &[]);

    while sim.count(ApiCall::Dequeue) == 0 {
        std::thread::yield_now();
    }
    // The worker is blocked on the port, so its wait is abandoned.
    sim.close_handle(subscription.port()).unwrap();
    subscription.join();

    let err = subscription.err().expect("worker error");
    assert_eq!(err.code, OsErrorCode::ABANDONED_WAIT_0, "{err}");
    assert_eq!(err.operation, "GetQueuedCompletionStatus");
    assert_eq!(rx.recv_timeout(WAIT), Err(RecvTimeoutError::Disconnected));

    // The port is already gone, so closing fails and the state stops short.
    assert!(subscription.close().is_err());
    assert_eq!(subscription.state(), SubscriptionState::Closing);
}

#[test]
fn unknown_codes_pass_through() {
    let sim = Arc::new(SimulatedJobApi::new());
    let (job, _subscription, rx) = subscribed_job(&sim, &[]);

    sim.post_message(job.handle(), 42, 7).unwrap();
    sim.post_message(job.handle(), msg::JOB_MEMORY_LIMIT, 8).unwrap();

    assert_eq!(recv(&rx).kind, NotificationType::Unknown(42));
    assert_eq!(recv(&rx).kind, NotificationType::JobMemoryLimit);
}

#[test]
fn tokio_channels_are_sinks() {
    let sim = Arc::new(SimulatedJobApi::new());
    let job = JobObject::create(sim.clone(), "", &[]).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = notify(tx, &job).unwrap();

    sim.post_message(job.handle(), msg::NEW_PROCESS, 12).unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let received = runtime.block_on(async { tokio::time::timeout(WAIT, rx.recv()).await });
    assert_eq!(
        received.unwrap(),
        Some(Notification {
            kind: NotificationType::NewProcess,
            pid: 12
        })
    );

    subscription.close().unwrap();
    let closed = runtime.block_on(async { tokio::time::timeout(WAIT, rx.recv()).await });
    assert_eq!(closed.unwrap(), None);
}
