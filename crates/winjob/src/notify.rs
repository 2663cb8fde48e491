//! Job notifications delivered through a completion port.
//!
//! [`notify`] associates a new port with a job and starts one worker thread
//! that forwards every message to a [`NotificationSink`]. Closing the
//! [`Subscription`] closes the port, which wakes the worker with an abandoned
//! wait (or an invalid handle if it had not started waiting); the worker
//! then drops the sink and exits.
//!
//! Delivery is best effort: the OS may drop messages.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use winjob_common::{OsError, OsResult, WinjobResult};

use crate::api::{JobApi, RawHandle, msg};
use crate::job::JobObject;

/// The kind of a job notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// The job time limit was reached.
    EndOfJobTime,
    /// A process reached its time limit.
    EndOfProcessTime,
    /// A process was rejected because of the active process limit.
    ActiveProcessLimit,
    /// No process is left in the job.
    ActiveProcessZero,
    /// A process joined the job.
    NewProcess,
    /// A process exited.
    ExitProcess,
    /// A process exited with an exception code.
    AbnormalExitProcess,
    /// A process exceeded its memory limit.
    ProcessMemoryExit,
    /// The job exceeded its memory limit.
    JobMemoryLimit,
    /// A notification limit was exceeded.
    NotificationLimit,
    /// The job exceeded its cycle time limit.
    JobCycleLimit,
    /// The silo of the job terminated.
    SiloTerminated,
    /// A code this crate does not know.
    Unknown(u32),
}

impl NotificationType {
    /// Map a raw message code.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            msg::END_OF_JOB_TIME => Self::EndOfJobTime,
            msg::END_OF_PROCESS_TIME => Self::EndOfProcessTime,
            msg::ACTIVE_PROCESS_LIMIT => Self::ActiveProcessLimit,
            msg::ACTIVE_PROCESS_ZERO => Self::ActiveProcessZero,
            msg::NEW_PROCESS => Self::NewProcess,
            msg::EXIT_PROCESS => Self::ExitProcess,
            msg::ABNORMAL_EXIT_PROCESS => Self::AbnormalExitProcess,
            msg::PROCESS_MEMORY_LIMIT => Self::ProcessMemoryExit,
            msg::JOB_MEMORY_LIMIT => Self::JobMemoryLimit,
            msg::NOTIFICATION_LIMIT => Self::NotificationLimit,
            msg::JOB_CYCLE_TIME_LIMIT => Self::JobCycleLimit,
            msg::SILO_TERMINATED => Self::SiloTerminated,
            other => Self::Unknown(other),
        }
    }

    /// The raw message code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::EndOfJobTime => msg::END_OF_JOB_TIME,
            Self::EndOfProcessTime => msg::END_OF_PROCESS_TIME,
            Self::ActiveProcessLimit => msg::ACTIVE_PROCESS_LIMIT,
            Self::ActiveProcessZero => msg::ACTIVE_PROCESS_ZERO,
            Self::NewProcess => msg::NEW_PROCESS,
            Self::ExitProcess => msg::EXIT_PROCESS,
            Self::AbnormalExitProcess => msg::ABNORMAL_EXIT_PROCESS,
            Self::ProcessMemoryExit => msg::PROCESS_MEMORY_LIMIT,
            Self::JobMemoryLimit => msg::JOB_MEMORY_LIMIT,
            Self::NotificationLimit => msg::NOTIFICATION_LIMIT,
            Self::JobCycleLimit => msg::JOB_CYCLE_TIME_LIMIT,
            Self::SiloTerminated => msg::SILO_TERMINATED,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EndOfJobTime => "EndOfJobTime",
            Self::EndOfProcessTime => "EndOfProcessTime",
            Self::ActiveProcessLimit => "ActiveProcessLimit",
            Self::ActiveProcessZero => "ActiveProcessZero",
            Self::NewProcess => "NewProcess",
            Self::ExitProcess => "ExitProcess",
            Self::AbnormalExitProcess => "AbnormalExitProcess",
            Self::ProcessMemoryExit => "ProcessMemoryExit",
            Self::JobMemoryLimit => "JobMemoryLimit",
            Self::NotificationLimit => "NotificationLimit",
            Self::JobCycleLimit => "JobCycleLimit",
            Self::SiloTerminated => "SiloTerminated",
            Self::Unknown(code) => return write!(f, "{code}"),
        };
        f.write_str(name)
    }
}

impl Serialize for NotificationType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One message from a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// The process concerned, or 0.
    pub pid: u32,
}

/// Returned by a sink whose receiving side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("notification receiver dropped")]
pub struct SinkClosed;

/// Where a subscription delivers notifications.
///
/// The worker thread owns the sink and drops it exactly once when it exits,
/// which is how receivers learn that the subscription ended.
pub trait NotificationSink: Send + 'static {
    /// Deliver one notification, blocking if the sink is bounded.
    fn publish(&self, notification: Notification) -> Result<(), SinkClosed>;
}

impl NotificationSink for crossbeam_channel::Sender<Notification> {
    fn publish(&self, notification: Notification) -> Result<(), SinkClosed> {
        self.send(notification).map_err(|_| SinkClosed)
    }
}

impl NotificationSink for std::sync::mpsc::Sender<Notification> {
    fn publish(&self, notification: Notification) -> Result<(), SinkClosed> {
        self.send(notification).map_err(|_| SinkClosed)
    }
}

impl NotificationSink for std::sync::mpsc::SyncSender<Notification> {
    fn publish(&self, notification: Notification) -> Result<(), SinkClosed> {
        self.send(notification).map_err(|_| SinkClosed)
    }
}

impl NotificationSink for tokio::sync::mpsc::UnboundedSender<Notification> {
    fn publish(&self, notification: Notification) -> Result<(), SinkClosed> {
        self.send(notification).map_err(|_| SinkClosed)
    }
}

impl NotificationSink for tokio::sync::mpsc::Sender<Notification> {
    fn publish(&self, notification: Notification) -> Result<(), SinkClosed> {
        self.blocking_send(notification).map_err(|_| SinkClosed)
    }
}

/// Lifecycle of a subscription. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubscriptionState {
    /// Delivering notifications.
    Open,
    /// The port is being released.
    Closing,
    /// The port is released.
    Closed,
}

#[derive(Debug)]
struct Shared {
    state: SubscriptionState,
    err: Option<OsError>,
}

/// A port associated with one job, drained by a worker thread.
///
/// Dropping the subscription closes it without waiting for the worker.
pub struct Subscription {
    api: Arc<dyn JobApi>,
    port: RawHandle,
    shared: Arc<Mutex<Shared>>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("port", &self.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Relay the notifications of `job` to `sink` until the subscription closes.
pub fn notify<S: NotificationSink>(sink: S, job: &JobObject) -> WinjobResult<Subscription> {
    let api = Arc::clone(job.api());
    let port = api.create_port()?;
    if let Err(err) = api.associate_port(job.handle(), port) {
        if let Err(close_err) = api.close_handle(port) {
            tracing::warn!(error = %close_err, "Failed to close completion port");
        }
        return Err(err.into());
    }

    let shared = Arc::new(Mutex::new(Shared {
        state: SubscriptionState::Open,
        err: None,
    }));

    let spawned = std::thread::Builder::new()
        .name(format!("winjob-notify-{port}"))
        .spawn({
            let api = Arc::clone(&api);
            let shared = Arc::clone(&shared);
            move || dequeue_loop(api.as_ref(), port, &shared, sink)
        });
    let worker = match spawned {
        Ok(worker) => worker,
        Err(err) => {
            if let Err(close_err) = api.close_handle(port) {
                tracing::warn!(error = %close_err, "Failed to close completion port");
            }
            return Err(err.into());
        }
    };

    tracing::debug!(job = %job.name(), port = %port, "Subscribed to job notifications");
    Ok(Subscription {
        api,
        port,
        shared,
        worker: Some(worker),
    })
}

/// Block until the next message arrives on `port`.
pub fn next_message(api: &dyn JobApi, port: RawHandle) -> OsResult<Notification> {
    let raw = api.dequeue(port, None)?;
    Ok(Notification {
        kind: NotificationType::from_code(raw.code),
        pid: raw.pid,
    })
}

fn dequeue_loop<S: NotificationSink>(
    api: &dyn JobApi,
    port: RawHandle,
    shared: &Mutex<Shared>,
    sink: S,
) {
    loop {
        match next_message(api, port) {
            Ok(notification) => {
                tracing::trace!(port = %port, kind = %notification.kind, pid = notification.pid, "Job notification");
                if let Err(err) = sink.publish(notification) {
                    tracing::debug!(port = %port, reason = %err, "Stopping notification loop");
                    break;
                }
            }
            Err(err) => {
                let mut shared = shared.lock();
                // After close() the port may be gone before the first wait,
                // so either closed-handle code means a requested shutdown.
                if err.code.is_closed_handle() && shared.state != SubscriptionState::Open {
                    tracing::debug!(port = %port, "Notification loop stopped");
                } else {
                    tracing::warn!(port = %port, error = %err, "Notification loop failed");
                    shared.err = Some(err);
                }
                break;
            }
        }
    }
    drop(sink);
}

impl Subscription {
    /// The completion port handle.
    #[must_use]
    pub const fn port(&self) -> RawHandle {
        self.port
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.shared.lock().state
    }

    /// The error that ended the worker, if it ended abnormally.
    #[must_use]
    pub fn err(&self) -> Option<OsError> {
        self.shared.lock().err.clone()
    }

    /// Release the port, stopping the worker. Closing again succeeds.
    ///
    /// The sink is not touched here; the worker drops it on its way out.
    pub fn close(&self) -> WinjobResult<()> {
        let mut shared = self.shared.lock();
        if shared.state == SubscriptionState::Closed {
            return Ok(());
        }
        shared.state = SubscriptionState::Closing;
        self.api.close_handle(self.port)?;
        shared.state = SubscriptionState::Closed;
        tracing::debug!(port = %self.port, "Closed notification subscription");
        Ok(())
    }

    /// Wait for the worker thread to exit. Returns at once if already joined.
    ///
    /// Blocks until the subscription is closed or the port fails.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(port = %self.port, "Notification worker panicked");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(port = %self.port, error = %err, "Subscription close on drop failed");
        }
    }
}
