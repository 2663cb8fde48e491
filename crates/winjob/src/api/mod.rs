//! The OS job API boundary.
//!
//! Everything above this module talks to job objects through [`JobApi`].
//! [`windows::WindowsJobApi`] binds the real Win32 calls; [`sim::SimulatedJobApi`]
//! models the same contract in memory.

use std::fmt;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use winjob_common::{OsResult, WinjobResult};

pub mod info;
pub mod sim;
#[cfg(windows)]
pub mod windows;

pub use info::{InfoBlock, InfoClass};

/// `JOB_OBJECT_ASSIGN_PROCESS`
pub const JOB_OBJECT_ASSIGN_PROCESS: u32 = 0x0001;
/// `JOB_OBJECT_SET_ATTRIBUTES`
pub const JOB_OBJECT_SET_ATTRIBUTES: u32 = 0x0002;
/// `JOB_OBJECT_QUERY`
pub const JOB_OBJECT_QUERY: u32 = 0x0004;
/// `JOB_OBJECT_TERMINATE`
pub const JOB_OBJECT_TERMINATE: u32 = 0x0008;
/// `JOB_OBJECT_ALL_ACCESS`
pub const JOB_OBJECT_ALL_ACCESS: u32 = 0x001F_001F;

/// `PROCESS_TERMINATE`
pub const PROCESS_TERMINATE: u32 = 0x0001;
/// `PROCESS_SET_QUOTA`
pub const PROCESS_SET_QUOTA: u32 = 0x0100;
/// `PROCESS_QUERY_LIMITED_INFORMATION`
pub const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
/// `PROCESS_ALL_ACCESS`
pub const PROCESS_ALL_ACCESS: u32 = 0x001F_0FFF;

/// Completion port message codes posted by a job.
pub mod msg {
    /// `JOB_OBJECT_MSG_END_OF_JOB_TIME`
    pub const END_OF_JOB_TIME: u32 = 1;
    /// `JOB_OBJECT_MSG_END_OF_PROCESS_TIME`
    pub const END_OF_PROCESS_TIME: u32 = 2;
    /// `JOB_OBJECT_MSG_ACTIVE_PROCESS_LIMIT`
    pub const ACTIVE_PROCESS_LIMIT: u32 = 3;
    /// `JOB_OBJECT_MSG_ACTIVE_PROCESS_ZERO`
    pub const ACTIVE_PROCESS_ZERO: u32 = 4;
    /// `JOB_OBJECT_MSG_NEW_PROCESS`
    pub const NEW_PROCESS: u32 = 6;
    /// `JOB_OBJECT_MSG_EXIT_PROCESS`
    pub const EXIT_PROCESS: u32 = 7;
    /// `JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS`
    pub const ABNORMAL_EXIT_PROCESS: u32 = 8;
    /// `JOB_OBJECT_MSG_PROCESS_MEMORY_LIMIT`
    pub const PROCESS_MEMORY_LIMIT: u32 = 9;
    /// `JOB_OBJECT_MSG_JOB_MEMORY_LIMIT`
    pub const JOB_MEMORY_LIMIT: u32 = 10;
    /// `JOB_OBJECT_MSG_NOTIFICATION_LIMIT`
    pub const NOTIFICATION_LIMIT: u32 = 11;
    /// `JOB_OBJECT_MSG_JOB_CYCLE_TIME_LIMIT`
    pub const JOB_CYCLE_TIME_LIMIT: u32 = 12;
    /// `JOB_OBJECT_MSG_SILO_TERMINATED`
    pub const SILO_TERMINATED: u32 = 13;
}

/// A raw OS handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandle(pub isize);

impl RawHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Whether this is the null handle.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One message dequeued from a completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    /// The `JOB_OBJECT_MSG_*` code.
    pub code: u32,
    /// The process the message concerns, or 0.
    pub pid: u32,
}

/// A process created in the suspended state.
#[derive(Debug)]
pub struct Process {
    pid: u32,
    child: Option<Child>,
}

impl Process {
    /// Wrap a process id, with the child handle when the backend has one.
    #[must_use]
    pub const fn new(pid: u32, child: Option<Child>) -> Self {
        Self { pid, child }
    }

    /// The process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// The child handle, for waiting on a real process.
    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Give up the wrapper and keep the child handle.
    #[must_use]
    pub fn into_child(self) -> Option<Child> {
        self.child
    }
}

/// The black-box operations on job objects, processes and completion ports.
///
/// Every failure names the OS call that produced it.
pub trait JobApi: Send + Sync + fmt::Debug {
    /// Create a job object, or open it if a job with that name exists.
    /// An empty name creates an anonymous job.
    fn create_job(&self, name: &str) -> OsResult<RawHandle>;

    /// Open an existing named job with the given access rights.
    fn open_job(&self, name: &str, access: u32) -> OsResult<RawHandle>;

    /// Read one information block.
    fn query_info(&self, job: RawHandle, class: InfoClass) -> OsResult<InfoBlock>;

    /// Write one information block.
    fn set_info(&self, job: RawHandle, block: &InfoBlock) -> OsResult<()>;

    /// Terminate every process in the job.
    fn terminate_job(&self, job: RawHandle, exit_code: u32) -> OsResult<()>;

    /// Add a process to the job.
    fn assign_process(&self, job: RawHandle, process: RawHandle) -> OsResult<()>;

    /// Whether the process belongs to the job.
    fn is_process_in_job(&self, process: RawHandle, job: RawHandle) -> OsResult<bool>;

    /// Open a process by id.
    fn open_process(&self, pid: u32, access: u32) -> OsResult<RawHandle>;

    /// Close any handle returned by this API.
    fn close_handle(&self, handle: RawHandle) -> OsResult<()>;

    /// Create a completion port for job notifications.
    fn create_port(&self) -> OsResult<RawHandle>;

    /// Associate a completion port with a job.
    fn associate_port(&self, job: RawHandle, port: RawHandle) -> OsResult<()>;

    /// Wait for the next message on a port. `None` waits forever.
    fn dequeue(&self, port: RawHandle, timeout: Option<Duration>) -> OsResult<RawMessage>;

    /// Start a command with its primary thread suspended.
    fn spawn_suspended(&self, command: &mut Command) -> OsResult<Process>;

    /// Resume the first thread found for the process.
    fn resume_process(&self, pid: u32) -> OsResult<()>;
}

/// The job API of the host operating system.
#[cfg(windows)]
pub fn system_api() -> WinjobResult<Arc<dyn JobApi>> {
    Ok(Arc::new(windows::WindowsJobApi::new()))
}

/// The job API of the host operating system.
#[cfg(not(windows))]
pub fn system_api() -> WinjobResult<Arc<dyn JobApi>> {
    Err(winjob_common::WinjobError::Unsupported {
        feature: "job objects".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle() {
        assert!(RawHandle::NULL.is_null());
        assert!(!RawHandle(0x40).is_null());
        assert_eq!(RawHandle(0x40).to_string(), "0x40");
    }

    #[cfg(not(windows))]
    #[test]
    fn system_api_unsupported_off_windows() {
        let err = system_api().unwrap_err();
        assert!(matches!(
            err,
            winjob_common::WinjobError::Unsupported { .. }
        ));
    }
}
