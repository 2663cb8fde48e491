//! # Winjob
//!
//! Winjob manages Windows job objects: groups of processes that share
//! limits, accounting and lifecycle notifications.
//!
//! ## Features
//!
//! - **Limits**: memory, time, process count, affinity, priority, CPU rate,
//!   network rate and UI restrictions, applied in as few OS round trips as possible
//! - **Counters**: accounting and I/O snapshots of the whole job
//! - **Notifications**: completion port messages relayed to any channel
//! - **Launch**: start a process suspended, assign it, then let it run
//!
//! ## Usage
//!
//! ```no_run
//! use std::process::Command;
//! use std::time::Duration;
//!
//! use winjob::{Limit, api::system_api, launch};
//!
//! # fn example() -> winjob::WinjobResult<()> {
//! let limits = [
//!     Limit::kill_on_job_close(),
//!     Limit::process_time(Duration::from_secs(30)),
//!     Limit::cpu_hard_cap(2500),
//! ];
//! let (mut job, process) = launch::start(system_api()?, &mut Command::new("build.exe"), &limits)?;
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let subscription = winjob::notify(tx, &job)?;
//! for notification in rx {
//!     println!("{} {}", notification.kind, notification.pid);
//! #   break;
//! }
//! println!("{} processes ran", job.counters()?.total_processes);
//! # let _ = (process, subscription);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod counters;
pub mod job;
pub mod launch;
pub mod limit;
pub mod notify;

pub use cache::JobInfo;
pub use counters::Counters;
pub use job::JobObject;
pub use limit::{Limit, LimitValue};
pub use notify::{Notification, NotificationType, Subscription, notify};
pub use winjob_common::{LaunchStage, OsError, OsErrorCode, OsResult, WinjobError, WinjobResult};
