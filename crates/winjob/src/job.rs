//! Job handle manager.

use std::fmt;
use std::sync::Arc;

use winjob_common::{OsResult, WinjobResult};

use crate::api::{
    InfoClass, JOB_OBJECT_ALL_ACCESS, JobApi, PROCESS_ALL_ACCESS,
    PROCESS_QUERY_LIMITED_INFORMATION, RawHandle,
};
use crate::cache::JobInfo;
use crate::counters::Counters;
use crate::limit::Limit;

/// Exit code used by [`JobObject::terminate`].
pub const DEFAULT_EXIT_CODE: u32 = 1;

/// An open job object together with a cache of its information blocks.
///
/// The handle is closed on drop unless [`JobObject::close`] already did.
pub struct JobObject {
    api: Arc<dyn JobApi>,
    name: String,
    handle: RawHandle,
    info: JobInfo,
}

impl fmt::Debug for JobObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobObject")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl JobObject {
    /// Create a job, anonymous when `name` is empty, and apply `limits`.
    ///
    /// If the limits cannot be applied the new handle is closed and the
    /// limit error is returned.
    pub fn create(api: Arc<dyn JobApi>, name: &str, limits: &[Limit]) -> WinjobResult<Self> {
        let handle = api.create_job(name)?;
        let mut job = Self {
            api,
            name: name.to_string(),
            handle,
            info: JobInfo::default(),
        };

        tracing::debug!(job = %job.name, handle = %handle, "Created job object");

        if !limits.is_empty() {
            if let Err(err) = job.set_limit(limits) {
                if let Err(close_err) = job.close() {
                    tracing::warn!(job = %job.name, error = %close_err, "Failed to close job");
                }
                return Err(err);
            }
        }
        Ok(job)
    }

    /// Open an existing named job with full access.
    pub fn open(api: Arc<dyn JobApi>, name: &str) -> WinjobResult<Self> {
        Self::open_with_access(api, name, JOB_OBJECT_ALL_ACCESS)
    }

    /// Open an existing named job with the given access rights.
    pub fn open_with_access(api: Arc<dyn JobApi>, name: &str, access: u32) -> WinjobResult<Self> {
        let handle = api.open_job(name, access)?;
        tracing::debug!(job = %name, handle = %handle, access, "Opened job object");
        Ok(Self {
            api,
            name: name.to_string(),
            handle,
            info: JobInfo::default(),
        })
    }

    /// The job name; empty for anonymous jobs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw job handle; null once closed.
    #[must_use]
    pub const fn handle(&self) -> RawHandle {
        self.handle
    }

    /// The cached information blocks.
    #[must_use]
    pub const fn info(&self) -> &JobInfo {
        &self.info
    }

    /// The API the job was opened through.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn JobApi> {
        &self.api
    }

    /// Close the job handle.
    ///
    /// Closing twice fails with an invalid-handle error. If the job has
    /// kill-on-close set and this was its last handle, every process in it
    /// is terminated.
    pub fn close(&mut self) -> WinjobResult<()> {
        let handle = std::mem::replace(&mut self.handle, RawHandle::NULL);
        self.api.close_handle(handle)?;
        tracing::debug!(job = %self.name, handle = %handle, "Closed job object");
        Ok(())
    }

    /// Terminate every process in the job with exit code 1.
    pub fn terminate(&self) -> WinjobResult<()> {
        self.terminate_with_exit_code(DEFAULT_EXIT_CODE)
    }

    /// Terminate every process in the job with the given exit code.
    pub fn terminate_with_exit_code(&self, exit_code: u32) -> WinjobResult<()> {
        self.api.terminate_job(self.handle, exit_code)?;
        tracing::debug!(job = %self.name, exit_code, "Terminated job");
        Ok(())
    }

    /// Add a process to the job. The process is opened with full access.
    pub fn assign(&self, pid: u32) -> WinjobResult<()> {
        Ok(self.assign_pid(pid)?)
    }

    pub(crate) fn assign_pid(&self, pid: u32) -> OsResult<()> {
        self.with_process(pid, PROCESS_ALL_ACCESS, |process| {
            self.api.assign_process(self.handle, process)
        })?;
        tracing::debug!(job = %self.name, pid, "Assigned process to job");
        Ok(())
    }

    /// Whether the process belongs to the job.
    pub fn contains(&self, pid: u32) -> WinjobResult<bool> {
        let found = self.with_process(pid, PROCESS_QUERY_LIMITED_INFORMATION, |process| {
            self.api.is_process_in_job(process, self.handle)
        })?;
        Ok(found)
    }

    fn with_process<T>(
        &self,
        pid: u32,
        access: u32,
        f: impl FnOnce(RawHandle) -> OsResult<T>,
    ) -> OsResult<T> {
        let process = self.api.open_process(pid, access)?;
        let result = f(process);
        if let Err(err) = self.api.close_handle(process) {
            tracing::warn!(pid, error = %err, "Failed to close process handle");
        }
        result
    }

    /// Apply limits: one query and one write per information block touched.
    pub fn set_limit(&mut self, limits: &[Limit]) -> WinjobResult<()> {
        self.apply(limits, true)
    }

    /// Remove limits: one query and one write per information block touched.
    pub fn reset_limit(&mut self, limits: &[Limit]) -> WinjobResult<()> {
        self.apply(limits, false)
    }

    fn apply(&mut self, limits: &[Limit], set: bool) -> WinjobResult<()> {
        let mut classes: Vec<InfoClass> = Vec::new();
        for limit in limits {
            let class = limit.info_class();
            if !classes.contains(&class) {
                self.query(class)?;
                classes.push(class);
            }
            if set {
                limit.apply_into(&mut self.info);
            } else {
                limit.clear_from(&mut self.info);
            }
        }
        for class in &classes {
            self.write(*class)?;
        }

        tracing::debug!(
            job = %self.name,
            limits = limits.len(),
            blocks = classes.len(),
            set,
            "Applied limits"
        );
        Ok(())
    }

    /// Remove every limit. Only blocks that had limits are written.
    pub fn reset_limits(&mut self) -> WinjobResult<()> {
        self.query_limits()?;
        let classes = self.info.limit_classes_set();
        self.info.clear();
        for class in &classes {
            self.write(*class)?;
        }
        tracing::debug!(job = %self.name, blocks = classes.len(), "Reset all limits");
        Ok(())
    }

    /// Whether any limit is set, after refreshing every limit block.
    pub fn has_limits(&mut self) -> WinjobResult<bool> {
        self.query_limits()?;
        Ok(!self.info.limit_classes_set().is_empty())
    }

    /// Refresh every limit block.
    pub fn query_limits(&mut self) -> WinjobResult<()> {
        for class in InfoClass::LIMITS {
            self.query(class)?;
        }
        Ok(())
    }

    /// Overwrite `counters` from one accounting query.
    pub fn query_counters(&mut self, counters: &mut Counters) -> WinjobResult<()> {
        self.query(InfoClass::Accounting)?;
        counters.update(&self.info.accounting);
        Ok(())
    }

    /// A fresh accounting snapshot.
    pub fn counters(&mut self) -> WinjobResult<Counters> {
        let mut counters = Counters::default();
        self.query_counters(&mut counters)?;
        Ok(counters)
    }

    fn query(&mut self, class: InfoClass) -> OsResult<()> {
        let block = self.api.query_info(self.handle, class)?;
        self.info.store(block);
        Ok(())
    }

    fn write(&self, class: InfoClass) -> OsResult<()> {
        self.api.set_info(self.handle, &self.info.block(class))
    }
}

impl Drop for JobObject {
    fn drop(&mut self) {
        if self.handle.is_null() {
            return;
        }
        if let Err(err) = self.close() {
            tracing::warn!(job = %self.name, error = %err, "Failed to close job on drop");
        }
    }
}
