//! Starting processes inside a job.
//!
//! The process is created suspended, assigned, and only then resumed, so it
//! never runs a single instruction outside the job.

use std::process::Command;
use std::sync::Arc;

use winjob_common::{LaunchStage, WinjobError, WinjobResult};

use crate::api::{JobApi, Process};
use crate::job::JobObject;
use crate::limit::Limit;

/// Start `command` inside `job`.
///
/// Creation failure happens before the job is touched. If assignment or
/// resumption fails, the process is left as it is: suspended, and possibly
/// already in the job. The error carries its pid so the caller can clean up.
pub fn start_in_job(command: &mut Command, job: &JobObject) -> WinjobResult<Process> {
    let process = job
        .api()
        .spawn_suspended(command)
        .map_err(|source| WinjobError::Launch {
            stage: LaunchStage::Spawn,
            pid: None,
            source,
        })?;
    let pid = process.pid();
    tracing::debug!(job = %job.name(), pid, program = ?command.get_program(), "Spawned suspended process");

    job.assign_pid(pid).map_err(|source| WinjobError::Launch {
        stage: LaunchStage::Assign,
        pid: Some(pid),
        source,
    })?;

    job.api()
        .resume_process(pid)
        .map_err(|source| WinjobError::Launch {
            stage: LaunchStage::Resume,
            pid: Some(pid),
            source,
        })?;
    tracing::debug!(job = %job.name(), pid, "Resumed process");

    Ok(process)
}

/// Create an anonymous job with `limits` and start `command` inside it.
///
/// The job is closed if the command cannot be started.
pub fn start(
    api: Arc<dyn JobApi>,
    command: &mut Command,
    limits: &[Limit],
) -> WinjobResult<(JobObject, Process)> {
    let mut job = JobObject::create(api, "", limits)?;
    match start_in_job(command, &job) {
        Ok(process) => Ok((job, process)),
        Err(err) => {
            if let Err(close_err) = job.close() {
                tracing::warn!(error = %close_err, "Failed to close job after launch failure");
            }
            Err(err)
        }
    }
}

/// Resume the first thread of a process created suspended.
pub fn resume_process(api: &dyn JobApi, pid: u32) -> WinjobResult<()> {
    api.resume_process(pid).map_err(|source| WinjobError::Launch {
        stage: LaunchStage::Resume,
        pid: Some(pid),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::sim::{ApiCall, ProcessState, SimulatedJobApi};
    use winjob_common::OsErrorCode;

    #[test]
    fn started_process_runs_in_job() {
        let sim = Arc::new(SimulatedJobApi::new());
        let (job, process) = start(sim.clone(), &mut Command::new("app.exe"), &[]).unwrap();

        assert_eq!(sim.process_state(process.pid()), Some(ProcessState::Running));
        assert_eq!(sim.process_program(process.pid()).as_deref(), Some("app.exe"));
        assert!(job.contains(process.pid()).unwrap());
    }

    #[test]
    fn spawn_failure_never_touches_the_job() {
        let sim = Arc::new(SimulatedJobApi::new());
        let job = JobObject::create(sim.clone(), "", &[]).unwrap();
        sim.inject_failure(ApiCall::SpawnSuspended, OsErrorCode::FILE_NOT_FOUND);
        sim.clear_calls();

        let err = start_in_job(&mut Command::new("missing.exe"), &job).unwrap_err();
        assert!(matches!(
            err,
            WinjobError::Launch { stage: LaunchStage::Spawn, pid: None, .. }
        ));
        assert_eq!(sim.calls(), vec![ApiCall::SpawnSuspended]);
    }

    #[test]
    fn start_closes_job_on_failure() {
        let sim = Arc::new(SimulatedJobApi::new());
        sim.inject_failure(ApiCall::ResumeProcess, OsErrorCode::ACCESS_DENIED);

        let err = start(sim.clone(), &mut Command::new("app.exe"), &[]).unwrap_err();
        let WinjobError::Launch { stage, pid: Some(pid), .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(stage, LaunchStage::Resume);
        assert_eq!(sim.process_state(pid), Some(ProcessState::Suspended));
        assert_eq!(sim.open_handle_count(), 0);
    }
}
