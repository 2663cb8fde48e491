//! Value-less limits, for reading and resetting.
//!
//! ```
//! use winjob::limit::catalogue;
//! # fn check(job: &winjob::JobObject) {
//! if catalogue::KILL_ON_JOB_CLOSE.is_set(job) {
//!     println!("processes die with the job");
//! }
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use super::{CpuRate, Limit, LimitValue};
use crate::cache::JobInfo;
use crate::api::info::{LimitFlags, PriorityClass, UiRestrictionFlags};

/// Children created with the breakaway flag may leave the job.
pub const BREAKAWAY_OK: Limit = Limit::Flag(LimitFlags::BREAKAWAY_OK);
/// Children always leave the job.
pub const SILENT_BREAKAWAY_OK: Limit = Limit::Flag(LimitFlags::SILENT_BREAKAWAY_OK);
/// Unhandled exceptions terminate the process without a dialog.
pub const DIE_ON_UNHANDLED_EXCEPTION: Limit = Limit::Flag(LimitFlags::DIE_ON_UNHANDLED_EXCEPTION);
/// Closing the last handle terminates every process.
pub const KILL_ON_JOB_CLOSE: Limit = Limit::Flag(LimitFlags::KILL_ON_JOB_CLOSE);
/// The job time limit survives later limit changes.
pub const PRESERVE_JOB_TIME: Limit = Limit::Flag(LimitFlags::PRESERVE_JOB_TIME);
/// Processes may narrow the job affinity.
pub const SUBSET_AFFINITY: Limit = Limit::Flag(LimitFlags::SUBSET_AFFINITY);

/// No creating or switching desktops.
pub const UI_DESKTOP: Limit = Limit::Ui(UiRestrictionFlags::DESKTOP);
/// No changing display settings.
pub const UI_DISPLAY_SETTINGS: Limit = Limit::Ui(UiRestrictionFlags::DISPLAY_SETTINGS);
/// No `ExitWindows`.
pub const UI_EXIT_WINDOWS: Limit = Limit::Ui(UiRestrictionFlags::EXIT_WINDOWS);
/// Private atom table.
pub const UI_GLOBAL_ATOMS: Limit = Limit::Ui(UiRestrictionFlags::GLOBAL_ATOMS);
/// No foreign USER handles.
pub const UI_HANDLES: Limit = Limit::Ui(UiRestrictionFlags::HANDLES);
/// No clipboard reads.
pub const UI_READ_CLIPBOARD: Limit = Limit::Ui(UiRestrictionFlags::READ_CLIPBOARD);
/// No clipboard writes.
pub const UI_WRITE_CLIPBOARD: Limit = Limit::Ui(UiRestrictionFlags::WRITE_CLIPBOARD);
/// No changing system parameters.
pub const UI_SYSTEM_PARAMETERS: Limit = Limit::Ui(UiRestrictionFlags::SYSTEM_PARAMETERS);

/// Processor affinity.
pub const AFFINITY: Limit = Limit::Affinity(0);
/// Job memory.
pub const JOB_MEMORY: Limit = Limit::JobMemory(0);
/// Job user time.
pub const JOB_TIME: Limit = Limit::JobTime(Duration::ZERO);
/// Process memory.
pub const PROCESS_MEMORY: Limit = Limit::ProcessMemory(0);
/// Process user time.
pub const PROCESS_TIME: Limit = Limit::ProcessTime(Duration::ZERO);
/// Active process count.
pub const ACTIVE_PROCESS: Limit = Limit::ActiveProcess(0);
/// Working set bounds.
pub const WORKING_SET: Limit = Limit::WorkingSet { min: 0, max: 0 };
/// Priority class.
pub const PRIORITY_CLASS: Limit = Limit::PriorityClass(PriorityClass(0));
/// Scheduling class.
pub const SCHEDULING_CLASS: Limit = Limit::SchedulingClass(0);
/// CPU rate control, whatever the mode.
pub const CPU_RATE: Limit = Limit::CpuRate(CpuRate::HardCap(0));
/// Outgoing bandwidth.
pub const OUTGOING_BANDWIDTH: Limit = Limit::OutgoingBandwidth(0);
/// DSCP tag.
pub const DSCP_TAG: Limit = Limit::DscpTag(0);

/// Every catalogued limit with its report name.
pub const ALL: [(&str, Limit); 26] = [
    ("breakaway_ok", BREAKAWAY_OK),
    ("silent_breakaway_ok", SILENT_BREAKAWAY_OK),
    ("die_on_unhandled_exception", DIE_ON_UNHANDLED_EXCEPTION),
    ("kill_on_job_close", KILL_ON_JOB_CLOSE),
    ("preserve_job_time", PRESERVE_JOB_TIME),
    ("subset_affinity", SUBSET_AFFINITY),
    ("ui_desktop", UI_DESKTOP),
    ("ui_display_settings", UI_DISPLAY_SETTINGS),
    ("ui_exit_windows", UI_EXIT_WINDOWS),
    ("ui_global_atoms", UI_GLOBAL_ATOMS),
    ("ui_handles", UI_HANDLES),
    ("ui_read_clipboard", UI_READ_CLIPBOARD),
    ("ui_write_clipboard", UI_WRITE_CLIPBOARD),
    ("ui_system_parameters", UI_SYSTEM_PARAMETERS),
    ("affinity", AFFINITY),
    ("job_memory", JOB_MEMORY),
    ("job_time", JOB_TIME),
    ("process_memory", PROCESS_MEMORY),
    ("process_time", PROCESS_TIME),
    ("active_process", ACTIVE_PROCESS),
    ("working_set", WORKING_SET),
    ("priority_class", PRIORITY_CLASS),
    ("scheduling_class", SCHEDULING_CLASS),
    ("cpu_rate", CPU_RATE),
    ("outgoing_bandwidth", OUTGOING_BANDWIDTH),
    ("dscp_tag", DSCP_TAG),
];

/// The limits set in `info`, by report name.
#[must_use]
pub fn report(info: &JobInfo) -> BTreeMap<&'static str, LimitValue> {
    ALL.iter()
        .filter(|(_, limit)| limit.is_set_in(info))
        .map(|(name, limit)| (*name, limit.value_in(info)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_only_set_limits() {
        let mut info = JobInfo::default();
        Limit::kill_on_job_close().apply_into(&mut info);
        Limit::job_memory(1 << 20).apply_into(&mut info);
        Limit::ui_handles().apply_into(&mut info);

        let report = report(&info);
        assert_eq!(
            report.keys().copied().collect::<Vec<_>>(),
            ["job_memory", "kill_on_job_close", "ui_handles"]
        );
        insta::assert_snapshot!(
            serde_json::to_string(&report).unwrap(),
            @r#"{"job_memory":1048576,"kill_on_job_close":true,"ui_handles":true}"#
        );
    }

    #[test]
    fn names_match_limit_names() {
        for (name, limit) in ALL {
            assert_eq!(limit.name(), name);
        }
    }
}
