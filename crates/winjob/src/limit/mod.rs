//! Job limits and the rules for merging them into information blocks.
//!
//! A [`Limit`] belongs to exactly one [`InfoClass`]. [`crate::JobObject`]
//! groups limits by class, queries each class once, merges every limit into
//! the cached block in order and writes each block back once.
//!
//! Limits with a value double as selectors: [`Limit::is_set`] and resetting
//! only look at the variant, never at the value it carries. The value-less
//! forms live in [`catalogue`].

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::api::info::{
    InfoClass, LimitFlags, NetControlFlags, NetRateControl, PriorityClass, UiRestrictionFlags,
};
use crate::cache::JobInfo;
use crate::job::JobObject;

pub mod catalogue;
mod cpu;

pub use cpu::CpuRate;

/// A limit that can be applied to, read from, or reset on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Boolean limit flags without a value.
    Flag(LimitFlags),
    /// User-interface restrictions.
    Ui(UiRestrictionFlags),
    /// Processor affinity mask.
    Affinity(usize),
    /// Job-wide committed memory limit in bytes.
    JobMemory(usize),
    /// Job-wide user-mode time limit.
    JobTime(Duration),
    /// Per-process committed memory limit in bytes.
    ProcessMemory(usize),
    /// Per-process user-mode time limit.
    ProcessTime(Duration),
    /// Maximum number of active processes.
    ActiveProcess(u32),
    /// Minimum and maximum working set sizes in bytes.
    WorkingSet {
        /// Minimum size.
        min: usize,
        /// Maximum size.
        max: usize,
    },
    /// Priority class of every process.
    PriorityClass(PriorityClass),
    /// Scheduling class (0-9) of every process.
    SchedulingClass(u32),
    /// CPU rate control.
    CpuRate(CpuRate),
    /// Outgoing network bandwidth ceiling in bytes.
    OutgoingBandwidth(u64),
    /// DSCP tag for outgoing packets (0-63).
    DscpTag(u8),
}

/// The current value of a limit, decoded from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LimitValue {
    /// Whether a flag limit is set.
    Flag(bool),
    /// A size in bytes or an affinity mask.
    Size(usize),
    /// A count or class number.
    Count(u32),
    /// A time limit.
    Duration(#[serde(serialize_with = "serialize_duration")] Duration),
    /// Working set bounds.
    WorkingSet {
        /// Minimum size.
        min: usize,
        /// Maximum size.
        max: usize,
    },
    /// A priority class.
    Priority(PriorityClass),
    /// The CPU rate, if any mode is set.
    Cpu(Option<CpuRate>),
    /// Bandwidth in bytes.
    Bandwidth(u64),
    /// A DSCP tag.
    Dscp(u8),
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{duration:?}"))
}

/// Convert a duration to 100-nanosecond ticks.
#[must_use]
pub fn duration_to_ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
}

/// Convert 100-nanosecond ticks to a duration. Negative values become zero.
#[must_use]
pub fn ticks_to_duration(ticks: i64) -> Duration {
    Duration::from_nanos(u64::try_from(ticks).unwrap_or(0).saturating_mul(100))
}

impl Limit {
    /// Allow children created with the breakaway flag to leave the job.
    #[must_use]
    pub const fn breakaway_ok() -> Self {
        catalogue::BREAKAWAY_OK
    }

    /// Let every child leave the job.
    #[must_use]
    pub const fn silent_breakaway_ok() -> Self {
        catalogue::SILENT_BREAKAWAY_OK
    }

    /// Terminate processes on unhandled exceptions instead of showing a dialog.
    #[must_use]
    pub const fn die_on_unhandled_exception() -> Self {
        catalogue::DIE_ON_UNHANDLED_EXCEPTION
    }

    /// Terminate every process when the last job handle closes.
    #[must_use]
    pub const fn kill_on_job_close() -> Self {
        catalogue::KILL_ON_JOB_CLOSE
    }

    /// Keep the job time limit already in force while changing other limits.
    #[must_use]
    pub const fn preserve_job_time() -> Self {
        catalogue::PRESERVE_JOB_TIME
    }

    /// Let processes narrow the job affinity. Requires [`Limit::affinity`].
    #[must_use]
    pub const fn subset_affinity() -> Self {
        catalogue::SUBSET_AFFINITY
    }

    /// Forbid creating and switching desktops.
    #[must_use]
    pub const fn ui_desktop() -> Self {
        catalogue::UI_DESKTOP
    }

    /// Forbid changing display settings.
    #[must_use]
    pub const fn ui_display_settings() -> Self {
        catalogue::UI_DISPLAY_SETTINGS
    }

    /// Forbid `ExitWindows`.
    #[must_use]
    pub const fn ui_exit_windows() -> Self {
        catalogue::UI_EXIT_WINDOWS
    }

    /// Give the job its own atom table.
    #[must_use]
    pub const fn ui_global_atoms() -> Self {
        catalogue::UI_GLOBAL_ATOMS
    }

    /// Forbid USER handles owned by processes outside the job.
    #[must_use]
    pub const fn ui_handles() -> Self {
        catalogue::UI_HANDLES
    }

    /// Forbid reading the clipboard.
    #[must_use]
    pub const fn ui_read_clipboard() -> Self {
        catalogue::UI_READ_CLIPBOARD
    }

    /// Forbid writing the clipboard.
    #[must_use]
    pub const fn ui_write_clipboard() -> Self {
        catalogue::UI_WRITE_CLIPBOARD
    }

    /// Forbid changing system parameters.
    #[must_use]
    pub const fn ui_system_parameters() -> Self {
        catalogue::UI_SYSTEM_PARAMETERS
    }

    /// Pin every process to the processors in `mask`.
    #[must_use]
    pub const fn affinity(mask: usize) -> Self {
        Self::Affinity(mask)
    }

    /// Limit the committed memory of the whole job.
    #[must_use]
    pub const fn job_memory(bytes: usize) -> Self {
        Self::JobMemory(bytes)
    }

    /// Limit the user-mode time of the whole job.
    #[must_use]
    pub const fn job_time(limit: Duration) -> Self {
        Self::JobTime(limit)
    }

    /// Limit the committed memory of each process.
    #[must_use]
    pub const fn process_memory(bytes: usize) -> Self {
        Self::ProcessMemory(bytes)
    }

    /// Limit the user-mode time of each process.
    #[must_use]
    pub const fn process_time(limit: Duration) -> Self {
        Self::ProcessTime(limit)
    }

    /// Limit the number of simultaneously active processes.
    #[must_use]
    pub const fn active_processes(count: u32) -> Self {
        Self::ActiveProcess(count)
    }

    /// Fix the working set bounds of every process. Both or neither must be zero.
    #[must_use]
    pub const fn working_set(min: usize, max: usize) -> Self {
        Self::WorkingSet { min, max }
    }

    /// Fix the priority class of every process.
    #[must_use]
    pub const fn priority_class(class: PriorityClass) -> Self {
        Self::PriorityClass(class)
    }

    /// Fix the scheduling class (0-9) of every process.
    #[must_use]
    pub const fn scheduling_class(class: u32) -> Self {
        Self::SchedulingClass(class)
    }

    /// Hard-cap the CPU rate, in cycles per 10 000.
    #[must_use]
    pub const fn cpu_hard_cap(rate: u32) -> Self {
        Self::CpuRate(CpuRate::HardCap(rate))
    }

    /// Weight-based CPU scheduling (1-9).
    #[must_use]
    pub const fn cpu_weight(weight: u32) -> Self {
        Self::CpuRate(CpuRate::Weight(weight))
    }

    /// Reserve `min` and cap at `max` cycles per 10 000.
    #[must_use]
    pub const fn cpu_min_max(min: u16, max: u16) -> Self {
        Self::CpuRate(CpuRate::MinMax { min, max })
    }

    /// Cap outgoing network bandwidth.
    #[must_use]
    pub const fn outgoing_bandwidth(bytes: u64) -> Self {
        Self::OutgoingBandwidth(bytes)
    }

    /// Tag outgoing packets with a DSCP value (0-63).
    #[must_use]
    pub const fn dscp_tag(tag: u8) -> Self {
        Self::DscpTag(tag)
    }

    /// The information block this limit lives in.
    #[must_use]
    pub const fn info_class(&self) -> InfoClass {
        match self {
            Self::Ui(_) => InfoClass::UiRestrictions,
            Self::CpuRate(_) => InfoClass::CpuRateControl,
            Self::OutgoingBandwidth(_) | Self::DscpTag(_) => InfoClass::NetRateControl,
            _ => InfoClass::ExtendedLimits,
        }
    }

    /// The `LimitFlags` bit a valued basic limit is gated by.
    const fn basic_flag(&self) -> Option<LimitFlags> {
        Some(match self {
            Self::Flag(flags) => *flags,
            Self::Affinity(_) => LimitFlags::AFFINITY,
            Self::JobMemory(_) => LimitFlags::JOB_MEMORY,
            Self::JobTime(_) => LimitFlags::JOB_TIME,
            Self::ProcessMemory(_) => LimitFlags::PROCESS_MEMORY,
            Self::ProcessTime(_) => LimitFlags::PROCESS_TIME,
            Self::ActiveProcess(_) => LimitFlags::ACTIVE_PROCESS,
            Self::WorkingSet { .. } => LimitFlags::WORKINGSET,
            Self::PriorityClass(_) => LimitFlags::PRIORITY_CLASS,
            Self::SchedulingClass(_) => LimitFlags::SCHEDULING_CLASS,
            Self::Ui(_) | Self::CpuRate(_) | Self::OutgoingBandwidth(_) | Self::DscpTag(_) => {
                return None;
            }
        })
    }

    /// A stable snake-case name for reports.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Flag(_) | Self::Ui(_) => catalogue::ALL
                .iter()
                .find(|(_, limit)| limit == self)
                .map_or("flags", |(name, _)| *name),
            Self::Affinity(_) => "affinity",
            Self::JobMemory(_) => "job_memory",
            Self::JobTime(_) => "job_time",
            Self::ProcessMemory(_) => "process_memory",
            Self::ProcessTime(_) => "process_time",
            Self::ActiveProcess(_) => "active_process",
            Self::WorkingSet { .. } => "working_set",
            Self::PriorityClass(_) => "priority_class",
            Self::SchedulingClass(_) => "scheduling_class",
            Self::CpuRate(_) => "cpu_rate",
            Self::OutgoingBandwidth(_) => "outgoing_bandwidth",
            Self::DscpTag(_) => "dscp_tag",
        }
    }

    /// Merge this limit into the cached block.
    pub(crate) fn apply_into(&self, info: &mut JobInfo) {
        info.touch(self.info_class());
        let extended = &mut info.extended;
        let basic = &mut extended.basic;
        match *self {
            Self::Flag(flags) => {
                basic.limit_flags |= flags;
                if flags.contains(LimitFlags::PRESERVE_JOB_TIME) {
                    basic.limit_flags.remove(LimitFlags::JOB_TIME);
                }
            }
            Self::Ui(flags) => info.ui.class |= flags,
            Self::Affinity(mask) => basic.affinity = mask,
            Self::JobMemory(bytes) => extended.job_memory_limit = bytes,
            Self::JobTime(limit) => {
                basic.per_job_user_time_limit = duration_to_ticks(limit);
                basic.limit_flags.remove(LimitFlags::PRESERVE_JOB_TIME);
            }
            Self::ProcessMemory(bytes) => extended.process_memory_limit = bytes,
            Self::ProcessTime(limit) => {
                basic.per_process_user_time_limit = duration_to_ticks(limit);
            }
            Self::ActiveProcess(count) => basic.active_process_limit = count,
            Self::WorkingSet { min, max } => {
                basic.minimum_working_set_size = min;
                basic.maximum_working_set_size = max;
            }
            Self::PriorityClass(class) => basic.priority_class = class,
            Self::SchedulingClass(class) => basic.scheduling_class = class,
            Self::CpuRate(rate) => rate.write(&mut info.cpu),
            Self::OutgoingBandwidth(bytes) => {
                info.net.max_bandwidth = bytes;
                info.net.control_flags |= NetControlFlags::ENABLE | NetControlFlags::MAX_BANDWIDTH;
            }
            Self::DscpTag(tag) => {
                info.net.dscp_tag = tag;
                info.net.control_flags |= NetControlFlags::ENABLE | NetControlFlags::DSCP_TAG;
            }
        }
        if !matches!(self, Self::Flag(_)) {
            if let Some(flag) = self.basic_flag() {
                info.extended.basic.limit_flags |= flag;
            }
        }
    }

    /// Remove this limit from the cached block. Values are left in place.
    pub(crate) fn clear_from(&self, info: &mut JobInfo) {
        info.touch(self.info_class());
        if let Some(flag) = self.basic_flag() {
            info.extended.basic.limit_flags.remove(flag);
            return;
        }
        match self {
            Self::Ui(flags) => info.ui.class.remove(*flags),
            Self::CpuRate(_) => info.cpu.control_flags = crate::api::info::CpuControlFlags::empty(),
            Self::OutgoingBandwidth(_) => {
                info.net.max_bandwidth = 0;
                clear_net(&mut info.net, NetControlFlags::MAX_BANDWIDTH);
            }
            Self::DscpTag(_) => {
                info.net.dscp_tag = 0;
                clear_net(&mut info.net, NetControlFlags::DSCP_TAG);
            }
            _ => {}
        }
    }

    /// Whether the limit is in effect according to `info`.
    #[must_use]
    pub fn is_set_in(&self, info: &JobInfo) -> bool {
        if let Some(flag) = self.basic_flag() {
            return !flag.is_empty() && info.extended.basic.limit_flags.contains(flag);
        }
        match self {
            Self::Ui(flags) => !flags.is_empty() && info.ui.class.contains(*flags),
            Self::CpuRate(_) => !info.cpu.control_flags.is_empty(),
            Self::OutgoingBandwidth(_) => {
                info.net.control_flags.contains(NetControlFlags::MAX_BANDWIDTH)
            }
            Self::DscpTag(_) => info.net.control_flags.contains(NetControlFlags::DSCP_TAG),
            _ => false,
        }
    }

    /// The current value of the limit according to `info`.
    #[must_use]
    pub fn value_in(&self, info: &JobInfo) -> LimitValue {
        let extended = &info.extended;
        let basic = &extended.basic;
        match self {
            Self::Flag(_) | Self::Ui(_) => LimitValue::Flag(self.is_set_in(info)),
            Self::Affinity(_) => LimitValue::Size(basic.affinity),
            Self::JobMemory(_) => LimitValue::Size(extended.job_memory_limit),
            Self::JobTime(_) => {
                LimitValue::Duration(ticks_to_duration(basic.per_job_user_time_limit))
            }
            Self::ProcessMemory(_) => LimitValue::Size(extended.process_memory_limit),
            Self::ProcessTime(_) => {
                LimitValue::Duration(ticks_to_duration(basic.per_process_user_time_limit))
            }
            Self::ActiveProcess(_) => LimitValue::Count(basic.active_process_limit),
            Self::WorkingSet { .. } => {
                let (min, max) = info.working_set();
                LimitValue::WorkingSet { min, max }
            }
            Self::PriorityClass(_) => LimitValue::Priority(basic.priority_class),
            Self::SchedulingClass(_) => LimitValue::Count(basic.scheduling_class),
            Self::CpuRate(_) => LimitValue::Cpu(info.cpu_rate()),
            Self::OutgoingBandwidth(_) => LimitValue::Bandwidth(info.net.max_bandwidth),
            Self::DscpTag(_) => LimitValue::Dscp(info.net.dscp_tag),
        }
    }

    /// Whether the limit is in effect on the job. Query the job first.
    #[must_use]
    pub fn is_set(&self, job: &JobObject) -> bool {
        self.is_set_in(job.info())
    }

    /// The current value of the limit on the job. Query the job first.
    #[must_use]
    pub fn value(&self, job: &JobObject) -> LimitValue {
        self.value_in(job.info())
    }
}

/// Drop one network mode; disable rate control once no mode remains.
fn clear_net(net: &mut NetRateControl, mode: NetControlFlags) {
    net.control_flags.remove(mode);
    if !net
        .control_flags
        .intersects(NetControlFlags::MAX_BANDWIDTH | NetControlFlags::DSCP_TAG)
    {
        net.control_flags = NetControlFlags::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::info::CpuControlFlags;

    fn applied(limits: &[Limit]) -> JobInfo {
        let mut info = JobInfo::default();
        for limit in limits {
            limit.apply_into(&mut info);
        }
        info
    }

    #[test]
    fn info_class_mapping() {
        assert_eq!(Limit::kill_on_job_close().info_class(), InfoClass::ExtendedLimits);
        assert_eq!(Limit::working_set(1, 2).info_class(), InfoClass::ExtendedLimits);
        assert_eq!(Limit::ui_desktop().info_class(), InfoClass::UiRestrictions);
        assert_eq!(Limit::cpu_weight(5).info_class(), InfoClass::CpuRateControl);
        assert_eq!(Limit::dscp_tag(8).info_class(), InfoClass::NetRateControl);
    }

    #[test]
    fn valued_limit_sets_flag_and_field() {
        let info = applied(&[Limit::job_memory(64 << 20), Limit::active_processes(3)]);
        assert_eq!(
            info.extended.basic.limit_flags,
            LimitFlags::JOB_MEMORY | LimitFlags::ACTIVE_PROCESS
        );
        assert_eq!(info.extended.job_memory_limit, 64 << 20);
        assert_eq!(
            catalogue::ACTIVE_PROCESS.value_in(&info),
            LimitValue::Count(3)
        );
        assert!(catalogue::JOB_MEMORY.is_set_in(&info));
    }

    #[test]
    fn reset_clears_only_the_flag() {
        let mut info = applied(&[Limit::affinity(0b11), Limit::subset_affinity()]);
        catalogue::AFFINITY.clear_from(&mut info);
        assert_eq!(info.extended.basic.limit_flags, LimitFlags::SUBSET_AFFINITY);
        assert_eq!(info.extended.basic.affinity, 0b11);
    }

    #[test]
    fn preserve_job_time_and_job_time_exclude_each_other() {
        let info = applied(&[Limit::job_time(Duration::from_secs(5)), Limit::preserve_job_time()]);
        assert!(catalogue::PRESERVE_JOB_TIME.is_set_in(&info));
        assert!(!catalogue::JOB_TIME.is_set_in(&info));

        let info = applied(&[Limit::preserve_job_time(), Limit::job_time(Duration::from_secs(5))]);
        assert!(!catalogue::PRESERVE_JOB_TIME.is_set_in(&info));
        assert_eq!(
            catalogue::JOB_TIME.value_in(&info),
            LimitValue::Duration(Duration::from_secs(5))
        );
    }

    #[test]
    fn later_cpu_mode_wins() {
        let info = applied(&[Limit::cpu_hard_cap(2500), Limit::cpu_min_max(100, 900)]);
        assert_eq!(
            info.cpu_rate(),
            Some(CpuRate::MinMax { min: 100, max: 900 })
        );
        assert!(!info.cpu.control_flags.contains(CpuControlFlags::HARD_CAP));

        let mut info = info;
        catalogue::CPU_RATE.clear_from(&mut info);
        assert!(info.cpu.control_flags.is_empty());
        assert!(!catalogue::CPU_RATE.is_set_in(&info));
    }

    #[test]
    fn network_modes_are_independent() {
        let mut info = applied(&[Limit::outgoing_bandwidth(1_000_000), Limit::dscp_tag(46)]);
        catalogue::OUTGOING_BANDWIDTH.clear_from(&mut info);
        assert_eq!(
            info.net.control_flags,
            NetControlFlags::ENABLE | NetControlFlags::DSCP_TAG
        );
        assert_eq!(catalogue::DSCP_TAG.value_in(&info), LimitValue::Dscp(46));

        catalogue::DSCP_TAG.clear_from(&mut info);
        assert!(info.net.control_flags.is_empty());
    }

    #[test]
    fn mutation_marks_block_stale() {
        let mut info = JobInfo::default();
        info.store(crate::api::InfoBlock::UiRestrictions(
            crate::api::info::UiRestrictions::default(),
        ));
        Limit::ui_handles().apply_into(&mut info);
        assert!(!info.is_synced(InfoClass::UiRestrictions));
    }

    #[test]
    fn values_serialize_plainly() {
        let values = vec![
            LimitValue::Flag(true),
            LimitValue::Duration(Duration::from_millis(1500)),
            LimitValue::WorkingSet { min: 1, max: 2 },
            LimitValue::Cpu(Some(CpuRate::HardCap(1234))),
        ];
        insta::assert_snapshot!(
            serde_json::to_string(&values).unwrap(),
            @r#"[true,"1.5s",{"min":1,"max":2},{"hard_cap":1234}]"#
        );
    }

    #[test]
    fn names_come_from_catalogue() {
        assert_eq!(Limit::kill_on_job_close().name(), "kill_on_job_close");
        assert_eq!(Limit::ui_read_clipboard().name(), "ui_read_clipboard");
        assert_eq!(Limit::Flag(LimitFlags::BREAKAWAY_OK | LimitFlags::KILL_ON_JOB_CLOSE).name(), "flags");
        assert_eq!(Limit::cpu_weight(3).name(), "cpu_rate");
    }
}
