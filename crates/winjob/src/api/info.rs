//! Portable mirrors of the job object information blocks.
//!
//! Field names follow the OS structures; flag bit values equal the OS
//! constants so backends convert with a plain `bits()` / `from_bits_retain`.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use winjob_common::WinjobError;

bitflags! {
    /// `JOB_OBJECT_LIMIT_*` flags of the basic limit information.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LimitFlags: u32 {
        /// Minimum and maximum working set sizes are in effect.
        const WORKINGSET = 0x0000_0001;
        /// Per-process user time limit is in effect.
        const PROCESS_TIME = 0x0000_0002;
        /// Per-job user time limit is in effect.
        const JOB_TIME = 0x0000_0004;
        /// Active process limit is in effect.
        const ACTIVE_PROCESS = 0x0000_0008;
        /// Processor affinity is in effect.
        const AFFINITY = 0x0000_0010;
        /// Priority class is in effect.
        const PRIORITY_CLASS = 0x0000_0020;
        /// Keep the previously set job time limit.
        const PRESERVE_JOB_TIME = 0x0000_0040;
        /// Scheduling class is in effect.
        const SCHEDULING_CLASS = 0x0000_0080;
        /// Per-process committed memory limit is in effect.
        const PROCESS_MEMORY = 0x0000_0100;
        /// Job-wide committed memory limit is in effect.
        const JOB_MEMORY = 0x0000_0200;
        /// Processes die instead of showing the fault dialog.
        const DIE_ON_UNHANDLED_EXCEPTION = 0x0000_0400;
        /// Children created with the breakaway flag may leave the job.
        const BREAKAWAY_OK = 0x0000_0800;
        /// Children always leave the job.
        const SILENT_BREAKAWAY_OK = 0x0000_1000;
        /// Closing the last job handle terminates every process in the job.
        const KILL_ON_JOB_CLOSE = 0x0000_2000;
        /// Processes may use a subset of the job affinity.
        const SUBSET_AFFINITY = 0x0000_4000;
        /// Low job memory notification limit.
        const JOB_MEMORY_LOW = 0x0000_8000;
        /// Job read bytes notification limit.
        const JOB_READ_BYTES = 0x0001_0000;
        /// Job write bytes notification limit.
        const JOB_WRITE_BYTES = 0x0002_0000;
        /// CPU rate control notification limit.
        const RATE_CONTROL = 0x0004_0000;
        /// I/O rate control notification limit.
        const IO_RATE_CONTROL = 0x0008_0000;
        /// Network rate control notification limit.
        const NET_RATE_CONTROL = 0x0010_0000;
    }
}

bitflags! {
    /// `JOB_OBJECT_UILIMIT_*` user-interface restriction flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UiRestrictionFlags: u32 {
        /// No USER handles owned by processes outside the job.
        const HANDLES = 0x0000_0001;
        /// No reading from the clipboard.
        const READ_CLIPBOARD = 0x0000_0002;
        /// No writing to the clipboard.
        const WRITE_CLIPBOARD = 0x0000_0004;
        /// No changing system parameters.
        const SYSTEM_PARAMETERS = 0x0000_0008;
        /// No changing display settings.
        const DISPLAY_SETTINGS = 0x0000_0010;
        /// No access to global atoms.
        const GLOBAL_ATOMS = 0x0000_0020;
        /// No creating or switching desktops.
        const DESKTOP = 0x0000_0040;
        /// No calling `ExitWindows(Ex)`.
        const EXIT_WINDOWS = 0x0000_0080;
    }
}

bitflags! {
    /// `JOB_OBJECT_CPU_RATE_CONTROL_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuControlFlags: u32 {
        /// CPU rate control is enabled.
        const ENABLE = 0x0000_0001;
        /// The shared value is a scheduling weight.
        const WEIGHT_BASED = 0x0000_0002;
        /// The shared value is a hard cap.
        const HARD_CAP = 0x0000_0004;
        /// Notify when the rate is exceeded.
        const NOTIFY = 0x0000_0008;
        /// The shared value packs a minimum and maximum rate.
        const MIN_MAX_RATE = 0x0000_0010;
    }
}

impl CpuControlFlags {
    /// The bits that select how the shared value is interpreted.
    pub const MODES: Self = Self::WEIGHT_BASED
        .union(Self::HARD_CAP)
        .union(Self::MIN_MAX_RATE);
}

bitflags! {
    /// `JOB_OBJECT_NET_RATE_CONTROL_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NetControlFlags: u32 {
        /// Network rate control is enabled.
        const ENABLE = 0x0000_0001;
        /// The bandwidth ceiling is in effect.
        const MAX_BANDWIDTH = 0x0000_0002;
        /// The DSCP tag is in effect.
        const DSCP_TAG = 0x0000_0004;
    }
}

/// A process priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PriorityClass(pub u32);

impl PriorityClass {
    /// `NORMAL_PRIORITY_CLASS`
    pub const NORMAL: Self = Self(0x0000_0020);
    /// `IDLE_PRIORITY_CLASS`
    pub const IDLE: Self = Self(0x0000_0040);
    /// `HIGH_PRIORITY_CLASS`
    pub const HIGH: Self = Self(0x0000_0080);
    /// `REALTIME_PRIORITY_CLASS`
    pub const REALTIME: Self = Self(0x0000_0100);
    /// `BELOW_NORMAL_PRIORITY_CLASS`
    pub const BELOW_NORMAL: Self = Self(0x0000_4000);
    /// `ABOVE_NORMAL_PRIORITY_CLASS`
    pub const ABOVE_NORMAL: Self = Self(0x0000_8000);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::NORMAL, "normal"),
        (Self::IDLE, "idle"),
        (Self::HIGH, "high"),
        (Self::REALTIME, "realtime"),
        (Self::BELOW_NORMAL, "below_normal"),
        (Self::ABOVE_NORMAL, "above_normal"),
    ];

    /// Whether this is one of the documented priority classes.
    #[must_use]
    pub fn is_known(self) -> bool {
        Self::NAMES.iter().any(|(class, _)| *class == self)
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::NAMES.iter().find(|(class, _)| class == self) {
            Some((_, name)) => f.write_str(name),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

impl FromStr for PriorityClass {
    type Err = WinjobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::NAMES
            .iter()
            .find(|(_, name)| *name == wanted)
            .map(|(class, _)| *class)
            .ok_or_else(|| WinjobError::Config {
                message: format!("unknown priority class: {s}"),
            })
    }
}

impl Serialize for PriorityClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PriorityClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The information classes this crate exchanges with the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InfoClass {
    /// `JobObjectExtendedLimitInformation`
    ExtendedLimits,
    /// `JobObjectBasicUIRestrictions`
    UiRestrictions,
    /// `JobObjectBasicAndIoAccountingInformation`
    Accounting,
    /// `JobObjectCpuRateControlInformation`
    CpuRateControl,
    /// `JobObjectNetRateControlInformation`
    NetRateControl,
}

impl InfoClass {
    /// The classes that carry limits.
    pub const LIMITS: [Self; 4] = [
        Self::ExtendedLimits,
        Self::UiRestrictions,
        Self::CpuRateControl,
        Self::NetRateControl,
    ];

    /// The `JOBOBJECTINFOCLASS` value.
    #[must_use]
    pub const fn os_class(self) -> u32 {
        match self {
            Self::UiRestrictions => 4,
            Self::Accounting => 8,
            Self::ExtendedLimits => 9,
            Self::CpuRateControl => 15,
            Self::NetRateControl => 32,
        }
    }
}

impl fmt::Display for InfoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ExtendedLimits => "extended limits",
            Self::UiRestrictions => "ui restrictions",
            Self::Accounting => "accounting",
            Self::CpuRateControl => "cpu rate control",
            Self::NetRateControl => "net rate control",
        };
        f.write_str(name)
    }
}

/// `JOBOBJECT_BASIC_LIMIT_INFORMATION`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicLimits {
    /// Per-process user-mode time limit, in 100-nanosecond ticks.
    pub per_process_user_time_limit: i64,
    /// Per-job user-mode time limit, in 100-nanosecond ticks.
    pub per_job_user_time_limit: i64,
    /// Which of the other fields are in effect.
    pub limit_flags: LimitFlags,
    /// Minimum working set size in bytes.
    pub minimum_working_set_size: usize,
    /// Maximum working set size in bytes.
    pub maximum_working_set_size: usize,
    /// Maximum number of simultaneously active processes.
    pub active_process_limit: u32,
    /// Processor affinity mask.
    pub affinity: usize,
    /// Priority class of every process in the job.
    pub priority_class: PriorityClass,
    /// Scheduling class (0-9).
    pub scheduling_class: u32,
}

/// `IO_COUNTERS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    /// Read operations performed.
    pub read_operation_count: u64,
    /// Write operations performed.
    pub write_operation_count: u64,
    /// Other I/O operations performed.
    pub other_operation_count: u64,
    /// Bytes read.
    pub read_transfer_count: u64,
    /// Bytes written.
    pub write_transfer_count: u64,
    /// Bytes transferred by other operations.
    pub other_transfer_count: u64,
}

/// `JOBOBJECT_EXTENDED_LIMIT_INFORMATION`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedLimits {
    /// Basic limits.
    pub basic: BasicLimits,
    /// Reserved by the OS.
    pub io: IoCounters,
    /// Per-process committed memory limit in bytes.
    pub process_memory_limit: usize,
    /// Job-wide committed memory limit in bytes.
    pub job_memory_limit: usize,
    /// Peak committed memory of any process (read only).
    pub peak_process_memory_used: usize,
    /// Peak committed memory of the job (read only).
    pub peak_job_memory_used: usize,
}

/// `JOBOBJECT_BASIC_UI_RESTRICTIONS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UiRestrictions {
    /// Active restrictions.
    pub class: UiRestrictionFlags,
}

/// `JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountingInfo {
    /// User-mode time of all processes ever in the job, in 100-ns ticks.
    pub total_user_time: u64,
    /// Kernel-mode time of all processes ever in the job, in 100-ns ticks.
    pub total_kernel_time: u64,
    /// User-mode time since the last time limit was set.
    pub this_period_total_user_time: u64,
    /// Kernel-mode time since the last time limit was set.
    pub this_period_total_kernel_time: u64,
    /// Page faults of all processes ever in the job.
    pub total_page_fault_count: u32,
    /// Processes ever associated with the job.
    pub total_processes: u32,
    /// Processes currently associated with the job.
    pub active_processes: u32,
    /// Processes terminated because of a limit violation.
    pub total_terminated_processes: u32,
    /// I/O counters of all processes ever in the job.
    pub io: IoCounters,
}

/// `JOBOBJECT_CPU_RATE_CONTROL_INFORMATION`, with its union flattened into
/// a single value whose meaning the mode bits of `control_flags` select.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuRateControl {
    /// Control flags.
    pub control_flags: CpuControlFlags,
    /// Rate, weight, or packed min/max rate.
    pub value: u32,
}

/// `JOBOBJECT_NET_RATE_CONTROL_INFORMATION`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetRateControl {
    /// Outgoing bandwidth ceiling in bytes.
    pub max_bandwidth: u64,
    /// Control flags.
    pub control_flags: NetControlFlags,
    /// DSCP tag applied to outgoing packets.
    pub dscp_tag: u8,
}

/// One information block as exchanged with the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoBlock {
    /// Extended limits.
    ExtendedLimits(ExtendedLimits),
    /// UI restrictions.
    UiRestrictions(UiRestrictions),
    /// Accounting and I/O counters.
    Accounting(AccountingInfo),
    /// CPU rate control.
    CpuRateControl(CpuRateControl),
    /// Network rate control.
    NetRateControl(NetRateControl),
}

impl InfoBlock {
    /// The class this block belongs to.
    #[must_use]
    pub const fn class(&self) -> InfoClass {
        match self {
            Self::ExtendedLimits(_) => InfoClass::ExtendedLimits,
            Self::UiRestrictions(_) => InfoClass::UiRestrictions,
            Self::Accounting(_) => InfoClass::Accounting,
            Self::CpuRateControl(_) => InfoClass::CpuRateControl,
            Self::NetRateControl(_) => InfoClass::NetRateControl,
        }
    }

    /// Whether the block has any limit flag or control bit set.
    ///
    /// Accounting never counts as a limit.
    #[must_use]
    pub const fn has_limits(&self) -> bool {
        match self {
            Self::ExtendedLimits(b) => !b.basic.limit_flags.is_empty(),
            Self::UiRestrictions(b) => !b.class.is_empty(),
            Self::Accounting(_) => false,
            Self::CpuRateControl(b) => !b.control_flags.is_empty(),
            Self::NetRateControl(b) => !b.control_flags.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_class_values() {
        assert_eq!(InfoClass::UiRestrictions.os_class(), 4);
        assert_eq!(InfoClass::Accounting.os_class(), 8);
        assert_eq!(InfoClass::ExtendedLimits.os_class(), 9);
        assert_eq!(InfoClass::CpuRateControl.os_class(), 15);
        assert_eq!(InfoClass::NetRateControl.os_class(), 32);
    }

    #[test]
    fn priority_class_names() {
        assert_eq!(
            "above-normal".parse::<PriorityClass>().unwrap(),
            PriorityClass::ABOVE_NORMAL
        );
        assert_eq!(PriorityClass::IDLE.to_string(), "idle");
        assert_eq!(PriorityClass(0x1234).to_string(), "0x1234");
        assert!("urgent".parse::<PriorityClass>().is_err());
        assert!(!PriorityClass::default().is_known());
    }

    #[test]
    fn empty_blocks_have_no_limits() {
        assert!(!InfoBlock::ExtendedLimits(ExtendedLimits::default()).has_limits());
        assert!(!InfoBlock::Accounting(AccountingInfo {
            active_processes: 3,
            ..AccountingInfo::default()
        })
        .has_limits());

        let cpu = CpuRateControl {
            control_flags: CpuControlFlags::ENABLE | CpuControlFlags::HARD_CAP,
            value: 500,
        };
        assert!(InfoBlock::CpuRateControl(cpu).has_limits());
    }
}
