//! Accounting snapshot of a job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::info::AccountingInfo;

/// Basic accounting and I/O counters of a job.
///
/// Times are in 100-nanosecond ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Counters {
    /// User-mode time of every process ever in the job.
    pub total_user_time: u64,
    /// Kernel-mode time of every process ever in the job.
    pub total_kernel_time: u64,
    /// User-mode time since the last time limit was set.
    pub this_period_total_user_time: u64,
    /// Kernel-mode time since the last time limit was set.
    pub this_period_total_kernel_time: u64,
    /// Page faults.
    pub total_page_fault_count: u32,
    /// Processes ever associated with the job.
    pub total_processes: u32,
    /// Processes currently associated with the job.
    pub active_processes: u32,
    /// Processes terminated for exceeding a limit.
    pub total_terminated_processes: u32,
    /// Read operations.
    pub read_operation_count: u64,
    /// Write operations.
    pub write_operation_count: u64,
    /// Other I/O operations.
    pub other_operation_count: u64,
    /// Bytes read.
    pub read_transfer_count: u64,
    /// Bytes written.
    pub write_transfer_count: u64,
    /// Bytes transferred by other operations.
    pub other_transfer_count: u64,
}

impl Counters {
    /// Overwrite every field from an accounting block.
    pub fn update(&mut self, info: &AccountingInfo) {
        *self = Self::from(info);
    }

    /// Total user-mode time.
    #[must_use]
    pub const fn user_time(&self) -> Duration {
        ticks(self.total_user_time)
    }

    /// Total kernel-mode time.
    #[must_use]
    pub const fn kernel_time(&self) -> Duration {
        ticks(self.total_kernel_time)
    }
}

const fn ticks(value: u64) -> Duration {
    Duration::from_nanos(value.saturating_mul(100))
}

impl From<&AccountingInfo> for Counters {
    fn from(info: &AccountingInfo) -> Self {
        Self {
            total_user_time: info.total_user_time,
            total_kernel_time: info.total_kernel_time,
            this_period_total_user_time: info.this_period_total_user_time,
            this_period_total_kernel_time: info.this_period_total_kernel_time,
            total_page_fault_count: info.total_page_fault_count,
            total_processes: info.total_processes,
            active_processes: info.active_processes,
            total_terminated_processes: info.total_terminated_processes,
            read_operation_count: info.io.read_operation_count,
            write_operation_count: info.io.write_operation_count,
            other_operation_count: info.io.other_operation_count,
            read_transfer_count: info.io.read_transfer_count,
            write_transfer_count: info.io.write_transfer_count,
            other_transfer_count: info.io.other_transfer_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::info::IoCounters;

    fn accounting() -> AccountingInfo {
        AccountingInfo {
            total_user_time: 1,
            total_kernel_time: 2,
            this_period_total_user_time: 3,
            this_period_total_kernel_time: 4,
            total_page_fault_count: 5,
            total_processes: 6,
            active_processes: 7,
            total_terminated_processes: 8,
            io: IoCounters {
                read_operation_count: 9,
                write_operation_count: 10,
                other_operation_count: 11,
                read_transfer_count: 12,
                write_transfer_count: 13,
                other_transfer_count: 14,
            },
        }
    }

    #[test]
    fn every_field_has_its_own_slot() {
        let counters = Counters::from(&accounting());
        insta::assert_snapshot!(serde_json::to_string(&counters).unwrap(), @r#"{"TotalUserTime":1,"TotalKernelTime":2,"ThisPeriodTotalUserTime":3,"ThisPeriodTotalKernelTime":4,"TotalPageFaultCount":5,"TotalProcesses":6,"ActiveProcesses":7,"TotalTerminatedProcesses":8,"ReadOperationCount":9,"WriteOperationCount":10,"OtherOperationCount":11,"ReadTransferCount":12,"WriteTransferCount":13,"OtherTransferCount":14}"#);
    }

    #[test]
    fn update_overwrites() {
        let mut counters = Counters {
            active_processes: 99,
            ..Counters::default()
        };
        counters.update(&AccountingInfo::default());
        assert_eq!(counters, Counters::default());
    }

    #[test]
    fn durations_from_ticks() {
        let counters = Counters {
            total_user_time: 15_000_000,
            total_kernel_time: 10,
            ..Counters::default()
        };
        assert_eq!(counters.user_time(), Duration::from_millis(1500));
        assert_eq!(counters.kernel_time(), Duration::from_micros(1));
    }
}
