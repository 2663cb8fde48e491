//! Win32 bindings for the job API.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::mem::size_of;
use std::os::windows::process::CommandExt;
use std::process::Command;
use std::ptr::{null, null_mut};
use std::time::Duration;

use windows_sys::Win32::Foundation::{BOOL, CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, IsProcessInJob, JOBOBJECT_ASSOCIATE_COMPLETION_PORT,
    JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION, JOBOBJECT_BASIC_UI_RESTRICTIONS,
    JOBOBJECT_CPU_RATE_CONTROL_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOBOBJECT_NET_RATE_CONTROL_INFORMATION, OpenJobObjectW, QueryInformationJobObject,
    SetInformationJobObject, TerminateJobObject,
};
use windows_sys::Win32::System::Threading::{
    CREATE_SUSPENDED, IO_COUNTERS, OpenProcess, OpenThread, ResumeThread, THREAD_SUSPEND_RESUME,
};
use winjob_common::{OsError, OsErrorCode, OsResult};

use super::info::{
    AccountingInfo, BasicLimits, CpuControlFlags, CpuRateControl, ExtendedLimits, InfoBlock,
    InfoClass, IoCounters, LimitFlags, NetControlFlags, NetRateControl, PriorityClass,
    UiRestrictionFlags, UiRestrictions,
};
use super::{JobApi, Process, RawHandle, RawMessage};

/// `JobObjectAssociateCompletionPortInformation`
const ASSOCIATE_COMPLETION_PORT: i32 = 7;
const INFINITE: u32 = u32::MAX;

/// The job API backed by the running Windows kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsJobApi;

impl WindowsJobApi {
    /// Create the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Closes a handle on drop.
struct Guard(HANDLE);

impl Drop for Guard {
    fn drop(&mut self) {
        // SAFETY: the guard owns a handle returned by a successful call.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn check(ok: BOOL, operation: &'static str) -> OsResult<()> {
    if ok == 0 {
        Err(OsError::last(operation))
    } else {
        Ok(())
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Query one fixed-size information structure.
///
/// # Safety
///
/// `T` must be the structure the OS writes for `class`, and valid when zeroed.
unsafe fn query<T>(job: HANDLE, class: i32) -> OsResult<T> {
    // SAFETY: guaranteed by the caller.
    let mut info: T = unsafe { std::mem::zeroed() };
    // SAFETY: `info` is a writable buffer of exactly `size_of::<T>()` bytes.
    let ok = unsafe {
        QueryInformationJobObject(
            job,
            class as _,
            (&raw mut info).cast(),
            size_of::<T>() as u32,
            null_mut(),
        )
    };
    check(ok, "QueryInformationJobObject")?;
    Ok(info)
}

fn set<T>(job: HANDLE, class: i32, info: &T) -> OsResult<()> {
    // SAFETY: `info` is a readable buffer of exactly `size_of::<T>()` bytes.
    let ok = unsafe {
        SetInformationJobObject(
            job,
            class as _,
            std::ptr::from_ref(info).cast::<c_void>(),
            size_of::<T>() as u32,
        )
    };
    check(ok, "SetInformationJobObject")
}

const fn io_from_native(io: &IO_COUNTERS) -> IoCounters {
    IoCounters {
        read_operation_count: io.ReadOperationCount,
        write_operation_count: io.WriteOperationCount,
        other_operation_count: io.OtherOperationCount,
        read_transfer_count: io.ReadTransferCount,
        write_transfer_count: io.WriteTransferCount,
        other_transfer_count: io.OtherTransferCount,
    }
}

fn extended_from_native(native: &JOBOBJECT_EXTENDED_LIMIT_INFORMATION) -> ExtendedLimits {
    let basic = &native.BasicLimitInformation;
    ExtendedLimits {
        basic: BasicLimits {
            per_process_user_time_limit: basic.PerProcessUserTimeLimit,
            per_job_user_time_limit: basic.PerJobUserTimeLimit,
            limit_flags: LimitFlags::from_bits_retain(basic.LimitFlags as u32),
            minimum_working_set_size: basic.MinimumWorkingSetSize,
            maximum_working_set_size: basic.MaximumWorkingSetSize,
            active_process_limit: basic.ActiveProcessLimit,
            affinity: basic.Affinity,
            priority_class: PriorityClass(basic.PriorityClass),
            scheduling_class: basic.SchedulingClass,
        },
        io: io_from_native(&native.IoInfo),
        process_memory_limit: native.ProcessMemoryLimit,
        job_memory_limit: native.JobMemoryLimit,
        peak_process_memory_used: native.PeakProcessMemoryUsed,
        peak_job_memory_used: native.PeakJobMemoryUsed,
    }
}

fn extended_to_native(limits: &ExtendedLimits) -> JOBOBJECT_EXTENDED_LIMIT_INFORMATION {
    // SAFETY: plain C structure, valid when zeroed.
    let mut native: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    let basic = &mut native.BasicLimitInformation;
    basic.PerProcessUserTimeLimit = limits.basic.per_process_user_time_limit;
    basic.PerJobUserTimeLimit = limits.basic.per_job_user_time_limit;
    basic.LimitFlags = limits.basic.limit_flags.bits() as _;
    basic.MinimumWorkingSetSize = limits.basic.minimum_working_set_size;
    basic.MaximumWorkingSetSize = limits.basic.maximum_working_set_size;
    basic.ActiveProcessLimit = limits.basic.active_process_limit;
    basic.Affinity = limits.basic.affinity;
    basic.PriorityClass = limits.basic.priority_class.0;
    basic.SchedulingClass = limits.basic.scheduling_class;
    native.ProcessMemoryLimit = limits.process_memory_limit;
    native.JobMemoryLimit = limits.job_memory_limit;
    native
}

#[allow(clippy::cast_sign_loss)]
fn accounting_from_native(native: &JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION) -> AccountingInfo {
    let basic = &native.BasicInfo;
    AccountingInfo {
        total_user_time: basic.TotalUserTime as u64,
        total_kernel_time: basic.TotalKernelTime as u64,
        this_period_total_user_time: basic.ThisPeriodTotalUserTime as u64,
        this_period_total_kernel_time: basic.ThisPeriodTotalKernelTime as u64,
        total_page_fault_count: basic.TotalPageFaultCount,
        total_processes: basic.TotalProcesses,
        active_processes: basic.ActiveProcesses,
        total_terminated_processes: basic.TotalTerminatedProcesses,
        io: io_from_native(&native.IoInfo),
    }
}

impl JobApi for WindowsJobApi {
    fn create_job(&self, name: &str) -> OsResult<RawHandle> {
        let name = (!name.is_empty()).then(|| wide(name));
        let name_ptr = name.as_ref().map_or(null(), |n| n.as_ptr());
        // SAFETY: `name_ptr` is null or a NUL-terminated UTF-16 string.
        let handle = unsafe { CreateJobObjectW(null(), name_ptr) };
        if handle == 0 {
            return Err(OsError::last("CreateJobObject"));
        }
        Ok(RawHandle(handle))
    }

    fn open_job(&self, name: &str, access: u32) -> OsResult<RawHandle> {
        let name = wide(name);
        // SAFETY: `name` is a NUL-terminated UTF-16 string.
        let handle = unsafe { OpenJobObjectW(access, 0, name.as_ptr()) };
        if handle == 0 {
            return Err(OsError::last("OpenJobObject"));
        }
        Ok(RawHandle(handle))
    }

    fn query_info(&self, job: RawHandle, class: InfoClass) -> OsResult<InfoBlock> {
        let raw = class.os_class() as i32;
        // SAFETY: each structure matches its information class.
        unsafe {
            Ok(match class {
                InfoClass::ExtendedLimits => {
                    let native: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = query(job.0, raw)?;
                    InfoBlock::ExtendedLimits(extended_from_native(&native))
                }
                InfoClass::UiRestrictions => {
                    let native: JOBOBJECT_BASIC_UI_RESTRICTIONS = query(job.0, raw)?;
                    InfoBlock::UiRestrictions(UiRestrictions {
                        class: UiRestrictionFlags::from_bits_retain(native.UIRestrictionsClass as u32),
                    })
                }
                InfoClass::Accounting => {
                    let native: JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION = query(job.0, raw)?;
                    InfoBlock::Accounting(accounting_from_native(&native))
                }
                InfoClass::CpuRateControl => {
                    let native: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION = query(job.0, raw)?;
                    InfoBlock::CpuRateControl(CpuRateControl {
                        control_flags: CpuControlFlags::from_bits_retain(native.ControlFlags as u32),
                        value: native.Anonymous.CpuRate,
                    })
                }
                InfoClass::NetRateControl => {
                    let native: JOBOBJECT_NET_RATE_CONTROL_INFORMATION = query(job.0, raw)?;
                    InfoBlock::NetRateControl(NetRateControl {
                        max_bandwidth: native.MaxBandwidth,
                        control_flags: NetControlFlags::from_bits_retain(native.ControlFlags as u32),
                        dscp_tag: native.DscpTag,
                    })
                }
            })
        }
    }

    fn set_info(&self, job: RawHandle, block: &InfoBlock) -> OsResult<()> {
        let raw = block.class().os_class() as i32;
        match block {
            InfoBlock::ExtendedLimits(limits) => set(job.0, raw, &extended_to_native(limits)),
            InfoBlock::UiRestrictions(ui) => {
                // SAFETY: plain C structure, valid when zeroed.
                let mut native: JOBOBJECT_BASIC_UI_RESTRICTIONS = unsafe { std::mem::zeroed() };
                native.UIRestrictionsClass = ui.class.bits() as _;
                set(job.0, raw, &native)
            }
            InfoBlock::CpuRateControl(cpu) => {
                // SAFETY: plain C structure, valid when zeroed.
                let mut native: JOBOBJECT_CPU_RATE_CONTROL_INFORMATION =
                    unsafe { std::mem::zeroed() };
                native.ControlFlags = cpu.control_flags.bits() as _;
                native.Anonymous.CpuRate = cpu.value;
                set(job.0, raw, &native)
            }
            InfoBlock::NetRateControl(net) => {
                // SAFETY: plain C structure, valid when zeroed.
                let mut native: JOBOBJECT_NET_RATE_CONTROL_INFORMATION =
                    unsafe { std::mem::zeroed() };
                native.MaxBandwidth = net.max_bandwidth;
                native.ControlFlags = net.control_flags.bits() as _;
                native.DscpTag = net.dscp_tag;
                set(job.0, raw, &native)
            }
            InfoBlock::Accounting(_) => Err(OsError::new(
                "SetInformationJobObject",
                OsErrorCode::INVALID_PARAMETER,
            )),
        }
    }

    fn terminate_job(&self, job: RawHandle, exit_code: u32) -> OsResult<()> {
        // SAFETY: plain handle call.
        check(unsafe { TerminateJobObject(job.0, exit_code) }, "TerminateJobObject")
    }

    fn assign_process(&self, job: RawHandle, process: RawHandle) -> OsResult<()> {
        // SAFETY: plain handle call.
        check(
            unsafe { AssignProcessToJobObject(job.0, process.0) },
            "AssignProcessToJobObject",
        )
    }

    fn is_process_in_job(&self, process: RawHandle, job: RawHandle) -> OsResult<bool> {
        let mut result: BOOL = 0;
        // SAFETY: `result` is a valid out pointer.
        check(
            unsafe { IsProcessInJob(process.0, job.0, &raw mut result) },
            "IsProcessInJob",
        )?;
        Ok(result != 0)
    }

    fn open_process(&self, pid: u32, access: u32) -> OsResult<RawHandle> {
        // SAFETY: plain call; a null result reports failure.
        let handle = unsafe { OpenProcess(access, 0, pid) };
        if handle == 0 {
            return Err(OsError::last("OpenProcess"));
        }
        Ok(RawHandle(handle))
    }

    fn close_handle(&self, handle: RawHandle) -> OsResult<()> {
        // SAFETY: closing an invalid handle reports an error and has no other effect.
        check(unsafe { CloseHandle(handle.0) }, "CloseHandle")
    }

    fn create_port(&self) -> OsResult<RawHandle> {
        // SAFETY: INVALID_HANDLE_VALUE asks for a new port with no file attached.
        let handle = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 1) };
        if handle == 0 {
            return Err(OsError::last("CreateIoCompletionPort"));
        }
        Ok(RawHandle(handle))
    }

    fn associate_port(&self, job: RawHandle, port: RawHandle) -> OsResult<()> {
        // SAFETY: plain C structure, valid when zeroed.
        let mut info: JOBOBJECT_ASSOCIATE_COMPLETION_PORT = unsafe { std::mem::zeroed() };
        info.CompletionKey = job.0 as *mut c_void;
        info.CompletionPort = port.0;
        set(job.0, ASSOCIATE_COMPLETION_PORT, &info)
    }

    fn dequeue(&self, port: RawHandle, timeout: Option<Duration>) -> OsResult<RawMessage> {
        let millis = timeout.map_or(INFINITE, |t| {
            u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1)
        });
        let mut code = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = null_mut();
        // SAFETY: all out pointers are valid for the duration of the call.
        let ok = unsafe {
            GetQueuedCompletionStatus(
                port.0,
                &raw mut code,
                &raw mut key,
                &raw mut overlapped,
                millis,
            )
        };
        check(ok, "GetQueuedCompletionStatus")?;
        // Job messages carry the process id in place of the OVERLAPPED pointer.
        #[allow(clippy::cast_possible_truncation)]
        let pid = overlapped as usize as u32;
        Ok(RawMessage { code, pid })
    }

    fn spawn_suspended(&self, command: &mut Command) -> OsResult<Process> {
        command.creation_flags(CREATE_SUSPENDED);
        let child = command
            .spawn()
            .map_err(|err| OsError::from_io("CreateProcess", &err))?;
        Ok(Process::new(child.id(), Some(child)))
    }

    fn resume_process(&self, pid: u32) -> OsResult<()> {
        // SAFETY: plain call; the handle is closed by the guard.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, pid) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(OsError::last("CreateToolhelp32Snapshot"));
        }
        let snapshot = Guard(snapshot);

        // SAFETY: plain C structure, valid when zeroed.
        let mut entry: THREADENTRY32 = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<THREADENTRY32>() as u32;
        // SAFETY: `entry` has its size set.
        check(
            unsafe { Thread32First(snapshot.0, &raw mut entry) },
            "Thread32First",
        )?;
        loop {
            if entry.th32OwnerProcessID == pid && entry.th32ThreadID != 0 {
                return resume_thread(entry.th32ThreadID);
            }
            // SAFETY: as above.
            if unsafe { Thread32Next(snapshot.0, &raw mut entry) } == 0 {
                let code = OsErrorCode::last();
                return Err(OsError::new("Thread32Next", code));
            }
        }
    }
}

fn resume_thread(tid: u32) -> OsResult<()> {
    // SAFETY: plain call; the handle is closed by the guard.
    let thread = unsafe { OpenThread(THREAD_SUSPEND_RESUME, 0, tid) };
    if thread == 0 {
        return Err(OsError::last("OpenThread"));
    }
    let thread = Guard(thread);
    // SAFETY: `thread` was opened with THREAD_SUSPEND_RESUME.
    if unsafe { ResumeThread(thread.0) } == u32::MAX {
        return Err(OsError::last("ResumeThread"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::JOB_OBJECT_ALL_ACCESS;

    #[test]
    #[cfg_attr(not(feature = "windows-host"), ignore = "needs a Windows host")]
    fn create_and_query_anonymous_job() {
        let api = WindowsJobApi::new();
        let job = api.create_job("").unwrap();
        let block = api.query_info(job, InfoClass::Accounting).unwrap();
        assert!(matches!(block, InfoBlock::Accounting(a) if a.active_processes == 0));
        api.close_handle(job).unwrap();
    }

    #[test]
    #[cfg_attr(not(feature = "windows-host"), ignore = "needs a Windows host")]
    fn open_unknown_job_fails() {
        let api = WindowsJobApi::new();
        let err = api
            .open_job("winjob-test-does-not-exist", JOB_OBJECT_ALL_ACCESS)
            .unwrap_err();
        assert_eq!(err.code, OsErrorCode::FILE_NOT_FOUND);
    }
}
