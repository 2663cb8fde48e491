//! In-memory model of job objects.
//!
//! [`SimulatedJobApi`] implements [`JobApi`] without an operating system:
//! handles carry access rights, named jobs are shared between handles,
//! processes move through suspended, running and exited states, and
//! completion ports block their readers until a message is posted or the
//! port is closed. Parameter validation follows the OS rules closely
//! enough that invalid combinations fail with `ERROR_INVALID_PARAMETER`.
//!
//! Tests drive the model through the helpers on [`SimulatedJobApi`]: the call
//! log, failure injection, and direct control of process CPU time and exit.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::Command;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use winjob_common::{OsError, OsErrorCode, OsResult};

use super::info::{
    AccountingInfo, CpuControlFlags, CpuRateControl, ExtendedLimits, InfoBlock, InfoClass,
    IoCounters, LimitFlags, NetControlFlags, NetRateControl, UiRestrictionFlags, UiRestrictions,
};
use super::{
    JOB_OBJECT_ASSIGN_PROCESS, JOB_OBJECT_QUERY, JOB_OBJECT_SET_ATTRIBUTES, JOB_OBJECT_TERMINATE,
    JobApi, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_QUOTA, PROCESS_TERMINATE, Process,
    RawHandle, RawMessage, msg,
};

/// Bits of `LimitFlags` accepted by the extended limit class.
const EXTENDED_LIMIT_BITS: u32 = 0x7fff;
/// Exit codes at or above this value are reported as abnormal exits.
const ABNORMAL_EXIT_THRESHOLD: u32 = 0xC000_0000;
/// 100-nanosecond ticks per second.
const TICKS_PER_SEC: u64 = 10_000_000;

/// One recorded call on the simulated API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    /// `CreateJobObjectW`
    CreateJob,
    /// `OpenJobObjectW`
    OpenJob,
    /// `QueryInformationJobObject`
    QueryInfo(InfoClass),
    /// `SetInformationJobObject`
    SetInfo(InfoClass),
    /// `TerminateJobObject`
    TerminateJob,
    /// `AssignProcessToJobObject`
    AssignProcess,
    /// `IsProcessInJob`
    IsProcessInJob,
    /// `OpenProcess`
    OpenProcess,
    /// `CloseHandle`
    CloseHandle,
    /// `CreateIoCompletionPort`
    CreatePort,
    /// `SetInformationJobObject(JobObjectAssociateCompletionPortInformation)`
    AssociatePort,
    /// `GetQueuedCompletionStatus`
    Dequeue,
    /// `CreateProcessW` with `CREATE_SUSPENDED`
    SpawnSuspended,
    /// `ResumeThread` on the first thread of a process
    ResumeProcess,
}

impl ApiCall {
    const fn operation(self) -> &'static str {
        match self {
            Self::CreateJob => "CreateJobObject",
            Self::OpenJob => "OpenJobObject",
            Self::QueryInfo(_) => "QueryInformationJobObject",
            Self::SetInfo(_) | Self::AssociatePort => "SetInformationJobObject",
            Self::TerminateJob => "TerminateJobObject",
            Self::AssignProcess => "AssignProcessToJobObject",
            Self::IsProcessInJob => "IsProcessInJob",
            Self::OpenProcess => "OpenProcess",
            Self::CloseHandle => "CloseHandle",
            Self::CreatePort => "CreateIoCompletionPort",
            Self::Dequeue => "GetQueuedCompletionStatus",
            Self::SpawnSuspended => "CreateProcess",
            Self::ResumeProcess => "ResumeThread",
        }
    }

    const fn fail(self, code: OsErrorCode) -> OsError {
        OsError::new(self.operation(), code)
    }
}

/// Lifecycle state of a simulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, primary thread not yet resumed.
    Suspended,
    /// Running.
    Running,
    /// Exited with the given code.
    Exited(u32),
}

type JobId = u64;
type PortId = u64;

#[derive(Debug, Clone, Copy)]
enum HandleEntry {
    Job { job: JobId, access: u32 },
    Process { pid: u32, access: u32 },
    Port(PortId),
}

#[derive(Debug, Default)]
struct SimJob {
    name: Option<String>,
    handles: usize,
    extended: ExtendedLimits,
    ui: UiRestrictions,
    cpu: CpuRateControl,
    net: NetRateControl,
    /// Job time limit in force; survives writes that preserve it.
    job_time_limit: Option<u64>,
    members: Vec<u32>,
    port: Option<PortId>,
    /// Totals of processes that left the job.
    retired: AccountingInfo,
    /// User and kernel time at the start of the current period.
    period_start: (u64, u64),
}

#[derive(Debug)]
struct SimProcess {
    program: String,
    state: ProcessState,
    job: Option<JobId>,
    user_time: u64,
    kernel_time: u64,
    page_faults: u32,
    io: IoCounters,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct SimPort {
    open: bool,
    waiters: usize,
    queue: VecDeque<RawMessage>,
}

#[derive(Debug)]
struct SimState {
    next_handle: isize,
    next_id: u64,
    next_pid: u32,
    handles: HashMap<isize, HandleEntry>,
    jobs: HashMap<JobId, SimJob>,
    names: HashMap<String, JobId>,
    processes: BTreeMap<u32, SimProcess>,
    ports: HashMap<PortId, SimPort>,
    calls: Vec<ApiCall>,
    failures: HashMap<ApiCall, OsErrorCode>,
    process_lifetime: Option<Duration>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            next_handle: 0x40,
            next_id: 1,
            next_pid: 4000,
            handles: HashMap::new(),
            jobs: HashMap::new(),
            names: HashMap::new(),
            processes: BTreeMap::new(),
            ports: HashMap::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
            process_lifetime: None,
        }
    }
}

/// In-memory implementation of [`JobApi`].
#[derive(Debug, Default)]
pub struct SimulatedJobApi {
    state: Mutex<SimState>,
    changed: Condvar,
}

impl SimulatedJobApi {
    /// Create an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every resumed process run for `lifetime` and then exit with code 0.
    #[must_use]
    pub fn with_process_lifetime(self, lifetime: Duration) -> Self {
        self.state.lock().process_lifetime = Some(lifetime);
        self
    }

    /// Calls made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// How many times `call` was made.
    #[must_use]
    pub fn count(&self, call: ApiCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Make every later `call` fail with `code`.
    pub fn inject_failure(&self, call: ApiCall, code: OsErrorCode) {
        self.state.lock().failures.insert(call, code);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Number of handles currently open.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Number of completion ports still tracked, open or awaiting their
    /// last waiter.
    #[must_use]
    pub fn port_count(&self) -> usize {
        self.state.lock().ports.len()
    }

    /// The state of a process, if it exists.
    #[must_use]
    pub fn process_state(&self, pid: u32) -> Option<ProcessState> {
        self.state.lock().processes.get(&pid).map(|p| p.state)
    }

    /// The program a process was started from.
    #[must_use]
    pub fn process_program(&self, pid: u32) -> Option<String> {
        self.state.lock().processes.get(&pid).map(|p| p.program.clone())
    }

    /// Charge CPU time to a running process and enforce time limits.
    ///
    /// Suspended and exited processes accrue nothing.
    pub fn run_process(&self, pid: u32, user: Duration, kernel: Duration) {
        let mut state = self.state.lock();
        let Some(process) = state.processes.get_mut(&pid) else {
            return;
        };
        if process.state != ProcessState::Running {
            return;
        }
        process.user_time += ticks(user);
        process.kernel_time += ticks(kernel);
        process.page_faults += 1;
        let job = process.job;
        if let Some(job) = job {
            state.enforce_time_limits(job, pid);
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Add I/O activity to a process.
    pub fn record_io(&self, pid: u32, io: IoCounters) {
        let mut state = self.state.lock();
        if let Some(process) = state.processes.get_mut(&pid) {
            add_io(&mut process.io, &io);
        }
    }

    /// Make a process exit on its own.
    pub fn exit_process(&self, pid: u32, exit_code: u32) {
        let mut state = self.state.lock();
        state.exit(pid, exit_code);
        drop(state);
        self.changed.notify_all();
    }

    /// Post a raw message as if the job identified by `job` had sent it.
    pub fn post_message(&self, job: RawHandle, code: u32, pid: u32) -> OsResult<()> {
        let mut state = self.state.lock();
        let id = state.job(job, 0, ApiCall::AssociatePort)?;
        state.post(id, code, pid);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Record the call, apply injected failures and let time pass.
    fn enter(&self, call: ApiCall) -> OsResult<MutexGuard<'_, SimState>> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(code) = state.failures.get(&call) {
            return Err(call.fail(*code));
        }
        state.advance(Instant::now());
        Ok(state)
    }
}

fn ticks(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos() / 100).unwrap_or(u64::MAX)
}

fn add_io(into: &mut IoCounters, from: &IoCounters) {
    into.read_operation_count += from.read_operation_count;
    into.write_operation_count += from.write_operation_count;
    into.other_operation_count += from.other_operation_count;
    into.read_transfer_count += from.read_transfer_count;
    into.write_transfer_count += from.write_transfer_count;
    into.other_transfer_count += from.other_transfer_count;
}

impl SimState {
    fn insert_handle(&mut self, entry: HandleEntry) -> RawHandle {
        let handle = self.next_handle;
        self.next_handle += 4;
        self.handles.insert(handle, entry);
        RawHandle(handle)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn job(&self, handle: RawHandle, access: u32, call: ApiCall) -> OsResult<JobId> {
        match self.handles.get(&handle.0) {
            Some(HandleEntry::Job { job, access: granted }) => {
                if granted & access == access {
                    Ok(*job)
                } else {
                    Err(call.fail(OsErrorCode::ACCESS_DENIED))
                }
            }
            _ => Err(call.fail(OsErrorCode::INVALID_HANDLE)),
        }
    }

    fn process(&self, handle: RawHandle, access: u32, call: ApiCall) -> OsResult<u32> {
        match self.handles.get(&handle.0) {
            Some(HandleEntry::Process { pid, access: granted }) => {
                if granted & access == access {
                    Ok(*pid)
                } else {
                    Err(call.fail(OsErrorCode::ACCESS_DENIED))
                }
            }
            _ => Err(call.fail(OsErrorCode::INVALID_HANDLE)),
        }
    }

    fn jobs_mut(&mut self, id: JobId) -> &mut SimJob {
        self.jobs.entry(id).or_default()
    }

    fn post(&mut self, job: JobId, code: u32, pid: u32) {
        let Some(port) = self.jobs.get(&job).and_then(|j| j.port) else {
            return;
        };
        if let Some(port) = self.ports.get_mut(&port) {
            if port.open {
                port.queue.push_back(RawMessage { code, pid });
            }
        }
    }

    /// Exit processes whose lifetime ran out.
    fn advance(&mut self, now: Instant) {
        let due: Vec<u32> = self
            .processes
            .iter()
            .filter(|(_, p)| p.state == ProcessState::Running)
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(pid, _)| *pid)
            .collect();
        for pid in due {
            if let (Some(process), Some(lifetime)) =
                (self.processes.get_mut(&pid), self.process_lifetime)
            {
                process.user_time += ticks(lifetime);
            }
            self.exit(pid, 0);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.processes
            .values()
            .filter(|p| p.state == ProcessState::Running)
            .filter_map(|p| p.deadline)
            .min()
    }

    fn exit(&mut self, pid: u32, exit_code: u32) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if matches!(process.state, ProcessState::Exited(_)) {
            return;
        }
        process.state = ProcessState::Exited(exit_code);
        let Some(id) = process.job else {
            return;
        };
        let (user, kernel, faults, io) = (
            process.user_time,
            process.kernel_time,
            process.page_faults,
            process.io,
        );

        let job = self.jobs_mut(id);
        job.members.retain(|member| *member != pid);
        job.retired.total_user_time += user;
        job.retired.total_kernel_time += kernel;
        job.retired.total_page_fault_count += faults;
        add_io(&mut job.retired.io, &io);
        let empty = job.members.is_empty();

        let code = if exit_code >= ABNORMAL_EXIT_THRESHOLD {
            msg::ABNORMAL_EXIT_PROCESS
        } else {
            msg::EXIT_PROCESS
        };
        self.post(id, code, pid);
        if empty {
            self.post(id, msg::ACTIVE_PROCESS_ZERO, 0);
        }
    }

    fn accounting(&self, id: JobId) -> AccountingInfo {
        let Some(job) = self.jobs.get(&id) else {
            return AccountingInfo::default();
        };
        let mut info = job.retired;
        for pid in &job.members {
            if let Some(p) = self.processes.get(pid) {
                info.total_user_time += p.user_time;
                info.total_kernel_time += p.kernel_time;
                info.total_page_fault_count += p.page_faults;
                add_io(&mut info.io, &p.io);
            }
        }
        info.this_period_total_user_time = info.total_user_time.saturating_sub(job.period_start.0);
        info.this_period_total_kernel_time =
            info.total_kernel_time.saturating_sub(job.period_start.1);
        info.active_processes = u32::try_from(job.members.len()).unwrap_or(u32::MAX);
        info
    }

    fn enforce_time_limits(&mut self, id: JobId, pid: u32) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let basic = job.extended.basic;
        if basic.limit_flags.contains(LimitFlags::PROCESS_TIME) {
            let limit = u64::try_from(basic.per_process_user_time_limit).unwrap_or(0);
            let used = self.processes.get(&pid).map_or(0, |p| p.user_time);
            if used > limit {
                self.post(id, msg::END_OF_PROCESS_TIME, pid);
                self.jobs_mut(id).retired.total_terminated_processes += 1;
                self.exit(pid, 1);
            }
        }

        let Some(limit) = self.jobs.get(&id).and_then(|j| j.job_time_limit) else {
            return;
        };
        if self.accounting(id).this_period_total_user_time > limit {
            self.post(id, msg::END_OF_JOB_TIME, 0);
            let members = self.jobs_mut(id).members.clone();
            self.jobs_mut(id).retired.total_terminated_processes +=
                u32::try_from(members.len()).unwrap_or(u32::MAX);
            for member in members {
                self.exit(member, 1);
            }
        }
    }

    fn release_job(&mut self, id: JobId) {
        let job = self.jobs_mut(id);
        job.handles = job.handles.saturating_sub(1);
        if job.handles > 0 {
            return;
        }
        let kill = job
            .extended
            .basic
            .limit_flags
            .contains(LimitFlags::KILL_ON_JOB_CLOSE);
        let name = job.name.take();
        let members = job.members.clone();
        if let Some(name) = name {
            self.names.remove(&name);
        }
        if kill {
            for pid in members {
                self.exit(pid, 0);
            }
        }
    }
}

fn validate_extended(limits: &ExtendedLimits) -> bool {
    let basic = &limits.basic;
    let flags = basic.limit_flags;
    if flags.bits() & !EXTENDED_LIMIT_BITS != 0 {
        return false;
    }
    if flags.contains(LimitFlags::WORKINGSET) {
        let (min, max) = (
            basic.minimum_working_set_size,
            basic.maximum_working_set_size,
        );
        if (min == 0) != (max == 0) || min > max {
            return false;
        }
    }
    if flags.contains(LimitFlags::SUBSET_AFFINITY) && !flags.contains(LimitFlags::AFFINITY) {
        return false;
    }
    if flags.contains(LimitFlags::AFFINITY) && basic.affinity == 0 {
        return false;
    }
    if flags.contains(LimitFlags::PRESERVE_JOB_TIME | LimitFlags::JOB_TIME) {
        return false;
    }
    if flags.contains(LimitFlags::PRIORITY_CLASS) && !basic.priority_class.is_known() {
        return false;
    }
    if flags.contains(LimitFlags::SCHEDULING_CLASS) && basic.scheduling_class > 9 {
        return false;
    }
    true
}

fn validate_cpu(cpu: &CpuRateControl) -> bool {
    let flags = cpu.control_flags;
    if flags.is_empty() {
        return true;
    }
    if flags.bits() & !CpuControlFlags::all().bits() != 0 || !flags.contains(CpuControlFlags::ENABLE)
    {
        return false;
    }
    let mode = flags & CpuControlFlags::MODES;
    if mode == CpuControlFlags::HARD_CAP {
        (1..=10_000).contains(&cpu.value)
    } else if mode == CpuControlFlags::WEIGHT_BASED {
        (1..=9).contains(&cpu.value)
    } else if mode == CpuControlFlags::MIN_MAX_RATE {
        let min = cpu.value & 0xffff;
        let max = cpu.value >> 16;
        (1..=10_000).contains(&max) && min <= max
    } else {
        false
    }
}

fn validate_net(net: &NetRateControl) -> bool {
    let flags = net.control_flags;
    if flags.is_empty() {
        return true;
    }
    if flags.bits() & !NetControlFlags::all().bits() != 0
        || !flags.contains(NetControlFlags::ENABLE)
        || !flags.intersects(NetControlFlags::MAX_BANDWIDTH | NetControlFlags::DSCP_TAG)
    {
        return false;
    }
    if flags.contains(NetControlFlags::DSCP_TAG) && net.dscp_tag > 63 {
        return false;
    }
    !(flags.contains(NetControlFlags::MAX_BANDWIDTH) && net.max_bandwidth == 0)
}

fn validate_ui(ui: &UiRestrictions) -> bool {
    ui.class.bits() & !UiRestrictionFlags::all().bits() == 0
}

impl JobApi for SimulatedJobApi {
    fn create_job(&self, name: &str) -> OsResult<RawHandle> {
        let mut state = self.enter(ApiCall::CreateJob)?;
        let id = if let Some(id) = state.names.get(name).copied() {
            id
        } else {
            let id = state.next_id();
            let job = SimJob {
                name: (!name.is_empty()).then(|| name.to_string()),
                ..SimJob::default()
            };
            state.jobs.insert(id, job);
            if !name.is_empty() {
                state.names.insert(name.to_string(), id);
            }
            id
        };
        state.jobs_mut(id).handles += 1;
        Ok(state.insert_handle(HandleEntry::Job {
            job: id,
            access: super::JOB_OBJECT_ALL_ACCESS,
        }))
    }

    fn open_job(&self, name: &str, access: u32) -> OsResult<RawHandle> {
        let call = ApiCall::OpenJob;
        let mut state = self.enter(call)?;
        if name.is_empty() {
            return Err(call.fail(OsErrorCode::INVALID_PARAMETER));
        }
        let Some(id) = state.names.get(name).copied() else {
            return Err(call.fail(OsErrorCode::FILE_NOT_FOUND));
        };
        state.jobs_mut(id).handles += 1;
        Ok(state.insert_handle(HandleEntry::Job { job: id, access }))
    }

    fn query_info(&self, job: RawHandle, class: InfoClass) -> OsResult<InfoBlock> {
        let call = ApiCall::QueryInfo(class);
        let state = self.enter(call)?;
        let id = state.job(job, JOB_OBJECT_QUERY, call)?;
        let Some(sim) = state.jobs.get(&id) else {
            return Err(call.fail(OsErrorCode::INVALID_HANDLE));
        };
        Ok(match class {
            InfoClass::ExtendedLimits => InfoBlock::ExtendedLimits(sim.extended),
            InfoClass::UiRestrictions => InfoBlock::UiRestrictions(sim.ui),
            InfoClass::Accounting => InfoBlock::Accounting(state.accounting(id)),
            InfoClass::CpuRateControl => InfoBlock::CpuRateControl(sim.cpu),
            InfoClass::NetRateControl => InfoBlock::NetRateControl(sim.net),
        })
    }

    fn set_info(&self, job: RawHandle, block: &InfoBlock) -> OsResult<()> {
        let call = ApiCall::SetInfo(block.class());
        let mut state = self.enter(call)?;
        let id = state.job(job, JOB_OBJECT_SET_ATTRIBUTES, call)?;
        let invalid = call.fail(OsErrorCode::INVALID_PARAMETER);
        match block {
            InfoBlock::ExtendedLimits(limits) => {
                if !validate_extended(limits) {
                    return Err(invalid);
                }
                let totals = {
                    let info = state.accounting(id);
                    (info.total_user_time, info.total_kernel_time)
                };
                let sim = state.jobs_mut(id);
                let flags = limits.basic.limit_flags;
                let previous = sim.extended.basic.per_job_user_time_limit;
                let mut stored = *limits;
                stored.peak_process_memory_used = sim.extended.peak_process_memory_used;
                stored.peak_job_memory_used = sim.extended.peak_job_memory_used;
                if flags.contains(LimitFlags::PRESERVE_JOB_TIME) {
                    stored.basic.per_job_user_time_limit = previous;
                } else if flags.contains(LimitFlags::JOB_TIME) {
                    sim.job_time_limit =
                        Some(u64::try_from(limits.basic.per_job_user_time_limit).unwrap_or(0));
                    sim.period_start = totals;
                } else {
                    sim.job_time_limit = None;
                }
                sim.extended = stored;
            }
            InfoBlock::UiRestrictions(ui) => {
                if !validate_ui(ui) {
                    return Err(invalid);
                }
                state.jobs_mut(id).ui = *ui;
            }
            InfoBlock::CpuRateControl(cpu) => {
                if !validate_cpu(cpu) {
                    return Err(invalid);
                }
                state.jobs_mut(id).cpu = *cpu;
            }
            InfoBlock::NetRateControl(net) => {
                if !validate_net(net) {
                    return Err(invalid);
                }
                state.jobs_mut(id).net = *net;
            }
            InfoBlock::Accounting(_) => return Err(invalid),
        }
        Ok(())
    }

    fn terminate_job(&self, job: RawHandle, exit_code: u32) -> OsResult<()> {
        let call = ApiCall::TerminateJob;
        let mut state = self.enter(call)?;
        let id = state.job(job, JOB_OBJECT_TERMINATE, call)?;
        let members = state.jobs_mut(id).members.clone();
        for pid in members {
            state.exit(pid, exit_code);
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn assign_process(&self, job: RawHandle, process: RawHandle) -> OsResult<()> {
        let call = ApiCall::AssignProcess;
        let mut state = self.enter(call)?;
        let id = state.job(job, JOB_OBJECT_ASSIGN_PROCESS, call)?;
        let pid = state.process(process, PROCESS_SET_QUOTA | PROCESS_TERMINATE, call)?;

        let Some(target) = state.processes.get(&pid) else {
            return Err(call.fail(OsErrorCode::INVALID_HANDLE));
        };
        if matches!(target.state, ProcessState::Exited(_)) {
            return Err(call.fail(OsErrorCode::ACCESS_DENIED));
        }
        match target.job {
            Some(current) if current == id => return Ok(()),
            Some(_) => return Err(call.fail(OsErrorCode::ACCESS_DENIED)),
            None => {}
        }

        let sim = state.jobs_mut(id);
        let basic = sim.extended.basic;
        let active = sim.members.len();
        if basic.limit_flags.contains(LimitFlags::ACTIVE_PROCESS)
            && active >= basic.active_process_limit as usize
        {
            sim.retired.total_terminated_processes += 1;
            state.post(id, msg::ACTIVE_PROCESS_LIMIT, 0);
            if let Some(p) = state.processes.get_mut(&pid) {
                p.state = ProcessState::Exited(OsErrorCode::NOT_ENOUGH_QUOTA.0);
            }
            drop(state);
            self.changed.notify_all();
            return Err(call.fail(OsErrorCode::NOT_ENOUGH_QUOTA));
        }

        sim.members.push(pid);
        sim.retired.total_processes += 1;
        if let Some(p) = state.processes.get_mut(&pid) {
            p.job = Some(id);
        }
        state.post(id, msg::NEW_PROCESS, pid);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn is_process_in_job(&self, process: RawHandle, job: RawHandle) -> OsResult<bool> {
        let call = ApiCall::IsProcessInJob;
        let state = self.enter(call)?;
        let id = state.job(job, JOB_OBJECT_QUERY, call)?;
        let pid = state.process(process, PROCESS_QUERY_LIMITED_INFORMATION, call)?;
        Ok(state.processes.get(&pid).and_then(|p| p.job) == Some(id))
    }

    fn open_process(&self, pid: u32, access: u32) -> OsResult<RawHandle> {
        let call = ApiCall::OpenProcess;
        let mut state = self.enter(call)?;
        if !state.processes.contains_key(&pid) {
            return Err(call.fail(OsErrorCode::INVALID_PARAMETER));
        }
        Ok(state.insert_handle(HandleEntry::Process { pid, access }))
    }

    fn close_handle(&self, handle: RawHandle) -> OsResult<()> {
        let call = ApiCall::CloseHandle;
        let mut state = self.enter(call)?;
        let Some(entry) = state.handles.remove(&handle.0) else {
            return Err(call.fail(OsErrorCode::INVALID_HANDLE));
        };
        match entry {
            HandleEntry::Job { job, .. } => state.release_job(job),
            HandleEntry::Port(id) => {
                // Blocked waiters retire the port on their way out.
                let idle = state.ports.get_mut(&id).is_some_and(|port| {
                    port.open = false;
                    port.queue.clear();
                    port.waiters == 0
                });
                if idle {
                    state.ports.remove(&id);
                }
            }
            HandleEntry::Process { .. } => {}
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn create_port(&self) -> OsResult<RawHandle> {
        let mut state = self.enter(ApiCall::CreatePort)?;
        let id = state.next_id();
        state.ports.insert(
            id,
            SimPort {
                open: true,
                waiters: 0,
                queue: VecDeque::new(),
            },
        );
        Ok(state.insert_handle(HandleEntry::Port(id)))
    }

    fn associate_port(&self, job: RawHandle, port: RawHandle) -> OsResult<()> {
        let call = ApiCall::AssociatePort;
        let mut state = self.enter(call)?;
        let id = state.job(job, JOB_OBJECT_SET_ATTRIBUTES, call)?;
        let Some(HandleEntry::Port(port)) = state.handles.get(&port.0).copied() else {
            return Err(call.fail(OsErrorCode::INVALID_HANDLE));
        };
        let sim = state.jobs_mut(id);
        if sim.port.is_some() {
            return Err(call.fail(OsErrorCode::INVALID_PARAMETER));
        }
        sim.port = Some(port);
        Ok(())
    }

    fn dequeue(&self, port: RawHandle, timeout: Option<Duration>) -> OsResult<RawMessage> {
        let call = ApiCall::Dequeue;
        let mut state = self.enter(call)?;
        let Some(HandleEntry::Port(id)) = state.handles.get(&port.0).copied() else {
            return Err(call.fail(OsErrorCode::INVALID_HANDLE));
        };
        let give_up = timeout.map(|t| Instant::now() + t);
        if let Some(sim) = state.ports.get_mut(&id) {
            sim.waiters += 1;
        }
        let result = loop {
            let Some(sim) = state.ports.get_mut(&id) else {
                break Err(call.fail(OsErrorCode::INVALID_HANDLE));
            };
            if !sim.open {
                break Err(call.fail(OsErrorCode::ABANDONED_WAIT_0));
            }
            if let Some(message) = sim.queue.pop_front() {
                break Ok(message);
            }
            let now = Instant::now();
            if give_up.is_some_and(|g| g <= now) {
                break Err(call.fail(OsErrorCode::WAIT_TIMEOUT));
            }
            let wake = match (give_up, state.next_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake {
                Some(at) => {
                    self.changed.wait_until(&mut state, at);
                }
                None => self.changed.wait(&mut state),
            }
            state.advance(Instant::now());
        };
        let retired = state.ports.get_mut(&id).is_some_and(|sim| {
            sim.waiters -= 1;
            !sim.open && sim.waiters == 0
        });
        if retired {
            state.ports.remove(&id);
        }
        result
    }

    fn spawn_suspended(&self, command: &mut Command) -> OsResult<Process> {
        let call = ApiCall::SpawnSuspended;
        let mut state = self.enter(call)?;
        let program = command.get_program().to_string_lossy().into_owned();
        if program.is_empty() {
            return Err(call.fail(OsErrorCode::FILE_NOT_FOUND));
        }
        let pid = state.next_pid;
        state.next_pid += 4;
        state.processes.insert(
            pid,
            SimProcess {
                program,
                state: ProcessState::Suspended,
                job: None,
                user_time: 0,
                kernel_time: 0,
                page_faults: 0,
                io: IoCounters::default(),
                deadline: None,
            },
        );
        Ok(Process::new(pid, None))
    }

    fn resume_process(&self, pid: u32) -> OsResult<()> {
        let call = ApiCall::ResumeProcess;
        let mut state = self.enter(call)?;
        let lifetime = state.process_lifetime;
        let Some(process) = state.processes.get_mut(&pid) else {
            return Err(OsError::new("Thread32First", OsErrorCode::NO_MORE_FILES));
        };
        match process.state {
            ProcessState::Suspended => {
                process.state = ProcessState::Running;
                process.deadline = lifetime.map(|l| Instant::now() + l);
            }
            ProcessState::Running => {}
            ProcessState::Exited(_) => return Err(call.fail(OsErrorCode::ACCESS_DENIED)),
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }
}

/// Convert seconds to 100-nanosecond ticks.
#[must_use]
pub const fn secs_to_ticks(secs: u64) -> u64 {
    secs * TICKS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{JOB_OBJECT_ALL_ACCESS, PROCESS_ALL_ACCESS};

    fn spawn(api: &SimulatedJobApi, job: RawHandle) -> u32 {
        let process = api.spawn_suspended(&mut Command::new("worker")).unwrap();
        let handle = api.open_process(process.pid(), PROCESS_ALL_ACCESS).unwrap();
        api.assign_process(job, handle).unwrap();
        api.close_handle(handle).unwrap();
        process.pid()
    }

    #[test]
    fn named_jobs_are_shared() {
        let api = SimulatedJobApi::new();
        let a = api.create_job("shared").unwrap();
        let b = api.open_job("shared", JOB_OBJECT_ALL_ACCESS).unwrap();
        assert_ne!(a, b);

        api.close_handle(a).unwrap();
        api.close_handle(b).unwrap();
        let err = api.open_job("shared", JOB_OBJECT_ALL_ACCESS).unwrap_err();
        assert_eq!(err.code, OsErrorCode::FILE_NOT_FOUND);
    }

    #[test]
    fn access_rights_are_checked() {
        let api = SimulatedJobApi::new();
        let owner = api.create_job("limited").unwrap();
        let reader = api.open_job("limited", JOB_OBJECT_QUERY).unwrap();

        assert!(api.query_info(reader, InfoClass::Accounting).is_ok());
        let err = api.terminate_job(reader, 1).unwrap_err();
        assert_eq!(err.code, OsErrorCode::ACCESS_DENIED);
        assert_eq!(err.operation, "TerminateJobObject");
        api.close_handle(reader).unwrap();
        api.close_handle(owner).unwrap();
    }

    #[test]
    fn invalid_limit_combinations_are_rejected() {
        let api = SimulatedJobApi::new();
        let job = api.create_job("").unwrap();

        let mut limits = ExtendedLimits::default();
        limits.basic.limit_flags = LimitFlags::SUBSET_AFFINITY;
        let err = api
            .set_info(job, &InfoBlock::ExtendedLimits(limits))
            .unwrap_err();
        assert_eq!(err.code, OsErrorCode::INVALID_PARAMETER);

        let cpu = CpuRateControl {
            control_flags: CpuControlFlags::ENABLE
                | CpuControlFlags::HARD_CAP
                | CpuControlFlags::WEIGHT_BASED,
            value: 5,
        };
        assert!(api.set_info(job, &InfoBlock::CpuRateControl(cpu)).is_err());

        let net = NetRateControl {
            control_flags: NetControlFlags::ENABLE | NetControlFlags::DSCP_TAG,
            dscp_tag: 64,
            ..NetRateControl::default()
        };
        assert!(api.set_info(job, &InfoBlock::NetRateControl(net)).is_err());
        assert!(
            api.set_info(job, &InfoBlock::Accounting(AccountingInfo::default()))
                .is_err()
        );
    }

    #[test]
    fn kill_on_close_terminates_members() {
        let api = SimulatedJobApi::new();
        let job = api.create_job("").unwrap();
        let mut limits = ExtendedLimits::default();
        limits.basic.limit_flags = LimitFlags::KILL_ON_JOB_CLOSE;
        api.set_info(job, &InfoBlock::ExtendedLimits(limits)).unwrap();

        let pid = spawn(&api, job);
        api.resume_process(pid).unwrap();
        assert_eq!(api.process_state(pid), Some(ProcessState::Running));

        api.close_handle(job).unwrap();
        assert_eq!(api.process_state(pid), Some(ProcessState::Exited(0)));
        assert_eq!(api.open_handle_count(), 0);
    }

    #[test]
    fn messages_follow_process_lifecycle() {
        let api = SimulatedJobApi::new();
        let job = api.create_job("").unwrap();
        let port = api.create_port().unwrap();
        api.associate_port(job, port).unwrap();

        let pid = spawn(&api, job);
        api.resume_process(pid).unwrap();
        api.exit_process(pid, 0xC000_0005);

        let timeout = Some(Duration::from_millis(10));
        let codes: Vec<RawMessage> = (0..3).map(|_| api.dequeue(port, timeout).unwrap()).collect();
        assert_eq!(
            codes,
            vec![
                RawMessage { code: msg::NEW_PROCESS, pid },
                RawMessage { code: msg::ABNORMAL_EXIT_PROCESS, pid },
                RawMessage { code: msg::ACTIVE_PROCESS_ZERO, pid: 0 },
            ]
        );
        let err = api.dequeue(port, timeout).unwrap_err();
        assert_eq!(err.code, OsErrorCode::WAIT_TIMEOUT);
    }

    #[test]
    fn closing_port_abandons_waiter() {
        let api = std::sync::Arc::new(SimulatedJobApi::new());
        let port = api.create_port().unwrap();

        let waiter = {
            let api = api.clone();
            std::thread::spawn(move || api.dequeue(port, None))
        };
        while api.count(ApiCall::Dequeue) == 0 {
            std::thread::yield_now();
        }
        api.close_handle(port).unwrap();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.code, OsErrorCode::ABANDONED_WAIT_0);
        assert_eq!(api.port_count(), 0);
        let err = api.dequeue(port, None).unwrap_err();
        assert_eq!(err.code, OsErrorCode::INVALID_HANDLE);
    }

    #[test]
    fn closed_ports_are_forgotten() {
        let api = SimulatedJobApi::new();
        for _ in 0..16 {
            let port = api.create_port().unwrap();
            api.close_handle(port).unwrap();
        }
        assert_eq!(api.port_count(), 0);

        let port = api.create_port().unwrap();
        let err = api
            .dequeue(port, Some(Duration::from_millis(1)))
            .unwrap_err();
        assert_eq!(err.code, OsErrorCode::WAIT_TIMEOUT);
        assert_eq!(api.port_count(), 1);
        api.close_handle(port).unwrap();
        assert_eq!(api.port_count(), 0);
    }

    #[test]
    fn active_process_limit_rejects_extra_process() {
        let api = SimulatedJobApi::new();
        let job = api.create_job("").unwrap();
        let mut limits = ExtendedLimits::default();
        limits.basic.limit_flags = LimitFlags::ACTIVE_PROCESS;
        limits.basic.active_process_limit = 1;
        api.set_info(job, &InfoBlock::ExtendedLimits(limits)).unwrap();

        spawn(&api, job);
        let extra = api.spawn_suspended(&mut Command::new("extra")).unwrap();
        let handle = api.open_process(extra.pid(), PROCESS_ALL_ACCESS).unwrap();
        let err = api.assign_process(job, handle).unwrap_err();
        assert_eq!(err.code, OsErrorCode::NOT_ENOUGH_QUOTA);

        let Ok(InfoBlock::Accounting(info)) = api.query_info(job, InfoClass::Accounting) else {
            panic!("expected accounting block");
        };
        assert_eq!(info.active_processes, 1);
        assert_eq!(info.total_terminated_processes, 1);
    }

    #[test]
    fn process_time_limit_ends_process() {
        let api = SimulatedJobApi::new();
        let job = api.create_job("").unwrap();
        let mut limits = ExtendedLimits::default();
        limits.basic.limit_flags = LimitFlags::PROCESS_TIME;
        limits.basic.per_process_user_time_limit = i64::try_from(secs_to_ticks(1)).unwrap();
        api.set_info(job, &InfoBlock::ExtendedLimits(limits)).unwrap();

        let pid = spawn(&api, job);
        api.run_process(pid, Duration::from_secs(1), Duration::ZERO);
        assert_eq!(api.process_state(pid), Some(ProcessState::Suspended));

        api.resume_process(pid).unwrap();
        api.run_process(pid, Duration::from_millis(500), Duration::ZERO);
        assert_eq!(api.process_state(pid), Some(ProcessState::Running));
        api.run_process(pid, Duration::from_millis(600), Duration::ZERO);
        assert_eq!(api.process_state(pid), Some(ProcessState::Exited(1)));
    }

    #[test]
    fn injected_failures_name_the_operation() {
        let api = SimulatedJobApi::new();
        api.inject_failure(ApiCall::CreatePort, OsErrorCode::NOT_SUPPORTED);
        let err = api.create_port().unwrap_err();
        assert_eq!(err.operation, "CreateIoCompletionPort");
        assert_eq!(err.code, OsErrorCode::NOT_SUPPORTED);

        api.clear_failures();
        assert!(api.create_port().is_ok());
    }
}
