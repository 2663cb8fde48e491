//! Limit and run configuration.
//!
//! [`LimitConfig`] is the file and CLI form of a job's limits. Sizes, rates
//! and durations are written as human quantities (`"64Mi"`, `"12.5%"`,
//! `"30s"`) and checked when converted with [`LimitConfig::into_limits`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use winjob_common::{Quantity, WinjobError, WinjobResult};

use crate::api::info::PriorityClass;
use crate::limit::Limit;

/// Boolean limit flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlagConfig {
    /// Terminate every process when the job closes.
    pub kill_on_job_close: bool,
    /// Allow breakaway for children that ask for it.
    pub breakaway_ok: bool,
    /// Let every child leave the job.
    pub silent_breakaway_ok: bool,
    /// Kill processes on unhandled exceptions.
    pub die_on_unhandled_exception: bool,
    /// Keep the job time limit already in force.
    pub preserve_job_time: bool,
    /// Let processes narrow the job affinity.
    pub subset_affinity: bool,
}

/// Memory limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Committed memory of the whole job.
    pub job: Option<String>,
    /// Committed memory of each process.
    pub process: Option<String>,
    /// Minimum working set.
    pub working_set_min: Option<String>,
    /// Maximum working set.
    pub working_set_max: Option<String>,
}

/// User-mode time limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeConfig {
    /// Time of the whole job.
    pub job: Option<String>,
    /// Time of each process.
    pub process: Option<String>,
}

/// Process scheduling limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessConfig {
    /// Maximum simultaneously active processes.
    pub active: Option<u32>,
    /// Processor affinity mask.
    pub affinity: Option<usize>,
    /// Priority class name (`idle`, `below_normal`, `normal`, ...).
    pub priority_class: Option<PriorityClass>,
    /// Scheduling class (0-9).
    pub scheduling_class: Option<u32>,
}

/// CPU rate control. Only one mode may be given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CpuConfig {
    /// Hard cap (`"25%"` or cycles per 10 000).
    pub hard_cap: Option<String>,
    /// Scheduling weight (1-9).
    pub weight: Option<u32>,
    /// Reserved minimum rate.
    pub min: Option<String>,
    /// Maximum rate.
    pub max: Option<String>,
}

/// Network rate control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Outgoing bandwidth ceiling (`"10Mi"`).
    pub max_bandwidth: Option<String>,
    /// DSCP tag (0-63).
    pub dscp_tag: Option<u8>,
}

/// A user-interface restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UiRestriction {
    /// No desktops.
    Desktop,
    /// No display settings.
    DisplaySettings,
    /// No `ExitWindows`.
    ExitWindows,
    /// Private atom table.
    GlobalAtoms,
    /// No foreign USER handles.
    Handles,
    /// No clipboard reads.
    ReadClipboard,
    /// No clipboard writes.
    WriteClipboard,
    /// No system parameter changes.
    SystemParameters,
}

impl UiRestriction {
    /// The limit this restriction stands for.
    #[must_use]
    pub const fn limit(self) -> Limit {
        match self {
            Self::Desktop => Limit::ui_desktop(),
            Self::DisplaySettings => Limit::ui_display_settings(),
            Self::ExitWindows => Limit::ui_exit_windows(),
            Self::GlobalAtoms => Limit::ui_global_atoms(),
            Self::Handles => Limit::ui_handles(),
            Self::ReadClipboard => Limit::ui_read_clipboard(),
            Self::WriteClipboard => Limit::ui_write_clipboard(),
            Self::SystemParameters => Limit::ui_system_parameters(),
        }
    }
}

/// Every limit a job can be given, in configuration form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitConfig {
    /// Boolean flags.
    pub flags: FlagConfig,
    /// Memory limits.
    pub memory: Option<MemoryConfig>,
    /// Time limits.
    pub time: Option<TimeConfig>,
    /// Process limits.
    pub processes: Option<ProcessConfig>,
    /// CPU rate control.
    pub cpu: Option<CpuConfig>,
    /// UI restrictions.
    pub ui: Vec<UiRestriction>,
    /// Network rate control.
    pub network: Option<NetworkConfig>,
}

fn memory(value: &str) -> WinjobResult<usize> {
    let bytes = Quantity::parse_memory(value)?.as_bytes();
    usize::try_from(bytes).map_err(|_| WinjobError::InvalidQuantity {
        value: value.to_string(),
    })
}

fn duration(value: &str) -> WinjobResult<Duration> {
    Ok(Quantity::parse_duration(value)?.as_duration())
}

fn cpu_rate(value: &str) -> WinjobResult<u32> {
    let cycles = Quantity::parse_cpu_rate(value)?.as_cycles();
    u32::try_from(cycles).map_err(|_| WinjobError::InvalidQuantity {
        value: value.to_string(),
    })
}

fn config_error(message: impl Into<String>) -> WinjobError {
    WinjobError::Config {
        message: message.into(),
    }
}

impl LimitConfig {
    /// Whether no limit is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clone().into_limits().is_ok_and(|limits| limits.is_empty())
    }

    /// Validate and convert to limits, flags first.
    pub fn into_limits(self) -> WinjobResult<Vec<Limit>> {
        let mut limits = Vec::new();

        let flags = self.flags;
        for (enabled, limit) in [
            (flags.kill_on_job_close, Limit::kill_on_job_close()),
            (flags.breakaway_ok, Limit::breakaway_ok()),
            (flags.silent_breakaway_ok, Limit::silent_breakaway_ok()),
            (flags.die_on_unhandled_exception, Limit::die_on_unhandled_exception()),
            (flags.preserve_job_time, Limit::preserve_job_time()),
        ] {
            if enabled {
                limits.push(limit);
            }
        }

        if let Some(memory_config) = self.memory {
            if let Some(job) = &memory_config.job {
                limits.push(Limit::job_memory(memory(job)?));
            }
            if let Some(process) = &memory_config.process {
                limits.push(Limit::process_memory(memory(process)?));
            }
            match (&memory_config.working_set_min, &memory_config.working_set_max) {
                (Some(min), Some(max)) => {
                    let (min, max) = (memory(min)?, memory(max)?);
                    if min > max {
                        return Err(config_error(
                            "working_set_min must not exceed working_set_max",
                        ));
                    }
                    limits.push(Limit::working_set(min, max));
                }
                (None, None) => {}
                _ => {
                    return Err(config_error(
                        "working_set_min and working_set_max must be given together",
                    ));
                }
            }
        }

        if let Some(time) = self.time {
            if let Some(job) = &time.job {
                limits.push(Limit::job_time(duration(job)?));
            }
            if let Some(process) = &time.process {
                limits.push(Limit::process_time(duration(process)?));
            }
        }

        if let Some(processes) = self.processes {
            if let Some(active) = processes.active {
                limits.push(Limit::active_processes(active));
            }
            if let Some(mask) = processes.affinity {
                limits.push(Limit::affinity(mask));
            }
            if let Some(class) = processes.priority_class {
                limits.push(Limit::priority_class(class));
            }
            if let Some(class) = processes.scheduling_class {
                if class > 9 {
                    return Err(config_error(format!(
                        "scheduling_class must be 0-9, got {class}"
                    )));
                }
                limits.push(Limit::scheduling_class(class));
            }
        }
        if flags.subset_affinity {
            if !limits.iter().any(|l| matches!(l, Limit::Affinity(_))) {
                return Err(config_error("subset_affinity requires an affinity mask"));
            }
            limits.push(Limit::subset_affinity());
        }

        if let Some(cpu) = self.cpu {
            limits.push(cpu.into_limit()?);
        }

        limits.extend(self.ui.into_iter().map(UiRestriction::limit));

        if let Some(network) = self.network {
            if let Some(bandwidth) = &network.max_bandwidth {
                let bytes = Quantity::parse_memory(bandwidth)?.as_bytes();
                limits.push(Limit::outgoing_bandwidth(bytes));
            }
            if let Some(tag) = network.dscp_tag {
                if tag > 63 {
                    return Err(config_error(format!("dscp_tag must be 0-63, got {tag}")));
                }
                limits.push(Limit::dscp_tag(tag));
            }
        }

        Ok(limits)
    }
}

impl CpuConfig {
    fn into_limit(self) -> WinjobResult<Limit> {
        match (self.hard_cap, self.weight, self.min, self.max) {
            (Some(cap), None, None, None) => Ok(Limit::cpu_hard_cap(cpu_rate(&cap)?)),
            (None, Some(weight), None, None) => {
                if !(1..=9).contains(&weight) {
                    return Err(config_error(format!("cpu weight must be 1-9, got {weight}")));
                }
                Ok(Limit::cpu_weight(weight))
            }
            (None, None, min, Some(max)) => {
                let max = cpu_rate(&max)?;
                let min = min.as_deref().map_or(Ok(0), cpu_rate)?;
                if min > max {
                    return Err(config_error("cpu min must not exceed max"));
                }
                // Rates never exceed 10 000, so both fit in 16 bits.
                let narrow = |v: u32| u16::try_from(v).map_err(|_| config_error("cpu rate out of range"));
                Ok(Limit::cpu_min_max(narrow(min)?, narrow(max)?))
            }
            (None, None, None, None) => Err(config_error("cpu section sets no mode")),
            _ => Err(config_error(
                "cpu hard_cap, weight and min/max are mutually exclusive",
            )),
        }
    }
}

/// Settings of the `run` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Job name; empty for an anonymous job.
    pub name: String,
    /// Limits applied to the job.
    pub limits: LimitConfig,
    /// Print counters this often (`"5s"`); never when unset.
    pub counters_interval: Option<String>,
    /// Terminate the job when the runner is interrupted.
    pub terminate_on_interrupt: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            limits: LimitConfig::default(),
            counters_interval: None,
            terminate_on_interrupt: true,
        }
    }
}

impl RunConfig {
    /// Load from a JSON or TOML file, chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> WinjobResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&content).map_err(|err| WinjobError::Serialization(err.to_string()))
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }

    /// Set the job name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the limits.
    #[must_use]
    pub fn with_limits(mut self, limits: LimitConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Print counters at this interval.
    #[must_use]
    pub fn with_counters_interval(mut self, interval: Duration) -> Self {
        self.counters_interval = Some(format!("{}ms", interval.as_millis()));
        self
    }

    /// Choose whether an interrupt terminates the job.
    #[must_use]
    pub const fn with_terminate_on_interrupt(mut self, terminate: bool) -> Self {
        self.terminate_on_interrupt = terminate;
        self
    }

    /// The parsed counters interval.
    pub fn counters_interval(&self) -> WinjobResult<Option<Duration>> {
        let Some(value) = &self.counters_interval else {
            return Ok(None);
        };
        let interval = duration(value)?;
        if interval.is_zero() {
            return Err(config_error("counters_interval must be positive"));
        }
        Ok(Some(interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = RunConfig::default();
        assert!(config.name.is_empty());
        assert!(config.terminate_on_interrupt);
        assert!(config.limits.is_empty());
        assert_eq!(config.counters_interval().unwrap(), None);
    }

    #[test]
    fn builder_pattern() {
        let config = RunConfig::default()
            .with_name("build")
            .with_counters_interval(Duration::from_secs(2))
            .with_terminate_on_interrupt(false);

        assert_eq!(config.name, "build");
        assert!(!config.terminate_on_interrupt);
        assert_eq!(
            config.counters_interval().unwrap(),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn limits_from_quantities() {
        let config = LimitConfig {
            flags: FlagConfig {
                kill_on_job_close: true,
                ..FlagConfig::default()
            },
            memory: Some(MemoryConfig {
                job: Some("64Mi".into()),
                ..MemoryConfig::default()
            }),
            time: Some(TimeConfig {
                process: Some("250ms".into()),
                ..TimeConfig::default()
            }),
            cpu: Some(CpuConfig {
                hard_cap: Some("12.5%".into()),
                ..CpuConfig::default()
            }),
            ui: vec![UiRestriction::ReadClipboard],
            ..LimitConfig::default()
        };
        assert_eq!(
            config.into_limits().unwrap(),
            vec![
                Limit::kill_on_job_close(),
                Limit::job_memory(64 << 20),
                Limit::process_time(Duration::from_millis(250)),
                Limit::cpu_hard_cap(1250),
                Limit::ui_read_clipboard(),
            ]
        );
    }

    #[test]
    fn cpu_modes_are_exclusive() {
        let cpu = CpuConfig {
            hard_cap: Some("10%".into()),
            weight: Some(3),
            ..CpuConfig::default()
        };
        let config = LimitConfig {
            cpu: Some(cpu),
            ..LimitConfig::default()
        };
        assert!(matches!(
            config.into_limits(),
            Err(WinjobError::Config { .. })
        ));
    }

    #[test]
    fn cpu_min_max_defaults_min_to_zero() {
        let cpu = CpuConfig {
            max: Some("50%".into()),
            ..CpuConfig::default()
        };
        assert_eq!(cpu.into_limit().unwrap(), Limit::cpu_min_max(0, 5000));
    }

    #[test]
    fn subset_affinity_needs_affinity() {
        let mut config = LimitConfig {
            flags: FlagConfig {
                subset_affinity: true,
                ..FlagConfig::default()
            },
            ..LimitConfig::default()
        };
        assert!(config.clone().into_limits().is_err());

        config.processes = Some(ProcessConfig {
            affinity: Some(0b1),
            ..ProcessConfig::default()
        });
        let limits = config.into_limits().unwrap();
        assert_eq!(limits, vec![Limit::affinity(1), Limit::subset_affinity()]);
    }

    #[test]
    fn half_a_working_set_is_rejected() {
        let config = LimitConfig {
            memory: Some(MemoryConfig {
                working_set_min: Some("1Mi".into()),
                ..MemoryConfig::default()
            }),
            ..LimitConfig::default()
        };
        assert!(config.into_limits().is_err());
    }

    #[test]
    fn load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
name = "nightly"
counters_interval = "5s"

[limits]
ui = ["desktop", "handles"]

[limits.flags]
kill_on_job_close = true

[limits.processes]
active = 4
priority_class = "below_normal"
"#
        )
        .unwrap();

        let config = RunConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "nightly");
        assert_eq!(config.counters_interval().unwrap(), Some(Duration::from_secs(5)));
        assert_eq!(
            config.limits.into_limits().unwrap(),
            vec![
                Limit::kill_on_job_close(),
                Limit::active_processes(4),
                Limit::priority_class(PriorityClass::BELOW_NORMAL),
                Limit::ui_desktop(),
                Limit::ui_handles(),
            ]
        );
    }

    #[test]
    fn load_json_file_rejects_unknown_fields() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"name": "x", "limitz": {{}}}}"#).unwrap();
        let err = RunConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, WinjobError::Serialization(_)));
    }
}
