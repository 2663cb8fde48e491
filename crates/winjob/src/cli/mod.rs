//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio::time::Interval;

use crate::api::info::PriorityClass;
use crate::api::sim::SimulatedJobApi;
use crate::api::{JobApi, system_api};
use crate::config::{
    CpuConfig, LimitConfig, MemoryConfig, NetworkConfig, ProcessConfig, RunConfig, TimeConfig,
    UiRestriction,
};
use crate::job::{DEFAULT_EXIT_CODE, JobObject};
use crate::limit::catalogue;
use crate::notify::{NotificationType, notify};

/// How long a simulated process runs before it exits.
const SIMULATED_LIFETIME: Duration = Duration::from_millis(500);

/// Winjob - run and inspect processes under job object limits
#[derive(Parser)]
#[command(name = "winjob")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Use the in-memory job model instead of the OS
    #[arg(long, global = true, env = "WINJOB_SIMULATE")]
    pub simulate: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a command inside a new job and relay its notifications
    Run {
        /// Job name (anonymous when omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Path to a JSON or TOML run configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print counters at this interval (e.g. "5s")
        #[arg(short, long)]
        interval: Option<String>,

        /// Leave the job running on Ctrl-C
        #[arg(long)]
        keep_on_interrupt: bool,

        /// Limits applied on top of the configuration file
        #[command(flatten)]
        limits: LimitArgs,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Show the limits set on a named job
    Limits {
        /// Job name
        name: String,
    },

    /// Show the accounting counters of a named job
    Counters {
        /// Job name
        name: String,

        /// Keep printing at this interval until interrupted
        #[arg(short, long)]
        interval: Option<String>,
    },

    /// Terminate every process in a named job
    Terminate {
        /// Job name
        name: String,

        /// Exit code given to the processes
        #[arg(short, long, default_value_t = DEFAULT_EXIT_CODE)]
        exit_code: u32,
    },

    /// Remove every limit from a named job
    Reset {
        /// Job name
        name: String,
    },
}

/// Limit flags of the `run` command.
#[derive(Args, Debug, Default)]
pub struct LimitArgs {
    /// Terminate the processes when the job closes
    #[arg(long)]
    pub kill_on_close: bool,

    /// Allow breakaway for children that ask for it
    #[arg(long)]
    pub breakaway_ok: bool,

    /// Let every child leave the job
    #[arg(long)]
    pub silent_breakaway_ok: bool,

    /// Kill processes on unhandled exceptions
    #[arg(long)]
    pub die_on_unhandled_exception: bool,

    /// Committed memory of the whole job (e.g. "512Mi")
    #[arg(long)]
    pub job_memory: Option<String>,

    /// Committed memory of each process
    #[arg(long)]
    pub process_memory: Option<String>,

    /// User time of the whole job (e.g. "30s")
    #[arg(long)]
    pub job_time: Option<String>,

    /// User time of each process
    #[arg(long)]
    pub process_time: Option<String>,

    /// Maximum simultaneously active processes
    #[arg(long)]
    pub active_processes: Option<u32>,

    /// Processor affinity mask
    #[arg(long)]
    pub affinity: Option<usize>,

    /// Priority class (idle, below_normal, normal, above_normal, high, realtime)
    #[arg(long)]
    pub priority_class: Option<PriorityClass>,

    /// Scheduling class (0-9)
    #[arg(long)]
    pub scheduling_class: Option<u32>,

    /// Hard CPU cap (e.g. "25%")
    #[arg(long, conflicts_with_all = ["cpu_weight", "cpu_max"])]
    pub cpu_hard_cap: Option<String>,

    /// CPU weight (1-9)
    #[arg(long, conflicts_with = "cpu_max")]
    pub cpu_weight: Option<u32>,

    /// Reserved minimum CPU rate
    #[arg(long, requires = "cpu_max")]
    pub cpu_min: Option<String>,

    /// Maximum CPU rate
    #[arg(long)]
    pub cpu_max: Option<String>,

    /// UI restriction (repeatable)
    #[arg(long = "ui", value_enum)]
    pub ui: Vec<UiRestriction>,

    /// Outgoing bandwidth ceiling in bytes per second (e.g. "10Mi")
    #[arg(long)]
    pub max_bandwidth: Option<String>,

    /// DSCP tag for outgoing traffic (0-63)
    #[arg(long)]
    pub dscp_tag: Option<u8>,
}

impl LimitArgs {
    /// Overlay the flags onto `config`. Flags win over file values.
    pub fn merge_into(self, config: &mut LimitConfig) {
        let flags = &mut config.flags;
        flags.kill_on_job_close |= self.kill_on_close;
        flags.breakaway_ok |= self.breakaway_ok;
        flags.silent_breakaway_ok |= self.silent_breakaway_ok;
        flags.die_on_unhandled_exception |= self.die_on_unhandled_exception;

        if self.job_memory.is_some() || self.process_memory.is_some() {
            let memory = config.memory.get_or_insert_with(MemoryConfig::default);
            memory.job = self.job_memory.or(memory.job.take());
            memory.process = self.process_memory.or(memory.process.take());
        }

        if self.job_time.is_some() || self.process_time.is_some() {
            let time = config.time.get_or_insert_with(TimeConfig::default);
            time.job = self.job_time.or(time.job.take());
            time.process = self.process_time.or(time.process.take());
        }

        if self.active_processes.is_some()
            || self.affinity.is_some()
            || self.priority_class.is_some()
            || self.scheduling_class.is_some()
        {
            let processes = config.processes.get_or_insert_with(ProcessConfig::default);
            processes.active = self.active_processes.or(processes.active);
            processes.affinity = self.affinity.or(processes.affinity);
            processes.priority_class = self.priority_class.or(processes.priority_class);
            processes.scheduling_class = self.scheduling_class.or(processes.scheduling_class);
        }

        // A CPU flag replaces the whole file section; modes do not mix.
        if self.cpu_hard_cap.is_some() || self.cpu_weight.is_some() || self.cpu_max.is_some() {
            config.cpu = Some(CpuConfig {
                hard_cap: self.cpu_hard_cap,
                weight: self.cpu_weight,
                min: self.cpu_min,
                max: self.cpu_max,
            });
        }

        for restriction in self.ui {
            if !config.ui.contains(&restriction) {
                config.ui.push(restriction);
            }
        }

        if self.max_bandwidth.is_some() || self.dscp_tag.is_some() {
            let network = config.network.get_or_insert_with(NetworkConfig::default);
            network.max_bandwidth = self.max_bandwidth.or(network.max_bandwidth.take());
            network.dscp_tag = self.dscp_tag.or(network.dscp_tag);
        }
    }
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let api = self.api()?;

        match self.command {
            Commands::Run {
                name,
                config,
                interval,
                keep_on_interrupt,
                limits,
                command,
            } => {
                let mut run_config = match config {
                    Some(path) => RunConfig::from_file(&path).wrap_err_with(|| {
                        format!("Failed to load run configuration {}", path.display())
                    })?,
                    None => RunConfig::default(),
                };
                if let Some(name) = name {
                    run_config.name = name;
                }
                if interval.is_some() {
                    run_config.counters_interval = interval;
                }
                if keep_on_interrupt {
                    run_config.terminate_on_interrupt = false;
                }
                limits.merge_into(&mut run_config.limits);

                run(api, run_config, &command).await
            }

            Commands::Limits { name } => {
                let mut job = JobObject::open(api, &name)
                    .map_err(|e| eyre!("Failed to open job {}: {}", name, e))?;
                job.query_limits()?;
                let report = catalogue::report(job.info());
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }

            Commands::Counters { name, interval } => {
                let mut job = JobObject::open(api, &name)
                    .map_err(|e| eyre!("Failed to open job {}: {}", name, e))?;
                println!("{}", serde_json::to_string_pretty(&job.counters()?)?);

                let Some(interval) = interval else {
                    return Ok(());
                };
                let mut ticker = tokio::time::interval(parse_interval(&interval)?);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            println!("{}", serde_json::to_string(&job.counters()?)?);
                        }
                        _ = tokio::signal::ctrl_c() => return Ok(()),
                    }
                }
            }

            Commands::Terminate { name, exit_code } => {
                let job = JobObject::open(api, &name)
                    .map_err(|e| eyre!("Failed to open job {}: {}", name, e))?;
                job.terminate_with_exit_code(exit_code)
                    .map_err(|e| eyre!("Failed to terminate job {}: {}", name, e))?;
                println!("Job {} terminated with exit code {}", name, exit_code);
                Ok(())
            }

            Commands::Reset { name } => {
                let mut job = JobObject::open(api, &name)
                    .map_err(|e| eyre!("Failed to open job {}: {}", name, e))?;
                job.reset_limits()
                    .map_err(|e| eyre!("Failed to reset job {}: {}", name, e))?;
                println!("Limits of job {} removed", name);
                Ok(())
            }
        }
    }

    fn api(&self) -> Result<Arc<dyn JobApi>> {
        if self.simulate {
            tracing::info!("Using the simulated job API");
            return Ok(Arc::new(
                SimulatedJobApi::new().with_process_lifetime(SIMULATED_LIFETIME),
            ));
        }
        Ok(system_api()?)
    }
}

fn parse_interval(value: &str) -> Result<Duration> {
    let config = RunConfig {
        counters_interval: Some(value.to_string()),
        ..RunConfig::default()
    };
    config
        .counters_interval()?
        .ok_or_else(|| eyre!("Missing interval"))
}

/// Wait for the next tick, or forever without a ticker.
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(api: Arc<dyn JobApi>, config: RunConfig, command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| eyre!("No command given"))?;
    let interval = config.counters_interval()?;
    let limits = config.limits.into_limits()?;

    let mut job = JobObject::create(api, &config.name, &limits)
        .map_err(|e| eyre!("Failed to create job: {}", e))?;
    tracing::info!(job = %job.name(), limits = limits.len(), "Job created");

    // Subscribe first so the new-process message is not missed.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = notify(tx, &job)?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    let process = match crate::launch::start_in_job(&mut cmd, &job) {
        Ok(process) => process,
        Err(err) => {
            if let Err(terminate_err) = job.terminate() {
                tracing::warn!(error = %terminate_err, "Failed to terminate job after launch failure");
            }
            return Err(eyre!("Failed to start {}: {}", program, err));
        }
    };
    tracing::info!(pid = process.pid(), program = %program, "Process started");

    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.reset();
        ticker
    });

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(notification) = message else {
                    if let Some(err) = subscription.err() {
                        return Err(eyre!("Notification loop failed: {}", err));
                    }
                    break;
                };
                println!("{}", serde_json::to_string(&notification)?);
                if notification.kind == NotificationType::ActiveProcessZero {
                    break;
                }
            }
            () = tick(&mut ticker) => {
                println!("{}", serde_json::to_string(&job.counters()?)?);
            }
            _ = tokio::signal::ctrl_c() => {
                if config.terminate_on_interrupt {
                    job.terminate()?;
                    tracing::info!(job = %job.name(), "Job terminated on interrupt");
                }
                break;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&job.counters()?)?);
    subscription.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "winjob",
            "--simulate",
            "run",
            "--kill-on-close",
            "--job-memory",
            "64Mi",
            "--cpu-hard-cap",
            "25%",
            "--ui",
            "handles",
            "--",
            "build.exe",
            "--release",
        ])
        .unwrap();
        assert!(cli.simulate);
        let Commands::Run { limits, command, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(command, ["build.exe", "--release"]);

        let mut config = LimitConfig::default();
        limits.merge_into(&mut config);
        assert_eq!(
            config.into_limits().unwrap(),
            vec![
                crate::limit::Limit::kill_on_job_close(),
                crate::limit::Limit::job_memory(64 << 20),
                crate::limit::Limit::cpu_hard_cap(2500),
                crate::limit::Limit::ui_handles(),
            ]
        );
    }

    #[test]
    fn cpu_modes_conflict() {
        let result = Cli::try_parse_from([
            "winjob", "run", "--cpu-hard-cap", "10%", "--cpu-weight", "2", "app.exe",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_override_file_values() {
        let mut config = LimitConfig {
            memory: Some(MemoryConfig {
                job: Some("1Gi".into()),
                process: Some("128Mi".into()),
                ..MemoryConfig::default()
            }),
            ..LimitConfig::default()
        };
        let args = LimitArgs {
            job_memory: Some("2Gi".into()),
            ..LimitArgs::default()
        };
        args.merge_into(&mut config);
        let memory = config.memory.unwrap();
        assert_eq!(memory.job.as_deref(), Some("2Gi"));
        assert_eq!(memory.process.as_deref(), Some("128Mi"));
    }

    #[tokio::test]
    async fn simulated_run_ends_when_the_job_empties() {
        let api: Arc<dyn JobApi> =
            Arc::new(SimulatedJobApi::new().with_process_lifetime(Duration::from_millis(20)));
        let config = RunConfig::default().with_name("sim-run");
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(api, config, &["app.exe".to_string()]),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
