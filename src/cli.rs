use crate::config::job::{JobConfig, ResourceLimits, SecurityLevel};
use crate::config::presets::Interpreter;
use crate::config::settings::WorkerConfig;
use crate::config::validator::validate_worker_config;
use crate::core::engine::LinuxEngine;
use crate::kernel::signal::ShutdownSignal;
use crate::lifecycle::coordinator::Coordinator;
use crate::lifecycle::job::{JobId, JobLogs, JobSnapshot};
use crate::safety::cleanup::sweep_orphans;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Local client id used for jobs submitted from the command line
const LOCAL_CLIENT: &str = "127.0.0.1";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Worker configuration file (JSON)
    #[arg(long, global = true, env = "SANDRUN_CONFIG")]
    config: Option<PathBuf>,
    /// Run in permissive mode (unsafe for untrusted code). Strict is default.
    #[arg(long, global = true)]
    permissive: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove cgroups, mounts and directories left by a previous worker
    Sweep,
    /// Run one job from a local directory and print its final snapshot
    Run {
        /// Directory whose files become the job's inputs
        dir: PathBuf,
        /// Interpreter tag (python3, python, node, bash, sh)
        #[arg(long, short = 'i')]
        interpreter: String,
        /// Entrypoint path relative to the directory
        #[arg(long, short = 'e')]
        entrypoint: String,
        /// Memory limit in MB
        #[arg(long)]
        mem: Option<u64>,
        /// CPU limit in seconds
        #[arg(long)]
        cpu: Option<u64>,
        /// Wall clock time limit in seconds
        #[arg(long)]
        wall_time: Option<u64>,
        /// Maximum number of processes
        #[arg(long)]
        processes: Option<u32>,
        /// Disable /etc binds and process creation
        #[arg(long)]
        paranoid: bool,
        /// Output glob patterns (repeatable)
        #[arg(long = "output", value_name = "PATTERN")]
        outputs: Vec<String>,
        /// Environment variables (KEY=VALUE, repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Arguments passed to the entrypoint
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Validate a worker configuration file
    Check {
        /// Configuration file to check
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct RunReport {
    job: JobSnapshot,
    logs: Option<JobLogs>,
    result_digest: Option<String>,
}

fn load_config(path: Option<&Path>, permissive: bool) -> Result<WorkerConfig> {
    let mut config = match path {
        Some(path) => WorkerConfig::load_from_file(path)?,
        None => WorkerConfig::default(),
    };
    if permissive {
        config.sandbox.strict_mode = false;
    }
    Ok(config)
}

/// Collect every regular file under `dir` as a job input.
fn read_inputs(dir: &Path, config: &mut JobConfig) -> Result<()> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("failed to read {}", current.display()))?
        {
            let entry = entry?;
            let kind = entry.file_type()?;
            let path = entry.path();
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() {
                let rel = path
                    .strip_prefix(dir)
                    .context("input outside job directory")?
                    .to_string_lossy()
                    .into_owned();
                let contents =
                    std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
                config.inputs.push(crate::config::job::InputFile {
                    path: rel,
                    contents,
                    executable: false,
                });
            }
        }
    }
    config.inputs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(())
}

fn parse_env(pairs: &[String], config: &mut JobConfig) -> Result<()> {
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("environment entry must be KEY=VALUE: {}", pair))?;
        config.env.insert(key.to_string(), value.to_string());
    }
    Ok(())
}

fn wait_for_job(coordinator: &Coordinator, id: &JobId, shutdown: &ShutdownSignal) -> Result<JobSnapshot> {
    loop {
        let snapshot = coordinator.status(id)?;
        if snapshot.state.is_terminal() {
            return Ok(snapshot);
        }
        if shutdown.wait(POLL_INTERVAL) {
            log::warn!("Signal {} received; shutting down", shutdown.signal());
            coordinator.shutdown();
            bail!("interrupted before job {} finished", id);
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => {
            let config = WorkerConfig::load_from_file(&file)?;
            let result = validate_worker_config(&config)?;
            for warning in &result.warnings {
                println!("warning: {}", warning);
            }
            for error in &result.errors {
                println!("error: {}", error);
            }
            if !result.is_valid() {
                bail!("{} is invalid", file.display());
            }
            println!("{}: ok", file.display());
            Ok(())
        }
        Commands::Sweep => {
            let config = load_config(cli.config.as_deref(), cli.permissive)?;
            let report = sweep_orphans(&config.sandbox);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                bail!("sweep finished with {} errors", report.errors.len());
            }
            Ok(())
        }
        Commands::Run {
            dir,
            interpreter,
            entrypoint,
            mem,
            cpu,
            wall_time,
            processes,
            paranoid,
            outputs,
            env,
            args,
        } => {
            let shutdown = ShutdownSignal::install().map_err(anyhow::Error::msg)?;
            let config = load_config(cli.config.as_deref(), cli.permissive)?;

            let interpreter = Interpreter::from_tag(&interpreter)
                .with_context(|| format!("unknown interpreter: {}", interpreter))?;
            let defaults = ResourceLimits::default();
            let limits = ResourceLimits {
                memory_mb: mem.unwrap_or(defaults.memory_mb),
                cpu_seconds: cpu.unwrap_or(defaults.cpu_seconds),
                wall_seconds: wall_time.unwrap_or(defaults.wall_seconds),
                max_processes: processes.unwrap_or(defaults.max_processes),
                ..defaults
            };
            let mut job = JobConfig::new(interpreter, entrypoint).with_limits(limits);
            job.args = args;
            job.outputs = outputs;
            if paranoid {
                job.security = SecurityLevel::Paranoid;
            }
            parse_env(&env, &mut job)?;
            read_inputs(&dir, &mut job)?;

            let engine = LinuxEngine::new(config.sandbox.clone())?;
            let coordinator = Coordinator::start(config, Arc::new(engine))?;
            let id = coordinator.submit(job, LOCAL_CLIENT)?;
            eprintln!("Submitted job {}", id);

            let snapshot = wait_for_job(&coordinator, &id, &shutdown)?;
            let report = RunReport {
                logs: coordinator.logs(&id).ok(),
                result_digest: coordinator.result_digest(&id).ok(),
                job: snapshot,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            log::debug!("{}", coordinator.metrics().render_prometheus());

            let failed = report.job.failure.is_some();
            coordinator.acknowledge_download(&id)?;
            coordinator.shutdown();
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sandrun", "--permissive", "run", "job", "-i", "python3", "-e", "main.py", "--cpu", "5",
            "--env", "A=1", "--", "--flag",
        ])
        .unwrap();
        assert!(cli.permissive);
        match cli.command {
            Commands::Run { interpreter, cpu, env, args, .. } => {
                assert_eq!(interpreter, "python3");
                assert_eq!(cpu, Some(5));
                assert_eq!(env, vec!["A=1"]);
                assert_eq!(args, vec!["--flag"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn inputs_are_read_recursively_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print(1)").unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/x.csv"), "a,b").unwrap();

        let mut job = JobConfig::new(Interpreter::Python3, "main.py");
        read_inputs(dir.path(), &mut job).unwrap();
        let paths: Vec<_> = job.inputs.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["data/x.csv", "main.py"]);
        assert_eq!(job.inputs[1].contents, b"print(1)");
    }

    #[test]
    fn env_pairs_need_an_equals_sign() {
        let mut job = JobConfig::new(Interpreter::Sh, "run.sh");
        parse_env(&["A=1=2".to_string()], &mut job).unwrap();
        assert_eq!(job.env["A"], "1=2");
        assert!(parse_env(&["NOPE".to_string()], &mut job).is_err());
    }
}
