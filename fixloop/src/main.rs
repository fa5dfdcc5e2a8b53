//! Iterative command-driven repair loop.
//!
//! `fixloop repair` runs a command, asks a diagnosis oracle for a fix whenever it fails,
//! applies the fix, and retries until the command passes or attempts run out.
//! `fixloop checklist` does the same for every item of a configured checklist, and
//! `fixloop update` implements a requirements document until a verification command
//! passes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fixloop::checklist::{ChecklistReport, run_checklist};
use fixloop::core::history::History;
use fixloop::exit_codes;
use fixloop::io::config::{RepairConfig, default_config_path, load_config, write_config};
use fixloop::io::process::ShellRunner;
use fixloop::io::report::write_report;
use fixloop::logging;
use fixloop::repair::{RepairLoop, RepairOutcome, RepairStatus, RepairTarget, SessionSettings};
use fixloop::update::{UpdateLoop, UpdateOutcome, UpdateSettings, UpdateStatus, UpdateTarget};

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Run a command and let an agent repair the project until it passes"
)]
struct Cli {
    /// Config file (default: `<root>/.fixloop/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config to `.fixloop/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Repair a single command until it exits 0.
    Repair {
        /// Shell command to repair, e.g. "make test".
        command: String,
        #[command(flatten)]
        run: RunArgs,
        /// Directory the command runs in, relative to the root.
        #[arg(long)]
        workdir: Option<String>,
        /// Override `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Override `command_timeout_secs` from the config.
        #[arg(long)]
        timeout: Option<u64>,
        /// Free this TCP port before every run (repeatable).
        #[arg(long = "cleanup-port", value_name = "PORT")]
        cleanup_ports: Vec<u16>,
    },
    /// Repair every item of the configured checklist in order.
    Checklist {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Implement a requirements document until the verification command passes.
    Update {
        /// Requirements document given to the agent.
        #[arg(long)]
        requirements: PathBuf,
        /// Override `update.verification_command` from the config.
        #[arg(long)]
        verify: Option<String>,
        /// Override `update.max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Project root that bounds reads and writes.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Write a JSON report here when done.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Write per-iteration logs under this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(cli.config.as_deref(), force),
        Command::Repair {
            command,
            run,
            workdir,
            max_iterations,
            timeout,
            cleanup_ports,
        } => {
            let mut cfg = load_for(cli.config.as_deref(), &run.root)?;
            if let Some(max_iterations) = max_iterations {
                cfg.max_iterations = max_iterations;
            }
            if let Some(timeout) = timeout {
                cfg.command_timeout_secs = timeout;
            }
            cfg.validate().context("invalid command-line overrides")?;
            cmd_repair(&cfg, &run, command, workdir, cleanup_ports)
        }
        Command::Checklist { run } => {
            let cfg = load_for(cli.config.as_deref(), &run.root)?;
            cmd_checklist(&cfg, &run)
        }
        Command::Update {
            requirements,
            verify,
            max_iterations,
            run,
        } => {
            let mut cfg = load_for(cli.config.as_deref(), &run.root)?;
            if let Some(verify) = verify {
                cfg.update.verification_command = verify;
            }
            if let Some(max_iterations) = max_iterations {
                cfg.update.max_iterations = max_iterations;
            }
            cfg.validate().context("invalid command-line overrides")?;
            cmd_update(&cfg, &run, &requirements)
        }
    }
}

fn cmd_init(config: Option<&Path>, force: bool) -> Result<i32> {
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_config_path(Path::new(".")));
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &RepairConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_repair(
    cfg: &RepairConfig,
    args: &RunArgs,
    command: String,
    workdir: Option<String>,
    cleanup_ports: Vec<u16>,
) -> Result<i32> {
    if command.trim().is_empty() {
        bail!("command must not be empty");
    }
    let root = project_root(&args.root)?;
    let oracle = cfg.command_oracle();
    let settings = SessionSettings {
        log_dir: args.log_dir.clone(),
        ..SessionSettings::from_config(cfg)
    };
    let repair = RepairLoop::new(&ShellRunner, &oracle, settings);
    let target = RepairTarget::new(command, root)
        .with_workdir(workdir)
        .with_cleanup_ports(cleanup_ports);

    let outcome = repair.run(&target);
    print_outcome(&outcome);
    if let Some(path) = &args.report {
        write_report(path, &outcome)?;
    }
    Ok(if outcome.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::EXHAUSTED
    })
}

fn cmd_checklist(cfg: &RepairConfig, args: &RunArgs) -> Result<i32> {
    if cfg.checklist.is_empty() {
        bail!("checklist is empty (add [[checklist]] entries to the config)");
    }
    let root = project_root(&args.root)?;
    let oracle = cfg.command_oracle();
    let settings = SessionSettings {
        log_dir: args.log_dir.clone(),
        ..SessionSettings::from_config(cfg)
    };
    let repair = RepairLoop::new(&ShellRunner, &oracle, settings);

    let report = run_checklist(&repair, &root, &cfg.checklist);
    print_checklist(&report);
    if let Some(path) = &args.report {
        write_report(path, &report)?;
    }
    Ok(if report.all_succeeded() {
        exit_codes::OK
    } else {
        exit_codes::EXHAUSTED
    })
}

fn cmd_update(cfg: &RepairConfig, args: &RunArgs, requirements: &Path) -> Result<i32> {
    let requirements = fs::read_to_string(requirements)
        .with_context(|| format!("read requirements {}", requirements.display()))?;
    if requirements.trim().is_empty() {
        bail!("requirements file is empty");
    }
    let root = project_root(&args.root)?;
    let oracle = cfg.command_oracle();
    let settings = UpdateSettings {
        log_dir: args.log_dir.clone(),
        ..UpdateSettings::from_config(cfg)
    };
    let update = UpdateLoop::new(&ShellRunner, &oracle, settings);
    let target = UpdateTarget {
        requirements,
        verification_command: cfg.update.verification_command.clone(),
        project_root: root,
    };

    let outcome = update.run(&target);
    print_update(&outcome);
    if let Some(path) = &args.report {
        write_report(path, &outcome)?;
    }
    Ok(if outcome.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::EXHAUSTED
    })
}

fn load_for(config: Option<&Path>, root: &Path) -> Result<RepairConfig> {
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_config_path(root));
    load_config(&path)
}

fn project_root(root: &Path) -> Result<PathBuf> {
    let metadata =
        fs::metadata(root).with_context(|| format!("project root {}", root.display()))?;
    if !metadata.is_dir() {
        bail!("project root {} is not a directory", root.display());
    }
    fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))
}

fn print_outcome(outcome: &RepairOutcome) {
    match outcome.status {
        RepairStatus::Succeeded { iteration } => {
            println!("PASS `{}` (iteration {iteration})", outcome.command);
        }
        RepairStatus::Exhausted { max_iterations } => {
            println!(
                "FAIL `{}` (gave up after {max_iterations} iterations)",
                outcome.command
            );
        }
    }
    print_history(&outcome.history);
}

fn print_update(outcome: &UpdateOutcome) {
    let command = &outcome.verification_command;
    match outcome.status {
        UpdateStatus::Verified { iteration } => {
            println!("PASS `{command}` (iteration {iteration})");
        }
        UpdateStatus::NoChanges { iteration } => {
            println!("FAIL `{command}` (no changes proposed at iteration {iteration})");
        }
        UpdateStatus::ApplyFailed { iteration } => {
            println!("FAIL `{command}` (changes could not be applied at iteration {iteration})");
        }
        UpdateStatus::Exhausted { max_iterations } => {
            println!("FAIL `{command}` (gave up after {max_iterations} iterations)");
        }
    }
    print_history(&outcome.history);
}

fn print_history(history: &History) {
    for entry in history.entries() {
        println!(
            "  #{} [{:?}] {}",
            entry.iteration,
            entry.remediation.solution_type,
            first_line(&entry.remediation.root_cause)
        );
    }
}

fn print_checklist(report: &ChecklistReport) {
    for item in &report.items {
        let mark = if item.success { "PASS" } else { "FAIL" };
        println!("{mark} {}", item.name);
        for session in &item.sessions {
            print_history(&session.history);
        }
    }
    let passed = report.items.iter().filter(|item| item.success).count();
    println!("{passed}/{} checks passed", report.items.len());
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
