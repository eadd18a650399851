mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use log::error;
use portkeeper::config::{self, SupervisorConfig};
use portkeeper::{Supervisor, Termination};

fn main() {
    let args = cli::Args::parse();

    // Initialize logger with custom format
    let default_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(default_level)
        .parse_default_env()
        .init();

    match real_main(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn real_main(args: cli::Args) -> Result<i32> {
    let cfg = load_config(&args)?;
    let mut sup = Supervisor::new(cfg);

    Ok(match args.sub {
        cli::Cmd::Start => handle_start(&mut sup),
        cli::Cmd::Stop => handle_stop(&mut sup),
        cli::Cmd::Restart => handle_restart(&mut sup),
        cli::Cmd::Status { json } => handle_status(&mut sup, json)?,
    })
}

fn load_config(args: &cli::Args) -> Result<SupervisorConfig> {
    let path = config::resolve_config_path(args.config.as_deref(), args.system)?;
    let mut cfg = config::load_or_init(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(port) = args.port {
        cfg.override_port(port);
        cfg.validate().context("Invalid --port override")?;
    }
    Ok(cfg)
}

/// Handle start command - exit 0 once the port is confirmed bound
fn handle_start(sup: &mut Supervisor) -> i32 {
    let name = sup.config().name.clone();
    match sup.start() {
        Ok(report) => {
            if !report.displaced.is_empty() {
                println!("{name}: terminated previous occupant(s) {:?}", report.displaced);
            }
            println!(
                "{name} started (pid {}) and listening on port {}",
                report.pid, report.port
            );
            0
        }
        Err(e) => {
            eprintln!("Failed to start {name}: {e:#}");
            1
        }
    }
}

/// Handle stop command - absence of a running process is not an error
fn handle_stop(sup: &mut Supervisor) -> i32 {
    let name = sup.config().name.clone();
    match sup.stop() {
        Ok(report) if report.was_running() => {
            let pids: Vec<u32> = report
                .terminated
                .iter()
                .filter(|(_, t)| *t == Termination::Stopped)
                .map(|(pid, _)| *pid)
                .collect();
            if report.port_released {
                println!("{name} stopped (pid {pids:?}), port {} released", report.port);
            } else {
                println!(
                    "{name} stopped (pid {pids:?}), but port {} is still bound",
                    report.port
                );
            }
            0
        }
        Ok(report) => {
            println!("{name} is not running (port {} free)", report.port);
            0
        }
        Err(e) => {
            eprintln!("Failed to stop {name}: {e:#}");
            1
        }
    }
}

/// Handle restart command - exit code follows the start
fn handle_restart(sup: &mut Supervisor) -> i32 {
    let name = sup.config().name.clone();
    match sup.restart() {
        Ok(report) => {
            println!(
                "{name} restarted (pid {}) and listening on port {}",
                report.pid, report.port
            );
            0
        }
        Err(e) => {
            eprintln!("Failed to restart {name}: {e:#}");
            1
        }
    }
}

/// Handle status command - exit 0 when running, 1 when stopped
fn handle_status(sup: &mut Supervisor, json: bool) -> Result<i32> {
    let report = sup.status().context("Failed to query status")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize status")?
        );
    } else if report.is_running() {
        let pid = report
            .recorded_pid
            .filter(|_| report.recorded_pid_alive)
            .map_or_else(|| "unrecorded".to_string(), |p| p.to_string());
        println!(
            "{} is running (pid {pid}, port {} owners {:?})",
            report.name, report.port, report.port_owners
        );
    } else {
        println!("{} is stopped (port {} free)", report.name, report.port);
    }
    Ok(if report.is_running() { 0 } else { 1 })
}
