//! # Command-Line Interface / 命令行接口
//!
//! Builds the `plan-runner` command with clap's builder API and dispatches to
//! the subcommands.
//!
//! 使用 clap 的构建器 API 构建 `plan-runner` 命令并分派到各个子命令。

pub mod commands;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::infra::logging;

/// The default name of the plan file.
pub const DEFAULT_PLAN_FILE: &str = "Plan.toml";

fn plan_arg() -> Arg {
    Arg::new("plan")
        .short('p')
        .long("plan")
        .help("Path to the plan file")
        .value_name("PLAN")
        .default_value(DEFAULT_PLAN_FILE)
        .value_parser(clap::value_parser!(PathBuf))
        .action(ArgAction::Set)
}

pub fn build_cli() -> Command {
    Command::new("plan-runner")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs a tree of dependent tests, each master inside its own isolated host")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Log level used when RUST_LOG is not set")
                .value_name("LEVEL")
                .default_value("warn")
                .global(true)
                .action(ArgAction::Set),
        )
        .subcommand(
            Command::new("run")
                .about("Run every master of a plan file")
                .arg(plan_arg())
                .arg(
                    Arg::new("jobs")
                        .short('j')
                        .long("jobs")
                        .help("Number of masters that may run at the same time")
                        .value_name("JOBS")
                        .value_parser(clap::value_parser!(usize))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("grace-secs")
                        .long("grace-secs")
                        .help("Seconds running masters get to finish after Ctrl-C")
                        .value_name("SECONDS")
                        .value_parser(clap::value_parser!(u64))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .help("Print the output of every command")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Validate a plan file and print its execution order")
                .arg(plan_arg()),
        )
        .subcommand(
            Command::new("init")
                .about("Write a sample plan file")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("Where to write the plan file")
                        .value_name("OUTPUT")
                        .default_value(DEFAULT_PLAN_FILE)
                        .value_parser(clap::value_parser!(PathBuf))
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Overwrite an existing file")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("agent")
                .about("Serve an isolated host over stdin/stdout")
                .hide(true),
        )
}

fn plan_path(matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<PathBuf>("plan")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PLAN_FILE))
}

pub async fn run() -> Result<ExitCode> {
    let matches = build_cli().get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("warn");
    logging::init(log_level);

    match matches.subcommand() {
        Some(("run", run_matches)) => {
            let passed = commands::run::execute(
                plan_path(run_matches),
                run_matches.get_one::<usize>("jobs").copied(),
                run_matches.get_one::<u64>("grace-secs").copied(),
                run_matches.get_flag("verbose"),
            )
            .await?;
            Ok(if passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Some(("plan", plan_matches)) => {
            commands::plan::execute(plan_path(plan_matches))?;
            Ok(ExitCode::SUCCESS)
        }
        Some(("init", init_matches)) => {
            let output = init_matches
                .get_one::<PathBuf>("output")
                .cloned()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PLAN_FILE));
            commands::init::execute(&output, init_matches.get_flag("force"))?;
            Ok(ExitCode::SUCCESS)
        }
        Some(("agent", _)) => {
            commands::agent::execute().await?;
            Ok(ExitCode::SUCCESS)
        }
        // Clap has already printed help, since a subcommand is required.
        _ => Ok(ExitCode::FAILURE),
    }
}
