#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use kyrie_core::config::resolve_config;
use kyrie_core::error::ErrorCode;
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use std::env;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "kyrie: issue board sync inspection and simulation",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Output format. Overrides --json, FORMAT and user config.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Inspect board snapshots and replay change streams",
        after_help = "EXAMPLES:\n    kyrie board lanes --snapshot board.json\n    kyrie board replay --snapshot board.json --events changes.jsonl"
    )]
    Board(cmd::board::BoardArgs),

    #[command(
        about = "Deterministic board-sync simulation campaigns",
        after_help = "EXAMPLES:\n    kyrie sim run --seeds 100\n    kyrie sim replay --seed 42"
    )]
    Sim(cmd::sim::SimArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("KYRIE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "kyrie=debug,info"
        } else {
            "kyrie=info,warn"
        })
    });

    let format = env::var("KYRIE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let project_root = env::current_dir()?;
    let effective = match resolve_config(&project_root, cli.json) {
        Ok(effective) => effective,
        Err(err) => {
            let mode = resolve_output_mode(cli.format, if cli.json { "json" } else { "text" });
            render_error(mode, &CliError::coded(ErrorCode::ConfigParseError, format!("{err:#}")))?;
            std::process::exit(1);
        }
    };
    let output = resolve_output_mode(cli.format, &effective.resolved_output);
    let board_config = &effective.project.board;

    let result = match &cli.command {
        Commands::Board(args) => match &args.command {
            cmd::board::BoardCommand::Lanes(args) => cmd::board::run_lanes(args, board_config, output),
            cmd::board::BoardCommand::Replay(args) => {
                cmd::board::run_replay(args, board_config, output)
            }
        },
        Commands::Sim(args) => match &args.command {
            cmd::sim::SimCommand::Run(args) => cmd::sim::run_sim_run(args, output),
            cmd::sim::SimCommand::Replay(args) => cmd::sim::run_sim_replay(args, output),
        },
    };

    if let Err(err) = result {
        match err.downcast_ref::<CliError>() {
            Some(cli_err) => render_error(output, cli_err)?,
            None => render_error(
                output,
                &CliError::coded(ErrorCode::InternalUnexpected, format!("{err:#}")),
            )?,
        }
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_parses_after_subcommand() {
        let cli = Cli::parse_from(["kyrie", "sim", "run", "--json"]);
        assert!(cli.json);
    }

    #[test]
    fn format_flag_parses_before_subcommand() {
        let cli = Cli::parse_from(["kyrie", "--format", "text", "sim", "replay", "--seed", "3"]);
        assert_eq!(cli.format, Some(OutputMode::Text));
        assert!(matches!(cli.command, Commands::Sim(_)));
    }

    #[test]
    fn board_replay_requires_events() {
        assert!(Cli::try_parse_from(["kyrie", "board", "replay", "--snapshot", "b.json"]).is_err());
        assert!(
            Cli::try_parse_from([
                "kyrie", "board", "replay", "--snapshot", "b.json", "--events", "c.jsonl"
            ])
            .is_ok()
        );
    }

    #[test]
    fn sim_policy_accepts_known_values_only() {
        assert!(Cli::try_parse_from(["kyrie", "sim", "run", "--policy", "guarded"]).is_ok());
        assert!(Cli::try_parse_from(["kyrie", "sim", "run", "--policy", "eager"]).is_err());
    }

    #[test]
    fn all_subcommands_listed() {
        let subcommands = [
            vec!["kyrie", "board", "lanes", "--snapshot", "b.json"],
            vec!["kyrie", "board", "replay", "--snapshot", "b.json", "--events", "e.jsonl"],
            vec!["kyrie", "sim", "run"],
            vec!["kyrie", "sim", "replay", "--seed", "1"],
        ];
        for args in &subcommands {
            let result = Cli::try_parse_from(args.iter());
            assert!(result.is_ok(), "Failed to parse: {args:?}: {:?}", result.err());
        }
    }
}
