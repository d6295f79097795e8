mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "mculink", version, about = "Debug protocol host CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_discover_subcommand() {
        let cli = Cli::try_parse_from(["mculink", "discover", "127.0.0.1:5566", "--timeout", "3s"])
            .expect("discover args should parse");
        assert!(matches!(cli.command, Command::Discover(_)));
    }

    #[test]
    fn parses_watch_with_count() {
        let cli = Cli::try_parse_from(["mculink", "watch", "127.0.0.1:5566", "--count", "5"])
            .expect("watch args should parse");
        match cli.command {
            Command::Watch(args) => assert_eq!(args.count, Some(5)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn emulate_defaults_node_id() {
        let cli = Cli::try_parse_from(["mculink", "emulate", "127.0.0.1:5566"])
            .expect("emulate args should parse");
        match cli.command {
            Command::Emulate(args) => assert_eq!(args.node_id, 1),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
