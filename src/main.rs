use std::path::PathBuf;

use feedmark::app::Command;
use feedmark::config::{self, LogConfig};
use tracing_subscriber::EnvFilter;

const HELP: &str = "Feedmark: mark feed posts as read and keep them hidden.\n\n  scan <PAGE> [--dismiss <ID>]...  Replay a page snapshot and report each post\n  count                            Print how many posts are dismissed\n  clear                            Forget every dismissed post\n  --version, -V                    Show version and exit\n  --help,    -h                    Show this help message";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if handle_cli_flags(&args) {
        return;
    }

    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}\n\n{HELP}");
            std::process::exit(2);
        }
    };

    let cfg = match config::load(config::LoadOptions::default()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(1);
        }
    };
    init_logging(&cfg.log);

    if let Err(err) = feedmark::run(&cfg, command) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Logs go to stderr; `RUST_LOG` wins over the configured filter.
fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .unwrap_or_else(|_| EnvFilter::new("feedmark=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_cli_flags(args: &[String]) -> bool {
    let mut saw_flag = false;
    for arg in args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("Feedmark {}", feedmark::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{HELP}");
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let mut args = args.iter();
    match args.next().map(String::as_str) {
        Some("scan") => {
            let mut page = None;
            let mut dismiss = Vec::new();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--dismiss" => {
                        let id = args.next().ok_or("--dismiss needs an id")?;
                        dismiss.push(id.clone());
                    }
                    other if page.is_none() => page = Some(PathBuf::from(other)),
                    other => return Err(format!("unexpected argument {other}")),
                }
            }
            let page = page.ok_or("scan needs a page snapshot")?;
            Ok(Command::Scan { page, dismiss })
        }
        Some("count") => Ok(Command::Count),
        Some("clear") => Ok(Command::Clear),
        Some(other) => Err(format!("unknown command {other}")),
        None => Err("missing command".to_string()),
    }
}
