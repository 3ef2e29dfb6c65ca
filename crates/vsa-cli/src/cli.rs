use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use vsa::config::Config;

use crate::commands::replay::{handle_replay, ReplayOptions};
use crate::commands::tool::handle_tool;
use crate::logging::{setup_logging, LogFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        long,
        value_enum,
        global = true,
        default_value = "text",
        help = "Log output format (text, json)"
    )]
    log_format: LogFormat,

    #[arg(
        long,
        value_name = "PATH",
        global = true,
        help = "Path to the config file",
        long_help = "Path to a YAML config file. Secrets are read from secrets.yaml next to it. Defaults to the user config directory."
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Invoke one backend tool directly")]
    Tool {
        #[arg(help = "Tool name as the model would call it (e.g. tavily_search)")]
        name: String,

        #[arg(long, value_name = "JSON", help = "Tool arguments as a JSON object")]
        args: Option<String>,

        #[arg(long, help = "Print the raw result segments instead of the summary")]
        raw: bool,
    },

    #[command(
        about = "Replay captured control-channel frames through a session",
        long_about = "Feed a JSONL file of inbound control-channel frames to a session over an in-memory channel. Tool calls in the capture are dispatched to the configured backends and everything the session emits is printed."
    )]
    Replay {
        #[arg(help = "JSONL file, one frame per line")]
        path: PathBuf,

        #[arg(
            long,
            value_name = "MS",
            default_value_t = 5000,
            help = "How long to keep the session open after the last frame"
        )]
        linger_ms: u64,

        #[arg(long, value_name = "URL", help = "Canvas service to send canvas commands to")]
        canvas_url: Option<String>,

        #[arg(long, help = "Print session events as JSON lines")]
        json: bool,

        #[arg(short, long, help = "Also print every inbound protocol event")]
        verbose: bool,
    },
}

pub async fn cli() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_format)?;

    let explicit;
    let config = match cli.config {
        Some(path) => {
            let secrets = path.with_file_name("secrets.yaml");
            explicit = Config::new(path, secrets);
            &explicit
        }
        None => Config::global(),
    };

    match cli.command {
        Command::Tool { name, args, raw } => handle_tool(config, &name, args.as_deref(), raw).await,
        Command::Replay {
            path,
            linger_ms,
            canvas_url,
            json,
            verbose,
        } => {
            handle_replay(
                config,
                ReplayOptions {
                    path,
                    linger: Duration::from_millis(linger_ms),
                    canvas_url,
                    json,
                    verbose,
                },
            )
            .await
        }
    }
}
