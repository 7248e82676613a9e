use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spooky_panel::device::index_map;
use spooky_panel::speech::SpeechRequest;
use spooky_panel::{Config, Daemon, DaemonOptions, Persona, ShowRegistry, TopologyKind, daemon};

/// Spooky - LED panel shows synchronized with a two-persona voice
#[derive(Parser)]
#[command(name = "spooky", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/spooky/panel/config.toml)
    #[arg(short, long, env = "SPOOKY_CONFIG")]
    config: Option<PathBuf>,

    /// Serial device for the panel controller
    #[arg(short, long, env = "SPOOKY_DEVICE")]
    device: Option<String>,

    /// Discard speech audio
    #[arg(long)]
    mute: bool,

    /// Render without opening a device
    #[arg(long)]
    headless: bool,

    /// Read console commands from stdin ("evil: text", "/listen", "/show rainbow", ...)
    #[arg(long)]
    stdin: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the panel daemon (default)
    Run,
    /// Speak one line and exit
    Say {
        /// Text to speak
        text: String,
        /// Voice to use ("benevolent" or "evil")
        #[arg(short, long, default_value = "benevolent")]
        persona: Persona,
        /// Delivery hint passed to the TTS model
        #[arg(short, long)]
        emotion: Option<String>,
    },
    /// Render a show on the panel for a while
    TestPanel {
        /// Show to render
        #[arg(short, long, default_value = "rainbow")]
        show: String,
        /// Duration in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
    /// Print the wire index of every cell
    Topology {
        /// Topology to print (defaults to the configured one)
        #[arg(short, long)]
        kind: Option<TopologyKind>,
    },
    /// List available shows
    Shows,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,spooky_panel=info",
        1 => "info,spooky_panel=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(device) = cli.device {
        config.panel.device = Some(device);
    }
    tracing::debug!(
        panel = ?config.panel,
        provider = ?config.speech.provider,
        model = %config.speech.model,
        "loaded configuration"
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let options = DaemonOptions {
                headless: cli.headless,
                mute: cli.mute,
                stdin: cli.stdin,
            };
            let daemon = Daemon::new(config, options)?;
            daemon.run().await?;
        }
        Command::Say {
            text,
            persona,
            emotion,
        } => {
            let mut request = SpeechRequest::new(text, persona);
            if let Some(emotion) = emotion {
                request = request.with_emotion(emotion);
            }
            daemon::speak_once(&config, request, cli.mute).await?;
        }
        Command::TestPanel { show, seconds } => {
            let duration = Duration::from_secs(seconds);
            daemon::run_test_panel(&config, &show, duration, cli.headless).await?;
        }
        Command::Topology { kind } => print_topology(&config, kind.unwrap_or(config.panel.topology)),
        Command::Shows => {
            for name in ShowRegistry::with_builtins().names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}

/// Print the index map as a grid, one panel row per line
fn print_topology(config: &Config, kind: TopologyKind) {
    let (width, height) = (config.panel.width, config.panel.height);
    let indices = index_map(kind.build().as_ref(), width, height);
    let cell = (width * height).saturating_sub(1).to_string().len();

    println!("{kind} ({width}x{height})");
    for row in indices.chunks(width) {
        let line: Vec<String> = row.iter().map(|i| format!("{i:>cell$}")).collect();
        println!("{}", line.join(" "));
    }
}
