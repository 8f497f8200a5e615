use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use chime::assistant::{Assistant, AssistantHandle, AssistantState};
use chime::audio::capture::CpalMicrophone;
use chime::audio::playback::CpalPlayback;
use chime::config::{Config, DeviceKind};
use chime::error::ChimeError;
use chime::net::client::WsConnector;

#[derive(Parser)]
#[command(
    name = "chime",
    about = "Talk to a live voice model from your terminal",
    long_about = "Chime streams your microphone to a Gemini Live session, plays the \
        spoken reply back without gaps, shows running transcripts of both sides, \
        and answers the model's show_direction tool with a timed on-screen cue."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/chime/config.yaml if not specified.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the chime crate, showing per-frame
    /// capture, scheduling and session detail.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the assistant (foreground)
    ///
    /// Connects to the live session and reads commands from stdin:
    /// `start` begins streaming the microphone, `stop` ends it, `reset`
    /// clears the conversation and reconnects, `quit` exits. Ctrl+C also
    /// exits.
    Run,

    /// List audio devices
    ///
    /// Shows every input and output device recognized by the system. Use
    /// --input or --output to save a device name to the config file.
    Devices {
        /// Write this input device name to the config file
        #[arg(long)]
        input: Option<String>,

        /// Write this output device name to the config file
        #[arg(long)]
        output: Option<String>,
    },

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map_or_else(Config::default_path, Config::expand_path)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("chime=debug,info")
    } else {
        EnvFilter::new("chime=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    install_completions_if_missing();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("TLS crypto provider already installed");
    }

    if let Err(e) = run(cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Auto-install shell completions for `$SHELL` if the completion file does not
/// already exist. Errors are ignored so that missing dirs or unsupported
/// shells never block normal operation.
fn install_completions_if_missing() {
    let Ok(shell_env) = std::env::var("SHELL") else {
        return;
    };

    let Some(home) = dirs::home_dir() else {
        return;
    };

    let (shell, path) = if shell_env.ends_with("/bash") {
        let dir = home.join(".local/share/bash-completion/completions");
        (Shell::Bash, dir.join("chime"))
    } else if shell_env.ends_with("/zsh") {
        (Shell::Zsh, home.join(".zfunc/_chime"))
    } else if shell_env.ends_with("/fish") {
        (Shell::Fish, home.join(".config/fish/completions/chime.fish"))
    } else {
        return;
    };

    if path.exists() {
        return;
    }

    if let Some(parent) = path.parent()
        && std::fs::create_dir_all(parent).is_err()
    {
        return;
    }

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), "chime", &mut buf);

    let _ = std::fs::write(&path, buf);
}

fn run(cli: Cli) -> Result<(), ChimeError> {
    match cli.command {
        Command::Run => {
            let config = Config::load_or_default(&config_path(&cli))?;
            config.require_api_key()?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_assistant(config))
        }
        Command::Devices {
            ref input,
            ref output,
        } => run_devices(&cli, input.as_deref(), output.as_deref()),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "chime", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn print_device_list(devices: &[String], default_name: Option<&str>) {
    if devices.is_empty() {
        println!("  (none)");
    }
    for (i, name) in devices.iter().enumerate() {
        let marker = if default_name == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }
}

fn run_devices(cli: &Cli, input: Option<&str>, output: Option<&str>) -> Result<(), ChimeError> {
    if input.is_some() || output.is_some() {
        let path = config_path(cli);
        if let Some(name) = input {
            Config::set_audio_device(&path, DeviceKind::Input, name)?;
            println!("Set input device to: {name}");
        }
        if let Some(name) = output {
            Config::set_audio_device(&path, DeviceKind::Output, name)?;
            println!("Set output device to: {name}");
        }
        return Ok(());
    }

    let inputs = chime::audio::capture::list_input_devices()?;
    println!("Input devices:");
    print_device_list(
        &inputs,
        chime::audio::capture::default_input_device_name().as_deref(),
    );

    let outputs = chime::audio::playback::list_output_devices()?;
    println!("Output devices:");
    print_device_list(
        &outputs,
        chime::audio::playback::default_output_device_name().as_deref(),
    );

    Ok(())
}

async fn run_assistant(config: Config) -> Result<(), ChimeError> {
    let microphone = CpalMicrophone::new(&config.audio);
    let playback = CpalPlayback::new(&config.audio)?;

    let (assistant, handle) = Assistant::new(
        config,
        Box::new(microphone),
        Box::new(playback),
        Arc::new(WsConnector::new()),
    );

    tokio::spawn(print_updates(handle.subscribe()));
    tokio::spawn(read_commands(handle.clone()));

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C, shutting down...");
        let _ = ctrl_c.shutdown().await;
    });

    println!("Commands: start, stop, reset, quit");
    assistant.run().await;
    Ok(())
}

async fn read_commands(handle: AssistantHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("failed to read stdin: {e}");
                break;
            }
        };

        let result = match line.trim() {
            "" => continue,
            "start" => handle.start().await,
            "stop" => handle.stop().await,
            "reset" => handle.reset().await,
            "quit" | "exit" => break,
            other => {
                println!("unknown command '{other}' (start, stop, reset, quit)");
                continue;
            }
        };
        if result.is_err() {
            return;
        }
    }

    let _ = handle.shutdown().await;
}

/// Print what changed between snapshots.
async fn print_updates(mut updates: watch::Receiver<AssistantState>) {
    let mut last = AssistantState::default();

    while updates.changed().await.is_ok() {
        let state = updates.borrow_and_update().clone();

        if state.status != last.status {
            println!("[{}] {}", state.connection, state.status);
        }
        if state.error != last.error
            && let Some(error) = &state.error
        {
            println!("error: {error}");
        }
        if state.direction != last.direction {
            println!(">> direction: {}", state.direction);
        }
        if state.history.len() > last.history.len() {
            for entry in &state.history[last.history.len()..] {
                println!(
                    "{} {}: {}",
                    entry.at.format("%H:%M:%S"),
                    entry.speaker.label(),
                    entry.text
                );
            }
        }

        last = state;
    }
}
