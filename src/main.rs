//! FlashFwd - A Fluentd Forward Protocol Listener
//!
//! This is the main entry point for the FlashFwd binary.
//! It opens the forward input, writes every decoded record to stdout as a
//! JSON line, and shuts down gracefully on Ctrl+C or SIGTERM.

use flashfwd::server::{ForwardInput, InputConfig, DEFAULT_MAX_MESSAGE_SIZE};
use flashfwd::sink::JsonLinesSink;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Binary configuration
struct Config {
    /// Bind address (`tcp://host:port` or `unix://path`)
    bind: String,
    /// Largest accepted message in bytes
    max_message_size: usize,
    /// Default log filter when `RUST_LOG` is unset
    log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: flashfwd::DEFAULT_BIND.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--bind" | "-b" => {
                    if i + 1 < args.len() {
                        config.bind = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --bind requires a value");
                        std::process::exit(1);
                    }
                }
                "--max-message-size" => {
                    if i + 1 < args.len() {
                        config.max_message_size = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid message size");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --max-message-size requires a value");
                        std::process::exit(1);
                    }
                }
                "--log-level" => {
                    if i + 1 < args.len() {
                        config.log_level = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --log-level requires a value");
                        std::process::exit(1);
                    }
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("FlashFwd version {}", flashfwd::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }
}

fn print_help() {
    println!(
        r#"
FlashFwd - A Fluentd Forward Protocol Listener

USAGE:
    flashfwd [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>               Listen address (default: {})
        --max-message-size <BYTES>  Largest accepted message (default: {})
        --log-level <FILTER>        Log filter when RUST_LOG is unset (default: info)
    -v, --version                   Print version information
    -h, --help                      Print this help message

EXAMPLES:
    flashfwd                                  # Listen on 127.0.0.1:24224
    flashfwd --bind tcp://0.0.0.0:24224       # Listen on all interfaces
    flashfwd --bind unix:///tmp/fluent.sock   # Listen on a Unix socket

OUTPUT:
    One JSON object per record on stdout; logs go to stderr.
    $ echo '["app.log", 1700000000, {{"msg": "hi"}}]' | nc 127.0.0.1 24224
    {{"tag":"app.log","time":1700000000,"record":{{"msg":"hi"}}}}
"#,
        flashfwd::DEFAULT_BIND,
        DEFAULT_MAX_MESSAGE_SIZE
    );
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging; stdout carries the records
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let input_config =
        InputConfig::new(config.bind.clone()).with_max_message_size(config.max_message_size);
    let input = ForwardInput::with_config(input_config, Arc::new(JsonLinesSink::stdout())).await?;

    info!(
        version = flashfwd::VERSION,
        local = input.local_addr(),
        "FlashFwd ready to accept connections"
    );
    input.start();

    shutdown_signal().await?;
    info!("Shutdown signal received, stopping input...");

    input.stop();
    input.wait_for_shutdown().await;

    info!(
        entries = input.entries(),
        connections = input.stats().connections_accepted(),
        bytes = input.stats().bytes_read(),
        "Input shutdown complete"
    );
    Ok(())
}
