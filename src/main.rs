use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use computer_bridge::config::Config;
use computer_bridge::environment::{PowerRequest, SimulatedEnvironment};
use computer_bridge::fs::{DirMount, FileSystem};
use computer_bridge::Computer;

fn print_help() {
    println!(
        "\
computer-bridge v{}

Host harness for the sandboxed computer capability bridge. Boots one
computer, ticks its clock at the configured rate and logs every event
it produces.

USAGE:
    computer-bridge [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/bridge.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, computer_bridge=debug,warn)

EXAMPLES:
    computer-bridge                            # uses config/bridge.toml
    computer-bridge /etc/bridge/computer.toml  # custom config path
    RUST_LOG=debug computer-bridge             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

fn build_filesystem(config: &Config) -> Result<FileSystem> {
    let fs_config = &config.filesystem;
    let root = DirMount::new(&fs_config.root, fs_config.capacity)
        .with_context(|| format!("mounting {}", fs_config.root.display()))?;
    let mut fs = FileSystem::new("hdd", Arc::new(root));
    if let Some(rom) = &fs_config.rom {
        let mount = DirMount::read_only(rom)?;
        fs.mount("rom", "rom", Arc::new(mount))
            .context("mounting rom")?;
    }
    Ok(fs)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("computer-bridge v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("computer_bridge=info")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/bridge.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Computer: #{}", config.computer.id);
    info!("Filesystem root: {}", config.filesystem.root.display());
    info!(
        "Websockets: {} (max {}, hosts: {})",
        if config.websocket.enabled { "enabled" } else { "disabled" },
        config.websocket.max_connections,
        config.websocket.allowed_hosts.join(", ")
    );

    let env = Arc::new(SimulatedEnvironment::new(
        config.computer.id,
        config.computer.label.clone(),
    ));
    let mut computer = Computer::with_standard_apis(
        env.clone(),
        config.events.queue_limit,
        build_filesystem(&config)?,
        config.websocket.clone(),
        tokio::runtime::Handle::current(),
    );
    computer.startup();

    let mut ticker = tokio::time::interval(Duration::from_millis(config.clock.tick_millis.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // ── Tick loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                env.advance(1);
                computer.tick();
                for event in computer.deliver_events(&mut Vec::new()).events {
                    info!("Event: {event}");
                }
                match env.take_power_request() {
                    Some(PowerRequest::Shutdown) => {
                        info!("Shutdown requested by script, exiting");
                        break;
                    }
                    Some(PowerRequest::Reboot) => {
                        warn!("Reboot requested by script");
                        computer.reboot();
                    }
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
        }
    }

    computer.shutdown();
    Ok(())
}
