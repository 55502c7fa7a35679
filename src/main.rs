use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use vmc_connect::hook::HookKind;
use vmc_connect::session::{DisconnectOutcome, SessionError};
use vmc_connect::{Config, ConnectFailure, SessionContext, SessionOutcome};

#[derive(Parser)]
#[command(name = "vmc-connect")]
#[command(about = "USB mobile broadband modem lifecycle controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./vmc-connect.toml, then user and /etc locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Dial the modem and hold the session until disconnect
    Connect {
        /// Seconds to wait for the link to come up
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Ask the running session to disconnect
    Disconnect,
    /// Show current session status
    Status,
    /// Clean up after a session whose controller died
    Recover,
    /// Generate default config file
    Init,
    /// udev entry point for USB add/remove events
    ///
    /// Reads ACTION, DEVPATH and PRODUCT from the environment and prints
    /// udev properties on stdout. Do not call this directly.
    Device,
    /// pppd ip-up/ip-down hook entry point
    ///
    /// Usage: vmc-connect hook ip-up "$@"
    Hook {
        /// ip-up or ip-down
        kind: String,
        /// Arguments pppd passed to the hook
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Process exit status for a failed connect
fn exit_code(failure: &ConnectFailure) -> i32 {
    match failure {
        ConnectFailure::Busy => 2,
        ConnectFailure::DeviceNotReady => 3,
        ConnectFailure::AuthRejected => 4,
        ConnectFailure::NoCarrier => 5,
        ConnectFailure::Timeout => 6,
        ConnectFailure::Ppp(_) => 7,
        ConnectFailure::Setup(_) => 8,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr: udev and pppd read our stdout
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Init = cli.command {
        info!("Generating default config...");
        let path = cli
            .config
            .unwrap_or_else(|| PathBuf::from(vmc_connect::config::CONFIG_FILE_NAME));
        Config::default().save(&path)?;
        println!("Created default config: {}", path.display());
        return Ok(());
    }

    let config = Config::discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {}
        Commands::Connect { timeout } => {
            info!("Connecting to peer {}...", config.dial.peer);
            match vmc_connect::run_session(&config, timeout).await {
                Ok(SessionOutcome::Disconnected) => println!("Disconnected"),
                Ok(SessionOutcome::Dropped(code)) => {
                    println!("Connection dropped (pppd exit {:?})", code);
                    std::process::exit(1);
                }
                Ok(SessionOutcome::Failed(failure)) => {
                    println!("Connect failed: {}", failure);
                    std::process::exit(exit_code(&failure));
                }
                Err(e) => {
                    error!("Teardown failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Disconnect => {
            let context = SessionContext::from_config(&config)?;
            match context.request_disconnect()? {
                DisconnectOutcome::NotConnected => println!("Not connected"),
                DisconnectOutcome::Requested(record) => {
                    println!("Disconnect requested from pid {}", record.owner_pid)
                }
                DisconnectOutcome::Recovered(report) => println!(
                    "Controller was gone; recovered (restored: {})",
                    report.restored
                ),
            }
        }
        Commands::Status => {
            let context = SessionContext::from_config(&config)?;
            println!("{}", context.status()?);
        }
        Commands::Recover => {
            let context = SessionContext::from_config(&config)?;
            match context.recover() {
                Ok(report) => {
                    if let Some(record) = report.released {
                        println!("Released stale lock of {}", record.session_tag);
                    }
                    println!("Network state restored: {}", report.restored);
                    println!("Dial privileges revoked: {}", report.privileges_revoked);
                }
                Err(SessionError::OwnerAlive(record)) => {
                    println!(
                        "Session {} is still running (pid {}); use `vmc-connect disconnect`",
                        record.session_tag, record.owner_pid
                    );
                    std::process::exit(exit_code(&ConnectFailure::Busy));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Device => match vmc_connect::handle_device_mode(&config).await {
            Ok(action) => {
                for property in action.udev_properties() {
                    println!("{}", property);
                }
            }
            Err(e) => {
                error!("Device handling failed: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Hook { kind, args } => {
            let kind: HookKind = kind.parse()?;
            match vmc_connect::handle_hook_mode(&config, kind, &args) {
                Ok(action) => info!("Hook completed: {:?}", action),
                Err(e) => {
                    error!("Hook failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
