//! virtual-input CLI
//!
//! Document validation, device listing and a session client for
//! virtual-input.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use virtual_input::action::{key_part, modifier_part};
use virtual_input::protocol::{clamp_name, ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "virtual-input")]
#[command(about = "Virtual key input tool")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/virtual-input/config.kdl")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and every document it references
    Validate,

    /// Validate a key-table document
    ValidateTable { file: PathBuf },

    /// Validate a post-lookup document
    ValidatePostLookup { file: PathBuf },

    /// List available input devices
    Devices,

    /// Connect to the session socket and print received key messages
    Listen {
        /// Session name reported to the daemon
        #[arg(short, long)]
        name: String,

        /// Session socket path
        #[arg(short, long, default_value = "/tmp/keyhandler")]
        socket: PathBuf,
    },
}

fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&cli.config).into_owned().into();

    match cli.command {
        Commands::Validate => cmd_validate(&config_path),
        Commands::ValidateTable { file } => cmd_validate_table(&file).map(|_| ()),
        Commands::ValidatePostLookup { file } => cmd_validate_post_lookup(&file).map(|_| ()),
        Commands::Devices => cmd_devices(),
        Commands::Listen { name, socket } => {
            let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
            runtime.block_on(cmd_listen(&name, &socket))
        }
    }
}

fn cmd_validate(config_path: &Path) -> miette::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = virtual_input_config::parse_config(config_path).map_err(miette::Report::new)?;

    println!("Configuration is valid!");
    println!("  Backend: {:?} at {}", config.global.backend, config.global.locator.display());
    println!(
        "  Repeat: start={}ms interval={}ms limit={}",
        config.global.repeat.start_ms, config.global.repeat.interval_ms, config.global.repeat.limit
    );

    let mut failures = 0;

    println!("  Tables: {}", config.tables.len());
    for table in &config.tables {
        let default = config.global.default_table.as_deref() == Some(table.name.as_str());
        println!(
            "    - {}{}{}",
            table.name,
            if default { " (default)" } else { "" },
            if table.pass_through { " (pass-through)" } else { "" }
        );
        if let Err(e) = cmd_validate_table(&table.path) {
            eprintln!("{:?}", e);
            failures += 1;
        }
    }

    println!("  Sources: {}", config.sources.len());
    for source in &config.sources {
        println!(
            "    - {} -> {}{}",
            source.path.display(),
            source.table.as_deref().unwrap_or("<default>"),
            if source.grab { " (grab)" } else { "" }
        );
    }

    println!("  Post-lookups: {}", config.post_lookups.len());
    for post_lookup in &config.post_lookups {
        println!("    - {}", post_lookup.session);
        if let Err(e) = cmd_validate_post_lookup(&post_lookup.path) {
            eprintln!("{:?}", e);
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(miette::miette!("{} referenced document(s) failed to load", failures));
    }
    Ok(())
}

/// Returns the number of rows loaded
fn cmd_validate_table(file: &Path) -> miette::Result<usize> {
    let document = virtual_input_config::parse_key_table(file).map_err(miette::Report::new)?;

    println!(
        "      {}: {} row(s), {} malformed",
        file.display(),
        document.rows.len(),
        document.malformed
    );
    Ok(document.rows.len())
}

/// Returns the number of conversions loaded
fn cmd_validate_post_lookup(file: &Path) -> miette::Result<usize> {
    let document = virtual_input_config::parse_post_lookup(file).map_err(miette::Report::new)?;

    println!(
        "      {}: {} conversion(s), {} skipped",
        file.display(),
        document.conversions.len(),
        document.skipped
    );
    Ok(document.conversions.len())
}

fn cmd_devices() -> miette::Result<()> {
    if !nix::unistd::geteuid().is_root() {
        println!("(not running as root, some devices may be missing)");
    }
    println!("Available input devices:\n");

    for device in virtual_input::source::enumerate_devices().map_err(|e| miette::miette!("{:#}", e))? {
        let device_type = if device.keyboard { "keys" } else { "other" };

        println!("  {} [{}]", device.name, device_type);
        println!("    Path: {}", device.path.display());
        println!("    ID: {}", device.vendor_product());
        println!();
    }

    Ok(())
}

async fn cmd_listen(name: &str, socket: &Path) -> miette::Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| miette::miette!("Failed to connect to {}: {}", socket.display(), e))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let name = clamp_name(name);
    println!("Connected to {} as '{}'", socket.display(), name);

    while let Some(line) = lines.next_line().await.into_diagnostic()? {
        match serde_json::from_str::<ServerMessage>(&line) {
            Ok(ServerMessage::Name) => {
                let mut reply = serde_json::to_string(&ClientMessage::Name { name: name.clone() })
                    .into_diagnostic()?;
                reply.push('\n');
                writer.write_all(reply.as_bytes()).await.into_diagnostic()?;
            }
            Ok(ServerMessage::Key(message)) => {
                let modifiers = modifier_part(message.code);
                println!(
                    "{:<9} key={:<5} mods={}",
                    format!("{:?}", message.action),
                    key_part(message.code),
                    if modifiers.is_empty() {
                        "-".to_string()
                    } else {
                        modifiers.to_string()
                    }
                );
            }
            Err(e) => tracing::warn!("Ignoring invalid message: {}", e),
        }
    }

    println!("Daemon closed the connection");
    Ok(())
}
