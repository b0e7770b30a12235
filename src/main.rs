//! CLI entry point for the Spruce session layer.
//!
//! Manages the local identity, configuration and persisted session, and runs
//! an in-process demonstration of two users establishing a session.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use spruce_core::{
    crypto::{KeyMaterialManager, MlKem768},
    session::SessionKeyStore,
    storage::{FileStore, KeyValueStore, MemoryStore},
    utils::{SpruceConfig, DEFAULT_CONFIG_FILE},
    InMemoryRelay, SessionEvent, SessionManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Spruce - hybrid post-quantum session layer
#[derive(Parser)]
#[command(name = "spruce")]
#[command(about = "Hybrid X25519 + ML-KEM session establishment and message encryption")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and session state
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect identity keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Inspect or discard the persisted session
    Session {
        #[command(subcommand)]
        action: SessionCommands,
    },
    /// Run two in-process users through a handshake and a message exchange
    Demo {
        /// Message alice sends to bob
        #[arg(short, long, default_value = "hello from alice")]
        message: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity
    Generate {
        /// Username for the identity
        #[arg(short, long)]
        name: String,
        /// Overwrite an existing identity
        #[arg(short, long)]
        force: bool,
    },
    /// Display the public keys
    Show {
        /// Output format (pretty, json, hex)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Erase the identity and any session derived from it
    Destroy,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Show the persisted session, if it is still live
    Status,
    /// Discard the persisted session
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SpruceConfig::load(cli.config.as_deref())?;
    setup_logging(&config.logging.level, cli.verbose, cli.quiet);

    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Session { action } => handle_session_commands(action, &config).await,
        Commands::Demo { message } => handle_demo_command(&message, config).await,
    }
}

fn setup_logging(configured: &str, verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn open_store(config: &SpruceConfig) -> Result<Arc<dyn KeyValueStore>> {
    config.ensure_directories()?;
    Ok(Arc::new(FileStore::open(&config.storage.data_dir)?))
}

fn key_manager(config: &SpruceConfig) -> Result<KeyMaterialManager> {
    Ok(KeyMaterialManager::new(
        open_store(config)?,
        Arc::new(MlKem768),
        config.crypto.signature.scheme(),
    ))
}

fn handle_key_commands(action: KeyCommands, config: &SpruceConfig) -> Result<()> {
    let keys = key_manager(config)?;

    match action {
        KeyCommands::Generate { name, force } => {
            if keys.load()?.is_some() && !force {
                return Err(anyhow::anyhow!(
                    "Identity already exists. Use --force to overwrite."
                ));
            }

            info!("Generating new identity for '{}'", name);
            let (bundle, _) = keys.generate_identity(&name)?;

            println!("✓ Identity generated successfully");
            println!("  Username: {}", bundle.username);
            println!("  Signature: {}", config.crypto.signature);
            println!("  Fingerprint: {}", bundle.fingerprint());
            println!("  Saved to: {}", config.storage.data_dir.display());
        }
        KeyCommands::Show { format } => {
            let identity = keys
                .load()?
                .ok_or_else(|| anyhow::anyhow!("No identity found. Run `spruce keys generate`."))?;
            let bundle = identity.public_bundle();

            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&bundle)?),
                "hex" => {
                    println!("x25519: {}", hex::encode(&bundle.dh_public_key));
                    println!("ml-kem-768: {}", hex::encode(&bundle.kem_public_key));
                    println!("{}: {}", identity.sig_algorithm(), hex::encode(&bundle.sig_public_key));
                }
                "pretty" => {
                    println!("Identity");
                    println!("========");
                    println!("Username: {}", bundle.username);
                    println!("Fingerprint: {}", bundle.fingerprint());
                    println!("KEM: {}", identity.kem_algorithm());
                    println!("Signature: {}", identity.sig_algorithm());
                    println!(
                        "Created: {}",
                        identity.created_at().format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
        KeyCommands::Destroy => {
            keys.destroy()?;
            open_store(config)?.remove(spruce_core::storage::SESSION_RECORD)?;
            println!("✓ Identity and session erased");
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &SpruceConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            SpruceConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                SpruceConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            if let Some(section_name) = section {
                let table: toml::Table = toml::from_str(&config_str)?;
                let value = table
                    .get(&section_name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown section: {}", section_name))?;
                println!("[{}]", section_name);
                println!("{}", toml::to_string_pretty(value)?);
            } else {
                println!("{}", config_str);
            }
        }
    }
    Ok(())
}

async fn handle_session_commands(action: SessionCommands, config: &SpruceConfig) -> Result<()> {
    let store = SessionKeyStore::new(
        open_store(config)?,
        config.session.idle_timeout(),
        config.session.refresh_on_activity,
        None,
    );

    match action {
        SessionCommands::Status => {
            let restored = store.reload().await;
            store.cancel_timer();

            match restored {
                Ok(Some(key)) => {
                    let created = chrono::DateTime::from_timestamp_millis(key.version())
                        .map_or_else(|| key.version().to_string(), |at| at.to_rfc3339());
                    println!("Session");
                    println!("=======");
                    println!("Peer: {}", key.peer());
                    println!("Established: {}", created);
                    println!("Key fingerprint: {}", key.fingerprint());
                }
                Ok(None) => println!("No active session"),
                Err(e) if e.requires_reset() => {
                    warn!("Persisted session was unusable and has been discarded: {}", e);
                    println!("No active session");
                }
                Err(e) => return Err(e.into()),
            }
        }
        SessionCommands::Reset => {
            store.clear().await?;
            println!("✓ Session discarded");
        }
    }
    Ok(())
}

async fn handle_demo_command(message: &str, mut config: SpruceConfig) -> Result<()> {
    config.polling.interval_ms = config.polling.interval_ms.min(200);
    let relay = Arc::new(InMemoryRelay::new());

    let mut users = Vec::new();
    for name in ["alice", "bob"] {
        let store = Arc::new(MemoryStore::new());
        let bundle = SessionManager::register(name, &config, relay.as_ref(), store.clone()).await?;
        println!("✓ Registered {} ({})", name, bundle.fingerprint());

        let (manager, events) = SessionManager::init(config.clone(), relay.clone(), store).await?;
        users.push((manager, events));
    }
    let (bob, mut bob_events) = users.pop().ok_or_else(|| anyhow::anyhow!("bob missing"))?;
    let (alice, _alice_events) = users.pop().ok_or_else(|| anyhow::anyhow!("alice missing"))?;

    bob.start_polling();
    let version = alice.connect("bob").await?;
    println!("✓ alice opened a session with bob (version {})", version);

    alice.send("bob", message).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = bob_events.recv() => match event {
                Some(SessionEvent::HandshakeCompleted { peer, .. }) => {
                    println!("✓ bob completed the handshake from {}", peer);
                }
                Some(SessionEvent::MessageReceived { sender, content, .. }) => {
                    println!("✓ bob received from {}: {}", sender, content);
                    break;
                }
                Some(other) => println!("  bob: {:?}", other),
                None => break,
            },
            () = &mut deadline => {
                warn!("No message delivered before the deadline");
                break;
            }
        }
    }

    bob.teardown().await;
    alice.teardown().await;
    Ok(())
}
