//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use dkx_crypto::{codec, provisioning, DeviceCrypto, KeyPair, PublicKey};

use crate::config::{CliOverrides, Config};
use crate::session::{self, ChannelSettings};
use crate::transport::{memory_pair, LineTransport};
use crate::ExitCode;

/// dkx - ED25519 device/server key exchange harness
#[derive(Parser, Debug)]
#[command(name = "dkx")]
#[command(version, about = "ED25519 device/server key exchange harness")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (protocol-level tracing)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Maximum value characters per {{key;value}} line
    #[arg(long, global = true)]
    pub slice_size: Option<usize>,

    /// Per-message receive timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the device side against a server
    Device(DeviceArgs),
    /// Accept devices and run the server side
    Server(ServerArgs),
    /// Run both sides in process
    Demo,
    /// Generate a key pair and print it as an [identity] section
    Keygen,
    /// Print the signed public key registration payload
    Provision(ProvisionArgs),
}

#[derive(Parser, Debug)]
pub struct DeviceArgs {
    /// Server address (host:port)
    #[arg(long, conflicts_with = "stdio")]
    pub connect: Option<String>,

    /// Talk to the server over stdin/stdout instead of TCP
    #[arg(long)]
    pub stdio: bool,
}

#[derive(Parser, Debug)]
pub struct ServerArgs {
    /// Listen address (host:port)
    #[arg(long)]
    pub listen: Option<String>,

    /// Exit after this many connections
    #[arg(long)]
    pub sessions: Option<usize>,
}

#[derive(Parser, Debug)]
pub struct ProvisionArgs {
    /// Hardware device identifier to embed in the payload
    #[arg(long)]
    pub device_id: String,
}

impl Cli {
    /// CLI flags that override config file values
    pub fn overrides(&self) -> CliOverrides {
        let (listen_addr, connect_addr) = match &self.command {
            Commands::Server(args) => (args.listen.clone(), None),
            Commands::Device(args) => (None, args.connect.clone()),
            _ => (None, None),
        };
        CliOverrides {
            verbose: self.verbose.then_some(true),
            debug: self.debug.then_some(true),
            listen_addr,
            connect_addr,
            slice_size: self.slice_size,
            timeout_seconds: self.timeout,
        }
    }

    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        config.validate()?;
        let settings = config.transport.channel_settings();

        match self.command {
            Commands::Device(args) => {
                let keys = load_identity(&config)?;
                print_key("device", keys.public_key());
                let result = if args.stdio {
                    let mut channel = settings.channel(LineTransport::stdio())?;
                    session::run_device(&mut channel, &keys).await
                } else {
                    session::connect(config.transport.connect_addr()?, &keys, settings).await
                };
                match result {
                    Ok(server) => {
                        print_key("server", Some(server));
                        eprintln!("Handshake succeeded");
                        Ok(ExitCode::Success)
                    }
                    Err(e) => {
                        eprintln!("Handshake failed: {e}");
                        Ok(ExitCode::from(&e))
                    }
                }
            }
            Commands::Server(args) => {
                let keys = Arc::new(load_identity(&config)?);
                let addr = config.transport.listen_addr()?;
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding {addr}"))?;
                print_key("server", keys.public_key());
                info!(%addr, "listening");

                tokio::select! {
                    results = session::serve(listener, keys, settings, args.sessions) => {
                        let failure = results.into_iter().find_map(Result::err);
                        Ok(failure.as_ref().map_or(ExitCode::Success, ExitCode::from))
                    }
                    _ = tokio::signal::ctrl_c() => Ok(ExitCode::Success),
                }
            }
            Commands::Demo => run_demo(&config, settings).await,
            Commands::Keygen => {
                let keys = KeyPair::generated()?;
                let public = keys.public_key().context("generated key pair has no public key")?;
                let private = keys
                    .export_private_key()
                    .context("generated key pair has no private key")?;
                println!("# fingerprint {}", public.fingerprint());
                println!("[identity]");
                println!("public_key = \"{}\"", codec::encode(public.as_bytes()));
                println!("private_key = \"{}\"", codec::encode(private.as_bytes()));
                Ok(ExitCode::Success)
            }
            Commands::Provision(args) => {
                let crypto = DeviceCrypto::with_key_pair(load_identity(&config)?);
                let payload = provisioning::key_registration_now(&crypto, &args.device_id)?;
                println!("{payload}");
                Ok(ExitCode::Success)
            }
        }
    }
}

/// The configured identity, or a fresh key pair when none is configured.
fn load_identity(config: &Config) -> anyhow::Result<KeyPair> {
    match config.identity.key_pair()? {
        Some(keys) => Ok(keys),
        None => Ok(KeyPair::generated()?),
    }
}

/// Status goes to stderr so stdout stays free for payloads and `--stdio`.
fn print_key(role: &str, key: Option<PublicKey>) {
    if let Some(key) = key {
        eprintln!("{role} key: {} ({})", codec::encode(key.as_bytes()), key.fingerprint());
    }
}

async fn run_demo(config: &Config, settings: ChannelSettings) -> anyhow::Result<ExitCode> {
    let device_keys = load_identity(config)?;
    let server_keys = KeyPair::generated()?;
    print_key("device", device_keys.public_key());
    print_key("server", server_keys.public_key());

    let (device_end, server_end) = memory_pair();
    let mut device_channel = settings.channel(device_end)?;
    let mut server_channel = settings.channel(server_end)?;

    let (device, server) = tokio::join!(
        session::run_device(&mut device_channel, &device_keys),
        session::run_server(&mut server_channel, &server_keys),
    );
    match (device, server) {
        (Ok(_), Ok(_)) => {
            eprintln!("Handshake succeeded");
            Ok(ExitCode::Success)
        }
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Handshake failed: {e}");
            Ok(ExitCode::from(&e))
        }
    }
}
