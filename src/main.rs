//! jupiter-bridge - operator tool for the Jupiter plugin runtime.
//!
//! Inspects a plugins directory, shows the load plan and manages unit
//! signatures. It never runs unit code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jupiter_bridge::manifest::ManifestLoader;
use jupiter_bridge::registry::RecordFilter;
use jupiter_bridge::trust::{sign_unit, verify_unit, SigningIdentity};
use jupiter_bridge::{Bridge, BridgeConfig, DependencyResolver, PluginState, TrustLevel, TrustStore};

/// Operator tool for the Jupiter plugin runtime
#[derive(Parser)]
#[command(name = "jupiter-bridge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to .jupiter/bridge.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Plugins directory, overriding the configuration
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the units found in the plugins directory
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Only show units in this state
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Show the dependency load plan
    Plan {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Generate an ed25519 signing identity
    Keygen {
        /// Signer id recorded in signatures
        signer: String,

        /// Write the secret key to this file instead of printing it
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Sign a unit directory
    Sign {
        /// Unit directory
        path: PathBuf,

        /// Signer id
        #[arg(short, long)]
        signer: String,

        /// Base64 secret key
        #[arg(long, env = "JUPITER_SIGNING_KEY", hide_env_values = true)]
        key: Option<String>,

        /// File holding the base64 secret key
        #[arg(long, conflicts_with = "key")]
        key_file: Option<PathBuf>,

        /// Trust level to claim
        #[arg(short, long, default_value = "community")]
        level: String,

        /// Expiry in days
        #[arg(long)]
        expires_in_days: Option<i64>,
    },

    /// Verify a unit directory against the trust store
    Verify {
        /// Unit directory
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load_from_file(path)?,
        None => BridgeConfig::load()?,
    };
    if let Some(dir) = cli.dir {
        config.general.plugins_dir = dir;
    }

    match cli.command {
        Commands::List { format, state } => cmd_list(config, &format, state.as_deref()),
        Commands::Plan { format } => cmd_plan(config, &format),
        Commands::Keygen { signer, out } => cmd_keygen(&signer, out.as_deref()),
        Commands::Sign { path, signer, key, key_file, level, expires_in_days } => {
            let secret = match (key, key_file) {
                (Some(key), _) => key,
                (None, Some(file)) => std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?
                    .trim()
                    .to_string(),
                (None, None) => anyhow::bail!("pass --key, --key-file or set JUPITER_SIGNING_KEY"),
            };
            cmd_sign(&config, &path, &signer, &secret, &level, expires_in_days)
        }
        Commands::Verify { path } => cmd_verify(&config, &path),
    }
}

/// Discover units without loading them.
fn discovered(config: BridgeConfig) -> Result<Bridge> {
    let dir = config.general.plugins_dir.clone();
    let bridge = Bridge::from_config(config)?;
    let report = bridge.discover(&dir)?;
    for issue in &report.invalid {
        eprintln!("invalid: {} - {}", issue.source, issue.reason);
    }
    Ok(bridge)
}

fn parse_state(raw: &str) -> Result<PluginState> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .with_context(|| format!("unknown state '{raw}'"))
}

fn cmd_list(config: BridgeConfig, format: &str, state: Option<&str>) -> Result<()> {
    let bridge = discovered(config)?;
    let filter = RecordFilter { state: state.map(parse_state).transpose()?, ..Default::default() };
    let records = bridge.list(&filter);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => {
            for record in &records {
                println!(
                    "{:<32} {:<10} {:<7} {:<12} {}",
                    record.id(),
                    record.manifest.version,
                    record.unit_type(),
                    record.state,
                    record.trust.trust_level,
                );
                if let Some(error) = &record.error {
                    println!("    {}", error.message);
                }
            }
            println!("\nTotal: {} units", records.len());
        }
    }
    Ok(())
}

fn cmd_plan(config: BridgeConfig, format: &str) -> Result<()> {
    let bridge = discovered(config)?;
    let records = bridge.list(&RecordFilter::state(PluginState::Discovered));
    let plan = DependencyResolver::new().resolve(records.iter().map(|r| &r.manifest))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
        _ => {
            for (n, batch) in plan.batches.iter().enumerate() {
                println!("batch {}: {}", n + 1, batch.join(", "));
            }
            for (id, failure) in &plan.failures {
                println!("excluded {id}: {}", failure.to_error(id));
            }
        }
    }
    Ok(())
}

fn cmd_keygen(signer: &str, out: Option<&Path>) -> Result<()> {
    let identity = SigningIdentity::generate(signer);
    println!("signer:     {}", identity.signer());
    println!("public key: {}", identity.public_key_base64());
    match out {
        Some(path) => {
            std::fs::write(path, identity.secret_key_base64())
                .with_context(|| format!("writing {}", path.display()))?;
            println!("secret key written to {}", path.display());
        }
        None => println!("secret key: {}", identity.secret_key_base64()),
    }
    Ok(())
}

fn cmd_sign(
    config: &BridgeConfig,
    path: &Path,
    signer: &str,
    secret: &str,
    level: &str,
    expires_in_days: Option<i64>,
) -> Result<()> {
    let level = TrustLevel::parse(level).with_context(|| format!("unknown trust level '{level}'"))?;
    let manifest = ManifestLoader::new(config.host_version()).load_dir(path)?;
    let identity = SigningIdentity::from_secret_base64(signer, secret)?;
    let expires_at = expires_in_days.map(|days| chrono::Utc::now() + chrono::Duration::days(days));

    let signature = sign_unit(path, &manifest, &identity, level, expires_at)?;
    println!("signed {} {} as {} ({})", manifest.id, manifest.version, signature.trust_level, signature.signer);
    println!("content hash: {}", signature.content_hash);
    Ok(())
}

fn cmd_verify(config: &BridgeConfig, path: &Path) -> Result<()> {
    let store = match &config.trust.store_path {
        Some(store_path) => TrustStore::load(store_path)?,
        None => TrustStore::load(&TrustStore::default_path()?)?,
    };
    let manifest = ManifestLoader::new(config.host_version()).load_dir(path)?;

    let record = verify_unit(path, &manifest, &store)?;
    if record.verified {
        println!(
            "{}: verified, {} signed by {}",
            manifest.id,
            record.trust_level,
            record.signer.as_deref().unwrap_or("?")
        );
    } else {
        println!("{}: unsigned", manifest.id);
    }
    Ok(())
}
