//! `facegate`: operator CLI for the facegated daemon.
//!
//! Embeddings and attempts are read from JSON files produced by the capture
//! pipeline; every command talks to the daemon over D-Bus.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[zbus::proxy(
    interface = "org.facegate.Facegate1",
    default_service = "org.facegate.Facegate1",
    default_path = "/org/facegate/Facegate1"
)]
trait Facegate {
    fn enroll(
        &self,
        identity: &str,
        embedding: Vec<f64>,
        display_name: &str,
        email: &str,
        phone: &str,
    ) -> zbus::Result<String>;
    fn authenticate(&self, context: &str, attempt: &str) -> zbus::Result<String>;
    fn verify(&self, context: &str, identity: &str, attempt: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, identity: &str) -> zbus::Result<bool>;
    fn lockout_status(&self, context: &str) -> zbus::Result<String>;
    fn audit_log(&self, context: &str, limit: u32) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", version, about = "Facegate face authentication CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from an embedding file (JSON array of numbers)
    Enroll {
        identity: String,
        embedding: PathBuf,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
    },
    /// 1:N authentication from an attempt file
    Authenticate {
        attempt: PathBuf,
        #[arg(long, default_value = "cli")]
        context: String,
    },
    /// 1:1 verification of a claimed identity from an attempt file
    Verify {
        identity: String,
        attempt: PathBuf,
        #[arg(long, default_value = "cli")]
        context: String,
    },
    /// Show daemon status
    Status,
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove { identity: String },
    /// Show the lockout phase of a context
    Lockout { context: String },
    /// Show recent audit entries for a context
    Audit {
        context: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = FacegateProxy::new(&conn)
        .await
        .context("facegated is not reachable")?;

    match cli.command {
        Commands::Enroll {
            identity,
            embedding,
            name,
            email,
            phone,
        } => {
            let values = read_embedding(&embedding)?;
            tracing::debug!(dims = values.len(), "embedding loaded");
            let id = proxy
                .enroll(&identity, values, &name, &email, &phone)
                .await?;
            println!("enrolled {id}");
        }
        Commands::Authenticate { attempt, context } => {
            let attempt = read_attempt(&attempt)?;
            let decision = proxy.authenticate(&context, &attempt).await?;
            print_decision(&decision)?;
        }
        Commands::Verify {
            identity,
            attempt,
            context,
        } => {
            let attempt = read_attempt(&attempt)?;
            let decision = proxy.verify(&context, &identity, &attempt).await?;
            print_decision(&decision)?;
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::List => print_json(&proxy.list_identities().await?)?,
        Commands::Remove { identity } => {
            if proxy.remove_identity(&identity).await? {
                println!("removed {identity}");
            } else {
                bail!("no identity named {identity}");
            }
        }
        Commands::Lockout { context } => print_json(&proxy.lockout_status(&context).await?)?,
        Commands::Audit { context, limit } => {
            print_json(&proxy.audit_log(&context, limit).await?)?
        }
    }

    Ok(())
}

fn read_embedding(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_embedding(&text).with_context(|| format!("{} is not a JSON number array", path.display()))
}

fn parse_embedding(text: &str) -> Result<Vec<f64>> {
    let values: Vec<f64> = serde_json::from_str(text)?;
    if values.is_empty() {
        bail!("embedding is empty");
    }
    Ok(values)
}

/// Attempts are forwarded verbatim; the daemon validates their shape.
fn read_attempt(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let _: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(text)
}

fn print_json(text: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Print the decision and exit non-zero unless it was accepted.
fn print_decision(text: &str) -> Result<()> {
    print_json(text)?;
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value["decision"] != "accepted" {
        std::process::exit(1);
    }
    Ok(())
}
