//! `lsp-bridge`: start a language server for a workspace, open files, run
//! optional queries, wait for diagnostics and print them.

use std::fs;
use std::io;
use std::path::{self, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tokio::time;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use bridge_lsp::protocol;
use bridge_lsp::{DiagnosticsSnapshot, LspConfig, LspManager, ServerConfig};

const SESSION: &str = "main";

/// A zero-based `FILE:LINE:COL` position.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    file: PathBuf,
    line: u32,
    character: u32,
}

impl FromStr for Position {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, ':');
        let (Some(character), Some(line), Some(file)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("expected FILE:LINE:COL, got `{s}`");
        };
        if file.is_empty() {
            bail!("missing file in `{s}`");
        }
        Ok(Self {
            file: PathBuf::from(file),
            line: line.parse().with_context(|| format!("invalid line in `{s}`"))?,
            character: character
                .parse()
                .with_context(|| format!("invalid column in `{s}`"))?,
        })
    }
}

/// Drive a language server over stdio and report its diagnostics.
#[derive(Parser, Debug)]
#[command(name = "lsp-bridge", version, about = "Drive a language server over stdio")]
struct Cli {
    /// Workspace root sent to the server (also its working directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Language identifier sent with didOpen
    #[arg(long, default_value = "plaintext")]
    language: String,

    /// Wait after initialization for project import, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    settle_ms: u64,

    /// Bound on each query and command, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Grace period for shutdown before the server is killed, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    shutdown_ms: u64,

    /// How long to collect diagnostics after the last action, in milliseconds
    #[arg(long, default_value_t = 2_000)]
    wait_ms: u64,

    /// Files to open (repeatable)
    #[arg(long = "open", value_name = "FILE")]
    open: Vec<PathBuf>,

    /// Run `workspace/executeCommand` with this command name
    #[arg(long, value_name = "COMMAND")]
    execute: Option<String>,

    /// Hover at a zero-based FILE:LINE:COL
    #[arg(long, value_name = "FILE:LINE:COL")]
    hover: Option<Position>,

    /// Language server command and its arguments
    #[arg(last = true, required = true, value_name = "SERVER")]
    server: Vec<String>,
}

impl Cli {
    fn config(&self) -> Result<LspConfig> {
        let (command, args) = self
            .server
            .split_first()
            .ok_or_else(|| anyhow!("missing language server command"))?;
        let root = path::absolute(&self.root)
            .with_context(|| format!("resolving {}", self.root.display()))?;
        let server = ServerConfig::new(command.as_str(), self.language.as_str(), root)
            .with_args(args.to_vec())
            .with_settle_delay(Duration::from_millis(self.settle_ms))
            .with_shutdown_timeout(Duration::from_millis(self.shutdown_ms));
        Ok(LspConfig::default()
            .with_server(SESSION, server)
            .with_request_timeout(Duration::from_millis(self.timeout_ms)))
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn file_uri(file: &Path) -> Result<String> {
    let absolute =
        path::absolute(file).with_context(|| format!("resolving {}", file.display()))?;
    Ok(protocol::path_to_file_uri(&absolute)?.to_string())
}

fn print_diagnostics(snapshot: &DiagnosticsSnapshot) {
    for (uri, entries) in snapshot.documents() {
        let path = protocol::file_uri_to_path(uri).unwrap_or_else(|| PathBuf::from(uri));
        for entry in entries {
            println!("{}", entry.display_with_path(&path));
        }
    }
    if snapshot.is_empty() {
        println!("No diagnostics");
    } else {
        println!("{}", snapshot.status_string());
    }
}

async fn run(cli: &Cli, manager: &mut LspManager) -> Result<()> {
    let session = manager
        .start_session(SESSION)
        .await
        .context("starting language server")?;

    tracing::info!("Waiting for the server to settle");
    session.settled().await;

    for file in &cli.open {
        let text = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        let uri = file_uri(file)?;
        session
            .notify_open(&uri, &cli.language, &text)
            .await
            .with_context(|| format!("opening {}", file.display()))?;
    }

    if let Some(command) = &cli.execute {
        let result = manager
            .execute(SESSION, command, Vec::new())
            .await
            .with_context(|| format!("executing {command}"))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if let Some(position) = &cli.hover {
        let uri = file_uri(&position.file)?;
        match manager
            .hover(SESSION, &uri, position.line, position.character)
            .await
            .context("hover")?
        {
            Some(hover) => println!("{}", serde_json::to_string_pretty(&hover)?),
            None => println!("No hover information"),
        }
    }

    time::sleep(Duration::from_millis(cli.wait_ms)).await;
    print_diagnostics(&manager.diagnostics(None));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut manager = LspManager::new(cli.config()?);
    let result = run(&cli, &mut manager).await;
    manager.shutdown_all().await;
    result
}
