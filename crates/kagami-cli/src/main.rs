//! kagami command-line frontend.
//!
//! Thin glue over the client library: every subcommand is argument
//! plumbing around `SessionManager` / `VirtualFilesystem` and carries no
//! logic of its own.
//!
//! ```bash
//! kagami login alice            # prompt for password, store the session
//! kagami ls /notes              # list a remote directory
//! kagami cat /notes/todo.md     # print a remote file
//! kagami put /notes/todo.md --file local.md
//! kagami mv /a.txt /b.txt
//! kagami check                  # probe auth + worker connectivity
//! ```

use std::io::{BufRead, Read, Write as _};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kagami_client::constants::{DEFAULT_AUTH_URL, DEFAULT_WORKER_URL};
use kagami_client::{
    ChannelClient, FileCredentialStore, HttpAuthBackend, SessionManager, VirtualFilesystem,
    WsConnector,
};
use kagami_types::{ClockIdSource, EntryKind};

#[derive(Parser)]
#[command(name = "kagami", about = "Remote workspace mirror", version)]
struct Cli {
    /// Auth service base URL.
    #[arg(long, default_value = DEFAULT_AUTH_URL, global = true)]
    auth_url: String,

    /// Worker channel URL.
    #[arg(long, default_value = DEFAULT_WORKER_URL, global = true)]
    worker_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session.
    Login { username: String },
    /// Create an account and log in.
    Register { username: String },
    /// End the session.
    Logout,
    /// Show session status.
    Status,
    /// List a remote directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a remote file.
    Cat { path: String },
    /// Write a remote file from a local file or stdin.
    Put {
        path: String,
        /// Local file to read; stdin when omitted.
        #[arg(long)]
        file: Option<std::path::PathBuf>,
        /// Refuse to replace an existing file.
        #[arg(long)]
        no_overwrite: bool,
    },
    /// Delete a remote path.
    Rm { path: String },
    /// Rename a remote file.
    Mv { old: String, new: String },
    /// Probe auth and worker connectivity.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let session = SessionManager::new(
        Arc::new(HttpAuthBackend::new(&cli.auth_url)),
        Arc::new(FileCredentialStore::new(FileCredentialStore::default_path())),
    );

    match cli.command {
        Command::Login { username } => {
            let password = prompt_password()?;
            let outcome = session.login(&username, &password).await;
            println!("{}", outcome.message());
            if !outcome.success() {
                bail!("login failed");
            }
            Ok(())
        }
        Command::Register { username } => {
            let password = prompt_password()?;
            let outcome = session.register(&username, &password).await;
            println!("{}", outcome.message());
            if !outcome.success() {
                bail!("registration failed");
            }
            Ok(())
        }
        Command::Logout => {
            session.logout().await;
            println!("logged out");
            Ok(())
        }
        Command::Status => {
            if !session.is_authenticated() {
                println!("not logged in");
                return Ok(());
            }
            if session.validate_session().await {
                let identity = session.identity();
                let name = identity
                    .as_ref()
                    .map(|i| i.display_name.as_str())
                    .unwrap_or("(unconfirmed)");
                println!("logged in as {name}");
            } else {
                println!("session expired; log in again");
            }
            Ok(())
        }
        Command::Ls { path } => {
            let (fs, channel) = open_filesystem(&session, &cli.worker_url).await?;
            let entries = fs.list(&path).await?;
            for entry in &entries {
                match entry.kind {
                    EntryKind::Directory => println!("{}/", entry.name()),
                    EntryKind::File => println!("{}", entry.name()),
                }
            }
            channel.disconnect();
            Ok(())
        }
        Command::Cat { path } => {
            let (fs, channel) = open_filesystem(&session, &cli.worker_url).await?;
            let content = fs.read(&path).await?;
            std::io::stdout().write_all(&content)?;
            channel.disconnect();
            Ok(())
        }
        Command::Put { path, file, no_overwrite } => {
            let content = match file {
                Some(local) => std::fs::read(&local)
                    .with_context(|| format!("reading {}", local.display()))?,
                None => {
                    let mut buffer = Vec::new();
                    std::io::stdin().read_to_end(&mut buffer)?;
                    buffer
                }
            };
            let (fs, channel) = open_filesystem(&session, &cli.worker_url).await?;
            fs.write(&path, &content, !no_overwrite).await?;
            println!("wrote {path} ({} bytes)", content.len());
            channel.disconnect();
            Ok(())
        }
        Command::Rm { path } => {
            let (fs, channel) = open_filesystem(&session, &cli.worker_url).await?;
            fs.delete(&path).await?;
            println!("deleted {path}");
            channel.disconnect();
            Ok(())
        }
        Command::Mv { old, new } => {
            let (fs, channel) = open_filesystem(&session, &cli.worker_url).await?;
            fs.rename(&old, &new).await?;
            println!("renamed {old} -> {new}");
            channel.disconnect();
            Ok(())
        }
        Command::Check => {
            if !session.is_authenticated() {
                println!("auth: not logged in");
                return Ok(());
            }
            if session.validate_session().await {
                println!("auth: ok");
            } else {
                println!("auth: session expired");
                return Ok(());
            }
            let (fs, channel) = open_filesystem(&session, &cli.worker_url).await?;
            match fs.list("/").await {
                Ok(entries) => println!("worker: ok ({} entries at /)", entries.len()),
                Err(e) => println!("worker: list failed: {e}"),
            }
            channel.disconnect();
            Ok(())
        }
    }
}

/// Connect the channel with the stored token and put a filesystem on it.
async fn open_filesystem(
    session: &SessionManager,
    worker_url: &str,
) -> Result<(VirtualFilesystem, ChannelClient)> {
    let token = session
        .token()
        .context("not logged in; run `kagami login` first")?;
    let channel = ChannelClient::new(Box::new(WsConnector::new(worker_url)));
    channel.connect(&token).await?;
    let fs = VirtualFilesystem::new(channel.clone(), Arc::new(ClockIdSource));
    Ok((fs, channel))
}

/// Read a password from stdin. Plain line read — piping is supported;
/// terminal echo suppression is the shell's concern here.
fn prompt_password() -> Result<String> {
    eprint!("password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(password)
}
