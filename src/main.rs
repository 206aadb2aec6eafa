use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remote_shelf::error::SerializableError;
use remote_shelf::ssh::{AuthMaterial, ConnectionTarget};
use remote_shelf::{AppError, AppState, EntryKind, FileEntry};
use std::path::PathBuf;

/// Browse, read and write files on a remote host over SSH
#[derive(Parser, Debug)]
#[command(name = "remote-shelf", version, about)]
struct Cli {
    /// Remote port; defaults to `default_port` from config.toml
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Private key file to authenticate with
    #[arg(long, short = 'i', conflicts_with = "password_env")]
    identity: Option<PathBuf>,

    /// Environment variable holding the key passphrase
    #[arg(long, requires = "identity")]
    passphrase_env: Option<String>,

    /// Environment variable holding the password
    #[arg(long)]
    password_env: Option<String>,

    /// Authenticate with the running SSH agent (the default without other credentials)
    #[arg(long, conflicts_with_all = ["identity", "password_env"])]
    agent: bool,

    /// Print results and errors as JSON
    #[arg(long)]
    json: bool,

    /// Connection string, `user@host[:port]`
    destination: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory (the login directory by default)
    Ls { path: Option<String> },
    /// Print a remote file
    Cat { path: String },
    /// Replace a remote file with the contents of a local one
    Put {
        path: String,
        #[arg(long)]
        from: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    remote_shelf::logging::init_tracing("remote_shelf=info,warn");

    let cli = Cli::parse();
    let state = AppState::new().context("Failed to initialize remote-shelf")?;

    let outcome = run(&cli, &state).await;
    state.pool.close_all().await;

    match outcome {
        Ok(()) => Ok(()),
        Err(e) if cli.json => {
            println!("{}", serde_json::to_string_pretty(&SerializableError::from(&e))?);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run(cli: &Cli, state: &AppState) -> Result<(), AppError> {
    let auth = auth_material(cli)?;
    let mut target = ConnectionTarget::from_connection_string(&cli.destination, state.settings.ssh.default_port, auth)?;
    if let Some(port) = cli.port {
        target = ConnectionTarget::new(target.host(), port, target.username(), target.auth().clone())?;
    }

    match &cli.command {
        Command::Ls { path } => {
            let entries = state.fs.list_directory(&target, path.as_deref()).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
        }
        Command::Cat { path } => {
            let content = state.fs.read_file(&target, path).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&content)?);
            } else {
                print!("{}", content);
            }
        }
        Command::Put { path, from } => {
            let content = std::fs::read_to_string(from)?;
            state.fs.write_file(&target, path, &content).await?;
            tracing::info!("Wrote {} bytes to {}:{}", content.len(), target, path);
        }
    }
    Ok(())
}

fn auth_material(cli: &Cli) -> Result<AuthMaterial, AppError> {
    if cli.agent {
        return Ok(AuthMaterial::Agent);
    }
    if let Some(path) = &cli.identity {
        let passphrase = cli.passphrase_env.as_deref().map(read_env).transpose()?;
        return Ok(AuthMaterial::KeyFile {
            path: path.clone(),
            passphrase,
        });
    }
    if let Some(var) = &cli.password_env {
        return Ok(AuthMaterial::Password(read_env(var)?));
    }
    Ok(AuthMaterial::Agent)
}

fn read_env(var: &str) -> Result<String, AppError> {
    std::env::var(var).map_err(|_| AppError::Config(format!("Environment variable {} is not set", var)))
}

fn format_entry(entry: &FileEntry) -> String {
    let kind = match entry.kind {
        EntryKind::Directory => "dir",
        EntryKind::Symlink => "link",
        EntryKind::File => "file",
        EntryKind::Unknown => "?",
    };
    let size = entry.size.map(|s| s.to_string()).unwrap_or_default();
    let modified = entry.modified.as_deref().unwrap_or("");
    format!("{:<5} {:>12} {:<13} {}", kind, size, modified, entry.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("remote-shelf").chain(args.iter().copied()))
    }

    #[test]
    fn test_agent_is_default_and_explicit() {
        assert_eq!(auth_material(&cli(&["u@h", "ls"])).unwrap(), AuthMaterial::Agent);
        assert_eq!(auth_material(&cli(&["--agent", "u@h", "ls"])).unwrap(), AuthMaterial::Agent);
    }

    #[test]
    fn test_agent_conflicts_with_identity() {
        let parsed = Cli::try_parse_from(["remote-shelf", "--agent", "-i", "/k", "u@h", "ls"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_identity_selects_key_file() {
        let auth = auth_material(&cli(&["-i", "/home/u/.ssh/id_ed25519", "u@h", "cat", "/etc/motd"])).unwrap();
        assert!(matches!(auth, AuthMaterial::KeyFile { passphrase: None, .. }));
    }
}
