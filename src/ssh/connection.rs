//! libssh2-backed [`Connector`] and [`Transport`]

use super::{AuthMaterial, CommandRequest, CommandResult, ConnectionTarget, Connector, Transport};
use crate::config::{KnownHostsPolicy, SshSettings};
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, OpenFlags, OpenType, Session, Sftp};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Connects over TCP and authenticates with libssh2
pub struct Ssh2Connector {
    settings: SshSettings,
    known_hosts_path: PathBuf,
}

impl Ssh2Connector {
    pub fn new(settings: SshSettings, known_hosts_path: PathBuf) -> Self {
        Self {
            settings,
            known_hosts_path,
        }
    }

    fn connect_tcp(&self, target: &ConnectionTarget) -> AppResult<TcpStream> {
        let addrs: Vec<SocketAddr> = (target.host(), target.port())
            .to_socket_addrs()
            .map_err(|e| AppError::transport(target, "connect", format!("Could not resolve host: {}", e)))?
            .collect();

        let timeout = self.settings.connect_timeout();
        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => {
                    tracing::debug!("TCP connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) if e.kind() == std::io::ErrorKind::TimedOut => AppError::Timeout {
                target: target.to_string(),
                operation: "connect".to_string(),
                after: timeout,
            },
            Some(e) => AppError::transport(target, "connect", format!("TCP connect failed: {}", e)),
            None => AppError::transport(target, "connect", "Host resolved to no addresses"),
        })
    }

    /// Verify the host key against known_hosts
    fn verify_host_key(&self, session: &Session, target: &ConnectionTarget) -> AppResult<()> {
        let host_key_error = |message: String| AppError::HostKey {
            target: target.to_string(),
            message,
        };

        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| host_key_error("No host key received".to_string()))?;
        let fingerprint = compute_sha256_fingerprint(key);

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| AppError::transport(target, "connect", format!("Failed to create known_hosts: {}", e)))?;
        if self.known_hosts_path.exists() {
            let _ = known_hosts.read_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH);
        }

        match known_hosts.check_port(target.host(), target.port(), key) {
            CheckResult::Match => {
                tracing::debug!("Host key matched for {} ({})", target, fingerprint);
                Ok(())
            }
            CheckResult::NotFound => match self.settings.known_hosts_policy {
                KnownHostsPolicy::Strict => {
                    tracing::warn!("Unknown host key for {} ({})", target, fingerprint);
                    Err(host_key_error(format!(
                        "Host is not in known_hosts ({} {})",
                        key_type_name(key_type),
                        fingerprint
                    )))
                }
                KnownHostsPolicy::Accept => {
                    tracing::info!("Recording new host key for {} ({})", target, fingerprint);
                    let host_entry = if target.port() == 22 {
                        target.host().to_string()
                    } else {
                        format!("[{}]:{}", target.host(), target.port())
                    };
                    known_hosts
                        .add(
                            &host_entry,
                            key,
                            &format!("Added by remote-shelf on {}", chrono::Utc::now()),
                            KnownHostKeyFormat::from(key_type),
                        )
                        .map_err(|e| host_key_error(format!("Failed to add known host: {}", e)))?;
                    if let Some(parent) = self.known_hosts_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    known_hosts
                        .write_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH)
                        .map_err(|e| host_key_error(format!("Failed to write known_hosts: {}", e)))?;
                    Ok(())
                }
            },
            CheckResult::Mismatch => {
                tracing::error!("HOST KEY MISMATCH for {}! Possible MITM attack!", target);
                Err(host_key_error(
                    "Host key has changed; remove the old key from known_hosts if you trust this change"
                        .to_string(),
                ))
            }
            CheckResult::Failure => Err(host_key_error("Failed to check known hosts".to_string())),
        }
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self, target: &ConnectionTarget) -> AppResult<Box<dyn Transport>> {
        tracing::info!("Connecting to {}", target);

        let tcp = self.connect_tcp(target)?;
        tcp.set_nodelay(true)?;

        let mut session = Session::new()
            .map_err(|e| AppError::transport(target, "connect", format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.settings.connect_timeout()));
        session.set_keepalive(true, self.settings.keepalive_interval);

        session
            .handshake()
            .map_err(|e| AppError::transport(target, "connect", format!("SSH handshake failed: {}", e)))?;

        self.verify_host_key(&session, target)?;
        authenticate(&session, target)?;

        tracing::info!("SSH authentication successful for {}", target);
        Ok(Box::new(Ssh2Transport {
            session,
            sftp: None,
            label: target.to_string(),
        }))
    }
}

/// Authenticate with the SSH server
fn authenticate(session: &Session, target: &ConnectionTarget) -> AppResult<()> {
    let auth_error = |message: &str| AppError::auth(target, "connect", message);

    match target.auth() {
        AuthMaterial::Password(password) => {
            session
                .userauth_password(target.username(), password)
                .map_err(|_| auth_error("Password authentication failed"))?;
        }
        AuthMaterial::KeyFile { path, passphrase } => {
            session
                .userauth_pubkey_file(target.username(), None, path, passphrase.as_deref())
                .map_err(|e| {
                    let msg = e.to_string().to_lowercase();
                    if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                        auth_error("Invalid passphrase or key format. Ensure the key is in PEM or OpenSSH format.")
                    } else if msg.contains("denied") || msg.contains("auth") {
                        auth_error("Private key not accepted by server")
                    } else {
                        auth_error("Private key authentication failed")
                    }
                })?;
        }
        AuthMaterial::Agent => {
            let mut agent = session
                .agent()
                .map_err(|_| auth_error("SSH agent not available. Make sure ssh-agent is running."))?;
            agent
                .connect()
                .map_err(|_| auth_error("Failed to connect to SSH agent. Is it running?"))?;
            agent
                .list_identities()
                .map_err(|_| auth_error("Failed to list SSH agent identities"))?;

            let identities = agent.identities().unwrap_or_default();
            if identities.is_empty() {
                return Err(auth_error("No identities found in SSH agent. Add keys with ssh-add."));
            }

            let accepted = identities
                .iter()
                .any(|identity| agent.userauth(target.username(), identity).is_ok());
            if !accepted {
                return Err(auth_error("SSH agent authentication failed. No matching key accepted."));
            }
        }
    }

    if !session.authenticated() {
        return Err(auth_error("Authentication failed"));
    }
    Ok(())
}

/// One authenticated libssh2 session; commands run on fresh exec channels
pub struct Ssh2Transport {
    session: Session,
    sftp: Option<Sftp>,
    label: String,
}

impl Ssh2Transport {
    fn transport_error(&self, operation: &str, message: impl std::fmt::Display) -> AppError {
        AppError::transport(&self.label, operation, message.to_string())
    }

    fn sftp(&mut self) -> AppResult<&Sftp> {
        if self.sftp.is_none() {
            let sftp = self
                .session
                .sftp()
                .map_err(|e| self.transport_error("transfer_file", format!("Failed to open SFTP: {}", e)))?;
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| self.transport_error("transfer_file", "SFTP subsystem unavailable"))
    }
}

impl Transport for Ssh2Transport {
    fn execute(&mut self, request: &CommandRequest) -> AppResult<CommandResult> {
        let command_line = request.command_line();
        tracing::debug!("Executing on {}: {}", self.label, sanitize(&command_line));

        self.session.set_timeout(millis(request.timeout()));
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.transport_error("execute", format!("Failed to open channel: {}", e)))?;
        channel
            .exec(&command_line)
            .map_err(|e| self.transport_error("execute", format!("Failed to start command: {}", e)))?;

        if let Some(input) = request.input() {
            channel
                .write_all(input)
                .map_err(|e| self.transport_error("execute", format!("Failed to write stdin: {}", e)))?;
        }
        channel
            .send_eof()
            .map_err(|e| self.transport_error("execute", format!("Failed to send EOF: {}", e)))?;

        self.session.set_blocking(false);
        let mut stderr = channel.stderr();
        let output = collect_output(&mut channel, &mut stderr, request.timeout(), |channel: &ssh2::Channel| {
            channel.eof()
        });
        self.session.set_blocking(true);
        let (stdout, stderr) = output.map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => AppError::Timeout {
                target: self.label.clone(),
                operation: "execute".to_string(),
                after: request.timeout(),
            },
            _ => self.transport_error("execute", format!("Failed to read output: {}", e)),
        })?;

        channel
            .wait_close()
            .map_err(|e| self.transport_error("execute", format!("Failed to close channel: {}", e)))?;
        let exit_status = channel
            .exit_status()
            .map_err(|e| self.transport_error("execute", format!("No exit status: {}", e)))?;

        Ok(CommandResult::from_output(exit_status, &stdout, &stderr))
    }

    fn transfer_file(&mut self, remote_path: &str, content: &[u8]) -> AppResult<()> {
        let label = self.label.clone();
        let write_error = |what: &str, e: &dyn std::fmt::Display| {
            AppError::transport(&label, "transfer_file", format!("Failed to {} {}: {}", what, remote_path, e))
        };

        let sftp = self.sftp()?;
        let mut file = sftp
            .open_mode(
                Path::new(remote_path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(|e| match e.code() {
                // The server refused (permissions, missing directory); the connection is fine.
                ssh2::ErrorCode::SFTP(code) => AppError::RemoteCommand {
                    target: label.clone(),
                    operation: "transfer_file".to_string(),
                    exit_status: code,
                    message: format!("Failed to create {}: {}", remote_path, e),
                },
                _ => write_error("create", &e),
            })?;
        file.write_all(content).map_err(|e| write_error("write", &e))?;
        file.flush().map_err(|e| write_error("flush", &e))?;
        Ok(())
    }

    fn close(&mut self) {
        self.sftp = None;
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            tracing::debug!("Disconnect from {} was not clean: {}", self.label, e);
        }
    }
}

/// Read stdout and stderr in turn until `finished` reports the channel at EOF.
/// Expects non-blocking readers; a stream that would block is skipped for the round.
fn collect_output<O: Read, E: Read>(
    stdout: &mut O,
    stderr: &mut E,
    timeout: Duration,
    finished: impl Fn(&O) -> bool,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let progressed = pump(stdout, &mut out, &mut buf)? | pump(stderr, &mut err, &mut buf)?;
        if finished(stdout) {
            // EOF can be flagged while data is still buffered.
            while pump(stdout, &mut out, &mut buf)? | pump(stderr, &mut err, &mut buf)? {}
            return Ok((out, err));
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "command did not finish in time"));
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

fn pump<R: Read>(reader: &mut R, sink: &mut Vec<u8>, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(false),
        Err(e) => Err(e),
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// Compute SHA256 fingerprint of a key
fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}
