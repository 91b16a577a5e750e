//! One-shot remote shell execution against managed routers.
//!
//! The fleet contains devices on firmware old enough that they cannot
//! negotiate modern SSH suites, so the client advertises legacy key
//! exchanges, ciphers, host keys, and MACs alongside the current ones.
//! That is a fleet-management property, not a security posture; callers
//! needing a stricter profile bring their own transport.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect, Preferred};
use thiserror::Error;
use tokio::time::timeout;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("connection refused")]
    ConnectRefused,
    #[error("authentication failed")]
    AuthFailed,
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by remote host")]
    ConnectionClosed,
    #[error("remote command exited with code {exit_code}: {stderr}")]
    CommandFailed { stderr: String, exit_code: u32 },
    #[error("{0}")]
    Unknown(String),
}

impl ShellError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Address and password credentials of one managed device.
#[derive(Debug, Clone)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ShellTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            password: password.into(),
        }
    }
}

struct AcceptingHostKeys;

#[async_trait]
impl client::Handler for AcceptingHostKeys {
    type Error = russh::Error;

    // Managed devices regenerate host keys on factory reset and firmware
    // flash; pinning them would strand exactly the devices this system is
    // meant to recover.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Algorithm suites offered to the fleet, newest first, legacy last.
fn fleet_preferred() -> Preferred {
    Preferred {
        kex: Cow::Borrowed(&[
            russh::kex::CURVE25519,
            russh::kex::CURVE25519_PRE_RFC_8731,
            russh::kex::DH_G16_SHA512,
            russh::kex::DH_G14_SHA256,
            russh::kex::DH_G14_SHA1,
            russh::kex::DH_G1_SHA1,
        ]),
        key: Cow::Borrowed(&[
            russh_keys::key::ED25519,
            russh_keys::key::RSA_SHA2_512,
            russh_keys::key::RSA_SHA2_256,
            russh_keys::key::SSH_RSA,
        ]),
        cipher: Cow::Borrowed(&[
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_256_GCM,
            russh::cipher::AES_256_CTR,
            russh::cipher::AES_192_CTR,
            russh::cipher::AES_128_CTR,
            russh::cipher::AES_256_CBC,
            russh::cipher::AES_192_CBC,
            russh::cipher::AES_128_CBC,
            russh::cipher::TRIPLE_DES_CBC,
        ]),
        mac: Cow::Borrowed(&[
            russh::mac::HMAC_SHA256_ETM,
            russh::mac::HMAC_SHA512_ETM,
            russh::mac::HMAC_SHA256,
            russh::mac::HMAC_SHA512,
            russh::mac::HMAC_SHA1_ETM,
            russh::mac::HMAC_SHA1,
        ]),
        ..Default::default()
    }
}

/// Password-authenticated SSH client that runs exactly one command per
/// session and closes it.
#[derive(Clone)]
pub struct SshClient {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl SshClient {
    pub fn new(connect_timeout: Duration) -> Self {
        let config = client::Config {
            preferred: fleet_preferred(),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout,
        }
    }

    /// Run one command and resolve with trimmed stdout.
    ///
    /// Resolution follows the fleet contract: exit code 0 succeeds, and so
    /// does any command that produced stdout regardless of its exit code —
    /// several vendor binaries on the devices exit non-zero while printing
    /// a usable result. Everything else maps onto a [`ShellError`] kind.
    /// `command_timeout` bounds the exec and output drain; on expiry the
    /// session is torn down and the call fails with [`ShellError::Timeout`].
    pub async fn exec(
        &self,
        target: &ShellTarget,
        command: &str,
        command_timeout: Duration,
    ) -> Result<String, ShellError> {
        let (stdout, stderr, exit_status) =
            self.session_exec(target, command, command_timeout).await?;
        resolve_exec_outcome(&stdout, &stderr, exit_status)
    }

    /// Like [`SshClient::exec`], but a non-zero exit code always fails even
    /// when the command produced output. Used where the exit code itself is
    /// the verdict (e.g. image verification).
    pub async fn exec_strict(
        &self,
        target: &ShellTarget,
        command: &str,
        command_timeout: Duration,
    ) -> Result<String, ShellError> {
        let (stdout, stderr, exit_status) =
            self.session_exec(target, command, command_timeout).await?;
        resolve_strict_outcome(&stdout, &stderr, exit_status)
    }

    async fn session_exec(
        &self,
        target: &ShellTarget,
        command: &str,
        command_timeout: Duration,
    ) -> Result<(Vec<u8>, Vec<u8>, Option<u32>), ShellError> {
        let connect = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            AcceptingHostKeys,
        );
        let mut handle = match timeout(self.connect_timeout, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(classify_transport_error(err)),
            Err(_) => return Err(ShellError::Timeout(self.connect_timeout)),
        };

        let authenticated = handle
            .authenticate_password(&target.username, &target.password)
            .await
            .map_err(classify_transport_error)?;
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(ShellError::AuthFailed);
        }

        let run = async {
            let mut channel = handle.channel_open_session().await?;
            channel.exec(true, command).await?;

            let mut stdout: Vec<u8> = Vec::new();
            let mut stderr: Vec<u8> = Vec::new();
            let mut exit_status: Option<u32> = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                    _ => {}
                }
            }
            Ok::<_, russh::Error>((stdout, stderr, exit_status))
        };

        let outcome = match timeout(command_timeout, run).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
                return Err(classify_transport_error(err));
            }
            Err(_) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
                return Err(ShellError::Timeout(command_timeout));
            }
        };

        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        Ok(outcome)
    }
}

/// Classify a transport error by kind. Message text is never inspected;
/// locale and library drift make substring checks unreliable.
fn classify_transport_error(err: russh::Error) -> ShellError {
    match err {
        russh::Error::Disconnect => ShellError::ConnectionClosed,
        russh::Error::IO(io_err) => match io_err.kind() {
            std::io::ErrorKind::ConnectionRefused => ShellError::ConnectRefused,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => ShellError::ConnectionClosed,
            std::io::ErrorKind::TimedOut => ShellError::Timeout(Duration::ZERO),
            _ => ShellError::Unknown(io_err.to_string()),
        },
        other => ShellError::Unknown(other.to_string()),
    }
}

fn resolve_exec_outcome(
    stdout: &[u8],
    stderr: &[u8],
    exit_status: Option<u32>,
) -> Result<String, ShellError> {
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    match exit_status {
        Some(0) => Ok(stdout),
        _ if !stdout.is_empty() => Ok(stdout),
        Some(code) => Err(ShellError::CommandFailed {
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
            exit_code: code,
        }),
        // The channel ended without an exit status and without output: the
        // remote side tore the session down under us.
        None => Err(ShellError::ConnectionClosed),
    }
}

fn resolve_strict_outcome(
    stdout: &[u8],
    stderr: &[u8],
    exit_status: Option<u32>,
) -> Result<String, ShellError> {
    match exit_status {
        Some(0) => Ok(String::from_utf8_lossy(stdout).trim().to_string()),
        Some(code) => Err(ShellError::CommandFailed {
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
            exit_code: code,
        }),
        None => Err(ShellError::ConnectionClosed),
    }
}
