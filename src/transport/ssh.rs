//! SSH transport on top of libssh2
//!
//! Every session is a fresh TCP connection with its own SSH handshake.
//! Negotiation offers exactly one cipher; keep-alives are enabled so idle
//! sessions notice a dead peer.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

use secrecy::ExposeSecret;
use ssh2::{ErrorCode, FileStat, MethodType, Session, Sftp};
use tracing::{debug, trace};

use super::{
    CommandSession, ConnectParams, ExecOutput, FileSession, SessionFactory, TransportError,
    TransportResult,
};
use crate::credentials::SshAuth;

/// libssh2 `LIBSSH2_ERROR_TIMEOUT`
const ERROR_TIMEOUT: i32 = -9;
/// SFTP `SSH_FX_NO_SUCH_FILE`
const SFTP_NO_SUCH_FILE: i32 = 2;
/// SFTP `SSH_FX_PERMISSION_DENIED`
const SFTP_PERMISSION_DENIED: i32 = 3;

const KEEPALIVE_INTERVAL_SECS: u32 = 30;

/// Opens real SSH sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct SshSessionFactory;

impl SshSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SessionFactory for SshSessionFactory {
    fn open_command(&self, params: &ConnectParams) -> TransportResult<Box<dyn CommandSession>> {
        let session = connect(params)?;
        Ok(Box::new(SshCommandSession {
            session,
            endpoint: params.endpoint(),
            connected: true,
        }))
    }

    fn open_file(&self, params: &ConnectParams) -> TransportResult<Box<dyn FileSession>> {
        let session = connect(params)?;
        let sftp = session
            .sftp()
            .map_err(|e| map_error(&params.endpoint(), "open sftp channel", e))?;
        Ok(Box::new(SshFileSession {
            session,
            sftp,
            endpoint: params.endpoint(),
            connected: true,
        }))
    }
}

/// Dial, negotiate and authenticate one session
fn connect(params: &ConnectParams) -> TransportResult<Session> {
    let endpoint = params.endpoint();

    let addr = (params.host.as_str(), params.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::connection(&endpoint, e.to_string()))?
        .next()
        .ok_or_else(|| TransportError::connection(&endpoint, "address did not resolve"))?;

    let tcp = TcpStream::connect_timeout(&addr, params.connect_timeout)
        .map_err(|e| TransportError::connection(&endpoint, e.to_string()))?;
    tcp.set_read_timeout(Some(params.operation_timeout)).ok();
    tcp.set_write_timeout(Some(params.operation_timeout)).ok();

    let mut session =
        Session::new().map_err(|e| TransportError::connection(&endpoint, e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(params.connect_timeout.as_millis().min(u32::MAX as u128) as u32);

    for method in [MethodType::CryptCs, MethodType::CryptSc] {
        session
            .method_pref(method, &params.cipher)
            .map_err(|e| TransportError::connection(&endpoint, e.to_string()))?;
    }

    session
        .handshake()
        .map_err(|e| map_error(&endpoint, "handshake", e))?;

    trace!(
        "Authenticating to {} as {} ({})",
        endpoint,
        params.username,
        params.auth.method_name()
    );

    let auth_error = |e: ssh2::Error| TransportError::Authentication {
        username: params.username.clone(),
        message: e.message().to_string(),
    };

    match &params.auth {
        SshAuth::Password(password) => session
            .userauth_password(&params.username, password.expose_secret())
            .map_err(auth_error)?,
        SshAuth::PrivateKey { pem, passphrase } => session
            .userauth_pubkey_memory(
                &params.username,
                None,
                pem.expose_secret(),
                passphrase.as_ref().map(|p| p.expose_secret()),
            )
            .map_err(auth_error)?,
        SshAuth::KeyFile {
            key_path,
            passphrase,
        } => session
            .userauth_pubkey_file(
                &params.username,
                None,
                key_path,
                passphrase.as_ref().map(|p| p.expose_secret()),
            )
            .map_err(auth_error)?,
    }

    if !session.authenticated() {
        return Err(TransportError::Authentication {
            username: params.username.clone(),
            message: "server did not accept the credentials".to_string(),
        });
    }

    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
    session.set_timeout(params.operation_timeout.as_millis().min(u32::MAX as u128) as u32);

    debug!("Connected to {} ({})", params.node, endpoint);
    Ok(session)
}

/// Classify a libssh2 error
fn map_error(endpoint: &str, operation: &str, err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::Session(ERROR_TIMEOUT) => TransportError::Timeout {
            operation: format!("{} on {}", operation, endpoint),
        },
        ErrorCode::Session(_) => TransportError::connection(
            endpoint,
            format!("{}: {}", operation, err.message()),
        ),
        ErrorCode::SFTP(code) => {
            TransportError::Remote(format!("{}: sftp error {}: {}", operation, code, err.message()))
        }
    }
}

fn map_sftp_error(endpoint: &str, operation: &str, path: &str, err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => TransportError::NotFound {
            path: path.to_string(),
        },
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => TransportError::PermissionDenied {
            path: path.to_string(),
        },
        _ => map_error(endpoint, operation, err),
    }
}

struct SshCommandSession {
    session: Session,
    endpoint: String,
    connected: bool,
}

impl CommandSession for SshCommandSession {
    fn is_connected(&self) -> bool {
        self.connected && self.session.authenticated()
    }

    fn exec(&mut self, command: &str) -> TransportResult<ExecOutput> {
        let endpoint = self.endpoint.as_str();
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| map_error(endpoint, "open channel", e))?;
        channel
            .exec(command)
            .map_err(|e| map_error(endpoint, "exec", e))?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel
            .wait_close()
            .map_err(|e| map_error(endpoint, "close channel", e))?;
        let exit_code = channel
            .exit_status()
            .map_err(|e| map_error(endpoint, "exit status", e))?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.session.disconnect(None, "closing", None).ok();
        }
    }
}

struct SshFileSession {
    session: Session,
    sftp: Sftp,
    endpoint: String,
    connected: bool,
}

impl FileSession for SshFileSession {
    fn is_connected(&self) -> bool {
        self.connected && self.session.authenticated()
    }

    fn upload(&mut self, path: &str, data: &[u8], mode: Option<i32>) -> TransportResult<()> {
        let mut file = self
            .sftp
            .create(Path::new(path))
            .map_err(|e| map_sftp_error(&self.endpoint, "create", path, e))?;
        file.write_all(data)?;

        if let Some(mode) = mode {
            file.setstat(FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode as u32),
                atime: None,
                mtime: None,
            })
            .map_err(|e| map_sftp_error(&self.endpoint, "setstat", path, e))?;
        }
        Ok(())
    }

    fn download(&mut self, path: &str) -> TransportResult<Vec<u8>> {
        let mut file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| map_sftp_error(&self.endpoint, "open", path, e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn exists(&mut self, path: &str) -> TransportResult<bool> {
        match self.sftp.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(false),
            Err(e) => Err(map_sftp_error(&self.endpoint, "stat", path, e)),
        }
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.session.disconnect(None, "closing", None).ok();
        }
    }
}
