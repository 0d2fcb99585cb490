//! SSH credentials for a node

use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;

/// SSH authentication method
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Password authentication
    Password(SecretString),

    /// Public key authentication with an in-memory PEM private key
    PrivateKey {
        /// OpenSSH or PEM encoded private key
        pem: SecretString,
        /// Optional passphrase for the key
        passphrase: Option<SecretString>,
    },

    /// Public key authentication with a private key file
    KeyFile {
        /// Path to private key file
        key_path: PathBuf,
        /// Optional passphrase for the key
        passphrase: Option<SecretString>,
    },
}

impl SshAuth {
    /// Short name of the method for logs
    pub fn method_name(&self) -> &'static str {
        match self {
            SshAuth::Password(_) => "password",
            SshAuth::PrivateKey { .. } => "private-key",
            SshAuth::KeyFile { .. } => "key-file",
        }
    }
}

/// Username plus one authentication method
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub auth: SshAuth,
}

impl Credentials {
    /// Password credentials
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth: SshAuth::Password(SecretString::from(password.into())),
        }
    }

    /// In-memory private key credentials
    pub fn private_key(username: impl Into<String>, pem: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth: SshAuth::PrivateKey {
                pem: SecretString::from(pem.into()),
                passphrase: None,
            },
        }
    }

    /// Private key file credentials
    pub fn key_file(username: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            auth: SshAuth::KeyFile {
                key_path: key_path.into(),
                passphrase: None,
            },
        }
    }

    /// Whether the password (if any) equals `candidate`. Used by tests and fakes.
    pub fn password_matches(&self, candidate: &str) -> bool {
        match &self.auth {
            SshAuth::Password(secret) => secret.expose_secret() == candidate,
            _ => false,
        }
    }

    /// Home folder of the account on a standard Linux layout
    pub fn home_folder(&self, home_root: &str) -> String {
        if self.username == "root" {
            "/root".to_string()
        } else {
            format!("{}/{}", home_root.trim_end_matches('/'), self.username)
        }
    }
}
