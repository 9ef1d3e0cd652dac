// src/balancer/error.rs
use std::io;
use std::path::PathBuf;

/// Rejections from [`VirtualServer::new`](super::VirtualServer::new).
/// Nothing is constructed when one of these is returned.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("virtual server name is empty")]
    NameEmpty,

    #[error("virtual server address is empty")]
    AddressEmpty,

    #[error("protocol {0:?} is not supported")]
    UnsupportedProtocol(String),

    #[error("load balancing method {0:?} is not supported")]
    UnsupportedMethod(String),

    #[error("{kind} file {path:?} does not exist")]
    TlsFileMissing { kind: &'static str, path: PathBuf },
}

/// Failures of `run` / `stop`. The server's status is unchanged when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("virtual server {0} is already enabled")]
    AlreadyEnabled(String),

    #[error("virtual server {0} is already disabled")]
    AlreadyDisabled(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS material from {path:?}: {message}")]
    Tls { path: PathBuf, message: String },
}
