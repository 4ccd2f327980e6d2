//! Error types for edgekube

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for edgekube operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Certificate authority failure
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error outside the filesystem preparer
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem preparation error
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// Child process could not be started or exited unexpectedly
    #[error("process error: {0}")]
    Process(String),

    /// Health probe exhausted its attempts
    #[error("health check error: {0}")]
    Health(String),

    /// A service failed before signalling readiness
    #[error("readiness error: {0}")]
    Readiness(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid runtime configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Add-on deployment error
    #[error("addon error: {0}")]
    Addon(String),
}

impl Error {
    /// Create a filesystem error with the given message
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem(msg.into())
    }

    /// Create a process error with the given message
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create a health check error with the given message
    pub fn health(msg: impl Into<String>) -> Self {
        Self::Health(msg.into())
    }

    /// Create a readiness error with the given message
    pub fn readiness(msg: impl Into<String>) -> Self {
        Self::Readiness(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an add-on error with the given message
    pub fn addon(msg: impl Into<String>) -> Self {
        Self::Addon(msg.into())
    }

    /// Whether this error must stop the node from starting at all
    pub fn is_fatal_bootstrap(&self) -> bool {
        matches!(self, Error::Pki(_) | Error::Filesystem(_) | Error::Config(_))
    }
}
