//! Error types for the provisioning agent.

use std::io;
use thiserror::Error;

/// Errors surfaced by the per-domain server lifecycle.
///
/// Each variant identifies the stage that failed; nothing here is retried
/// automatically. Host mutations applied before a failing step are not
/// rolled back.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server config: {0}")]
    Config(String),

    #[error("hypervisor connection failed: {0}")]
    Connection(io::Error),

    #[error("domain not found: {0}")]
    Lookup(String),

    #[error("domain metadata: {0}")]
    Metadata(String),

    #[error("host interface '{0}' not usable: {1}")]
    Interface(String, String),

    #[error("host network mutation failed for {subject}: {detail}")]
    NetworkMutation { subject: String, detail: String },

    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
