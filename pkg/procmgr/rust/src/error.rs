// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::signal::Signal;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("discovery unavailable: no writable directory among {candidates:?}")]
    DiscoveryUnavailable { candidates: Vec<PathBuf> },

    #[error("recipient not found: no listener port recorded for pid {0}")]
    RecipientNotFound(u32),

    #[error("message rejected by pid {pid}: {message}")]
    Rejected { pid: u32, message: String },

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process has not been started")]
    NotStarted,

    #[error("process {pid} exited with {status}")]
    Exited { pid: u32, status: ExitStatus },

    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: std::io::Error,
    },

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}

impl Error {
    /// Transient I/O failures are the only errors worth retrying on the send path.
    pub(crate) fn is_transient(&self) -> bool {
        use std::io::ErrorKind::*;
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                Interrupted | WouldBlock | TimedOut | ConnectionRefused | ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let refused = Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(refused.is_transient());

        let denied = Error::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());

        assert!(!Error::RecipientNotFound(1).is_transient());
    }

    #[test]
    fn test_display_mentions_pid() {
        let err = Error::RecipientNotFound(999999);
        assert!(err.to_string().contains("recipient not found"));
        assert!(err.to_string().contains("999999"));
    }
}
