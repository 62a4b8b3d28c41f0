// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process supervision and local IPC.
//!
//! - Child process handles and a pid-keyed manager (`process`, `manager`)
//! - pid -> port discovery files and framed JSON messaging over loopback TCP
//!   with per-group queues (`discovery`, `transport`)
//! - Signal fan-out to registered handlers (`signal`)
//! - An HTTP server that keeps its socket across process image swaps
//!   (`graceful`, `reload`)
//!
//! Everything hangs off a [`Runtime`] built once per process.

#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]

pub mod config;
pub mod discovery;
pub mod env;
pub mod error;
pub mod graceful;
pub mod manager;
pub mod message;
pub mod platform;
pub mod process;
pub mod queue;
pub mod reload;
pub mod runtime;
pub mod signal;
pub mod state;
pub mod transport;

// Re-export public types
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use graceful::{GracefulServer, Handler, ServerStatus, handler_fn};
pub use manager::ProcessManager;
pub use message::{MessageRequest, MessageResponse};
pub use process::{Process, StdioMode};
pub use runtime::Runtime;
pub use signal::{Signal, SignalDispatcher};
pub use state::ProcessState;
pub use transport::{Subscription, Transport};
