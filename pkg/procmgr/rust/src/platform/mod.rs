// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! OS-family specific behavior behind one small interface, so that process
//! handles and the graceful server stay platform-agnostic.

use std::fmt;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use tokio::process::Command;

use crate::signal::{Signal, SignalSource};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform;

/// First descriptor number a child sees for inherited sockets (after stdio).
pub const FIRST_INHERITED_FD: i32 = 3;

pub trait Platform: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// OS parent of the current process.
    fn parent_pid(&self) -> u32;

    fn send_signal(&self, pid: u32, sig: Signal) -> io::Result<()>;

    /// Arrange for `fds` to be open in the child as `FIRST_INHERITED_FD + i`.
    fn inherit_fds(&self, cmd: &mut Command, fds: &[i32]) -> io::Result<()>;

    /// Adopt a listening socket handed down by an ancestor.
    fn listener_from_fd(&self, fd: i32) -> io::Result<TcpListener>;

    /// Raw descriptor of `listener`, where descriptors can be passed to children.
    fn listener_fd(&self, listener: &TcpListener) -> Option<i32>;

    /// Fresh source of OS signal deliveries.
    fn signal_source(&self) -> Box<dyn SignalSource>;
}

/// Strategy for the OS family this binary was built for.
pub fn current() -> Arc<dyn Platform> {
    #[cfg(unix)]
    {
        Arc::new(UnixPlatform)
    }

    #[cfg(windows)]
    {
        Arc::new(WindowsPlatform)
    }
}
