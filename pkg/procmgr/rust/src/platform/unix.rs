// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use async_trait::async_trait;
use log::{debug, warn};
use nix::sys::signal as nix_signal;
use nix::unistd::Pid;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd};
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{FIRST_INHERITED_FD, Platform};
use crate::error::Result;
use crate::signal::{Signal, SignalSource};

#[derive(Debug, Clone, Copy, Default)]
pub struct UnixPlatform;

fn to_nix(sig: Signal) -> nix_signal::Signal {
    match sig {
        Signal::Interrupt => nix_signal::Signal::SIGINT,
        Signal::Quit => nix_signal::Signal::SIGQUIT,
        Signal::Kill => nix_signal::Signal::SIGKILL,
        Signal::Terminate => nix_signal::Signal::SIGTERM,
        Signal::Abort => nix_signal::Signal::SIGABRT,
        Signal::Hangup => nix_signal::Signal::SIGHUP,
        Signal::User1 => nix_signal::Signal::SIGUSR1,
        Signal::User2 => nix_signal::Signal::SIGUSR2,
    }
}

fn signal_kind(sig: Signal) -> Option<SignalKind> {
    match sig {
        Signal::Interrupt => Some(SignalKind::interrupt()),
        Signal::Quit => Some(SignalKind::quit()),
        Signal::Terminate => Some(SignalKind::terminate()),
        Signal::Abort => Some(SignalKind::from_raw(libc::SIGABRT)),
        Signal::Hangup => Some(SignalKind::hangup()),
        Signal::User1 => Some(SignalKind::user_defined1()),
        Signal::User2 => Some(SignalKind::user_defined2()),
        Signal::Kill => None,
    }
}

fn set_cloexec(fd: i32, enabled: bool) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own, with no pointers involved.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Place `sources[i]` at `first + i`. Every source is first duplicated above
/// the target range, so a source that sits in an earlier target slot is not
/// overwritten before it is copied. `staged` must be as long as `sources`.
fn remap_fds(sources: &[i32], first: i32, staged: &mut [i32]) -> io::Result<()> {
    let floor = first + sources.len() as i32;
    for (slot, &fd) in staged.iter_mut().zip(sources) {
        // SAFETY: plain descriptor duplication, no pointers involved.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD, floor) };
        if dup == -1 {
            return Err(io::Error::last_os_error());
        }
        *slot = dup;
    }
    for (target, &fd) in (first..).zip(staged.iter()) {
        // SAFETY: both descriptors are open; the staged copy is ours to close.
        unsafe {
            if libc::dup2(fd, target) == -1 {
                return Err(io::Error::last_os_error());
            }
            libc::close(fd);
        }
    }
    Ok(())
}

impl Platform for UnixPlatform {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn parent_pid(&self) -> u32 {
        std::os::unix::process::parent_id()
    }

    fn send_signal(&self, pid: u32, sig: Signal) -> io::Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        nix_signal::kill(Pid::from_raw(raw), to_nix(sig)).map_err(io::Error::from)
    }

    fn inherit_fds(&self, cmd: &mut Command, fds: &[i32]) -> io::Result<()> {
        if fds.is_empty() {
            return Ok(());
        }
        let fds = fds.to_vec();
        let mut staged = vec![-1; fds.len()];
        debug!(
            "passing {} file descriptor(s) starting at fd {FIRST_INHERITED_FD}",
            fds.len()
        );
        // SAFETY: the closure only calls async-signal-safe functions (fcntl,
        // dup2, close) between fork and exec and does not allocate.
        unsafe {
            cmd.pre_exec(move || remap_fds(&fds, FIRST_INHERITED_FD, &mut staged));
        }
        Ok(())
    }

    fn listener_from_fd(&self, fd: i32) -> io::Result<TcpListener> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listener fd {fd}"),
            ));
        }
        // SAFETY: the fd was handed to this process by its parent for exactly
        // this purpose and nothing else in the process owns it.
        let listener = unsafe { TcpListener::from_raw_fd(fd) };
        listener.local_addr()?;
        // Keep it from leaking into unrelated children; reload re-enables it.
        set_cloexec(fd, true)?;
        Ok(listener)
    }

    fn listener_fd(&self, listener: &TcpListener) -> Option<i32> {
        Some(listener.as_raw_fd())
    }

    fn signal_source(&self) -> Box<dyn SignalSource> {
        Box::new(UnixSignalSource::default())
    }
}

/// Forwards tokio signal streams into one channel. The channel holds a single
/// pending signal, so rapid repeats of the same signal may coalesce.
#[derive(Default)]
pub struct UnixSignalSource {
    rx: Option<mpsc::Receiver<Signal>>,
    forwarders: Vec<JoinHandle<()>>,
}

#[async_trait]
impl SignalSource for UnixSignalSource {
    fn subscribe(&mut self, signals: &[Signal]) -> Result<()> {
        let (tx, rx) = mpsc::channel(1);
        for &sig in signals {
            let Some(kind) = signal_kind(sig) else {
                debug!("{sig} cannot be caught, not subscribing");
                continue;
            };
            let mut stream = signal(kind)?;
            let tx = tx.clone();
            self.forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(sig).await.is_err() {
                        break;
                    }
                }
            }));
        }
        if self.forwarders.is_empty() {
            warn!("no catchable signals registered, signal listener will idle");
        }
        // Keep one sender alive so recv blocks instead of ending when idle.
        self.forwarders.push(tokio::spawn(async move {
            tx.closed().await;
        }));
        self.rx = Some(rx);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Signal> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for UnixSignalSource {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}
