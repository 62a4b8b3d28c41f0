// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use async_trait::async_trait;
use log::debug;
use std::io;
use std::net::TcpListener;
use tokio::process::Command;
use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, ctrl_shutdown};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

use super::Platform;
use crate::error::Result;
use crate::signal::{Signal, SignalSource};

/// Windows has no fd inheritance for sockets through `Command`, and only
/// forced termination for signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPlatform;

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is not supported on windows"),
    )
}

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn parent_pid(&self) -> u32 {
        0
    }

    fn send_signal(&self, pid: u32, sig: Signal) -> io::Result<()> {
        if !matches!(sig, Signal::Kill | Signal::Terminate) {
            return Err(unsupported(&format!("sending {sig}")));
        }
        // SAFETY: plain Win32 calls; the handle is closed on every path.
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            let ok = TerminateProcess(handle, 1);
            let err = io::Error::last_os_error();
            CloseHandle(handle);
            if ok == 0 {
                return Err(err);
            }
        }
        Ok(())
    }

    fn inherit_fds(&self, _cmd: &mut Command, fds: &[i32]) -> io::Result<()> {
        if fds.is_empty() {
            Ok(())
        } else {
            Err(unsupported("listener inheritance"))
        }
    }

    fn listener_from_fd(&self, _fd: i32) -> io::Result<TcpListener> {
        Err(unsupported("listener inheritance"))
    }

    fn listener_fd(&self, _listener: &TcpListener) -> Option<i32> {
        None
    }

    fn signal_source(&self) -> Box<dyn SignalSource> {
        Box::new(WindowsSignalSource::default())
    }
}

/// Console control events mapped onto the closest POSIX signal.
#[derive(Default)]
pub struct WindowsSignalSource {
    rx: Option<mpsc::Receiver<Signal>>,
    forwarders: Vec<JoinHandle<()>>,
}

#[async_trait]
impl SignalSource for WindowsSignalSource {
    fn subscribe(&mut self, signals: &[Signal]) -> Result<()> {
        let (tx, rx) = mpsc::channel(1);
        if signals.contains(&Signal::Interrupt) {
            let mut stream = ctrl_c()?;
            let tx = tx.clone();
            self.forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(Signal::Interrupt).await.is_err() {
                        break;
                    }
                }
            }));
        }
        if signals.contains(&Signal::Quit) {
            let mut stream = ctrl_break()?;
            let tx = tx.clone();
            self.forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(Signal::Quit).await.is_err() {
                        break;
                    }
                }
            }));
        }
        if signals.contains(&Signal::Terminate) {
            let mut close = ctrl_close()?;
            let mut shutdown = ctrl_shutdown()?;
            let tx = tx.clone();
            self.forwarders.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(()) = close.recv() => {}
                        Some(()) = shutdown.recv() => {}
                        else => break,
                    }
                    if tx.send(Signal::Terminate).await.is_err() {
                        break;
                    }
                }
            }));
        }
        for sig in signals {
            if !matches!(sig, Signal::Interrupt | Signal::Quit | Signal::Terminate) {
                debug!("{sig} has no console equivalent, not subscribing");
            }
        }
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

impl Drop for WindowsSignalSource {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}
