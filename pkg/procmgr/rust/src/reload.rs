// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Zero-downtime reload: hand the listening socket to a fresh process image.
//!
//! The running image spawns its successor with the listener as fd 3 and the
//! fd number in `DD_PROCSUP_LISTENER_FD`. Once the successor serves on that
//! socket it tells its logical parent to exit on the admin group, and the old
//! image drains and stops.

use log::{info, warn};

use crate::error::{Error, Result};
use crate::graceful::GracefulServer;
use crate::manager::ProcessManager;
use crate::platform::FIRST_INHERITED_FD;
use crate::process::Process;
use crate::runtime::Runtime;

pub const LISTENER_FD_ENV: &str = "DD_PROCSUP_LISTENER_FD";

/// Group reserved for reload coordination between process images.
pub const ADMIN_GROUP: &str = "dd-procsup-admin";

pub const EXIT_MESSAGE: &[u8] = b"exit";

/// Listener fd handed down by the previous image, if any.
pub fn inherited_listener_fd() -> Option<i32> {
    let value = std::env::var(LISTENER_FD_ENV).ok()?;
    match value.trim().parse::<i32>() {
        Ok(fd) if fd >= 0 => Some(fd),
        _ => {
            warn!("ignoring invalid {LISTENER_FD_ENV}={value:?}");
            None
        }
    }
}

/// Start `exe args` with the server's listener inherited. The admin group is
/// subscribed first so the successor's exit request is not lost.
pub async fn spawn_successor(
    manager: &ProcessManager,
    server: &GracefulServer,
    exe: &str,
    args: &[String],
) -> Result<Process> {
    manager.runtime().transport().subscribe(ADMIN_GROUP).await?;
    let fd = server
        .fd()
        .ok_or(Error::InvalidOperation("server has no listener to hand over"))?;

    let process = manager.new_process(exe, args.iter().cloned(), &[]);
    process
        .env(LISTENER_FD_ENV, FIRST_INHERITED_FD.to_string())
        .inherit_fd(fd);
    let pid = process.start()?;
    info!(
        "reload: successor pid {pid} started with listener fd {fd} for [{}]",
        server.address()
    );
    Ok(process)
}

/// Ask the logical parent to exit. Does nothing for a process nobody supervises.
pub async fn notify_parent(runtime: &Runtime) -> Result<()> {
    if !runtime.is_child() {
        return Ok(());
    }
    let ppid = runtime.ppid();
    info!("reload: asking parent pid {ppid} to exit");
    runtime.send(ppid, EXIT_MESSAGE, ADMIN_GROUP).await
}

/// Block until a successor asks this process to exit; returns its pid.
pub async fn wait_for_successor(runtime: &Runtime) -> Result<u32> {
    let admin = runtime.transport().subscribe(ADMIN_GROUP).await?;
    loop {
        let request = admin.recv().await?;
        if request.data == EXIT_MESSAGE {
            info!("reload: pid {} took over, exiting", request.send_pid);
            return Ok(request.send_pid);
        }
        warn!(
            "reload: ignoring unexpected admin message from pid {}",
            request.send_pid
        );
    }
}
