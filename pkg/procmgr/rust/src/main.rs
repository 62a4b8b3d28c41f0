// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use dd_procsup::config::RuntimeConfig;
use dd_procsup::reload;
use dd_procsup::{GracefulServer, ProcessManager, Runtime, Signal, handler_fn};
use http_body_util::Full;
use hyper::Response;
use log::{LevelFilter, debug, error, info, warn};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long the old image waits for its successor to take over.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "dd-procsup", version, about = "Process supervision and local IPC")]
struct Cli {
    /// YAML runtime config; defaults to $DD_PROCSUP_CONFIG when set.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "DD_PROCSUP_LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve HTTP with zero-downtime reload on SIGHUP.
    Serve(ServeArgs),
    /// Start a command and supervise it until it exits.
    Run(RunArgs),
    /// Send one message to another process.
    Send(SendArgs),
    /// Print messages delivered to a group.
    Receive(ReceiveArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Overrides the configured server address.
    #[arg(long)]
    address: Option<String>,
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long)]
    pid: u32,
    #[arg(long, default_value = "")]
    group: String,
    data: String,
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    #[arg(long, default_value = "")]
    group: String,
    /// Exit after this many messages.
    #[arg(long)]
    count: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    SimpleLogger::new().with_level(cli.log_level).init()?;

    let config = match &cli.config {
        Some(path) => {
            let mut config = RuntimeConfig::load(path)?;
            config.apply_env_overrides();
            config
        }
        None => RuntimeConfig::from_env()?,
    };
    let runtime = Runtime::new(config);
    info!(
        "dd-procsup starting (version {}, pid {})",
        env!("CARGO_PKG_VERSION"),
        runtime.pid()
    );

    let result = match cli.command {
        Command::Serve(args) => serve(&runtime, args).await,
        Command::Run(args) => run(&runtime, args).await,
        Command::Send(args) => send(&runtime, args).await,
        Command::Receive(args) => receive(&runtime, args).await,
    };

    runtime.shutdown().await;
    info!("dd-procsup shutting down");
    result
}

async fn serve(runtime: &Runtime, args: ServeArgs) -> Result<()> {
    let mut config = runtime.config().server.clone();
    if let Some(address) = args.address {
        config.address = address;
    }

    let pid = runtime.pid();
    let handler = handler_fn(move |req| async move {
        let body = format!("pid {pid}: {} {}\n", req.method(), req.uri().path());
        Response::new(Full::new(Bytes::from(body)))
    });
    let mut server = GracefulServer::new(runtime, config, handler)?;
    let inherited = reload::inherited_listener_fd();
    if let Some(fd) = inherited {
        server = server.with_inherited_fd(fd);
    }
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => server.create_listener_tls(cert, key)?,
        (None, None) => server.create_listener()?,
        _ => bail!("--tls-cert and --tls-key must be given together"),
    }
    let server = Arc::new(server);
    server.register_shutdown_handler();

    let manager = ProcessManager::new(runtime);
    register_reload_handler(runtime, &manager, &server)?;
    let signals = spawn_signal_listener(runtime);

    if inherited.is_some()
        && let Err(e) = reload::notify_parent(runtime).await
    {
        warn!("could not ask the previous image to exit: {e}");
    }

    let served = server.serve().await;
    signals.abort();
    served.context("serving")
}

fn register_reload_handler(
    runtime: &Runtime,
    manager: &ProcessManager,
    server: &Arc<GracefulServer>,
) -> Result<()> {
    let exe = std::env::current_exe()
        .context("resolving own executable")?
        .to_string_lossy()
        .into_owned();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (runtime_handle, manager, server) = (runtime.clone(), manager.clone(), Arc::clone(server));

    runtime.signals().add_handler(
        move |sig| {
            let (runtime, manager, server) =
                (runtime_handle.clone(), manager.clone(), Arc::clone(&server));
            let (exe, args) = (exe.clone(), args.clone());
            async move {
                info!("{sig} received, handing the listener to a new image");
                let successor = match reload::spawn_successor(&manager, &server, &exe, &args).await {
                    Ok(successor) => successor,
                    Err(e) => {
                        error!("reload failed: {e}");
                        return;
                    }
                };
                match tokio::time::timeout(RELOAD_TIMEOUT, reload::wait_for_successor(&runtime)).await {
                    Ok(Ok(_)) => server.shutdown().await,
                    Ok(Err(e)) => error!("reload aborted: {e}"),
                    Err(_) => {
                        warn!("successor did not take over within {RELOAD_TIMEOUT:?}, killing it");
                        if let Err(e) = successor.kill() {
                            warn!("killing successor: {e}");
                        }
                    }
                }
            }
        },
        &[Signal::Hangup],
    );
    Ok(())
}

async fn run(runtime: &Runtime, args: RunArgs) -> Result<()> {
    let manager = ProcessManager::new(runtime);
    let (path, rest) = args
        .command
        .split_first()
        .context("no command given")?;
    let process = manager.new_process(path.as_str(), rest.iter().cloned(), &[]);
    process.start()?;

    let forward = manager.clone();
    runtime.signals().add_shutdown_handler(move |sig| {
        let manager = forward.clone();
        async move {
            info!("{sig} received, stopping {} managed process(es)", manager.size());
            if let Err(e) = manager.signal_all(Signal::Terminate) {
                warn!("stopping managed processes: {e}");
            }
        }
    });
    let signals = spawn_signal_listener(runtime);

    let waited = process.wait().await;
    signals.abort();
    manager.clear();
    let status = waited?;
    info!("[{path}] exited with {status}");
    Ok(())
}

async fn send(runtime: &Runtime, args: SendArgs) -> Result<()> {
    runtime
        .send(args.pid, args.data.as_bytes(), &args.group)
        .await
        .with_context(|| format!("sending to pid {}", args.pid))?;
    info!("delivered {} byte(s) to pid {} group [{}]", args.data.len(), args.pid, args.group);
    Ok(())
}

async fn receive(runtime: &Runtime, args: ReceiveArgs) -> Result<()> {
    let subscription = runtime.transport().subscribe(&args.group).await?;
    info!(
        "pid {} receiving on group [{}], port {}",
        runtime.pid(),
        args.group,
        runtime.transport().port().unwrap_or_default()
    );

    runtime
        .signals()
        .add_shutdown_handler(|sig| async move { debug!("{sig} received, stop receiving") });
    let mut signals = spawn_signal_listener(runtime);

    let mut received = 0usize;
    loop {
        tokio::select! {
            message = subscription.recv() => {
                let message = message?;
                received += 1;
                info!(
                    "received from pid {}: {}",
                    message.send_pid,
                    String::from_utf8_lossy(&message.data)
                );
                if args.count.is_some_and(|count| received >= count) {
                    break;
                }
            }
            _ = &mut signals => break,
        }
    }
    signals.abort();
    info!("received {received} message(s)");
    Ok(())
}

fn spawn_signal_listener(runtime: &Runtime) -> tokio::task::JoinHandle<()> {
    let runtime = runtime.clone();
    tokio::spawn(async move {
        if let Err(e) = runtime.listen_signals().await {
            error!("signal listener failed: {e}");
        }
    })
}
