//! Echo server that restarts without dropping its listener.
//!
//! ```bash
//! cargo run -p waddle-handoff --example echo
//! kill -USR2 <pid>   # spawn a replacement; it retires this process when ready
//! ```

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use waddle_handoff::{control, AsyncListener, DispatchConfig, Dispatcher, Hooks, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let registry = Arc::new(Registry::inherit()?);
    let inherited = !registry.is_empty();
    if !inherited {
        let addr = std::env::var("ECHO_ADDR").unwrap_or_else(|_| "127.0.0.1:7878".to_string());
        registry.register("echo", std::net::TcpListener::bind(&addr)?)?;
    }

    registry.set_hooks(
        "echo",
        Hooks::new()
            .on_reload(|service| {
                info!(service = %service.name(), "Reloading");
                Ok(())
            })
            .on_quit(|service| {
                info!(service = %service.name(), "Draining before exit");
                Ok(())
            }),
    )?;

    let service = registry
        .get("echo")
        .ok_or_else(|| anyhow!("no 'echo' listener"))?;
    let AsyncListener::Tcp(listener) = service.try_clone_listener()?.into_async()? else {
        bail!("'echo' must be a TCP listener");
    };
    tokio::spawn(accept_loop(listener));
    info!(pid = std::process::id(), listener = %service.display_name(), "Echo server ready");

    if inherited {
        // Serving now, so the previous generation can go.
        match control::signal_recorded() {
            Ok(target) => info!(pid = target.pid, "Retired previous generation"),
            Err(e) => warn!(error = %e, "Could not retire previous generation"),
        }
    }

    let config = DispatchConfig::from_env();
    config.log_config();
    let exit = Dispatcher::new(Arc::clone(&registry), config).wait().await?;
    if let Some(e) = &exit.error {
        error!(error = %e, "Restart failed");
    }

    info!(signal = %exit.signal, "Shutting down");
    registry.close_all()?;
    Ok(())
}

async fn accept_loop(listener: tokio::net::TcpListener) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "Read failed");
                        break;
                    }
                }
            }
        });
    }
}
