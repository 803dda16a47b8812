//! Host service: control server on the runtime, GUI loop on its own
//! thread.
//!
//! The GUI thread sleeps with `park_timeout` and is unparked by the
//! command queue on every enqueue, so an idle host costs nothing and a
//! busy one never waits a full idle tick.

use std::sync::Arc;
use std::thread;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use loopctl_core::bridge::{EventLoopBridge, ShutdownSignal};
use loopctl_core::error::LoopError;
use loopctl_core::server::{ControlServer, ServerOptions};

use crate::config::HostConfig;
use crate::headless::headless_api;

pub struct HostService {
    options: ServerOptions,
    stop: CancellationToken,
}

impl HostService {
    pub fn new(config: &HostConfig) -> Self {
        Self::with_options(config.to_server_options())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        Self {
            options,
            stop: CancellationToken::new(),
        }
    }

    /// Cancel to drain the event loop and stop the service.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run until stopped locally or by a client's Shutdown command.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let server = Arc::new(ControlServer::bind(&self.options).await?);
        info!("host listening on {}", server.local_addr()?);

        let accept = tokio::spawn({
            let server = Arc::clone(&server);
            let stop = self.stop.clone();
            async move { server.run(stop).await }
        });

        let (signal, gui) = spawn_gui(&server, &self.options)?;
        let gui_thread = gui.thread().clone();
        server.queue().on_enqueue({
            let gui_thread = gui_thread.clone();
            move || gui_thread.unpark()
        });

        // Local stop: ask the bridge to drain, then wake it.
        let stop_watch = tokio::spawn({
            let stop = self.stop.clone();
            async move {
                stop.cancelled().await;
                signal.trigger();
                gui_thread.unpark();
            }
        });

        let joined = tokio::task::spawn_blocking(move || gui.join()).await?;
        stop_watch.abort();
        self.stop.cancel();
        accept.await??;

        match joined {
            Ok(Ok(())) => {
                info!("host stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err("GUI thread panicked".into()),
        }
    }
}

fn spawn_gui(
    server: &ControlServer,
    options: &ServerOptions,
) -> std::io::Result<(ShutdownSignal, thread::JoinHandle<Result<(), LoopError>>)> {
    let sessions = server.sessions();
    let runtime = Handle::current();
    let pool_size = options.worker_pool_size;
    let bridge_options = options.bridge.clone();
    let idle_tick = options.idle_tick;
    let (signal_tx, signal_rx) = std::sync::mpsc::channel();

    let gui = thread::Builder::new()
        .name("loopctl-gui".into())
        .spawn(move || -> Result<(), LoopError> {
            let mut bridge =
                EventLoopBridge::with_pool(headless_api(), sessions, pool_size, runtime, bridge_options);
            let _ = signal_tx.send(bridge.shutdown_signal());
            info!("GUI loop started");

            while !bridge.state().is_stopped() {
                let tick = match bridge.tick() {
                    Ok(tick) => tick,
                    Err(e) => {
                        error!("GUI loop aborted: {e}");
                        return Err(e);
                    }
                };
                if tick.applied.is_none() && tick.completed == 0 {
                    thread::park_timeout(idle_tick);
                }
            }

            let window = bridge.host().state();
            info!(
                "GUI loop stopped: title {:?}, {} events",
                window.title,
                window.events.len()
            );
            Ok(())
        })?;

    match signal_rx.recv() {
        Ok(signal) => Ok((signal, gui)),
        Err(_) => {
            warn!("GUI thread exited during startup");
            Err(std::io::Error::other("GUI thread exited during startup"))
        }
    }
}
