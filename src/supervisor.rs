//! Process supervisor
//!
//! Brings the bus link up before any session may publish, runs every enabled
//! device session and tears everything down in order: inbound listener first,
//! then sessions (bounded by the grace period), then the outbound link.

use crate::bus::{BusGateway, CommandDispatcher, InboundListener};
use crate::config::BridgeConfig;
use crate::devices;
use crate::error::{BridgeError, Result};
use crate::session::{BusHandle, DeviceSession, SessionHandle};
use crate::signal::SignalRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A running bridge
pub struct Bridge {
    gateway: Arc<BusGateway>,
    dispatcher: CommandDispatcher,
    listen_addr: SocketAddr,
    listener_cancel: CancellationToken,
    listener_task: Option<JoinHandle<Result<()>>>,
    sessions_cancel: CancellationToken,
    sessions: JoinSet<(String, Result<()>)>,
    handles: Vec<SessionHandle>,
    shutdown_grace: Duration,
}

impl Bridge {
    /// Connect the bus, bind the listener and spawn the sessions
    ///
    /// Failing to reach the bus is fatal. A device whose adapter cannot be
    /// built is skipped.
    pub async fn start(config: &BridgeConfig) -> Result<Self> {
        info!("Started KNX Bus Adapter Daemon.");

        let gateway = Arc::new(BusGateway::connect(&config.bus).await?);

        let dispatcher = CommandDispatcher::new();
        let listener = InboundListener::bind(&config.listen_addr(), dispatcher.clone()).await?;
        let listen_addr = listener.local_addr()?;
        let listener_cancel = CancellationToken::new();
        let listener_task = tokio::spawn(listener.run(listener_cancel.clone()));

        let sessions_cancel = CancellationToken::new();
        let mut sessions = JoinSet::new();
        let mut handles = Vec::new();

        for device in config.enabled_devices() {
            let adapter = match devices::build_adapter(device, &config.sys) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(device = %device.name, "Skipping device: {}", e);
                    continue;
                }
            };

            let registry: SignalRegistry = device.build_signals().into_iter().collect();
            let mut bus = BusHandle::new(gateway.clone());
            if config.bus.local_echo {
                bus = bus.with_local_echo(dispatcher.clone());
            }

            let (session, handle) = DeviceSession::new(device.name.clone(), registry, adapter, bus);
            let session = session.with_reconnect(device.reconnect.clone());
            dispatcher.subscribe(handle.subscriber()).await;

            let cancel = sessions_cancel.child_token();
            let name = device.name.clone();
            sessions.spawn(async move {
                let result = session.run(cancel).await;
                (name, result)
            });

            info!(
                device = %device.name,
                "running client for {} ({})",
                device.name,
                device.kind.class_name()
            );
            handles.push(handle);
        }

        info!("✅ Bridge running with {} device sessions", handles.len());

        Ok(Self {
            gateway,
            dispatcher,
            listen_addr,
            listener_cancel,
            listener_task: Some(listener_task),
            sessions_cancel,
            sessions,
            handles,
            shutdown_grace: config.sys.shutdown_grace,
        })
    }

    pub fn gateway(&self) -> Arc<BusGateway> {
        self.gateway.clone()
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Address of the inbound command listener
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn sessions(&self) -> &[SessionHandle] {
        &self.handles
    }

    pub fn session(&self, name: &str) -> Option<&SessionHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    /// Run until `shutdown` resolves or something unrecoverable happens, then
    /// shut down
    ///
    /// A session that ends with an error is logged and the bridge keeps
    /// running. A failed listener or a panicked session task stops the bridge.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        enum Event {
            Shutdown,
            ListenerStopped(std::result::Result<Result<()>, tokio::task::JoinError>),
            SessionEnded(std::result::Result<(String, Result<()>), tokio::task::JoinError>),
        }

        let outcome = loop {
            let listener = &mut self.listener_task;
            let event = tokio::select! {
                _ = &mut shutdown => Event::Shutdown,
                stopped = async {
                    match listener.as_mut() {
                        Some(task) => task.await,
                        None => futures::future::pending().await,
                    }
                } => Event::ListenerStopped(stopped),
                Some(joined) = self.sessions.join_next() => Event::SessionEnded(joined),
            };

            match event {
                Event::Shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Event::ListenerStopped(stopped) => {
                    self.listener_task = None;
                    break match stopped {
                        Ok(Ok(())) => Err(BridgeError::internal("inbound listener stopped")),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(BridgeError::internal(format!(
                            "inbound listener task failed: {e}"
                        ))),
                    };
                }
                Event::SessionEnded(Ok((name, Ok(())))) => {
                    info!(device = %name, "Session finished");
                    self.dispatcher.unsubscribe(&name).await;
                }
                Event::SessionEnded(Ok((name, Err(e)))) => {
                    error!(device = %name, "Session ended, device unavailable: {}", e);
                    self.dispatcher.unsubscribe(&name).await;
                }
                Event::SessionEnded(Err(e)) => {
                    break Err(BridgeError::internal(format!("session task failed: {e}")));
                }
            }
        };

        if let Err(e) = &outcome {
            error!("Bridge stopping: {}", e);
        }
        self.shutdown().await;
        outcome
    }

    /// Stop the listener, close sessions within the grace period, close the bus
    pub async fn shutdown(&mut self) {
        self.listener_cancel.cancel();
        if let Some(task) = self.listener_task.take() {
            let _ = task.await;
        }

        self.sessions_cancel.cancel();
        let grace = self.shutdown_grace;
        let sessions = &mut self.sessions;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = sessions.join_next().await {
                if let Ok((name, Err(e))) = joined {
                    warn!(device = %name, "Session closed with error: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} sessions did not close within {:?}, aborting",
                self.sessions.len(),
                grace
            );
            self.sessions.abort_all();
            while self.sessions.join_next().await.is_some() {}
        }

        self.gateway.close().await;
        info!("Bridge stopped");
    }
}

/// Resolve on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run the bridge until a termination signal
pub async fn run(config: BridgeConfig) -> Result<()> {
    Bridge::start(&config).await?.run_until(shutdown_signal()).await
}
