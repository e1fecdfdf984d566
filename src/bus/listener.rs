//! Inbound commands from the bus
//!
//! linknx opens a fresh TCP connection per command and sends one
//! `address=value` line. Every registered subscriber sees every command and
//! ignores addresses it does not own.

use super::protocol::decode_inbound;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinSet};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest accepted inbound line
pub const MAX_LINE_LENGTH: usize = 4096;

/// How long a peer may take to send its line
pub const INBOUND_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stopping listener waits for commands already being dispatched
pub const INBOUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOrigin {
    /// Received from linknx
    Bus,
    /// Published by another session on this bridge
    Local { device: String },
}

/// A value destined for whichever session owns `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusCommand {
    pub address: String,
    pub value: String,
    pub origin: CommandOrigin,
}

impl BusCommand {
    pub fn from_bus(address: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            value: value.into(),
            origin: CommandOrigin::Bus,
        }
    }

    pub fn local(
        device: impl Into<String>,
        address: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            value: value.into(),
            origin: CommandOrigin::Local {
                device: device.into(),
            },
        }
    }
}

/// Consumer of inbound commands
#[async_trait]
pub trait CommandSubscriber: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one command; returns once the subscriber is done with it
    async fn deliver(&self, command: BusCommand);
}

/// Fan-out of commands to every subscriber
#[derive(Clone, Default)]
pub struct CommandDispatcher {
    subscribers: Arc<RwLock<Vec<Arc<dyn CommandSubscriber>>>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn CommandSubscriber>) {
        debug!("Subscribing {} to inbound commands", subscriber.name());
        self.subscribers.write().await.push(subscriber);
    }

    pub async fn unsubscribe(&self, name: &str) {
        self.subscribers.write().await.retain(|s| s.name() != name);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver to every subscriber and wait for all of them
    ///
    /// Locally echoed commands skip the session that published them.
    pub async fn dispatch(&self, command: BusCommand) {
        let subscribers = self.subscribers.read().await.clone();
        let targets = subscribers.iter().filter(|s| match &command.origin {
            CommandOrigin::Local { device } => s.name() != device,
            CommandOrigin::Bus => true,
        });

        join_all(targets.map(|s| s.deliver(command.clone()))).await;
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher").finish_non_exhaustive()
    }
}

/// Accepts one connection per inbound command
pub struct InboundListener {
    listener: TcpListener,
    dispatcher: CommandDispatcher,
}

impl InboundListener {
    pub async fn bind(addr: &str, dispatcher: CommandDispatcher) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BridgeError::transport(format!("binding inbound listener on {addr}: {e}"))
        })?;
        info!("📡 Listening for linknx commands on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled
    ///
    /// Returns an error only if the socket itself fails. Either way the
    /// connections already accepted are finished (or aborted after
    /// [`INBOUND_DRAIN_TIMEOUT`]) before this returns, so no command reaches a
    /// session once the listener is stopped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let handlers_cancel = cancel.child_token();
        let mut handlers = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = handlers.join_next() => log_handler_exit(joined),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        handlers.spawn(handle_connection(
                            stream,
                            peer,
                            self.dispatcher.clone(),
                            handlers_cancel.clone(),
                        ));
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("Inbound accept failed: {}", e);
                    }
                    Err(e) => {
                        break Err(BridgeError::transport(format!("inbound listener failed: {e}")));
                    }
                },
            }
        };

        handlers_cancel.cancel();
        drain_handlers(&mut handlers).await;
        info!("Inbound listener stopped");
        outcome
    }
}

async fn drain_handlers(handlers: &mut JoinSet<()>) {
    if handlers.is_empty() {
        return;
    }
    debug!("Waiting for {} inbound connections", handlers.len());

    let drained = tokio::time::timeout(INBOUND_DRAIN_TIMEOUT, async {
        while let Some(joined) = handlers.join_next().await {
            log_handler_exit(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} inbound connections still busy after {:?}, aborting",
            handlers.len(),
            INBOUND_DRAIN_TIMEOUT
        );
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
    }
}

fn log_handler_exit(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!("Inbound connection handler panicked: {}", e);
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: CommandDispatcher,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    // a command already read is always dispatched
    let read = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(peer = %peer, "Listener stopping, idle inbound connection dropped");
            return;
        }
        read = tokio::time::timeout(INBOUND_READ_TIMEOUT, lines.next()) => read,
    };

    let line = match read {
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(e))) => {
            warn!(peer = %peer, "Unreadable inbound line: {}", e);
            return;
        }
        Ok(None) => {
            debug!(peer = %peer, "Inbound connection closed without a command");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "No inbound command within {:?}", INBOUND_READ_TIMEOUT);
            return;
        }
    };

    debug!(peer = %peer, "Received {:?}", line);

    match decode_inbound(&line) {
        Ok(decoded) => {
            dispatcher
                .dispatch(BusCommand::from_bus(decoded.address, decoded.value))
                .await;
        }
        Err(e) => warn!(peer = %peer, "Dropping inbound line: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    struct Recorder {
        name: String,
        seen: StdMutex<Vec<BusCommand>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<BusCommand> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandSubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn deliver(&self, command: BusCommand) {
            self.seen.lock().unwrap().push(command);
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_all_subscribers() {
        let dispatcher = CommandDispatcher::new();
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        dispatcher.subscribe(a.clone()).await;
        dispatcher.subscribe(b.clone()).await;

        dispatcher.dispatch(BusCommand::from_bus("1/1/1", "on")).await;

        assert_eq!(a.seen().len(), 1);
        assert_eq!(b.seen()[0].address, "1/1/1");
    }

    #[tokio::test]
    async fn test_local_echo_skips_origin() {
        let dispatcher = CommandDispatcher::new();
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        dispatcher.subscribe(a.clone()).await;
        dispatcher.subscribe(b.clone()).await;

        dispatcher.dispatch(BusCommand::local("a", "1/1/1", "on")).await;

        assert!(a.seen().is_empty());
        assert_eq!(b.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.subscribe(Recorder::new("a")).await;
        dispatcher.unsubscribe("a").await;
        assert_eq!(dispatcher.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_listener_dispatches_and_survives_garbage() {
        let dispatcher = CommandDispatcher::new();
        let recorder = Recorder::new("r");
        dispatcher.subscribe(recorder.clone()).await;

        let listener = InboundListener::bind("127.0.0.1:0", dispatcher).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        for line in ["garbage without separator\n", "=nothing\n", "3/1/2=on\r\n"] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(line.as_bytes()).await.unwrap();
            // the listener closes its side once done
            let mut buf = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
        }

        assert_eq!(recorder.seen(), vec![BusCommand::from_bus("3/1/2", "on")]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    /// Takes a while to handle each command
    struct SlowSubscriber {
        started: Notify,
        finished: AtomicBool,
    }

    #[async_trait]
    impl CommandSubscriber for SlowSubscriber {
        fn name(&self) -> &str {
            "slow"
        }

        async fn deliver(&self, _command: BusCommand) {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_command_in_flight() {
        let dispatcher = CommandDispatcher::new();
        let slow = Arc::new(SlowSubscriber {
            started: Notify::new(),
            finished: AtomicBool::new(false),
        });
        dispatcher.subscribe(slow.clone()).await;

        let listener = InboundListener::bind("127.0.0.1:0", dispatcher).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"4/0/1=on\n").await.unwrap();
        slow.started.notified().await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(slow.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_drops_idle_connections() {
        let dispatcher = CommandDispatcher::new();
        let recorder = Recorder::new("r");
        dispatcher.subscribe(recorder.clone()).await;

        let listener = InboundListener::bind("127.0.0.1:0", dispatcher).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        // connected but silent: must not hold the listener for the read timeout
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener did not stop")
            .unwrap()
            .unwrap();
        assert!(recorder.seen().is_empty());
    }
}
