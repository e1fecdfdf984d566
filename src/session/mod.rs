//! Device sessions
//!
//! A session binds one device adapter to its signals and to the bus. It runs
//! as a single task: poll ticks, unsolicited device data and inbound commands
//! are multiplexed with `tokio::select!`, so the signal registry is never
//! shared between tasks.
//!
//! State machine: `Idle -> Connecting -> Active -> {Active, Degraded} -> Closed`.

pub mod reconnect;
pub mod worker;

pub use reconnect::{Backoff, ReconnectionConfig};

use crate::bus::{BusCommand, BusGateway, CommandDispatcher, CommandOrigin, CommandSubscriber};
use crate::error::{BridgeError, BusError, Result};
use crate::log_structured_error;
use crate::signal::debounce::{self, Accepted, Decision, RejectReason};
use crate::signal::{Signal, SignalRegistry, SignalUpdate};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands buffered per session
const INBOX_CAPACITY: usize = 32;

/// A raw reading produced by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub address: String,
    pub raw: String,
}

impl RawSample {
    pub fn new(address: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            raw: raw.into(),
        }
    }
}

/// Device integration plugged into a session
///
/// Every method but `connect` has a default so adapters implement only the
/// activities their device supports.
#[async_trait]
pub trait DeviceAdapter: Send {
    /// Establish the device link
    async fn connect(&mut self) -> Result<()>;

    /// Period of `poll`; None disables polling
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// Query the device
    async fn poll(&mut self) -> Result<Vec<RawSample>> {
        Ok(Vec::new())
    }

    /// Wait for unsolicited data; must be cancel-safe
    async fn receive(&mut self) -> Result<Vec<RawSample>> {
        futures::future::pending().await
    }

    /// Apply a bus value to the device
    async fn execute(&mut self, signal: &Signal, value: &str) -> Result<()> {
        debug!(address = %signal.address, "Device takes no commands, ignoring {}", value);
        Ok(())
    }

    /// Release the device link
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Degraded,
    Closed,
}

/// A session's access to the bus
#[derive(Clone, Debug)]
pub struct BusHandle {
    gateway: Arc<BusGateway>,
    echo: Option<CommandDispatcher>,
}

impl BusHandle {
    pub fn new(gateway: Arc<BusGateway>) -> Self {
        Self {
            gateway,
            echo: None,
        }
    }

    /// Forward published values to the other sessions
    pub fn with_local_echo(mut self, dispatcher: CommandDispatcher) -> Self {
        self.echo = Some(dispatcher);
        self
    }

    pub async fn publish(
        &self,
        origin: &str,
        updates: &[SignalUpdate],
    ) -> std::result::Result<(), BusError> {
        self.gateway.publish(updates).await?;

        if let Some(dispatcher) = &self.echo {
            let dispatcher = dispatcher.clone();
            let commands: Vec<BusCommand> = updates
                .iter()
                .map(|u| BusCommand::local(origin, u.address.clone(), u.value.clone()))
                .collect();
            // detached so two sessions echoing to each other cannot wait on one another
            tokio::spawn(async move {
                for command in commands {
                    dispatcher.dispatch(command).await;
                }
            });
        }
        Ok(())
    }
}

struct InboxMessage {
    command: BusCommand,
    done: oneshot::Sender<()>,
}

/// Subscriber side of a session inbox
pub struct SessionInbox {
    name: String,
    tx: mpsc::Sender<InboxMessage>,
}

#[async_trait]
impl CommandSubscriber for SessionInbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, command: BusCommand) {
        let (done, processed) = oneshot::channel();
        if self.tx.send(InboxMessage { command, done }).await.is_err() {
            debug!(device = %self.name, "Session gone, command dropped");
            return;
        }
        let _ = processed.await;
    }
}

/// Observer and inbox of a running session
#[derive(Clone)]
pub struct SessionHandle {
    name: String,
    state: watch::Receiver<SessionState>,
    inbox: Arc<SessionInbox>,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `state`
    pub async fn wait_for(&self, state: SessionState) -> Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::internal(format!("session {} dropped", self.name)))
    }

    /// The subscriber to register with the command dispatcher
    pub fn subscriber(&self) -> Arc<dyn CommandSubscriber> {
        self.inbox.clone()
    }
}

enum Event {
    Poll,
    Received(Result<Vec<RawSample>>),
    Command(InboxMessage),
}

/// One device bridged to the bus
pub struct DeviceSession {
    name: String,
    registry: SignalRegistry,
    adapter: Box<dyn DeviceAdapter>,
    bus: BusHandle,
    inbox: mpsc::Receiver<InboxMessage>,
    reconnect: Option<ReconnectionConfig>,
    state: watch::Sender<SessionState>,
}

impl DeviceSession {
    pub fn new(
        name: impl Into<String>,
        registry: SignalRegistry,
        adapter: Box<dyn DeviceAdapter>,
        bus: BusHandle,
    ) -> (Self, SessionHandle) {
        let name = name.into();
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (state, state_rx) = watch::channel(SessionState::Idle);

        let handle = SessionHandle {
            name: name.clone(),
            state: state_rx,
            inbox: Arc::new(SessionInbox {
                name: name.clone(),
                tx,
            }),
        };
        let session = Self {
            name,
            registry,
            adapter,
            bus,
            inbox,
            reconnect: None,
            state,
        };
        (session, handle)
    }

    pub fn with_reconnect(mut self, reconnect: Option<ReconnectionConfig>) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    fn set_state(&self, state: SessionState) {
        debug!(device = %self.name, "Session state {:?}", state);
        self.state.send_replace(state);
    }

    /// Drive the session until cancelled or until the device is lost for good
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = self.reconnect.clone().map(Backoff::new);

        let outcome = loop {
            self.set_state(SessionState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                connected = self.adapter.connect() => connected,
            };

            let failure = match connected {
                Ok(()) => {
                    if let Some(backoff) = backoff.as_mut() {
                        backoff.reset();
                    }
                    self.set_state(SessionState::Active);
                    info!(
                        device = %self.name,
                        "✅ Session active with {} signals",
                        self.registry.len()
                    );
                    match self.run_active(&cancel).await {
                        Ok(()) => break Ok(()),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.set_state(SessionState::Degraded);
            log_structured_error!(failure, &self.name, "session");
            if let Err(e) = self.adapter.close().await {
                debug!(device = %self.name, "Closing broken link: {}", e);
            }

            let Some(backoff) = backoff.as_mut() else {
                break Err(failure);
            };
            let Some(delay) = backoff.next_delay() else {
                warn!(
                    device = %self.name,
                    "Giving up after {} reconnection attempts",
                    backoff.attempt()
                );
                break Err(failure);
            };

            warn!(
                device = %self.name,
                "Reconnecting in {:?} (attempt #{})",
                delay,
                backoff.attempt()
            );
            if !self.wait_offline(delay, &cancel).await {
                break Ok(());
            }
        };

        self.set_state(SessionState::Closed);
        if let Err(e) = self.adapter.close().await {
            warn!(device = %self.name, "Failed to close device: {}", e);
        }
        info!(device = %self.name, "Session closed");
        outcome
    }

    /// Sleep out a backoff delay; commands arriving meanwhile are dropped
    ///
    /// Returns false when cancelled.
    async fn wait_offline(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(message) = self.inbox.recv() => {
                    warn!(
                        device = %self.name,
                        address = %message.command.address,
                        "Device offline, dropping command"
                    );
                    let _ = message.done.send(());
                }
            }
        }
    }

    async fn run_active(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = self.adapter.poll_interval().map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = next_tick(&mut ticker) => Event::Poll,
                received = self.adapter.receive() => Event::Received(received),
                Some(message) = self.inbox.recv() => Event::Command(message),
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                handled = self.handle(event) => handled?,
            }
        }
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Poll => match self.adapter.poll().await {
                Ok(samples) => self.report(samples).await,
                Err(e) => self.triage(e, "poll")?,
            },
            Event::Received(Ok(samples)) => self.report(samples).await,
            Event::Received(Err(e)) => self.triage(e, "receive")?,
            Event::Command(message) => {
                let outcome = self.handle_command(&message.command).await;
                let _ = message.done.send(());
                if let Err(e) = outcome {
                    self.triage(e, "execute")?;
                }
            }
        }
        Ok(())
    }

    /// Broken links end the active phase; anything else costs one input
    fn triage(&self, error: BridgeError, operation: &str) -> Result<()> {
        if error.is_connection_error() {
            return Err(error);
        }
        log_structured_error!(error, &self.name, operation);
        Ok(())
    }

    /// Run samples through change detection and publish the accepted ones
    ///
    /// Values are committed only after the bus acknowledged them, so a failed
    /// publish is reported again with the next changed sample.
    pub async fn report(&mut self, samples: Vec<RawSample>) {
        let mut staged: Vec<Accepted> = Vec::new();

        for sample in samples {
            let signal = match self.registry.lookup(&sample.address) {
                Ok(signal) => signal,
                Err(_) => {
                    debug!(
                        device = %self.name,
                        address = %sample.address,
                        "Sample for unknown signal"
                    );
                    continue;
                }
            };
            if !signal.direction.reports() {
                continue;
            }

            // a batch may carry one address twice; compare with the staged value
            let position = staged.iter().position(|a| a.address == sample.address);
            let previous = position.map(|i| &staged[i].value).unwrap_or(&signal.value);

            match debounce::evaluate_against(signal, previous, &sample.raw) {
                Decision::Accept(accepted) => {
                    debug!(
                        device = %self.name,
                        address = %accepted.address,
                        "{:?} -> {}",
                        sample.raw,
                        accepted.formatted
                    );
                    match position {
                        Some(i) => staged[i] = accepted,
                        None => staged.push(accepted),
                    }
                }
                Decision::Reject(RejectReason::Malformed(reason)) => {
                    warn!(
                        device = %self.name,
                        address = %sample.address,
                        "Sample rejected: {}",
                        reason
                    );
                }
                Decision::Reject(reason) => {
                    debug!(
                        device = %self.name,
                        address = %sample.address,
                        "{:?} ignored: {:?}",
                        sample.raw,
                        reason
                    );
                }
            }
        }

        if staged.is_empty() {
            return;
        }

        let updates: Vec<SignalUpdate> = staged.iter().map(Accepted::to_update).collect();
        match self.bus.publish(&self.name, &updates).await {
            Ok(()) => {
                for accepted in &staged {
                    if let Ok(signal) = self.registry.lookup_mut(&accepted.address) {
                        signal.commit(accepted);
                    }
                }
            }
            Err(e) => {
                error!(device = %self.name, "Publishing {} updates failed: {}", updates.len(), e);
            }
        }
    }

    /// Forward an inbound command to the device if it concerns one of our signals
    async fn handle_command(&mut self, command: &BusCommand) -> Result<()> {
        let Ok(signal) = self.registry.lookup(&command.address) else {
            return Ok(());
        };
        if !signal.direction.accepts_commands() {
            debug!(
                device = %self.name,
                address = %command.address,
                "Signal is read-only, command ignored"
            );
            return Ok(());
        }

        match debounce::evaluate_command(signal, &command.value) {
            Decision::Accept(accepted) => {
                let origin = match &command.origin {
                    CommandOrigin::Bus => "bus",
                    CommandOrigin::Local { device } => device.as_str(),
                };
                debug!(
                    device = %self.name,
                    address = %command.address,
                    origin,
                    "Executing {:?}",
                    command.value
                );
                self.adapter.execute(signal, &command.value).await?;
                if let Ok(signal) = self.registry.lookup_mut(&accepted.address) {
                    signal.commit(&accepted);
                }
            }
            Decision::Reject(RejectReason::Malformed(reason)) => {
                warn!(
                    device = %self.name,
                    address = %command.address,
                    "Command rejected: {}",
                    reason
                );
            }
            Decision::Reject(reason) => {
                debug!(
                    device = %self.name,
                    address = %command.address,
                    "Command ignored: {:?}",
                    reason
                );
            }
        }
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdapter, MockBus};
    use crate::signal::{Hysteresis, SignalDirection, SignalValue};
    use pretty_assertions::assert_eq;

    fn registry() -> SignalRegistry {
        [
            Signal::new("1/0/1").with_policy(Hysteresis::Absolute(0.5)),
            Signal::new("1/0/2")
                .with_value(SignalValue::Unset)
                .with_translation([("ONBATT", "false"), ("ONLINE", "true")]),
            Signal::new("1/0/3").with_direction(SignalDirection::Write),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_report_publishes_and_commits() {
        let bus = MockBus::start().await;
        let (mut session, _handle) =
            DeviceSession::new("ups", registry(), Box::new(MockAdapter::new()), bus.handle());

        session
            .report(vec![
                RawSample::new("1/0/1", "231.0"),
                RawSample::new("1/0/2", "ONBATT"),
                RawSample::new("1/0/3", "5"),
                RawSample::new("9/9/9", "1"),
            ])
            .await;

        assert_eq!(
            bus.frames().await,
            vec![vec![
                SignalUpdate::new("1/0/1", "231.00"),
                SignalUpdate::new("1/0/2", "false"),
            ]]
        );
        assert_eq!(
            session.registry().lookup("1/0/1").unwrap().value,
            SignalValue::Numeric(231.0)
        );

        // replay of the same readings writes nothing
        session
            .report(vec![
                RawSample::new("1/0/1", "231.2"),
                RawSample::new("1/0/2", "ONBATT"),
            ])
            .await;
        assert_eq!(bus.frames().await.len(), 1);
    }

    #[tokio::test]
    async fn test_report_keeps_last_value_within_batch() {
        let bus = MockBus::start().await;
        let (mut session, _handle) =
            DeviceSession::new("dev", registry(), Box::new(MockAdapter::new()), bus.handle());

        session
            .report(vec![
                RawSample::new("1/0/2", "ONLINE"),
                RawSample::new("1/0/2", "ONBATT"),
                RawSample::new("1/0/2", "ONBATT"),
            ])
            .await;

        assert_eq!(
            bus.frames().await,
            vec![vec![SignalUpdate::new("1/0/2", "false")]]
        );
    }

    #[tokio::test]
    async fn test_failed_publish_does_not_commit() {
        let bus = MockBus::start().await;
        bus.reject_next().await;
        let (mut session, _handle) =
            DeviceSession::new("dev", registry(), Box::new(MockAdapter::new()), bus.handle());

        session.report(vec![RawSample::new("1/0/1", "240")]).await;
        assert_eq!(
            session.registry().lookup("1/0/1").unwrap().value,
            SignalValue::Numeric(0.0)
        );

        session.report(vec![RawSample::new("1/0/1", "240")]).await;
        assert_eq!(
            session.registry().lookup("1/0/1").unwrap().value,
            SignalValue::Numeric(240.0)
        );
        assert_eq!(bus.frames().await.len(), 2);
    }

    #[tokio::test]
    async fn test_run_polls_and_executes_commands() {
        let bus = MockBus::start().await;
        let adapter = MockAdapter::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_poll_result(vec![RawSample::new("1/0/1", "12")]);
        let executed = adapter.executed();

        let (session, handle) =
            DeviceSession::new("dev", registry(), Box::new(adapter), bus.handle());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session.run(cancel.clone()));

        handle.wait_for(SessionState::Active).await.unwrap();
        let subscriber = handle.subscriber();
        let commands = [("1/0/3", "0"), ("1/0/3", "on"), ("7/7/7", "on"), ("1/0/3", "on")];
        for (address, value) in commands {
            subscriber.deliver(BusCommand::from_bus(address, value)).await;
        }

        // a repeated value still reaches the device, unknown addresses do not
        assert_eq!(
            executed.lock().unwrap().clone(),
            vec![
                ("1/0/3".to_string(), "0".to_string()),
                ("1/0/3".to_string(), "on".to_string()),
                ("1/0/3".to_string(), "on".to_string()),
            ]
        );
        bus.wait_for_frames(1).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_repeated_command_is_executed_and_committed() {
        let bus = MockBus::start().await;
        let adapter = MockAdapter::new();
        let executed = adapter.executed();
        let (mut session, _handle) =
            DeviceSession::new("dev", registry(), Box::new(adapter), bus.handle());

        for value in ["0", "on", "on"] {
            session
                .handle_command(&BusCommand::from_bus("1/0/3", value))
                .await
                .unwrap();
        }
        session
            .handle_command(&BusCommand::from_bus("1/0/3", " "))
            .await
            .unwrap();

        assert_eq!(executed.lock().unwrap().len(), 3);
        assert_eq!(
            session.registry().lookup("1/0/3").unwrap().value,
            SignalValue::Symbolic("on".into())
        );
        assert!(bus.frames().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_without_reconnect_ends_session() {
        let bus = MockBus::start().await;
        let adapter = MockAdapter::new().failing_connects(1);
        let (session, handle) =
            DeviceSession::new("dev", registry(), Box::new(adapter), bus.handle());

        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_reconnects_after_failure() {
        let bus = MockBus::start().await;
        let adapter = MockAdapter::new().failing_connects(2);
        let connects = adapter.connect_attempts();
        let (session, handle) =
            DeviceSession::new("dev", registry(), Box::new(adapter), bus.handle());
        let session = session.with_reconnect(Some(ReconnectionConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
            ..ReconnectionConfig::default()
        }));

        let mut states = handle.watch_state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session.run(cancel.clone()));

        let mut saw_degraded = false;
        while *states.borrow_and_update() != SessionState::Active {
            saw_degraded |= *states.borrow() == SessionState::Degraded;
            states.changed().await.unwrap();
        }
        assert!(saw_degraded);
        assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
