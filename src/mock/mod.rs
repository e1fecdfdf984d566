//! Mock implementations for testing
//!
//! [`MockBus`] is a minimal linknx stand-in on a loopback port that records
//! every write frame; [`MockAdapter`] is a scripted device.

use crate::bus::BusGateway;
use crate::config::BusConfig;
use crate::error::{BridgeError, Result};
use crate::session::{BusHandle, DeviceAdapter, RawSample};
use crate::signal::{Signal, SignalUpdate};
use async_trait::async_trait;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

/// Loopback linknx server plus a gateway connected to it
pub struct MockBus {
    frames: Arc<Mutex<Vec<Vec<SignalUpdate>>>>,
    reject_next: Arc<AtomicBool>,
    gateway: Arc<BusGateway>,
}

impl MockBus {
    /// Start the server and connect a gateway with a 1 s ack timeout
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock bus");
        let addr = listener.local_addr().expect("mock bus address");

        let frames = Arc::new(Mutex::new(Vec::new()));
        let reject_next = Arc::new(AtomicBool::new(false));

        let server_frames = frames.clone();
        let server_reject = reject_next.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, server_frames.clone(), server_reject.clone()));
            }
        });

        let config = BusConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ack_timeout: Duration::from_secs(1),
            ..BusConfig::default()
        };
        let gateway = BusGateway::connect(&config)
            .await
            .expect("connect to mock bus");

        Self {
            frames,
            reject_next,
            gateway: Arc::new(gateway),
        }
    }

    pub fn gateway(&self) -> Arc<BusGateway> {
        self.gateway.clone()
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle::new(self.gateway.clone())
    }

    /// Answer the next frame with an error acknowledgement
    pub async fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    pub async fn frames(&self) -> Vec<Vec<SignalUpdate>> {
        self.frames.lock().await.clone()
    }

    /// Wait until at least `count` frames arrived
    pub async fn wait_for_frames(&self, count: usize) -> Vec<Vec<SignalUpdate>> {
        let wait = async {
            loop {
                let frames = self.frames().await;
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("frames did not arrive")
    }
}

async fn serve(
    mut stream: TcpStream,
    frames: Arc<Mutex<Vec<Vec<SignalUpdate>>>>,
    reject_next: Arc<AtomicBool>,
) {
    let object = Regex::new(r#"<object id="([^"]*)" value="([^"]*)"/>"#).expect("valid regex");
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..read]);

        while let Some(end) = buffer.iter().position(|b| *b == 0x04) {
            let frame: Vec<u8> = buffer.drain(..=end).collect();
            let text = String::from_utf8_lossy(&frame);
            let updates = object
                .captures_iter(&text)
                .map(|c| SignalUpdate::new(&c[1], &c[2]))
                .collect();
            frames.lock().await.push(updates);

            let ack: &[u8] = if reject_next.swap(false, Ordering::SeqCst) {
                b"<write status=\"error\">rejected</write>\n"
            } else {
                b"<write status=\"success\"/>\n"
            };
            if stream.write_all(ack).await.is_err() {
                return;
            }
        }
    }
}

/// Scripted device adapter
pub struct MockAdapter {
    poll_interval: Option<Duration>,
    poll_result: Vec<RawSample>,
    pushes: Option<mpsc::Receiver<Vec<RawSample>>>,
    failing_connects: u32,
    connect_attempts: Arc<AtomicU32>,
    executed: Arc<std::sync::Mutex<Vec<(String, String)>>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            poll_interval: None,
            poll_result: Vec::new(),
            pushes: None,
            failing_connects: 0,
            connect_attempts: Arc::new(AtomicU32::new(0)),
            executed: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_poll_result(mut self, samples: Vec<RawSample>) -> Self {
        self.poll_result = samples;
        self
    }

    /// Unsolicited samples; dropping the sender looks like a lost link
    pub fn with_pushes(mut self) -> (Self, mpsc::Sender<Vec<RawSample>>) {
        let (tx, rx) = mpsc::channel(16);
        self.pushes = Some(rx);
        (self, tx)
    }

    /// Fail the first `count` connection attempts
    pub fn failing_connects(mut self, count: u32) -> Self {
        self.failing_connects = count;
        self
    }

    pub fn connect_attempts(&self) -> Arc<AtomicU32> {
        self.connect_attempts.clone()
    }

    /// `(address, value)` of every executed command
    pub fn executed(&self) -> Arc<std::sync::Mutex<Vec<(String, String)>>> {
        self.executed.clone()
    }
}

#[async_trait]
impl DeviceAdapter for MockAdapter {
    async fn connect(&mut self) -> Result<()> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failing_connects {
            return Err(BridgeError::transport("mock device unreachable"));
        }
        Ok(())
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    async fn poll(&mut self) -> Result<Vec<RawSample>> {
        Ok(self.poll_result.clone())
    }

    async fn receive(&mut self) -> Result<Vec<RawSample>> {
        match self.pushes.as_mut() {
            Some(pushes) => pushes
                .recv()
                .await
                .ok_or_else(|| BridgeError::transport("mock device hung up")),
            None => futures::future::pending().await,
        }
    }

    async fn execute(&mut self, signal: &Signal, value: &str) -> Result<()> {
        self.executed
            .lock()
            .map_err(|_| BridgeError::internal("poisoned"))?
            .push((signal.address.clone(), value.to_string()));
        Ok(())
    }
}
