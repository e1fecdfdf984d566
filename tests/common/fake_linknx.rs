//! Scriptable linknx stand-in
//!
//! Records every write frame and answers according to the current
//! [`AckMode`]. Also provides a fake `key=value` line device and a helper to
//! deliver inbound commands the way linknx does.

use knx_signal_bridge::config::BusConfig;
use knx_signal_bridge::signal::SignalUpdate;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const SUCCESS_ACK: &[u8] = b"<write status=\"success\"/>\n";
pub const ERROR_ACK: &[u8] = b"<write status=\"error\">object not found</write>\n";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AckMode {
    Success,
    Error,
    /// Swallow the frame and never answer
    Silent,
    /// Answer with success after a pause
    Delay(Duration),
}

#[derive(Clone)]
struct Shared {
    mode: Arc<Mutex<AckMode>>,
    frames: Arc<Mutex<Vec<Vec<SignalUpdate>>>>,
    connections: Arc<AtomicUsize>,
    pipelined: Arc<AtomicUsize>,
}

pub struct FakeLinknx {
    addr: SocketAddr,
    shared: Shared,
}

impl FakeLinknx {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake linknx");
        let addr = listener.local_addr().expect("fake linknx address");
        let shared = Shared {
            mode: Arc::new(Mutex::new(AckMode::Success)),
            frames: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            pipelined: Arc::new(AtomicUsize::new(0)),
        };

        let server = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, server.clone()));
            }
        });

        Self { addr, shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn bus_config(&self, ack_timeout: Duration) -> BusConfig {
        BusConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            listen_port: 0,
            ack_timeout,
            local_echo: false,
        }
    }

    pub fn set_mode(&self, mode: AckMode) {
        *self.shared.mode.lock().unwrap() = mode;
    }

    pub fn frames(&self) -> Vec<Vec<SignalUpdate>> {
        self.shared.frames.lock().unwrap().clone()
    }

    /// Every update written so far, in order
    pub fn updates(&self) -> Vec<SignalUpdate> {
        self.frames().into_iter().flatten().collect()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Frames that arrived while an earlier one was still unanswered
    pub fn pipelined(&self) -> usize {
        self.shared.pipelined.load(Ordering::SeqCst)
    }

    pub async fn wait_for_frames(&self, count: usize) -> Vec<Vec<SignalUpdate>> {
        super::eventually(|| async { self.frames().len() >= count }).await;
        self.frames()
    }
}

async fn serve(mut stream: TcpStream, shared: Shared) {
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
            shared.frames.lock().unwrap().push(updates);

            let mode = *shared.mode.lock().unwrap();
            let ack = match mode {
                AckMode::Success => SUCCESS_ACK,
                AckMode::Error => ERROR_ACK,
                AckMode::Silent => continue,
                AckMode::Delay(pause) => {
                    tokio::time::sleep(pause).await;
                    SUCCESS_ACK
                }
            };

            // anything already queued behind this frame was sent without waiting for us
            let mut early = [0u8; 1024];
            let pending = match stream.try_read(&mut early) {
                Ok(n) if n > 0 => {
                    buffer.extend_from_slice(&early[..n]);
                    true
                }
                _ => false,
            };
            if pending || !buffer.is_empty() {
                shared.pipelined.fetch_add(1, Ordering::SeqCst);
            }

            if stream.write_all(ack).await.is_err() {
                return;
            }
        }
    }
}

/// Deliver one inbound command line the way linknx does
pub async fn send_inbound(addr: SocketAddr, line: &str) {
    let mut stream = TcpStream::connect(addr).await.expect("connect to inbound listener");
    stream
        .write_all(format!("{line}\n").as_bytes())
        .await
        .expect("write inbound command");
    let _ = stream.shutdown().await;
}

/// `key=value` device reached over TCP
pub struct FakeLineDevice {
    port: u16,
    outgoing: mpsc::Sender<String>,
    received: mpsc::Receiver<String>,
}

impl FakeLineDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake device");
        let port = listener.local_addr().expect("fake device address").port();
        let (outgoing, mut to_send) = mpsc::channel::<String>(16);
        let (received_tx, received) = mpsc::channel(16);

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (reader, mut writer) = stream.into_split();

            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if received_tx.send(line).await.is_err() {
                        return;
                    }
                }
            });

            while let Some(line) = to_send.recv().await {
                if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        Self {
            port,
            outgoing,
            received,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send a line to the bridge
    pub async fn push(&self, line: &str) {
        self.outgoing.send(line.to_string()).await.expect("fake device running");
    }

    /// Next command line written by the bridge
    pub async fn next_command(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("no command from bridge")
            .expect("bridge closed the device link")
    }
}
