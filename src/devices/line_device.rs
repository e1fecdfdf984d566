//! Generic `key=value` line device
//!
//! Used for RS-485 gateways and microcontroller bridges. The device pushes one
//! `key=value` line per change; commands are written back the same way. Over
//! TCP the lines are read with a cancel-safe codec. A serial device file is
//! read on a dedicated thread because reads on it block.

use crate::config::{DeviceConfig, LineDeviceConfig, LineTransport};
use crate::error::{BridgeError, Result};
use crate::session::worker::{spawn_line_reader, Handoff};
use crate::session::{DeviceAdapter, RawSample};
use crate::signal::Signal;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LINE_LENGTH: usize = 1024;

enum LineLink {
    Tcp {
        lines: FramedRead<OwnedReadHalf, LinesCodec>,
        writer: OwnedWriteHalf,
    },
    Serial {
        handoffs: mpsc::Receiver<Handoff>,
        pending: Option<Handoff>,
        writer: tokio::fs::File,
    },
}

/// Bus address and value map for one device key
struct KeyBinding {
    address: String,
    valmap: HashMap<String, String>,
}

pub struct LineDeviceAdapter {
    name: String,
    transport: LineTransport,
    line_ending: String,
    keys: HashMap<String, KeyBinding>,
    link: Option<LineLink>,
}

impl LineDeviceAdapter {
    pub fn new(device: &DeviceConfig, line: &LineDeviceConfig) -> Result<Self> {
        let keys = device
            .objects
            .iter()
            .filter_map(|o| {
                let binding = KeyBinding {
                    address: o.address.clone(),
                    valmap: o.valmap.clone(),
                };
                o.key.clone().map(|key| (key, binding))
            })
            .collect();

        Ok(Self {
            name: device.name.clone(),
            transport: line.transport()?,
            line_ending: line.line_ending.clone(),
            keys,
            link: None,
        })
    }

    /// Turn one device line into a sample for the matching signal
    ///
    /// Device values listed in the object's value map are sent in their
    /// mapped form, even when the device value is numeric.
    pub fn parse_line(&self, line: &str) -> Result<Vec<RawSample>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| BridgeError::protocol(format!("couldn't parse command {line:?}")))?;

        match self.keys.get(key.trim()) {
            Some(binding) => {
                let value = value.trim();
                let value = binding.valmap.get(value).map(String::as_str).unwrap_or(value);
                Ok(vec![RawSample::new(binding.address.clone(), value)])
            }
            None => {
                warn!(device = %self.name, "command key {} not configured", key);
                Ok(Vec::new())
            }
        }
    }

    /// Render a bus value as a device line
    pub fn encode_command(&self, signal: &Signal, value: &str) -> Result<String> {
        let key = signal.device_key.as_deref().ok_or_else(|| {
            BridgeError::config(format!("signal {} has no device key", signal.address))
        })?;
        Ok(format!("{}={}{}", key, signal.untranslate(value), self.line_ending))
    }

    async fn open_tcp(&self, host: &str, port: u16) -> Result<LineLink> {
        let endpoint = format!("{host}:{port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| BridgeError::transport(format!("connecting to {endpoint} timed out")))??;
        let (reader, writer) = stream.into_split();

        Ok(LineLink::Tcp {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer,
        })
    }

    async fn open_serial(&self, path: &std::path::Path) -> Result<LineLink> {
        let reader = std::io::BufReader::new(std::fs::File::open(path)?);
        let handoffs = spawn_line_reader(&self.name, reader)?;
        let writer = tokio::fs::OpenOptions::new().write(true).open(path).await?;

        Ok(LineLink::Serial {
            handoffs,
            pending: None,
            writer,
        })
    }
}

#[async_trait]
impl DeviceAdapter for LineDeviceAdapter {
    async fn connect(&mut self) -> Result<()> {
        let link = match &self.transport {
            LineTransport::Tcp { host, port } => self.open_tcp(host, *port).await?,
            LineTransport::Serial { path } => self.open_serial(path).await?,
        };
        self.link = Some(link);
        debug!(device = %self.name, "Line device connected");
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<RawSample>> {
        let line = match self.link.as_mut() {
            Some(LineLink::Tcp { lines, .. }) => match lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(BridgeError::protocol("device line too long"));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                None => return Err(BridgeError::transport("device closed the connection")),
            },
            Some(LineLink::Serial {
                handoffs, pending, ..
            }) => {
                // the previous line has been processed by now
                if let Some(done) = pending.take() {
                    done.complete();
                }
                match handoffs.recv().await {
                    Some(handoff) => {
                        let line = handoff.line.clone();
                        *pending = Some(handoff);
                        line
                    }
                    None => return Err(BridgeError::transport("serial reader stopped")),
                }
            }
            None => return Err(BridgeError::transport("line device not connected")),
        };

        debug!(device = %self.name, "received: {:?}", line);
        self.parse_line(&line)
    }

    async fn execute(&mut self, signal: &Signal, value: &str) -> Result<()> {
        let command = self.encode_command(signal, value)?;
        debug!(device = %self.name, "writing command {:?}", command.trim_end());

        match self.link.as_mut() {
            Some(LineLink::Tcp { writer, .. }) => {
                writer.write_all(command.as_bytes()).await?;
                writer.flush().await?;
            }
            Some(LineLink::Serial { writer, .. }) => {
                writer.write_all(command.as_bytes()).await?;
                writer.flush().await?;
            }
            None => return Err(BridgeError::transport("line device not connected")),
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.link.take() {
            Some(LineLink::Tcp { mut writer, .. }) => {
                let _ = writer.shutdown().await;
            }
            Some(LineLink::Serial { pending, .. }) => {
                // dropping the receiver stops the reader after its current line
                drop(pending);
            }
            None => {}
        }
        Ok(())
    }
}
