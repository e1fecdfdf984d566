//! apcupsd network information server client
//!
//! Every poll sends a `status` request and reads the reply records until the
//! empty terminating record. Each signal carries a pattern with one capture
//! group that extracts its value from the status text.

use crate::config::{ApcUpsConfig, DeviceConfig};
use crate::error::{BridgeError, Result};
use crate::session::{DeviceAdapter, RawSample};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Bound on connect and on one request/response exchange
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Guard against a peer that never sends the terminating record
const MAX_STATUS_RECORDS: usize = 512;

struct Extractor {
    address: String,
    pattern: Regex,
}

pub struct ApcUpsAdapter {
    name: String,
    endpoint: String,
    poll_interval: Duration,
    extractors: Vec<Extractor>,
    stream: Option<TcpStream>,
}

impl ApcUpsAdapter {
    pub fn new(device: &DeviceConfig, ups: &ApcUpsConfig) -> Result<Self> {
        let mut extractors = Vec::new();
        for object in &device.objects {
            let Some(expression) = &object.key else {
                warn!(
                    device = %device.name,
                    address = %object.address,
                    "Object has no ups_expr, skipped"
                );
                continue;
            };
            let pattern = Regex::new(expression)?;
            if pattern.captures_len() < 2 {
                return Err(BridgeError::config(format!(
                    "ups_expr for {} needs a capture group",
                    object.address
                )));
            }
            extractors.push(Extractor {
                address: object.address.clone(),
                pattern,
            });
        }

        Ok(Self {
            name: device.name.clone(),
            endpoint: format!("{}:{}", ups.host, ups.port),
            poll_interval: device.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            extractors,
            stream: None,
        })
    }

    /// Pull every configured value out of a status report
    pub fn extract(&self, status: &str) -> Vec<RawSample> {
        self.extractors
            .iter()
            .filter_map(|extractor| {
                let value = extractor
                    .pattern
                    .captures(status)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().trim().to_string());
                if value.is_none() {
                    debug!(device = %self.name, address = %extractor.address, "No match in status");
                }
                value.map(|raw| RawSample::new(extractor.address.clone(), raw))
            })
            .collect()
    }
}

/// Encode a request as a length prefixed record
pub fn encode_request(command: &str) -> Vec<u8> {
    let mut request = Vec::with_capacity(command.len() + 2);
    request.extend_from_slice(&(command.len() as u16).to_be_bytes());
    request.extend_from_slice(command.as_bytes());
    request
}

/// Read length prefixed records up to the empty record and join them
pub async fn read_status<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut status = String::new();
    for _ in 0..MAX_STATUS_RECORDS {
        let length = reader.read_u16().await? as usize;
        if length == 0 {
            return Ok(status);
        }
        let mut record = vec![0u8; length];
        reader.read_exact(&mut record).await?;
        status.push_str(&String::from_utf8_lossy(&record));
    }
    Err(BridgeError::protocol("status reply without terminating record"))
}

async fn request_status(stream: &mut TcpStream) -> Result<String> {
    stream.write_all(&encode_request("status")).await?;
    read_status(stream).await
}

#[async_trait]
impl DeviceAdapter for ApcUpsAdapter {
    async fn connect(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(EXCHANGE_TIMEOUT, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| {
                BridgeError::transport(format!("connecting to {} timed out", self.endpoint))
            })??;
        debug!(device = %self.name, "Connected to apcupsd at {}", self.endpoint);
        self.stream = Some(stream);
        Ok(())
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    async fn poll(&mut self) -> Result<Vec<RawSample>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BridgeError::transport("apcupsd not connected"))?;

        debug!(device = %self.name, "polling apcupsd");
        let status = match tokio::time::timeout(EXCHANGE_TIMEOUT, request_status(stream)).await {
            Ok(Ok(status)) => status,
            // the stream position is unknown after a failed exchange
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e);
            }
            Err(_) => {
                self.stream = None;
                return Err(BridgeError::transport("apcupsd did not answer"));
            }
        };

        Ok(self.extract(&status))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}
