//! Outbound link to the linknx server
//!
//! One TCP connection carries every write. The connection sits behind a tokio
//! mutex so exactly one frame and its acknowledgement are in flight at any
//! time; dropping a publish future releases the lock.

use super::protocol::{ack_is_error, encode_write};
use crate::config::BusConfig;
use crate::error::{BridgeError, BusError, Result};
use crate::signal::SignalUpdate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Outbound connection statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayStats {
    /// Frames written to the bus
    pub frames_sent: u64,

    /// Acknowledgements without the error marker
    pub acks_received: u64,

    /// Acknowledgements with the error marker
    pub rejected: u64,

    /// Transactions that ran out of time
    pub timeouts: u64,

    /// Connections opened after the initial one
    pub reconnects: u32,

    /// Last successful acknowledgement
    pub last_ack: Option<chrono::DateTime<chrono::Utc>>,
}

struct BusConnection {
    stream: BufReader<TcpStream>,
    /// False while a transaction is outstanding or after it was abandoned
    clean: bool,
}

impl BusConnection {
    async fn transact(
        &mut self,
        frame: &[u8],
        ack_timeout: Duration,
    ) -> std::result::Result<String, BusError> {
        self.stream
            .write_all(frame)
            .await
            .map_err(|e| BusError::ConnectionLost(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| BusError::ConnectionLost(e.to_string()))?;

        let mut ack = String::new();
        let read = tokio::time::timeout(ack_timeout, self.stream.read_line(&mut ack))
            .await
            .map_err(|_| BusError::Timeout(ack_timeout))?
            .map_err(|e| BusError::ConnectionLost(e.to_string()))?;

        if read == 0 {
            return Err(BusError::ConnectionLost("connection closed by bus".to_string()));
        }
        Ok(ack.trim_end().to_string())
    }
}

/// Serialized writer for the bus
pub struct BusGateway {
    endpoint: String,
    ack_timeout: Duration,
    connection: Mutex<Option<BusConnection>>,
    stats: RwLock<GatewayStats>,
}

impl BusGateway {
    /// Open the initial outbound connection
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let gateway = Self {
            endpoint: config.endpoint(),
            ack_timeout: config.ack_timeout,
            connection: Mutex::new(None),
            stats: RwLock::new(GatewayStats::default()),
        };

        let connection = gateway.open().await?;
        *gateway.connection.lock().await = Some(connection);
        info!("✅ Connected to linknx at {}", gateway.endpoint);
        Ok(gateway)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    async fn open(&self) -> Result<BusConnection> {
        let stream = tokio::time::timeout(self.ack_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| {
                BridgeError::transport(format!("connecting to {} timed out", self.endpoint))
            })?
            .map_err(|e| BridgeError::transport(format!("connecting to {}: {e}", self.endpoint)))?;
        stream.set_nodelay(true)?;

        Ok(BusConnection {
            stream: BufReader::new(stream),
            clean: true,
        })
    }

    /// Write a batch of updates and wait for its acknowledgement
    ///
    /// Failures are returned to the caller and never retried here. A connection
    /// whose transaction did not complete is replaced on the next call.
    pub async fn publish(&self, updates: &[SignalUpdate]) -> std::result::Result<(), BusError> {
        if updates.is_empty() {
            return Ok(());
        }
        let frame = encode_write(updates);

        let mut guard = self.connection.lock().await;

        if guard.as_ref().is_some_and(|c| !c.clean) {
            debug!("Dropping unclean bus connection to {}", self.endpoint);
            *guard = None;
        }

        if guard.is_none() {
            let fresh = self
                .open()
                .await
                .map_err(|e| BusError::ConnectionLost(e.to_string()))?;
            self.stats.write().await.reconnects += 1;
            info!("Reconnected to linknx at {}", self.endpoint);
            *guard = Some(fresh);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(BusError::ConnectionLost("no bus connection".to_string()));
        };

        debug!("sending to knx: {:?}", String::from_utf8_lossy(&frame));
        connection.clean = false;
        self.stats.write().await.frames_sent += 1;

        match connection.transact(&frame, self.ack_timeout).await {
            Ok(ack) => {
                connection.clean = true;
                debug!("received {:?}", ack);
                let mut stats = self.stats.write().await;
                if ack_is_error(&ack) {
                    stats.rejected += 1;
                    Err(BusError::Rejected(ack))
                } else {
                    stats.acks_received += 1;
                    stats.last_ack = Some(chrono::Utc::now());
                    Ok(())
                }
            }
            Err(e) => {
                *guard = None;
                match &e {
                    BusError::Timeout(_) => {
                        self.stats.write().await.timeouts += 1;
                        warn!("No acknowledgement from linknx within {:?}", self.ack_timeout);
                    }
                    _ => error!("Bus transaction failed: {}", e),
                }
                Err(e)
            }
        }
    }

    /// Close the outbound connection
    pub async fn close(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            let _ = connection.stream.shutdown().await;
            debug!("Closed bus connection to {}", self.endpoint);
        }
    }

    pub async fn stats(&self) -> GatewayStats {
        self.stats.read().await.clone()
    }
}

impl std::fmt::Debug for BusGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusGateway")
            .field("endpoint", &self.endpoint)
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}
