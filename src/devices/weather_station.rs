//! HTTP receiver for weather station uploads
//!
//! Stations push readings as `GET /weatherstation/{name}?tempf=..&humidity=..`.
//! Each signal names the query parameter it reads (`sensor`) and optionally a
//! unit conversion applied before change detection.

use crate::config::{DeviceConfig, WeatherStationConfig};
use crate::error::{BridgeError, Result};
use crate::session::{DeviceAdapter, RawSample};
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stations report this when a sensor is missing
pub const BOGUS_VALUE: f64 = -9999.0;

const UPLOAD_QUEUE: usize = 16;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type Upload = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    MphToKmh,
    FahrenheitToCelsius,
    InchToMm,
    InHgToHpa,
}

impl Conversion {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mph_to_kmh" => Some(Conversion::MphToKmh),
            "F_to_C" => Some(Conversion::FahrenheitToCelsius),
            "inch_to_mm" => Some(Conversion::InchToMm),
            "inHg_to_hPa" => Some(Conversion::InHgToHpa),
            _ => None,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        match self {
            Conversion::MphToKmh => value * 1.60934,
            Conversion::FahrenheitToCelsius => (value - 32.0) / 1.8,
            Conversion::InchToMm => value * 25.4,
            Conversion::InHgToHpa => value * 33.8637526,
        }
    }
}

struct SensorBinding {
    address: String,
    sensor: String,
    conversion: Option<Conversion>,
}

struct Server {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WeatherStationAdapter {
    name: String,
    bind_addr: String,
    bindings: Vec<SensorBinding>,
    uploads: Option<mpsc::Receiver<Upload>>,
    server: Option<Server>,
}

impl WeatherStationAdapter {
    pub fn new(
        device: &DeviceConfig,
        station: &WeatherStationConfig,
        listen_host: &str,
    ) -> Result<Self> {
        let mut bindings = Vec::new();
        for object in &device.objects {
            let Some(sensor) = &object.key else {
                warn!(
                    device = %device.name,
                    address = %object.address,
                    "Object has no sensor, skipped"
                );
                continue;
            };
            let conversion = match object.conversion.as_deref() {
                None | Some("") => None,
                Some(name) => {
                    let conversion = Conversion::from_name(name);
                    if conversion.is_none() {
                        warn!(
                            device = %device.name,
                            "Unknown conversion {}, value passed through",
                            name
                        );
                    }
                    conversion
                }
            };
            bindings.push(SensorBinding {
                address: object.address.clone(),
                sensor: sensor.clone(),
                conversion,
            });
        }

        Ok(Self {
            name: device.name.clone(),
            bind_addr: format!("{}:{}", listen_host, station.listen_port),
            bindings,
            uploads: None,
            server: None,
        })
    }

    /// Address the receiver is bound to, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    /// Map one upload to samples
    pub fn samples_from(&self, upload: &Upload) -> Vec<RawSample> {
        let mut samples = Vec::new();
        for binding in &self.bindings {
            let Some(raw) = upload.get(&binding.sensor) else {
                continue;
            };

            let raw = match raw.trim().parse::<f64>() {
                Ok(value) if value == BOGUS_VALUE => {
                    debug!(device = %self.name, "bogus value for {}, ignored", binding.sensor);
                    continue;
                }
                Ok(value) => match binding.conversion {
                    Some(conversion) => {
                        let converted = (conversion.apply(value) * 100.0).round() / 100.0;
                        converted.to_string()
                    }
                    None => raw.clone(),
                },
                Err(_) => raw.clone(),
            };
            samples.push(RawSample::new(binding.address.clone(), raw));
        }
        samples
    }
}

async fn upload(
    State(uploads): State<mpsc::Sender<Upload>>,
    Path(station): Path<String>,
    Query(query): Query<Upload>,
) -> (StatusCode, &'static str) {
    debug!("upload from {}: {:?}", station, query);
    match uploads.send(query).await {
        Ok(()) => (StatusCode::OK, "success\n"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable\n"),
    }
}

#[async_trait]
impl DeviceAdapter for WeatherStationAdapter {
    async fn connect(&mut self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            BridgeError::transport(format!(
                "binding weather station receiver on {}: {e}",
                self.bind_addr
            ))
        })?;
        let addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);
        let app = Router::new()
            .route("/weatherstation/:name", get(upload))
            .with_state(tx);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let device = self.name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                warn!(device = %device, "Weather station receiver failed: {}", e);
            }
        });

        info!(device = %self.name, "🌦️ Weather station receiver listening on {}", addr);
        self.uploads = Some(rx);
        self.server = Some(Server {
            addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<RawSample>> {
        let uploads = self
            .uploads
            .as_mut()
            .ok_or_else(|| BridgeError::transport("weather station receiver not running"))?;

        match uploads.recv().await {
            Some(upload) => Ok(self.samples_from(&upload)),
            None => Err(BridgeError::transport("weather station receiver stopped")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.uploads = None;
        if let Some(server) = self.server.take() {
            server.shutdown.cancel();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, server.task).await.is_err() {
                warn!(device = %self.name, "Weather station receiver did not stop in time");
            }
            info!(device = %self.name, "quit weather station receiver");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceKind, SignalConfig};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn station() -> (DeviceConfig, WeatherStationConfig) {
        let config = WeatherStationConfig { listen_port: 0 };
        let mut temp = SignalConfig::new("5/0/1").with_key("tempf");
        temp.conversion = Some("F_to_C".into());
        let mut wind = SignalConfig::new("5/0/2").with_key("windspeedmph");
        wind.conversion = Some("mph_to_kmh".into());
        let device = DeviceConfig::new("garden", DeviceKind::WeatherStation(config.clone()))
            .with_objects(vec![temp, wind, SignalConfig::new("5/0/3").with_key("softwaretype")]);
        (device, config)
    }

    fn upload_of(pairs: &[(&str, &str)]) -> Upload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_conversions() {
        assert!((Conversion::FahrenheitToCelsius.apply(212.0) - 100.0).abs() < 1e-9);
        assert!((Conversion::MphToKmh.apply(10.0) - 16.0934).abs() < 1e-9);
        assert_eq!(Conversion::InchToMm.apply(1.0), 25.4);
        assert_eq!(Conversion::from_name("inHg_to_hPa"), Some(Conversion::InHgToHpa));
        assert_eq!(Conversion::from_name("furlongs"), None);
    }

    #[test]
    fn test_samples_from_upload() {
        let (device, config) = station();
        let adapter = WeatherStationAdapter::new(&device, &config, "127.0.0.1").unwrap();

        let samples = adapter.samples_from(&upload_of(&[
            ("tempf", "50"),
            ("windspeedmph", "-9999"),
            ("softwaretype", "EasyWeather"),
            ("ID", "ignored"),
        ]));
        assert_eq!(
            samples,
            vec![
                RawSample::new("5/0/1", "10"),
                RawSample::new("5/0/3", "EasyWeather"),
            ]
        );
    }

    #[tokio::test]
    async fn test_http_upload_becomes_samples() {
        let (device, config) = station();
        let mut adapter = WeatherStationAdapter::new(&device, &config, "127.0.0.1").unwrap();
        adapter.connect().await.unwrap();
        let addr = adapter.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let request = concat!(
                "GET /weatherstation/updateweatherstation.php",
                "?tempf=32&windspeedmph=0 HTTP/1.1\r\n",
                "Host: localhost\r\nConnection: close\r\n\r\n",
            );
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let samples = adapter.receive().await.unwrap();
        assert_eq!(
            samples,
            vec![RawSample::new("5/0/1", "0"), RawSample::new("5/0/2", "0")]
        );

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("success\n"));

        adapter.close().await.unwrap();
    }
}
