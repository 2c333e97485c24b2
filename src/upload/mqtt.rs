//! MQTT upload client.
//!
//! Publishes each artifact's bytes with QoS 1 to
//! `devices/{device_id}/uploads/{file_name}` and waits for the broker's
//! PUBACK for that packet id, so every file gets its own result. Broker
//! errors are logged and the event loop keeps polling, which reconnects.
//!
//! The connection is described by a `;`-separated connection string:
//! `HostName=hub.local;Port=8883;DeviceId=cam-1;Username=cam-1;Password=...;UseTls=true`.
//! `SharedAccessKey` is accepted as an alias for `Password`.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, ConnectionError, Event, Incoming, MqttOptions};
use rumqttc::{Outgoing, Transport};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::UploadClient;

const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_PLAIN_PORT: u16 = 1883;
const MAX_ARTIFACT_BYTES: u32 = 16 * 1024 * 1024;
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, PartialEq, Eq)]
pub struct UploadConnection {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl UploadConnection {
    /// Parse a connection string. `device_id` fills in a missing `DeviceId`.
    pub fn parse(connection_string: &str, device_id: &str) -> Result<Self> {
        let mut host = None;
        let mut port = None;
        let mut conn_device = None;
        let mut username = None;
        let mut password = None;
        let mut use_tls = true;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("connection string segment '{}' is not key=value", part))?;
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "hostname" => host = Some(value),
                "port" => {
                    port = Some(
                        value
                            .parse::<u16>()
                            .with_context(|| format!("invalid port '{}'", value))?,
                    )
                }
                "deviceid" => conn_device = Some(value),
                "username" => username = Some(value),
                "password" | "sharedaccesskey" => password = Some(value),
                "usetls" => {
                    use_tls = value
                        .parse::<bool>()
                        .with_context(|| format!("invalid UseTls '{}'", value))?
                }
                other => log::debug!("ignoring connection string key '{}'", other),
            }
        }

        let host = host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow!("connection string is missing HostName"))?;
        let device_id = conn_device
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| device_id.to_string());
        if device_id.trim().is_empty() {
            return Err(anyhow!("upload connection needs a device id"));
        }
        let port = port.unwrap_or(if use_tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PLAIN_PORT
        });

        Ok(Self {
            host,
            port,
            device_id,
            username,
            password,
            use_tls,
        })
    }

    pub fn topic_for(&self, file_name: &str) -> String {
        format!("devices/{}/uploads/{}", self.device_id, file_name)
    }
}

impl std::fmt::Debug for UploadConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("device_id", &self.device_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

enum AckEvent {
    /// A publish left the client with this packet id.
    Published(u16),
    Acked(u16),
    Failed(String),
}

/// Forward publish/ack events from the MQTT event loop until the client
/// disconnects. Connection errors are reported and polling continues, which
/// makes rumqttc reconnect and resend unacknowledged publishes.
fn pump_events<I>(events: I, tx: &Sender<AckEvent>, stopping: &AtomicBool, backoff: Duration)
where
    I: IntoIterator<Item = Result<Event, ConnectionError>>,
{
    for event in events {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("upload client connected to broker");
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = tx.send(AckEvent::Published(pkid));
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                let _ = tx.send(AckEvent::Acked(ack.pkid));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if stopping.load(Ordering::Acquire) => break,
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                log::warn!("MQTT connection error, reconnecting in {:?}: {}", backoff, e);
                let _ = tx.send(AckEvent::Failed(e.to_string()));
                std::thread::sleep(backoff);
            }
        }
    }
}

/// Pairs each publish with its own PUBACK.
///
/// Publishes that timed out are remembered so their late (or resent)
/// events are never credited to a later file. rumqttc hands out packet ids
/// in submission order, so a timed-out publish that never reached the wire
/// claims the next unseen `Published` id.
#[derive(Debug, Default)]
struct AckTracker {
    abandoned: HashSet<u16>,
    unsent: usize,
}

impl AckTracker {
    fn await_ack(&mut self, acks: &Receiver<AckEvent>, timeout: Duration) -> Result<u16> {
        let deadline = Instant::now() + timeout;
        let mut pkid = None;
        let mut last_error = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match acks.recv_timeout(remaining) {
                Ok(AckEvent::Published(p)) if pkid.is_none() => {
                    if self.abandoned.contains(&p) {
                        continue;
                    }
                    if self.unsent > 0 {
                        self.unsent -= 1;
                        self.abandoned.insert(p);
                        continue;
                    }
                    pkid = Some(p);
                }
                Ok(AckEvent::Published(_)) => {}
                Ok(AckEvent::Acked(p)) if Some(p) == pkid => return Ok(p),
                Ok(AckEvent::Acked(p)) => {
                    self.abandoned.remove(&p);
                }
                Ok(AckEvent::Failed(e)) => last_error = Some(e),
                Err(RecvTimeoutError::Timeout) => {
                    match pkid {
                        Some(p) => {
                            self.abandoned.insert(p);
                        }
                        None => self.unsent += 1,
                    }
                    return Err(match last_error {
                        Some(e) => anyhow!("no acknowledgement within {:?}: {}", timeout, e),
                        None => anyhow!("no acknowledgement within {:?}", timeout),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("broker connection closed"))
                }
            }
        }
    }
}

/// Live broker connection plus the thread polling its event loop.
struct BrokerSession {
    client: Client,
    acks: Receiver<AckEvent>,
    tracker: AckTracker,
    stopping: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BrokerSession {
    fn open(connection: &UploadConnection) -> Self {
        let mut options =
            MqttOptions::new(&connection.device_id, &connection.host, connection.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        options.set_max_packet_size(Some(MAX_ARTIFACT_BYTES));
        if let Some(user) = &connection.username {
            options.set_credentials(user, connection.password.clone().unwrap_or_default());
        }
        options.set_transport(if connection.use_tls {
            Transport::tls_with_default_config()
        } else {
            Transport::tcp()
        });

        let (client, mut mqtt_connection) = Client::new(options, 10);
        let (tx, acks) = mpsc::channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = Arc::clone(&stopping);
        let handle = std::thread::spawn(move || {
            pump_events(mqtt_connection.iter(), &tx, &thread_stopping, RECONNECT_BACKOFF)
        });

        log::info!(
            "upload client for {} connecting to {}:{} (TLS: {}, auth: {})",
            connection.device_id,
            connection.host,
            connection.port,
            connection.use_tls,
            connection.username.is_some()
        );
        Self {
            client,
            acks,
            tracker: AckTracker::default(),
            stopping,
            handle: Some(handle),
        }
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::Release);
        let result = self.client.disconnect();
        let _ = handle.join();
        result.context("disconnect from broker")
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Upload client that opens its broker session on the first upload, so a
/// long capture window never holds an idle connection.
pub struct MqttUploadClient {
    connection: UploadConnection,
    session: Option<BrokerSession>,
    ack_timeout: Duration,
}

impl MqttUploadClient {
    pub fn new(connection: UploadConnection) -> Self {
        Self {
            connection,
            session: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn disconnect(mut self) -> Result<()> {
        match self.session.take() {
            Some(mut session) => session.close(),
            None => Ok(()),
        }
    }
}

impl UploadClient for MqttUploadClient {
    fn upload_file(&mut self, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("artifact path {} has no file name", path.display()))?;
        let payload =
            std::fs::read(path).with_context(|| format!("read artifact {}", path.display()))?;

        let topic = self.connection.topic_for(file_name);
        let connection = &self.connection;
        let session = self
            .session
            .get_or_insert_with(|| BrokerSession::open(connection));
        session
            .client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish to {}", topic))?;

        let pkid = session
            .tracker
            .await_ack(&session.acks, self.ack_timeout)
            .with_context(|| format!("publish to {}", topic))?;
        log::debug!("broker acknowledged {} (packet {})", topic, pkid);
        Ok(())
    }
}
