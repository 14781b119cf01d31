use crate::configuration::Mqtt;
use async_trait::async_trait;
use log::{debug, error, info, trace};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    MqttOptions, Outgoing, QoS,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tokio::time::sleep;

/// Delay before polling the event loop again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Error returned for a single publish
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to the MQTT broker")]
    Disconnected,

    #[error("connection lost before the broker acknowledged the message")]
    ConnectionLost,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Error returned when the initial connection to the broker fails
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot connect to the MQTT broker: {0}")]
    Connection(#[from] ConnectionError),

    #[error("the MQTT broker refused the connection: {0:?}")]
    Refused(ConnectReturnCode),
}

/// Publishes messages on the bus
///
/// The call returns once the message is acknowledged, or failed. For QoS 0
/// there is no acknowledgement and the call returns once the client accepted it.
/// Implementations are shared between all the requests.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), PublishError>;
}

/// What the event loop does after a notification
#[derive(Debug, PartialEq)]
pub enum Flow {
    /// Poll again right away
    Continue,

    /// Wait before polling again, rumqttc reconnects on that poll
    Backoff,

    /// The client is gone
    Stop,
}

type Ack = oneshot::Sender<()>;

/// Publishes waiting for their broker acknowledgement
#[derive(Debug, Default)]
struct InFlight {
    /// Handed to the client, packet id not assigned yet. In request order.
    queued: VecDeque<(String, Ack)>,

    /// Written to the network, by packet id
    sent: HashMap<u16, (String, Ack)>,
}

/// Connection status and in-flight publishes, shared by the publisher and the event loop
#[derive(Debug, Default)]
pub struct Connection {
    connected: AtomicBool,
    in_flight: Mutex<InFlight>,
}

impl Connection {
    pub fn new(connected: bool) -> Connection {
        Connection {
            connected: AtomicBool::new(connected),
            ..Default::default()
        }
    }

    /// Returns `true` while the broker connection is up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of publishes waiting for an acknowledgement
    pub fn pending(&self) -> usize {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.queued.len() + in_flight.sent.len()
    }

    /// Registers a publish about to be handed to the client. Resolves on its acknowledgement.
    fn expect_ack(&self, topic: &str) -> oneshot::Receiver<()> {
        let (ack, received) = oneshot::channel();
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued
            .push_back((topic.to_string(), ack));
        received
    }

    /// Forgets the last registered publish, the client did not take it
    fn cancel_last(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued
            .pop_back();
    }

    /// Drops every in-flight publish, their callers get [`PublishError::ConnectionLost`]
    fn fail_in_flight(&self) {
        let mut guard = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let in_flight = &mut *guard;
        let sent = in_flight.sent.drain().map(|(_, pending)| pending);
        for (topic, _) in in_flight.queued.drain(..).chain(sent) {
            debug!("Publish to {topic} not acknowledged");
        }
    }

    fn sent(&self, pkid: u16) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match in_flight.queued.pop_front() {
            Some(pending) => {
                in_flight.sent.insert(pkid, pending);
            }
            None => debug!("Publish pkid={pkid} was not requested by this client"),
        }
    }

    fn acknowledged(&self, pkid: u16) {
        let pending = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .remove(&pkid);
        if let Some((topic, ack)) = pending {
            trace!("Publish to {topic} acknowledged");
            let _ = ack.send(());
        }
    }

    /// Updates the state from one event loop notification
    pub fn handle(&self, notification: &Result<Event, ConnectionError>) -> Flow {
        match notification {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                let success = ack.code == ConnectReturnCode::Success;
                if success {
                    info!("Reconnected to MQTT broker");
                } else {
                    error!("MQTT broker refused the connection: {:?}", ack.code);
                }
                self.connected.store(success, Ordering::Release);
                Flow::Continue
            }
            // QoS 0 publishes have no packet id and no acknowledgement
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) if *pkid != 0 => {
                self.sent(*pkid);
                Flow::Continue
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                self.acknowledged(ack.pkid);
                Flow::Continue
            }
            Ok(Event::Incoming(Incoming::PubComp(comp))) => {
                self.acknowledged(comp.pkid);
                Flow::Continue
            }
            Ok(notification) => {
                trace!("MQTT notification received: {notification:?}");
                Flow::Continue
            }
            Err(ConnectionError::RequestsDone) => {
                debug!("MQTT client dropped, stopping the event loop");
                self.connected.store(false, Ordering::Release);
                self.fail_in_flight();
                Flow::Stop
            }
            Err(e) => {
                if self.connected.swap(false, Ordering::AcqRel) {
                    error!("Connection lost: {e}");
                } else {
                    debug!("Still disconnected: {e}");
                }
                self.fail_in_flight();
                Flow::Backoff
            }
        }
    }
}

/// Publisher backed by a `rumqttc` client
///
/// QoS 1 and 2 publishes wait for the broker acknowledgement. The client
/// reconnects on its own; publishing while it is disconnected fails without retry.
pub struct MqttPublisher {
    client: AsyncClient,
    connection: Arc<Connection>,
    /// Keeps the acknowledgement queue in the order the client receives the requests
    send_lock: tokio::sync::Mutex<()>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    /// MQTT options built from the configuration
    pub fn options(config: &Mqtt) -> MqttOptions {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));
        if !config.user.is_empty() && !config.password.is_empty() {
            options.set_credentials(&config.user, &config.password);
        }
        options
    }

    fn new(
        client: AsyncClient,
        connection: Arc<Connection>,
        event_loop: Option<JoinHandle<()>>,
    ) -> MqttPublisher {
        MqttPublisher {
            client,
            connection,
            send_lock: tokio::sync::Mutex::new(()),
            event_loop,
        }
    }

    /// Connects to the broker and waits for it to acknowledge the connection
    pub async fn connect(config: &Mqtt) -> Result<MqttPublisher, ConnectError> {
        info!("Connecting to MQTT broker {}:{}", config.host, config.port);

        let (client, mut event_loop) = AsyncClient::new(Self::options(config), 64);

        loop {
            match event_loop.poll().await? {
                Event::Incoming(Incoming::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ConnectError::Refused(ack.code));
                    }
                    break;
                }
                notification => trace!("MQTT notification received: {notification:?}"),
            }
        }
        info!("Connected to MQTT at {}:{}", config.host, config.port);

        let connection = Arc::new(Connection::new(true));
        let event_loop = task::spawn(Self::drive(event_loop, connection.clone()));

        Ok(Self::new(client, connection, Some(event_loop)))
    }

    /// Keeps polling the event loop. rumqttc reconnects on the next poll after an error.
    async fn drive(mut event_loop: EventLoop, connection: Arc<Connection>) {
        loop {
            let notification = event_loop.poll().await;
            match connection.handle(&notification) {
                Flow::Continue => {}
                Flow::Backoff => {
                    // Those were reported as failed, don't send them after the reconnection
                    event_loop.pending.clear();
                    sleep(RECONNECT_DELAY).await;
                }
                Flow::Stop => break,
            }
        }
    }

    /// Returns `true` while the broker connection is up
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Disconnects from the broker and stops the event loop
    pub async fn disconnect(self) -> Result<(), PublishError> {
        let result = self.client.disconnect().await;
        // Give the event loop a moment to flush the disconnect packet
        sleep(Duration::from_millis(200)).await;
        if let Some(event_loop) = &self.event_loop {
            event_loop.abort();
        }
        result.map_err(PublishError::from)
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        debug!(
            "Publishing to topic {topic} : {}",
            String::from_utf8_lossy(&payload)
        );

        let ack = {
            let _guard = self.send_lock.lock().await;
            let ack = (qos != QoS::AtMostOnce).then(|| self.connection.expect_ack(topic));
            if let Err(e) = self.client.publish(topic, qos, retain, payload).await {
                if ack.is_some() {
                    self.connection.cancel_last();
                }
                return Err(e.into());
            }
            ack
        };

        match ack {
            Some(ack) => ack.await.map_err(|_| PublishError::ConnectionLost),
            None => Ok(()),
        }
    }
}

/// A message recorded by [`MemoryPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

impl Message {
    /// Payload as text
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }
}

/// Publisher that keeps the messages in memory, in publish order
///
/// Topics ending with one of the failing suffixes are rejected with [`PublishError::Disconnected`].
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<Message>>,
    failing: Vec<String>,
}

impl MemoryPublisher {
    pub fn new() -> MemoryPublisher {
        Default::default()
    }

    /// Publisher rejecting every topic ending with `suffix`
    pub fn failing_on(suffix: &str) -> MemoryPublisher {
        MemoryPublisher {
            failing: vec![suffix.to_string()],
            ..Default::default()
        }
    }

    /// Messages accepted so far
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    /// Topics of the accepted messages, in publish order
    pub fn topics(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.topic).collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), PublishError> {
        if self.failing.iter().any(|suffix| topic.ends_with(suffix)) {
            return Err(PublishError::Disconnected);
        }
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(Message {
                topic: topic.to_string(),
                qos,
                retain,
                payload,
            });
        }
        Ok(())
    }
}
