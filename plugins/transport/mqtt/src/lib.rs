//! MQTT message bus over `rumqttc`.
//!
//! One broker connection is shared by every receiver. [`MqttDriver`] owns the
//! event loop and dispatches each incoming publish to the subscriptions whose
//! filter matches its topic. When the connection drops, every subscription
//! receives the error and the driver stops; there is no reconnect.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tsbridge_api::{BusError, Message, MessageBus, Subscription};

type Delivery = Result<Message, BusError>;

/// Broker connection parameters.
#[derive(Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Subscription QoS level: 0, 1 or 2.
    pub qos: u8,
    pub credentials: Option<(String, String)>,
    /// Buffer for outgoing requests and for each subscription's inbox.
    pub channel_capacity: usize,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: "tsbridge".into(),
            keep_alive: Duration::from_secs(30),
            qos: 1,
            credentials: None,
            channel_capacity: 64,
        }
    }
}

impl std::fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("qos", &self.qos)
            .field("username", &self.credentials.as_ref().map(|(user, _)| user))
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

pub fn qos(level: u8) -> Result<QoS, BusError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BusError::new(format!("invalid QoS level {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

struct Route {
    id: u64,
    filter: String,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct RouteTable {
    routes: Vec<Route>,
    next_id: u64,
    /// Routes whose SUBSCRIBE is queued but has no packet id yet, in request order.
    queued: VecDeque<u64>,
    /// SUBSCRIBE packet id → route awaiting its SUBACK.
    in_flight: HashMap<u16, u64>,
}

/// Outcome of a SUBACK for one route.
struct Acknowledged {
    filter: String,
    /// Inbox of a refused route, already removed from the table.
    refused: Option<mpsc::Sender<Delivery>>,
}

/// Subscription filters and their inboxes.
#[derive(Clone, Default)]
struct Routes {
    inner: Arc<Mutex<RouteTable>>,
}

impl Routes {
    fn lock(&self) -> MutexGuard<'_, RouteTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a route and queue it for packet-id assignment. Callers must issue
    /// the matching SUBSCRIBE before registering another route.
    fn register(&self, filter: &str, capacity: usize) -> (u64, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        let mut table = self.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.routes.push(Route {
            id,
            filter: filter.to_string(),
            tx,
        });
        table.queued.push_back(id);
        (id, rx)
    }

    /// Forget a route whose SUBSCRIBE never reached the event loop.
    fn withdraw(&self, id: u64) {
        let mut table = self.lock();
        table.routes.retain(|r| r.id != id);
        table.queued.retain(|&queued| queued != id);
    }

    /// The event loop sent the oldest queued SUBSCRIBE as `pkid`.
    fn sent(&self, pkid: u16) {
        let mut table = self.lock();
        if let Some(id) = table.queued.pop_front() {
            table.in_flight.insert(pkid, id);
        }
    }

    /// Settle the route waiting on `pkid`. A refused route is removed.
    fn acknowledged(&self, pkid: u16, refused: bool) -> Option<Acknowledged> {
        let mut table = self.lock();
        let id = table.in_flight.remove(&pkid)?;
        let at = table.routes.iter().position(|r| r.id == id)?;
        if refused {
            let route = table.routes.remove(at);
            Some(Acknowledged {
                filter: route.filter,
                refused: Some(route.tx),
            })
        } else {
            Some(Acknowledged {
                filter: table.routes[at].filter.clone(),
                refused: None,
            })
        }
    }

    /// Inboxes whose filter matches `topic`. Routes of dropped subscriptions
    /// are pruned on the way.
    fn targets(&self, topic: &str) -> Vec<mpsc::Sender<Delivery>> {
        let mut table = self.lock();
        table.routes.retain(|r| !r.tx.is_closed());
        table
            .routes
            .iter()
            .filter(|r| rumqttc::matches(topic, &r.filter))
            .map(|r| r.tx.clone())
            .collect()
    }

    /// Remove every route, handing back the inboxes.
    fn drain(&self) -> Vec<mpsc::Sender<Delivery>> {
        let mut table = self.lock();
        table.queued.clear();
        table.in_flight.clear();
        table.routes.drain(..).map(|r| r.tx).collect()
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub struct MqttBus {
    client: AsyncClient,
    subscribing: tokio::sync::Mutex<()>,
    qos: QoS,
    routes: Routes,
    capacity: usize,
}

impl MqttBus {
    /// Connect and wait for the broker's CONNACK.
    ///
    /// The returned driver must be spawned before anything subscribes.
    pub async fn connect(settings: MqttSettings) -> Result<(MqttBus, MqttDriver), BusError> {
        let qos = qos(settings.qos)?;
        let endpoint = format!("{}:{}", settings.host, settings.port);

        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        if let Some((username, password)) = &settings.credentials {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, settings.channel_capacity);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(BusError::new(e.to_string()).with_context(format!("connect {endpoint}")));
                }
            }
        }
        tracing::info!(broker = %endpoint, client_id = %settings.client_id, "connected to broker");

        let routes = Routes::default();
        let bus = MqttBus {
            client,
            subscribing: tokio::sync::Mutex::new(()),
            qos,
            routes: routes.clone(),
            capacity: settings.channel_capacity,
        };
        Ok((bus, MqttDriver { eventloop, routes }))
    }

    /// Send DISCONNECT; the driver stops once the broker acknowledges.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BusError::new(e.to_string()))
    }
}

impl MessageBus for MqttBus {
    fn subscribe(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, BusError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let rx = {
                // Keeps route registration in the same order as SUBSCRIBE packets.
                let _ordered = self.subscribing.lock().await;
                let (id, rx) = self.routes.register(&topic, self.capacity);
                if let Err(e) = self.client.subscribe(topic.as_str(), self.qos).await {
                    self.routes.withdraw(id);
                    return Err(BusError::new(e.to_string()).with_context(format!("subscribe '{topic}'")));
                }
                rx
            };
            tracing::info!(topic = %topic, qos = ?self.qos, "subscription requested");
            Ok(Box::new(MqttSubscription { rx }) as Box<dyn Subscription>)
        })
    }
}

struct MqttSubscription {
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription for MqttSubscription {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Message>, BusError>> + Send + '_>> {
        Box::pin(async move { self.rx.recv().await.transpose() })
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Owns the connection's event loop. Spawn [`MqttDriver::run`] once.
pub struct MqttDriver {
    eventloop: EventLoop,
    routes: Routes,
}

impl MqttDriver {
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!("mqtt driver stopped");
                    return;
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    let targets = self.routes.targets(&message.topic);
                    if targets.is_empty() {
                        tracing::debug!(topic = %message.topic, "publish with no subscriber");
                    }
                    for tx in targets {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            _ = tx.send(Ok(message.clone())) => {}
                        }
                    }
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => self.routes.sent(pkid),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let refused = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    match self.routes.acknowledged(ack.pkid, refused) {
                        Some(Acknowledged {
                            filter,
                            refused: Some(tx),
                        }) => {
                            tracing::error!(topic = %filter, "broker refused subscription");
                            let error = BusError::new(format!("broker refused subscription to '{filter}'"));
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => return,
                                _ = tx.send(Err(error)) => {}
                            }
                        }
                        Some(Acknowledged { filter, refused: None }) => {
                            tracing::info!(topic = %filter, "subscribed");
                        }
                        None => tracing::debug!(pkid = ack.pkid, "unexpected SUBACK"),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::info!("disconnected from broker");
                    self.routes.drain();
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "broker connection lost");
                    let error = BusError::new(e.to_string());
                    for tx in self.routes.drain() {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            _ = tx.send(Err(error.clone())) => {}
                        }
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str) -> Delivery {
        Ok(Message {
            topic: topic.into(),
            payload: b"{}".to_vec(),
        })
    }

    #[test]
    fn qos_levels() {
        assert_eq!(qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos(3).is_err());
    }

    #[test]
    fn settings_hide_password() {
        let mut settings = MqttSettings::new("localhost", 1883);
        settings.credentials = Some(("bridge".into(), "hunter2".into()));
        let printed = format!("{settings:?}");
        assert!(printed.contains("bridge"));
        assert!(!printed.contains("hunter2"));
    }

    #[tokio::test]
    async fn publishes_reach_only_matching_filters() {
        let routes = Routes::default();
        let (_, mut weather) = routes.register("timescaledb/weather", 4);
        let (_, mut all) = routes.register("timescaledb/#", 4);

        for tx in routes.targets("timescaledb/rtl433") {
            tx.send(message("timescaledb/rtl433")).await.unwrap();
        }
        for tx in routes.targets("timescaledb/weather") {
            tx.send(message("timescaledb/weather")).await.unwrap();
        }

        assert_eq!(weather.recv().await.unwrap().unwrap().topic, "timescaledb/weather");
        assert!(weather.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap().unwrap().topic, "timescaledb/rtl433");
        assert_eq!(all.recv().await.unwrap().unwrap().topic, "timescaledb/weather");
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let routes = Routes::default();
        let (_, kept) = routes.register("a", 1);
        drop(routes.register("a", 1).1);
        assert_eq!(routes.targets("a").len(), 1);
        drop(kept);
        assert!(routes.targets("a").is_empty());
    }

    #[tokio::test]
    async fn drained_routes_end_their_streams() {
        let routes = Routes::default();
        let (_, rx) = routes.register("a", 1);
        let mut subscription = MqttSubscription { rx };

        let senders = routes.drain();
        assert_eq!(senders.len(), 1);
        senders[0].send(Err(BusError::new("connection reset"))).await.unwrap();
        drop(senders);

        assert!(subscription.recv().await.is_err());
        assert_eq!(subscription.recv().await.unwrap(), None);
        assert!(routes.targets("a").is_empty());
    }

    #[tokio::test]
    async fn refused_subscription_fails_only_its_own_stream() {
        let routes = Routes::default();
        let (_, weather) = routes.register("timescaledb/weather", 2);
        let (_, denied) = routes.register("secret/#", 2);
        routes.sent(1);
        routes.sent(2);
        let mut weather = MqttSubscription { rx: weather };
        let mut denied = MqttSubscription { rx: denied };

        let granted = routes.acknowledged(1, false).unwrap();
        assert_eq!(granted.filter, "timescaledb/weather");
        assert!(granted.refused.is_none());

        let refused = routes.acknowledged(2, true).unwrap();
        assert_eq!(refused.filter, "secret/#");
        let tx = refused.refused.unwrap();
        tx.send(Err(BusError::new("broker refused subscription to 'secret/#'")))
            .await
            .unwrap();
        drop(tx);

        let err = denied.recv().await.unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert_eq!(denied.recv().await.unwrap(), None);
        assert!(routes.targets("secret/data").is_empty());

        for tx in routes.targets("timescaledb/weather") {
            tx.send(message("timescaledb/weather")).await.unwrap();
        }
        assert_eq!(weather.recv().await.unwrap().unwrap().topic, "timescaledb/weather");
    }

    #[test]
    fn unknown_or_repeated_acks_are_ignored() {
        let routes = Routes::default();
        let (_, _rx) = routes.register("a", 1);
        assert!(routes.acknowledged(7, true).is_none());
        routes.sent(7);
        assert!(routes.acknowledged(7, false).is_some());
        assert!(routes.acknowledged(7, true).is_none());
        assert_eq!(routes.targets("a").len(), 1);
    }

    #[test]
    fn withdrawn_route_is_not_matched_to_a_later_packet() {
        let routes = Routes::default();
        let (failed, _gone) = routes.register("a", 1);
        routes.withdraw(failed);
        let (_, _rx) = routes.register("b", 1);
        routes.sent(1);
        assert_eq!(routes.acknowledged(1, true).unwrap().filter, "b");
        assert!(routes.targets("a").is_empty());
        assert!(routes.targets("b").is_empty());
    }
}
