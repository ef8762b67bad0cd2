use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, QoS, SubscribeReasonCode,
};
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::Delivery;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A live wildcard subscription on the broker. Iterating it yields every
/// message published on the bus, keyed by its exchange routing key.
pub struct Subscription {
    client: Client,
    connection: Connection,
    filter: String,
}

impl Subscription {
    /// Connect with a clean session and subscribe to `config.topic_filter`.
    /// Fails if the broker is unreachable, refuses the connection, or
    /// rejects the subscription.
    pub fn bind(config: &Config) -> Result<Self> {
        let mut opts =
            MqttOptions::new(&config.mqtt_client_id, &config.mqtt_host, config.mqtt_port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        opts.set_clean_session(true);

        let (client, connection) = Client::new(opts, 10);
        let mut subscription = Self {
            client,
            connection,
            filter: config.topic_filter.clone(),
        };

        subscription.await_connack().with_context(|| {
            format!(
                "Failed to connect to MQTT broker {}:{}",
                config.mqtt_host, config.mqtt_port
            )
        })?;
        subscription.subscribe()?;
        subscription
            .await_suback()
            .with_context(|| format!("Failed to subscribe to {}", subscription.filter))?;

        info!(
            "Subscribed to {} on {}:{}",
            subscription.filter, config.mqtt_host, config.mqtt_port
        );
        Ok(subscription)
    }

    fn subscribe(&mut self) -> Result<()> {
        self.client
            .subscribe(&self.filter, QoS::AtMostOnce)
            .context("Failed to queue MQTT subscribe")
    }

    fn next_event(&mut self) -> Result<Event> {
        match self.connection.iter().next() {
            Some(Ok(event)) => Ok(event),
            Some(Err(e)) => Err(anyhow!("MQTT connection error: {}", e)),
            None => bail!("MQTT event loop closed"),
        }
    }

    fn await_connack(&mut self) -> Result<()> {
        loop {
            if let Event::Incoming(Packet::ConnAck(ack)) = self.next_event()? {
                if ack.code != ConnectReturnCode::Success {
                    bail!("Broker refused connection: {:?}", ack.code);
                }
                return Ok(());
            }
        }
    }

    fn await_suback(&mut self) -> Result<()> {
        loop {
            if let Event::Incoming(Packet::SubAck(ack)) = self.next_event()? {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    bail!("Broker rejected subscription");
                }
                return Ok(());
            }
        }
    }
}

impl Iterator for Subscription {
    type Item = Delivery;

    /// Block until the next message arrives. Connection errors are left to
    /// the client's reconnect; the subscription is re-issued after each
    /// reconnect since the session does not survive it.
    fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.connection.iter().next()? {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Some(Delivery {
                        routing_key: routing_key(&publish.topic),
                        body: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Reconnected to MQTT broker ({:?})", ack.code);
                    if let Err(e) = self.subscribe() {
                        warn!("{:#}", e);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        warn!("Broker rejected subscription to {}", self.filter);
                    }
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    }
}

/// Convert an MQTT topic to exchange routing-key form, the way RabbitMQ's
/// MQTT plugin does (`a/b/c` becomes `a.b.c`).
pub fn routing_key(topic: &str) -> String {
    topic.replace('/', ".")
}
