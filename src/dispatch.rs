use log::{debug, error, trace};
use std::sync::Arc;

use crate::decode::{self, DecodeError, FieldMapping, EMDATA_FIELDS, EM_FIELDS};
use crate::metrics::Registry;

/// A message as delivered by the bus: routing key plus raw body.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Status message classes with a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Instantaneous electrical readings
    Em,
    /// Cumulative energy counters
    EmData,
}

impl MessageClass {
    pub fn fields(self) -> &'static [FieldMapping] {
        match self {
            MessageClass::Em => EM_FIELDS,
            MessageClass::EmData => EMDATA_FIELDS,
        }
    }
}

/// The routing keys of the configured meter, fixed at startup.
#[derive(Debug, Clone)]
pub struct Topics {
    pub em: String,
    pub emdata: String,
}

impl Topics {
    pub fn new(device_class: &str, device_id: &str) -> Self {
        let prefix = format!("{}-{}", device_class, device_id);
        Self {
            em: format!("{}.status.em:0", prefix),
            emdata: format!("{}.status.emdata:0", prefix),
        }
    }

    /// Exact match only; anything else on the bus is not ours.
    pub fn route(&self, routing_key: &str) -> Option<MessageClass> {
        if routing_key == self.em {
            Some(MessageClass::Em)
        } else if routing_key == self.emdata {
            Some(MessageClass::EmData)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Updated(MessageClass),
    Ignored,
    Rejected(DecodeError),
}

pub struct Dispatcher {
    topics: Topics,
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(topics: Topics, registry: Arc<Registry>) -> Self {
        Self { topics, registry }
    }

    /// Route one message to its decoder. A failed decode never leaves a
    /// partial update behind.
    pub fn handle(&self, routing_key: &str, body: &[u8]) -> Outcome {
        debug!("{}: {}", routing_key, String::from_utf8_lossy(body));

        let Some(class) = self.topics.route(routing_key) else {
            trace!("Ignoring message on {}", routing_key);
            return Outcome::Ignored;
        };

        match decode::parse_body(body)
            .and_then(|payload| decode::apply(&self.registry, &payload, class.fields()))
        {
            Ok(count) => {
                debug!("Updated {} gauges from {:?}", count, class);
                Outcome::Updated(class)
            }
            Err(e) => Outcome::Rejected(e),
        }
    }

    /// Process deliveries one at a time until the stream ends. Rejected
    /// messages are logged and count as handled.
    pub fn consume(&self, deliveries: impl IntoIterator<Item = Delivery>) -> Tally {
        let mut tally = Tally::default();
        for delivery in deliveries {
            match self.handle(&delivery.routing_key, &delivery.body) {
                Outcome::Updated(MessageClass::Em) => tally.em += 1,
                Outcome::Updated(MessageClass::EmData) => tally.emdata += 1,
                Outcome::Ignored => tally.ignored += 1,
                Outcome::Rejected(e) => {
                    error!(
                        "Failed to decode message on {}: {}; body: {}",
                        delivery.routing_key,
                        e,
                        String::from_utf8_lossy(&delivery.body)
                    );
                    tally.rejected += 1;
                }
            }
        }
        tally
    }
}

/// Per-outcome message counts of a consumption run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub em: u64,
    pub emdata: u64,
    pub ignored: u64,
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{EMDATA_SAMPLE, EM_SAMPLE};
    use crate::metrics::{Family, Phase};

    fn dispatcher() -> (Dispatcher, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let topics = Topics::new("shellypro3em", "08f9e0e957c8");
        (Dispatcher::new(topics, Arc::clone(&registry)), registry)
    }

    fn delivery(routing_key: &str, body: &str) -> Delivery {
        Delivery {
            routing_key: routing_key.to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    const EM_KEY: &str = "shellypro3em-08f9e0e957c8.status.em:0";
    const EMDATA_KEY: &str = "shellypro3em-08f9e0e957c8.status.emdata:0";

    #[test]
    fn topics_from_device() {
        let topics = Topics::new("shellypro3em", "08f9e0e957c8");
        assert_eq!(topics.em, EM_KEY);
        assert_eq!(topics.emdata, EMDATA_KEY);
    }

    #[test]
    fn route_requires_exact_match() {
        let topics = Topics::new("shellypro3em", "08f9e0e957c8");
        assert_eq!(topics.route(EM_KEY), Some(MessageClass::Em));
        assert_eq!(topics.route(EMDATA_KEY), Some(MessageClass::EmData));
        assert_eq!(topics.route("shellypro3em-08f9e0e957c8.status.em:1"), None);
        assert_eq!(topics.route("shellypro3em-000000000000.status.em:0"), None);
        assert_eq!(topics.route("shellypro3em-08f9e0e957c8.status.em:0.x"), None);
        assert_eq!(topics.route("shellypro3em-08f9e0e957c8.online"), None);
        assert_eq!(topics.route(""), None);
    }

    #[test]
    fn unknown_routing_key_leaves_registry_unchanged() {
        let (dispatcher, registry) = dispatcher();
        dispatcher.handle(EMDATA_KEY, EMDATA_SAMPLE.as_bytes());
        let before = registry.snapshot();

        let outcome = dispatcher.handle("shellyplus1-abc.status.switch:0", EM_SAMPLE.as_bytes());
        assert!(matches!(outcome, Outcome::Ignored));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn same_payload_twice_is_idempotent() {
        let (dispatcher, registry) = dispatcher();
        dispatcher.handle(EM_KEY, EM_SAMPLE.as_bytes());
        let once = registry.render();
        dispatcher.handle(EM_KEY, EM_SAMPLE.as_bytes());
        assert_eq!(registry.render(), once);
    }

    #[test]
    fn classes_update_disjoint_gauges() {
        let (dispatcher, registry) = dispatcher();
        assert!(matches!(
            dispatcher.handle(EM_KEY, EM_SAMPLE.as_bytes()),
            Outcome::Updated(MessageClass::Em)
        ));
        assert_eq!(registry.snapshot().len(), 21);
        assert!(matches!(
            dispatcher.handle(EMDATA_KEY, EMDATA_SAMPLE.as_bytes()),
            Outcome::Updated(MessageClass::EmData)
        ));
        assert_eq!(registry.snapshot().len(), 29);
        assert_eq!(registry.get(Family::Current, Phase::A), Some(1.141));
    }

    #[test]
    fn decode_error_keeps_previous_values() {
        let (dispatcher, registry) = dispatcher();
        dispatcher.handle(EM_KEY, EM_SAMPLE.as_bytes());
        let before = registry.snapshot();

        let outcome = dispatcher.handle(EM_KEY, br#"{"a_current": 7.5}"#);
        assert!(matches!(
            outcome,
            Outcome::Rejected(DecodeError::MissingField(_))
        ));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn malformed_body_does_not_stop_consumption() {
        let (dispatcher, registry) = dispatcher();
        let tally = dispatcher.consume(vec![
            delivery(EM_KEY, "{not json"),
            delivery("some.other.topic", "hello"),
            delivery(EMDATA_KEY, ""),
            delivery(EM_KEY, EM_SAMPLE),
        ]);
        assert_eq!(
            tally,
            Tally {
                em: 1,
                emdata: 0,
                ignored: 1,
                rejected: 2,
            }
        );
        assert_eq!(registry.get(Family::Current, Phase::A), Some(1.141));
        assert_eq!(registry.get(Family::TotalActiveEnergy, Phase::A), None);
    }

    #[test]
    fn scrape_reports_em_currents() {
        let (dispatcher, registry) = dispatcher();
        dispatcher.consume(vec![delivery(EM_KEY, EM_SAMPLE)]);

        let output = registry.render();
        assert!(output.contains("energy_meter_current{phase=\"A\"} 1.141\n"));
        assert!(output.contains("energy_meter_current{phase=\"B\"} 0.945\n"));
        assert!(output.contains("energy_meter_current{phase=\"C\"} 0.106\n"));
        assert!(output.contains("energy_meter_current{phase=\"total\"} 2.192\n"));
        assert!(!output.contains("energy_meter_freq{phase=\"total\"}"));
    }

    #[test]
    fn scrape_reports_emdata_energy() {
        let (dispatcher, registry) = dispatcher();
        dispatcher.consume(vec![delivery(EMDATA_KEY, EMDATA_SAMPLE)]);

        let output = registry.render();
        assert!(output.contains("energy_meter_total_active_energy{phase=\"A\"} 81574.47\n"));
        assert!(output.contains("energy_meter_total_active_energy{phase=\"total\"} 96916.55\n"));
        assert!(output.contains("energy_meter_total_active_energy_returned{phase=\"total\"} 0\n"));
    }
}
