use crate::components::Components;
use crate::configuration::Configuration;
use crate::home_assistant::{
    self, DeviceSettings, Discovery, DiscoveryDocument, ONLINE, PASSKEY, STATION_TYPE,
};
use crate::publisher::Publisher;
use log::{error, info, warn};
use percent_encoding::percent_decode;
use rumqttc::QoS;
use std::borrow::Cow;
use std::sync::Arc;

/// Values of one report, in arrival order. Only the first value of a repeated key is kept.
///
/// Values are kept as raw bytes so they are republished unmodified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySet {
    values: Vec<(String, Vec<u8>)>,
}

/// Decodes one `application/x-www-form-urlencoded` component
fn decode(component: &str) -> Vec<u8> {
    let plus_as_space: Vec<u8> = component
        .bytes()
        .map(|b| if b == b'+' { b' ' } else { b })
        .collect();
    percent_decode(&plus_as_space).collect()
}

impl TelemetrySet {
    /// Parses an URL query string, without the leading `?`
    ///
    /// ```
    /// use ambient2mqtt::TelemetrySet;
    ///
    /// let telemetry = TelemetrySet::from_query("tempf=72.5&humidity=45&tempf=80");
    /// assert_eq!(telemetry.len(), 2);
    /// assert_eq!(telemetry.get("tempf"), Some(&b"72.5"[..]));
    /// ```
    pub fn from_query(query: &str) -> TelemetrySet {
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (String::from_utf8_lossy(&decode(key)).into_owned(), decode(value))
            })
            .collect()
    }

    /// Adds a value unless the key is already present
    pub fn insert(&mut self, key: String, value: Vec<u8>) {
        if self.get(&key).is_none() {
            self.values.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Value as text, invalid UTF-8 sequences replaced
    pub fn get_str(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key).map(String::from_utf8_lossy)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl FromIterator<(String, Vec<u8>)> for TelemetrySet {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        let mut telemetry = TelemetrySet::default();
        for (key, value) in iter {
            telemetry.insert(key, value);
        }
        telemetry
    }
}

/// What happened to one report
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    /// Number of distinct keys in the report
    pub num_values: usize,

    /// Keys announced to Home Assistant
    pub discovered: usize,

    /// Keys without a discovery document
    pub unknown: usize,

    /// Publishes that failed
    pub failed: usize,
}

/// Republishes the reports of the weather station
pub struct Ingestor {
    publisher: Arc<dyn Publisher>,
    raw_topic: String,
    object_id: String,
    discovery: Option<Discovery>,
}

impl Ingestor {
    /// Discovery is only set up when it is enabled in the configuration
    pub fn new(
        config: &Configuration,
        components: Arc<Components>,
        publisher: Arc<dyn Publisher>,
    ) -> Ingestor {
        let discovery = config.hass.discovery.then(|| {
            Discovery::new(components, DeviceSettings::from_config(&config.hass))
        });

        Ingestor {
            publisher,
            raw_topic: format!("{}/{}", config.mqtt.topic_prefix, config.mqtt.topic),
            object_id: config.hass.object_id.clone(),
            discovery,
        }
    }

    /// Topic of the raw value of `key`
    pub fn raw_topic(&self, key: &str) -> String {
        format!("{}/{key}", self.raw_topic)
    }

    /// Publishes every value of the report, then the discovery messages if enabled
    ///
    /// Publish failures are logged and counted, never returned.
    pub async fn process(&self, telemetry: &TelemetrySet) -> Summary {
        let mut summary = Summary {
            num_values: telemetry.len(),
            ..Default::default()
        };

        for (key, value) in telemetry.iter() {
            info!("{key} = {}", String::from_utf8_lossy(value));
            if !self
                .publish(&self.raw_topic(key), QoS::AtMostOnce, value.to_vec())
                .await
            {
                summary.failed += 1;
            }
        }

        if let Some(discovery) = &self.discovery {
            self.process_discovery(discovery, telemetry, &mut summary)
                .await;
        }

        summary
    }

    async fn process_discovery(
        &self,
        discovery: &Discovery,
        telemetry: &TelemetrySet,
        summary: &mut Summary,
    ) {
        let passkey = telemetry.get_str(PASSKEY);
        let station_id = home_assistant::station_id(&self.object_id, passkey.as_deref());
        let station_type = telemetry.get_str(STATION_TYPE).filter(|s| !s.is_empty());

        for (key, value) in telemetry.iter() {
            if home_assistant::is_reserved(key) {
                continue;
            }

            match discovery.build(key, &station_id, station_type.as_deref()) {
                Some(document) => {
                    info!(
                        "processed key {key} - topic {}",
                        document.availability_topic
                    );
                    summary.failed += self.publish_discovery(&document, value).await;
                    summary.discovered += 1;
                }
                None => {
                    warn!("got a key of {key} - I don't know what to do with this");
                    summary.unknown += 1;
                }
            }
        }
    }

    /// Publishes availability, state and config in that order. Returns the number of failures.
    async fn publish_discovery(&self, document: &DiscoveryDocument, value: &[u8]) -> usize {
        let qos = document.qos_level();
        let config = match document.to_payload() {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot serialize the discovery document of {}: {e}", document.unique_id);
                return 1;
            }
        };

        let messages = [
            (&document.availability_topic, ONLINE.as_bytes().to_vec()),
            (&document.state_topic, value.to_vec()),
            (&document.config_topic, config),
        ];

        let mut failed = 0;
        for (topic, payload) in messages {
            if !self.publish(topic, qos, payload).await {
                failed += 1;
            }
        }
        failed
    }

    /// Publishes without retain. Returns `false` on failure.
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> bool {
        match self.publisher.publish(topic, qos, false, payload).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to publish to {topic}: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::MemoryPublisher;

    fn ingestor(discovery: bool, publisher: Arc<MemoryPublisher>) -> Ingestor {
        let mut config = Configuration::load("conf/ambient2mqtt.conf")
            .expect("Failed to load default config");
        config.hass.discovery = discovery;
        let components = Arc::new(Components::embedded().expect("embedded registry must load"));

        Ingestor::new(&config, components, publisher)
    }

    #[test]
    fn test_telemetry_set() {
        let telemetry = TelemetrySet::from_query("PASSKEY=AA%3ABB&b=2&a=1&b=3&empty=");

        assert_eq!(
            telemetry.iter().collect::<Vec<_>>(),
            vec![
                ("PASSKEY", &b"AA:BB"[..]),
                ("b", &b"2"[..]),
                ("a", &b"1"[..]),
                ("empty", &b""[..]),
            ]
        );
        assert_eq!(TelemetrySet::from_query("flag").get("flag"), Some(&b""[..]));
        assert_eq!(
            TelemetrySet::from_query("t+x=a+b%2Bc").get_str("t x").as_deref(),
            Some("a b+c")
        );
        assert!(TelemetrySet::from_query("").is_empty());
    }

    #[tokio::test]
    async fn test_raw_only() {
        let publisher = Arc::new(MemoryPublisher::new());
        let ingestor = ingestor(false, publisher.clone());

        let summary = ingestor
            .process(&TelemetrySet::from_query("tempf=72.5&unknown=1"))
            .await;

        assert_eq!(summary.num_values, 2);
        assert_eq!(summary.discovered, 0);
        assert_eq!(
            publisher.topics(),
            vec!["ambient2mqtt/weather/tempf", "ambient2mqtt/weather/unknown"]
        );
        for message in publisher.messages() {
            assert_eq!(message.qos, QoS::AtMostOnce);
            assert!(!message.retain);
        }
    }

    #[tokio::test]
    async fn test_discovery_order() {
        let publisher = Arc::new(MemoryPublisher::new());
        let ingestor = ingestor(true, publisher.clone());

        let summary = ingestor
            .process(&TelemetrySet::from_query("PASSKEY=AA:BB&tempf=72.5"))
            .await;

        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.unknown, 0);

        let messages = publisher.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(
            messages[2].topic,
            "homeassistant/sensor/AA-BB/outdoor_temperature/availability"
        );
        assert_eq!(messages[2].payload_str(), "online");
        assert_eq!(
            messages[3].topic,
            "homeassistant/sensor/AA-BB/outdoor_temperature/state"
        );
        assert_eq!(messages[3].payload_str(), "72.5");
        assert_eq!(
            messages[4].topic,
            "homeassistant/sensor/AA-BB/outdoor_temperature/config"
        );
        for message in &messages[2..] {
            assert_eq!(message.qos, QoS::AtLeastOnce);
            assert!(!message.retain);
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_processing() {
        let publisher = Arc::new(MemoryPublisher::failing_on("/state"));
        let ingestor = ingestor(true, publisher.clone());

        let summary = ingestor
            .process(&TelemetrySet::from_query("PASSKEY=s&tempf=1&humidity=2"))
            .await;

        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.failed, 2);
        // 3 raw values, then availability and config for each sensor
        assert_eq!(publisher.messages().len(), 7);
    }

    /// Values that are not UTF-8 are forwarded byte for byte
    #[tokio::test]
    async fn test_raw_bytes_kept() {
        let publisher = Arc::new(MemoryPublisher::new());
        let ingestor = ingestor(true, publisher.clone());

        ingestor
            .process(&TelemetrySet::from_query("PASSKEY=AA&tempf=%FF7"))
            .await;

        let messages = publisher.messages();
        let raw = messages
            .iter()
            .find(|m| m.topic == "ambient2mqtt/weather/tempf")
            .expect("raw value not published");
        assert_eq!(raw.payload, vec![0xFF, b'7']);

        let state = messages
            .iter()
            .find(|m| m.topic.ends_with("/outdoor_temperature/state"))
            .expect("state not published");
        assert_eq!(state.payload, vec![0xFF, b'7']);
    }

    #[tokio::test]
    async fn test_object_id_override() {
        let publisher = Arc::new(MemoryPublisher::new());
        let mut config = Configuration::load("conf/ambient2mqtt.conf")
            .expect("Failed to load default config");
        config.hass.discovery = true;
        config.hass.object_id = "backyard".to_string();
        let components = Arc::new(Components::embedded().expect("embedded registry must load"));
        let ingestor = Ingestor::new(&config, components, publisher.clone());

        ingestor
            .process(&TelemetrySet::from_query("PASSKEY=AA:BB&humidity=45"))
            .await;

        assert!(
            publisher
                .topics()
                .contains(&"homeassistant/sensor/backyard/outdoor_humidity/config".to_string())
        );
    }
}
