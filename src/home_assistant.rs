use crate::components::{Components, Platform};
use crate::configuration::Hass;
use rumqttc::QoS;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Prefix of every discovery topic. It must match the MQTT integration of Home Assistant
///
/// See <https://www.home-assistant.io/integrations/mqtt#discovery-options>
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// Payload sent on the availability topic before each state update
pub const ONLINE: &str = "online";

/// Telemetry field holding the station MAC address, used as the station identity
pub const PASSKEY: &str = "PASSKEY";

/// Telemetry field holding the firmware of the station
pub const STATION_TYPE: &str = "stationtype";

/// Telemetry field holding the report timestamp
pub const DATE_UTC: &str = "dateutc";

/// Fields that never get a discovery message. Sorted for the binary search.
const RESERVED_KEYS: [&str; 3] = [PASSKEY, DATE_UTC, STATION_TYPE];

const DEFAULT_MODEL: &str = "ws-2902a";
const DEFAULT_NAME: &str = "ws-2902a";
const DEFAULT_MANUFACTURER: &str = "Ambient Weather";

/// Returns `true` for the fields that describe the report itself rather than a measurement
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.binary_search(&key).is_ok()
}

/// Derives the station identity: the configured override, else the passkey with `:` replaced by `-`
///
/// ```
/// use ambient2mqtt::home_assistant::station_id;
///
/// assert_eq!(station_id("", Some("AA:BB:CC")), "AA-BB-CC");
/// assert_eq!(station_id("backyard", Some("AA:BB:CC")), "backyard");
/// assert_eq!(station_id("", None), "");
/// ```
pub fn station_id(object_id: &str, passkey: Option<&str>) -> String {
    if !object_id.is_empty() {
        return object_id.to_string();
    }
    passkey.unwrap_or_default().replace(':', "-")
}

fn topic(platform: Platform, station_id: &str, sensor_name: &str, suffix: &str) -> String {
    format!("{DISCOVERY_PREFIX}/{platform}/{station_id}/{sensor_name}/{suffix}")
}

/// Topic announcing that the sensor is online
pub fn availability_topic(platform: Platform, station_id: &str, sensor_name: &str) -> String {
    topic(platform, station_id, sensor_name, "availability")
}

/// Topic carrying the sensor value
pub fn state_topic(platform: Platform, station_id: &str, sensor_name: &str) -> String {
    topic(platform, station_id, sensor_name, "state")
}

/// Topic carrying the discovery document
pub fn config_topic(platform: Platform, station_id: &str, sensor_name: &str) -> String {
    topic(platform, station_id, sensor_name, "config")
}

/// Unique ID of a sensor: `{station_id}_{key}`
pub fn unique_id(key: &str, station_id: &str) -> String {
    format!("{station_id}_{key}")
}

/// The three topics of one sensor, always derived from the same triple
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    /// Receives `online` before each state update
    pub availability: String,

    /// Receives the raw value
    pub state: String,

    /// Receives the discovery document
    pub config: String,
}

impl Topics {
    pub fn new(platform: Platform, station_id: &str, sensor_name: &str) -> Topics {
        Topics {
            availability: availability_topic(platform, station_id, sensor_name),
            state: state_topic(platform, station_id, sensor_name),
            config: config_topic(platform, station_id, sensor_name),
        }
    }
}

/// Device sent to Home Assistant. All the sensors of a station share it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Device {
    /// Contains only the station identity
    pub identifiers: Vec<String>,

    /// Manufacturer of the station. Default: Ambient Weather
    pub manufacturer: String,

    /// Model of the station. Default: ws-2902a
    pub model: String,

    /// Name of the device shown in Home Assistant. Default: ws-2902a
    pub name: String,

    /// Firmware reported in the `stationtype` field, empty when absent
    pub sw_version: String,
}

/// Device metadata taken from the configuration, with the built-in defaults filled in
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// Copied to [`Device::model`]
    pub model: String,

    /// Copied to [`Device::name`]
    pub name: String,

    /// Copied to [`Device::manufacturer`]
    pub manufacturer: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            model: DEFAULT_MODEL.to_string(),
            name: DEFAULT_NAME.to_string(),
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
        }
    }
}

impl DeviceSettings {
    /// Uses the configured values, falling back to the defaults for the empty ones
    pub fn from_config(hass: &Hass) -> DeviceSettings {
        fn or_default(value: &str, default: &str) -> String {
            let value = if value.is_empty() { default } else { value };
            value.to_string()
        }

        DeviceSettings {
            model: or_default(&hass.device_model, DEFAULT_MODEL),
            name: or_default(&hass.device_name, DEFAULT_NAME),
            manufacturer: or_default(&hass.manufacturer, DEFAULT_MANUFACTURER),
        }
    }

    fn device(&self, station_id: &str, station_type: Option<&str>) -> Device {
        Device {
            identifiers: vec![station_id.to_string()],
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            name: self.name.clone(),
            sw_version: station_type.unwrap_or_default().to_string(),
        }
    }
}

/// Discovery document of a single sensor
///
/// It is built for each report and serialized on the config topic.
#[derive(Serialize, Debug, Clone)]
pub struct DiscoveryDocument {
    /// See [`Topics::availability`]
    pub availability_topic: String,

    /// Where this document is published. Not part of the payload
    #[serde(skip)]
    pub config_topic: String,

    pub device: Device,

    /// Name shown in Home Assistant, also used in the topics
    pub name: String,

    /// Quality of service of the three discovery messages. Always 1
    pub qos: u8,

    /// See [`Topics::state`]
    pub state_topic: String,

    /// Unique ID of the sensor, see [`unique_id`]
    pub unique_id: String,

    /// Device class from the registry, omitted when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    /// Icon from the registry, omitted when empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon: String,

    /// Empty when the sensor has no unit
    pub unit_of_measurement: String,

    /// Entity platform, part of the topics. Not part of the payload
    #[serde(skip)]
    pub platform: Platform,
}

impl DiscoveryDocument {
    /// Quality of service to publish the discovery messages with
    pub fn qos_level(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    /// JSON payload for the config topic
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl fmt::Display for DiscoveryDocument {
    /// Formats the document in JSON format
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(document) = serde_json::to_string(&self) else {
            return Err(fmt::Error);
        };
        write!(f, "{document}")
    }
}

/// Builds discovery documents from the component registry
#[derive(Debug, Clone)]
pub struct Discovery {
    components: Arc<Components>,
    device: DeviceSettings,
}

impl Discovery {
    pub fn new(components: Arc<Components>, device: DeviceSettings) -> Discovery {
        Discovery { components, device }
    }

    /// Builds the discovery document of a telemetry key
    ///
    /// Returns `None` for unknown and reserved keys. Their raw value is still published.
    ///
    /// ## Example
    ///
    /// ```
    /// use ambient2mqtt::{Components, Discovery, DeviceSettings};
    /// use std::sync::Arc;
    ///
    /// let components = Arc::new(Components::embedded().expect("Invalid registry"));
    /// let discovery = Discovery::new(components, DeviceSettings::default());
    ///
    /// let document = discovery.build("tempf", "AA-BB-CC", Some("AMBWeatherV4.3.4")).expect("tempf is known");
    /// assert_eq!(document.unique_id, "AA-BB-CC_tempf");
    /// assert_eq!(document.device.sw_version, "AMBWeatherV4.3.4");
    ///
    /// assert!(discovery.build("unknown", "AA-BB-CC", None).is_none());
    /// ```
    pub fn build(
        &self,
        key: &str,
        station_id: &str,
        station_type: Option<&str>,
    ) -> Option<DiscoveryDocument> {
        if is_reserved(key) {
            return None;
        }
        let descriptor = self.components.lookup(key)?;

        let name = descriptor.name.clone().unwrap_or_else(|| key.to_string());
        let topics = Topics::new(descriptor.platform, station_id, &name);

        Some(DiscoveryDocument {
            availability_topic: topics.availability,
            config_topic: topics.config,
            device: self.device.device(station_id, station_type),
            name,
            qos: 1,
            state_topic: topics.state,
            unique_id: unique_id(key, station_id),
            device_class: descriptor.device_class.clone(),
            icon: descriptor.icon.clone().unwrap_or_default(),
            unit_of_measurement: descriptor.unit.clone().unwrap_or_default(),
            platform: descriptor.platform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::HashMap;

    fn discovery() -> Discovery {
        let components = Components::embedded().expect("embedded registry must load");
        Discovery::new(Arc::new(components), DeviceSettings::default())
    }

    #[test]
    fn test_topics() {
        let topics = Topics::new(Platform::Sensor, "AA-BB-CC", "tempf");

        assert_eq!(
            topics.availability,
            "homeassistant/sensor/AA-BB-CC/tempf/availability"
        );
        assert_eq!(topics.state, "homeassistant/sensor/AA-BB-CC/tempf/state");
        assert_eq!(topics.config, "homeassistant/sensor/AA-BB-CC/tempf/config");

        assert_eq!(
            config_topic(Platform::BinarySensor, "s", "battout"),
            "homeassistant/binary_sensor/s/battout/config"
        );
        assert_eq!(unique_id("tempf", "AA-BB-CC"), "AA-BB-CC_tempf");
    }

    #[test]
    fn test_reserved() {
        assert!(is_reserved("PASSKEY"));
        assert!(is_reserved("stationtype"));
        assert!(is_reserved("dateutc"));
        assert!(!is_reserved("passkey"));
        assert!(!is_reserved("tempf"));
    }

    #[test]
    fn test_station_id_idempotent() {
        let once = station_id("", Some("AA:BB:CC:DD"));
        assert_eq!(once, "AA-BB-CC-DD");
        assert_eq!(station_id("", Some(once.as_str())), once);
    }

    /// Every registered key gives a document whose topics share the same prefix
    #[test]
    fn test_all_components() {
        let discovery = discovery();
        let station = "AA-BB-CC";

        for key in discovery.components.keys() {
            let document = discovery
                .build(key, station, None)
                .unwrap_or_else(|| panic!("no document for {key}"));

            assert_eq!(document.unique_id, format!("{station}_{key}"));
            assert_eq!(document.qos, 1);
            assert_eq!(document.qos_level(), QoS::AtLeastOnce);

            let prefix = format!(
                "{DISCOVERY_PREFIX}/{}/{station}/{}/",
                document.platform, document.name
            );
            assert!(document.availability_topic.starts_with(&prefix));
            assert!(document.state_topic.starts_with(&prefix));
            assert!(document.config_topic.starts_with(&prefix));
            assert!(document.availability_topic.ends_with("/availability"));
            assert!(document.state_topic.ends_with("/state"));
            assert!(document.config_topic.ends_with("/config"));
        }
    }

    #[test]
    fn test_name_falls_back_to_key() {
        let components = Components::from_toml("[sensors.co2]\nplatform = \"sensor\"\nunit = \"ppm\"\n")
            .expect("valid definition");
        let discovery = Discovery::new(Arc::new(components), DeviceSettings::default());

        let document = discovery.build("co2", "s", None).expect("co2 is known");
        assert_eq!(document.name, "co2");
        assert_eq!(document.state_topic, "homeassistant/sensor/s/co2/state");
        assert_eq!(document.unit_of_measurement, "ppm");
        assert!(document.icon.is_empty());
    }

    #[test]
    fn test_reserved_even_if_registered() {
        let components =
            Components::from_toml("[sensors.dateutc]\nplatform = \"sensor\"\n").expect("valid definition");
        let discovery = Discovery::new(Arc::new(components), DeviceSettings::default());

        assert!(discovery.build("dateutc", "s", None).is_none());
    }

    #[test]
    fn test_device_defaults() {
        let document = discovery().build("tempf", "AA-BB-CC", None).expect("tempf is known");

        assert_eq!(document.device.identifiers, vec!["AA-BB-CC".to_string()]);
        assert_eq!(document.device.model, "ws-2902a");
        assert_eq!(document.device.name, "ws-2902a");
        assert_eq!(document.device.manufacturer, "Ambient Weather");
        assert_eq!(document.device.sw_version, "");
    }

    #[test]
    fn test_device_from_config() {
        let hass = Hass {
            device_model: "ws-5000".to_string(),
            manufacturer: "ACME".to_string(),
            ..Default::default()
        };
        let settings = DeviceSettings::from_config(&hass);

        assert_eq!(settings.model, "ws-5000");
        assert_eq!(settings.name, "ws-2902a");
        assert_eq!(settings.manufacturer, "ACME");
    }

    /// The station type is kept whole
    #[test]
    fn test_sw_version() {
        let document = discovery()
            .build("humidity", "s", Some("AMBWeatherV4.2.9"))
            .expect("humidity is known");

        assert_eq!(document.device.sw_version, "AMBWeatherV4.2.9");
    }

    #[test]
    fn test_payload() {
        let document = discovery()
            .build("tempf", "AA-BB-CC", Some("AMBWeatherV4.2.9"))
            .expect("tempf is known");
        let json: HashMap<String, Value> =
            serde_json::from_str(&document.to_string()).expect("Cannot read document");

        assert_eq!(
            json["availability_topic"],
            "homeassistant/sensor/AA-BB-CC/outdoor_temperature/availability"
        );
        assert_eq!(
            json["state_topic"],
            "homeassistant/sensor/AA-BB-CC/outdoor_temperature/state"
        );
        assert_eq!(json["unique_id"], "AA-BB-CC_tempf");
        assert_eq!(json["name"], "outdoor_temperature");
        assert_eq!(json["qos"], 1);
        assert_eq!(json["unit_of_measurement"], "°F");
        assert_eq!(json["device_class"], "temperature");
        assert_eq!(json["device"]["identifiers"][0], "AA-BB-CC");
        assert_eq!(json["device"]["manufacturer"], "Ambient Weather");
        assert_eq!(json["device"]["sw_version"], "AMBWeatherV4.2.9");

        assert!(!json.contains_key("icon"));
        assert!(!json.contains_key("config_topic"));
        assert!(!json.contains_key("platform"));

        let bytes = document.to_payload().expect("Cannot serialize document");
        assert_eq!(bytes, document.to_string().into_bytes());
    }

    #[test]
    fn test_icon_serialized() {
        let document = discovery().build("winddir", "s", None).expect("winddir is known");
        let json: HashMap<String, Value> =
            serde_json::from_str(&document.to_string()).expect("Cannot read document");

        assert_eq!(json["icon"], "mdi:compass-outline");
        assert!(!json.contains_key("device_class"));
    }
}
