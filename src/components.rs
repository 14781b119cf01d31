use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

/// Definition of the known sensors, embedded at build time
const EMBEDDED_COMPONENTS: &str = include_str!("components.toml");

/// Kind of Home Assistant entity a telemetry key is announced as
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    /// Numeric or text sensor
    Sensor,

    /// On/off sensor, used for the battery flags
    BinarySensor,
}

/// Describes how a telemetry key maps to a Home Assistant entity
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDescriptor {
    /// Entity platform. Always present once the registry is loaded
    pub platform: Platform,

    /// See <https://www.home-assistant.io/integrations/sensor#device-class>
    pub device_class: Option<String>,

    /// Icon for sensors without a meaningful device class, e.g. `mdi:compass-outline`
    pub icon: Option<String>,

    /// Unit of the reported value
    pub unit: Option<String>,

    /// Display name. The telemetry key is used when absent
    pub name: Option<String>,
}

/// Errors raised while loading the registry. These are never recoverable.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot parse the component definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("component `{0}` has no platform")]
    MissingPlatform(String),

    #[error("component `{key}` has an unknown platform `{platform}`")]
    UnknownPlatform { key: String, platform: String },
}

#[derive(Deserialize)]
struct RawComponent {
    platform: Option<String>,
    device_class: Option<String>,
    icon: Option<String>,
    unit: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawComponents {
    #[serde(default)]
    sensors: BTreeMap<String, RawComponent>,
}

/// Read-only registry of the telemetry keys known to Home Assistant discovery
///
/// It is built once at startup and shared between all the requests.
#[derive(Debug, Default)]
pub struct Components {
    sensors: BTreeMap<String, SensorDescriptor>,
}

impl Components {
    /// Loads the registry embedded in the binary
    ///
    /// ```
    /// use ambient2mqtt::Components;
    ///
    /// let components = Components::embedded().expect("Invalid embedded registry");
    /// assert!(components.lookup("tempf").is_some());
    /// assert!(components.lookup("PASSKEY").is_none());
    /// ```
    pub fn embedded() -> Result<Components, RegistryError> {
        Self::from_toml(EMBEDDED_COMPONENTS)
    }

    /// Parses a registry definition
    ///
    /// Every entry needs a known platform, otherwise the whole definition is rejected.
    pub fn from_toml(definition: &str) -> Result<Components, RegistryError> {
        let raw: RawComponents = toml::from_str(definition)?;

        let mut sensors = BTreeMap::new();
        for (key, component) in raw.sensors {
            let platform = match component.platform.as_deref().map(str::trim) {
                None | Some("") => return Err(RegistryError::MissingPlatform(key)),
                Some(name) => {
                    Platform::from_str(name).map_err(|_| RegistryError::UnknownPlatform {
                        key: key.clone(),
                        platform: name.to_string(),
                    })?
                }
            };

            sensors.insert(
                key,
                SensorDescriptor {
                    platform,
                    device_class: component.device_class,
                    icon: component.icon,
                    unit: component.unit,
                    name: component.name,
                },
            );
        }

        Ok(Components { sensors })
    }

    /// Returns the descriptor of a telemetry key, if it is known
    pub fn lookup(&self, key: &str) -> Option<&SensorDescriptor> {
        self.sensors.get(key)
    }

    /// Number of known telemetry keys
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    /// Returns `true` if no telemetry key is known
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Known telemetry keys, in alphabetical order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sensors.keys().map(String::as_str)
    }
}
