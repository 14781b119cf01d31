use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::error::Error;

/// Contains the configuration of the HTTP listener the weather station reports to
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Http {
    /// Address to bind to. Default: 0.0.0.0
    #[serde_inline_default(String::from("0.0.0.0"))]
    pub bind: String,

    /// Port to listen on. Default: 8080
    #[serde_inline_default(8080)]
    pub port: u16,
}

/// Contains the configuration for communicating with the MQTT broker
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Mqtt {
    /// Hostname or IP address. Default: localhost
    #[serde_inline_default(String::from("localhost"))]
    pub host: String,

    /// Port of the connection to the broker. Default: 1883
    #[serde_inline_default(1883)]
    pub port: u16,

    /// Username for the connection to the broker. Default: empty
    #[serde(default)]
    pub user: String,

    /// Password for the connection to the broker. Default: empty
    #[serde(default)]
    pub password: String,

    /// Client identifier sent to the broker. Default: `ambient2mqtt-` followed by the hostname
    #[serde(default = "client_id", rename = "client-id")]
    pub client_id: String,

    /// First part of the raw telemetry topics. Default: ambient2mqtt
    #[serde_inline_default(String::from("ambient2mqtt"))]
    #[serde(rename = "topic-prefix")]
    pub topic_prefix: String,

    /// Second part of the raw telemetry topics. Default: weather
    ///
    /// Each value is published to `{topic-prefix}/{topic}/{key}`
    #[serde_inline_default(String::from("weather"))]
    pub topic: String,

    /// MQTT keep alive in seconds. Default: 30
    #[serde_inline_default(30)]
    #[serde(rename = "keep-alive")]
    pub keep_alive: u64,
}

/// Contains the Home Assistant discovery settings
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Hass {
    /// Publishes discovery messages when set. Default: false
    pub discovery: bool,

    /// Overrides the station identity derived from the `PASSKEY` field
    #[serde(rename = "object-id")]
    pub object_id: String,

    /// Model of the device shown in Home Assistant. Default: ws-2902a
    #[serde(rename = "device-model")]
    pub device_model: String,

    /// Name of the device shown in Home Assistant. Default: ws-2902a
    #[serde(rename = "device-name")]
    pub device_name: String,

    /// Manufacturer of the device shown in Home Assistant. Default: Ambient Weather
    pub manufacturer: String,
}

/// Contains all the configuration for `ambient2mqtt`
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Configuration {
    /// Contains the configuration of the HTTP listener
    pub http: Http,

    /// Contains the configuration for communicating with the MQTT broker
    pub mqtt: Mqtt,

    /// Contains the Home Assistant discovery settings
    #[serde(default)]
    pub hass: Hass,

    /// Sets the verbosity of the logs.
    ///   * 1 => Error
    ///  * 2 => Warning
    ///  * 3 => Info
    ///  * 4 => Debug
    ///  * 5 => Trace
    #[serde_inline_default(2)]
    #[serde(rename = "log-verbosity")]
    pub log_verbosity: usize,
}

fn client_id() -> String {
    match sysinfo::System::host_name() {
        Some(host) => format!("ambient2mqtt-{host}"),
        None => String::from("ambient2mqtt"),
    }
}

impl Configuration {
    /// Load the configuration from a file
    ///
    /// ## Example
    ///
    /// ```
    /// use ambient2mqtt::Configuration;
    ///
    /// let config = Configuration::load("conf/ambient2mqtt.conf").expect("Cannot load configuration");
    ///
    /// assert_eq!(config.mqtt.host, "localhost");
    /// ```
    pub fn load(path: &str) -> Result<Configuration, Box<dyn Error>> {
        Self::parse(std::fs::read_to_string(path)?.as_str())
    }

    /// Parses the configuration from a TOML string
    pub fn parse(content: &str) -> Result<Configuration, Box<dyn Error>> {
        toml::from_str(content).map_err(|err| err.into())
    }
}
