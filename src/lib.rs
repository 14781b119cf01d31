//! # ambient2mqtt
//!
//! `ambient2mqtt` receives the reports of an Ambient Weather station and republishes
//! every value to MQTT. It can also announce the sensors to Home Assistant with MQTT discovery.
//!

pub use self::components::Components;
pub use self::components::Platform;
pub use self::components::SensorDescriptor;
pub use self::configuration::Configuration;
pub use self::configuration::Hass;
pub use self::configuration::Http;
pub use self::configuration::Mqtt;
pub use self::daemon::Daemon;
pub use self::home_assistant::DeviceSettings;
pub use self::home_assistant::Discovery;
pub use self::home_assistant::DiscoveryDocument;
pub use self::ingest::Ingestor;
pub use self::ingest::TelemetrySet;
pub use self::publisher::MemoryPublisher;
pub use self::publisher::MqttPublisher;
pub use self::publisher::Publisher;
pub use self::status::ReportStatus;

/// Contains the registry of the sensors known to Home Assistant discovery
pub mod components;
/// Contains the configuration stuff
pub mod configuration;
/// Contains the daemon code
pub mod daemon;
/// Contains Home Assistant topics and discovery documents
pub mod home_assistant;
/// Contains the processing of a single report
pub mod ingest;
/// Contains the MQTT publishing
pub mod publisher;
/// Contains the HTTP routes
pub mod server;
/// Contains the answer sent to the weather station
pub mod status;
