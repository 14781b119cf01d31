use crate::components::{Components, RegistryError};
use crate::configuration::Configuration;
use crate::ingest::Ingestor;
use crate::publisher::MqttPublisher;
use crate::server;
use log::{debug, error, info};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;

/// Daemon that listens for weather station reports and forwards them to MQTT
pub struct Daemon {
    config: Configuration,
    components: Arc<Components>,
}

impl Daemon {
    /// Constructs a daemon from the specified configuration
    ///
    /// Fails if the embedded component registry is invalid.
    ///
    /// ```
    /// use ambient2mqtt::{Configuration, Daemon};
    ///
    /// let config = Configuration::load("conf/ambient2mqtt.conf").expect("Cannot load configuration");
    /// let daemon = Daemon::new(config).expect("Invalid component registry");
    ///
    /// // later, run daemon.run() in an async function
    /// ```
    pub fn new(config: Configuration) -> Result<Daemon, RegistryError> {
        let components = Components::embedded()?;
        info!(
            "Loaded {} Home Assistant components, discovery is {}",
            components.len(),
            if config.hass.discovery { "on" } else { "off" }
        );

        Ok(Daemon {
            config,
            components: Arc::new(components),
        })
    }

    /// Returns the component registry
    pub fn components(&self) -> &Components {
        &self.components
    }

    /// Connects to the broker and serves reports until Ctrl-C or SIGTERM
    pub async fn run(&self) -> Result<(), Box<dyn Error>> {
        let publisher = Arc::new(MqttPublisher::connect(&self.config.mqtt).await?);
        let ingestor = Arc::new(Ingestor::new(
            &self.config,
            self.components.clone(),
            publisher.clone(),
        ));

        let address = format!("{}:{}", self.config.http.bind, self.config.http.port);
        let listener = TcpListener::bind(&address).await?;
        info!("listening for inbound Ambient Weather HTTP requests on {address}");

        axum::serve(
            listener,
            server::router(ingestor).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(Self::shutdown_signal())
        .await?;

        match Arc::into_inner(publisher) {
            Some(publisher) => publisher.disconnect().await?,
            None => error!("MQTT client still in use, not disconnecting"),
        }

        Ok(())
    }

    /// Resolves on Ctrl-C or SIGTERM
    async fn shutdown_signal() {
        let mut terminal_signal = match tokio::signal::unix::signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => debug!("Ctrl-C received"),
            _ = terminal_signal.recv() => debug!("Interrupt received"),
        }
    }
}
