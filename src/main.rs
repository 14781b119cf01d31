use ambient2mqtt::configuration;
use ambient2mqtt::daemon::Daemon;
use log::error;

const DEFAULT_CONFIG_PATH: &str = "/etc/ambient2mqtt.conf";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => path.as_str(),
        None => DEFAULT_CONFIG_PATH,
    };

    let config =
        configuration::Configuration::load(config_path).expect("Failed to load configuration");

    stderrlog::new()
        .module(module_path!())
        .verbosity(config.log_verbosity)
        .init()
        .expect("Failed to initialize logging");

    let daemon = Daemon::new(config).expect("Failed to load the component registry");

    if let Err(e) = daemon.run().await {
        error!("ambient2mqtt stopped: {e}");
        std::process::exit(1);
    }
}
