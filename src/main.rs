mod bus;
mod config;
mod decode;
mod dispatch;
mod exporter;
mod metrics;

use anyhow::Result;
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;

fn main() -> Result<()> {
    let config = config::Config::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    info!("Starting energymon-exporter");

    let topics = dispatch::Topics::new(&config.device_class, &config.device_id);
    info!("Listening for EM events on routing key {}", topics.em);
    info!("Listening for EMData events on routing key {}", topics.emdata);

    let registry = Arc::new(metrics::Registry::new());

    info!("Starting Prometheus server on {}", config.metrics_port);
    exporter::start(
        SocketAddr::from(([0, 0, 0, 0], config.metrics_port)),
        Arc::clone(&registry),
    )?;

    info!("Using MQTT broker on {}:{}", config.mqtt_host, config.mqtt_port);
    let subscription = bus::Subscription::bind(&config)?;

    let dispatcher = dispatch::Dispatcher::new(topics, registry);
    let tally = dispatcher.consume(subscription);
    info!("Message stream ended after {:?}", tally);

    anyhow::bail!("MQTT event loop closed")
}
