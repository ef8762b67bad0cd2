use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "energymon-exporter",
    about = "Shelly Pro 3EM MQTT status to Prometheus metrics bridge"
)]
pub struct Config {
    /// Power meter identifier, as used in its MQTT topic prefix
    #[arg(long, default_value = "08f9e0e957c8")]
    pub device_id: String,

    /// Device class prefix of the MQTT topics
    #[arg(long, default_value = "shellypro3em")]
    pub device_class: String,

    /// MQTT broker hostname
    #[arg(long, default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client ID (clean session, so the subscription lives as long as the process)
    #[arg(long, default_value = "energy-meter-exporter")]
    pub mqtt_client_id: String,

    /// Subscription filter; everything by default, dispatch happens on exact topics
    #[arg(long, default_value = "#")]
    pub topic_filter: String,

    /// MQTT keep-alive interval in seconds
    #[arg(long, default_value_t = 60)]
    pub keep_alive_secs: u64,

    /// Port to serve Prometheus metrics on
    #[arg(long, default_value_t = 8000)]
    pub metrics_port: u16,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
