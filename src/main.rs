//! Command-line front end for the MQTT facade
//!
//! ```bash
//! # Print every message on the configured topics (plus extra ones)
//! mqtt-facade --broker tcp://127.0.0.1:1883 listen -t a -t b
//!
//! # Fire-and-forget publish
//! mqtt-facade --broker tcp://127.0.0.1:1883 publish --topic b --message hello
//!
//! # Validate a configuration file
//! mqtt-facade --config mqtt-facade.toml config --show
//! ```

use clap::{Parser, Subcommand};
use mqtt_facade::config::FacadeConfig;
use mqtt_facade::lifecycle_span;
use mqtt_facade::observability::LoggingOptions;
use mqtt_facade::transport::mqtt::{ClientConfig, ClientContext, MessageHandler, MqttClient};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, Instrument, Level};

/// Connection-lifecycle facade over an MQTT broker
#[derive(Parser)]
#[command(name = "mqtt-facade")]
#[command(about = "Connect, subscribe and publish through a single MQTT connection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URI, overrides the configuration file
    #[arg(short, long, env = "MQTT_BROKER_URL")]
    broker: Option<String>,

    /// Sets log level to debug
    #[arg(long)]
    debug: bool,

    /// Human-friendly log output (slower)
    #[arg(long)]
    human: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print received messages until Ctrl-C
    Listen {
        /// Additional topic (repeatable)
        #[arg(short, long = "topic")]
        topics: Vec<String>,
    },
    /// Publish one message at QoS 0
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        message: String,
        /// Time to let the publish drain before disconnecting
        #[arg(long, default_value_t = 250)]
        linger_ms: u64,
    },
    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingOptions::from_env(Level::WARN)
        .with_flags(cli.debug, cli.human)
        .init();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { topics } => run_listen(config, topics).await,
        Commands::Publish {
            topic,
            message,
            linger_ms,
        } => run_publish(config, topic, message, linger_ms).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<FacadeConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            FacadeConfig::load_from_file(path)?
        }
        None => {
            let default_paths = ["mqtt-facade.toml", "config/mqtt-facade.toml"];
            let found = default_paths
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists());

            match (found, &cli.broker) {
                (Some(path), _) => {
                    info!("Loading configuration from: {}", path.display());
                    FacadeConfig::load_from_file(&path)?
                }
                (None, Some(broker)) => FacadeConfig::with_broker(broker.clone()),
                (None, None) => {
                    return Err(
                        "no configuration file found; pass --config or --broker".into(),
                    )
                }
            }
        }
    };

    if let Some(broker) = &cli.broker {
        config.mqtt.broker_url = broker.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_client(
    config: &FacadeConfig,
    handler: Arc<dyn MessageHandler>,
    topics: Vec<String>,
) -> MqttClient {
    let mut client_config = ClientConfig::new(config.mqtt.broker_url.clone(), handler);
    config.mqtt.apply_to(&mut client_config);
    MqttClient::with_config(client_config, topics)
}

fn print_message(_ctx: &ClientContext, topic: &str, payload: &[u8]) {
    let line = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "topic": topic,
        "payload": String::from_utf8_lossy(payload),
    });
    println!("{line}");
}

async fn run_listen(
    config: FacadeConfig,
    extra_topics: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut topics = config.mqtt.topics.clone();
    topics.extend(extra_topics);
    if topics.is_empty() {
        return Err("no topics to listen on; configure topics or pass --topic".into());
    }

    let mut client = build_client(&config, Arc::new(print_message), topics);
    let span = lifecycle_span!(command = "listen", client_id = %client.client_id());

    async {
        client.start().await?;
        for report in client.startup_subscriptions() {
            if let Err(reason) = &report.outcome {
                error!(topic = %report.topic, reason = %reason, "Not listening on topic");
            }
        }
        info!("Listening, press Ctrl-C to stop");

        signal::ctrl_c().await?;
        info!("Shutdown signal received");
        client.destroy().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    }
    .instrument(span)
    .await
}

async fn run_publish(
    config: FacadeConfig,
    topic: String,
    message: String,
    linger_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    // Publishing only; configured topics are not subscribed
    let mut client = build_client(&config, Arc::new(print_message), Vec::new());
    let span = lifecycle_span!(command = "publish", client_id = %client.client_id());

    async {
        client.start().await?;
        client.publish(message.into_bytes(), &topic)?;
        sleep(Duration::from_millis(linger_ms)).await;
        client.destroy().await;
        info!(topic = %topic, "Message handed to broker connection");
        Ok::<(), Box<dyn std::error::Error>>(())
    }
    .instrument(span)
    .await
}

fn handle_config_command(
    config: &FacadeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}
