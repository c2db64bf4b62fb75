//! Courier Relay - 订阅配置中的频道，把收到的消息写入日志
//!
//! 配置目录默认为 `config`，可通过第一个命令行参数指定

mod runtime;

use std::sync::Arc;

use courier_adapter_kafka::{KafkaBroker, KafkaOptions};
use courier_config::{ConfigError, CourierConfig};
use courier_errors::BrokerError;
use courier_ports::{Close, Handler, MessageBroker};
use courier_telemetry::TelemetryError;
use thiserror::Error;
use tracing::{error, info};

use runtime::{init_runtime, shutdown_signal};

#[derive(Debug, Error)]
enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

fn log_handler(channel: String) -> Handler {
    Arc::new(move |payload: &[u8]| {
        info!(
            channel = %channel,
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(payload),
            "Message received"
        );
    })
}

async fn run(config_dir: &str) -> Result<(), RelayError> {
    let config = CourierConfig::load(config_dir)?;
    init_runtime(&config);
    let metrics = courier_telemetry::init_metrics()?;

    let options = KafkaOptions::from_settings(&config.broker)?
        .with_error_sink(|err: &BrokerError| error!(kind = err.kind(), error = %err, "Broker error"));
    let broker = KafkaBroker::new(options);
    info!(broker = %broker.identify(), "Starting broker");
    broker.start().await?;

    let subscriptions: Vec<Close> = config
        .channels
        .iter()
        .map(|channel| broker.listen(channel.as_bytes(), log_handler(channel.clone())))
        .collect();
    info!(channels = ?config.channels, "Relay running");

    shutdown_signal().await;

    for close in &subscriptions {
        close.close();
    }
    broker.stop().await?;
    info!(metrics = %metrics.render(), "Relay stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let config_dir = std::env::args().nth(1).unwrap_or_else(|| "config".to_string());

    if let Err(e) = run(&config_dir).await {
        eprintln!("courier-relay: {e}");
        std::process::exit(1);
    }
}
