//! relay 运行时

use courier_config::{CourierConfig, TelemetryConfig};
use courier_telemetry::init_from_config;
use tracing::{info, warn};

/// 生产环境总是输出 JSON 日志
fn telemetry_config(config: &CourierConfig) -> TelemetryConfig {
    TelemetryConfig {
        json: config.telemetry.json || config.is_production(),
        ..config.telemetry.clone()
    }
}

/// 初始化日志
pub fn init_runtime(config: &CourierConfig) {
    init_from_config(&telemetry_config(config));

    info!(
        app_name = %config.app_name,
        app_env = %config.app_env,
        "Runtime initialized"
    );
}

/// 等待关闭信号
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_config::BrokerSettings;
    use std::collections::HashMap;

    fn config(app_env: &str, json: bool) -> CourierConfig {
        CourierConfig {
            app_name: "courier-relay".to_string(),
            app_env: app_env.to_string(),
            broker: BrokerSettings {
                addresses: vec!["x:9092".to_string()],
                client_id: None,
                queue_capacity: None,
                close_timeout_ms: None,
                connect_timeout_ms: None,
                security_protocol: None,
                sasl: None,
                extra: HashMap::new(),
            },
            telemetry: TelemetryConfig {
                log_level: "debug".to_string(),
                json,
            },
            channels: Vec::new(),
        }
    }

    #[test]
    fn test_production_forces_json_logs() {
        let telemetry = telemetry_config(&config("production", false));
        assert!(telemetry.json);
        assert_eq!(telemetry.log_level, "debug");

        assert!(!telemetry_config(&config("development", false)).json);
        assert!(telemetry_config(&config("development", true)).json);
    }
}
