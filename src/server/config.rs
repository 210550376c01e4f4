use super::RequestsLoggingLevel;

/// Listener settings for the API and the Prometheus endpoint.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
    pub port: u16,
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            requests_logging_level: RequestsLoggingLevel::default(),
            port: 3002,
            metrics_port: 9092,
        }
    }
}
