// ABOUTME: Builder-style runtime configuration covering every option in the external-interfaces table.
// ABOUTME: with_*/Default builder idiom: construct via Default then chain setters for the fields that differ.

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("frame_buffer_size {buffer_size} is too small to carry a 3-byte header")]
    FrameTooLarge { buffer_size: usize },
}

/// Runtime configuration for a postmq client or server.
#[derive(Debug, Clone)]
pub struct Config {
    pub ip: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub listener_backlog: u32,
    pub send_and_receive_buffer_size: usize,
    pub send_timeout: Duration,
    pub connection_timeout: Duration,
    pub ping_frequency: Duration,
    pub ping_timeout: Duration,
    pub max_read_write_workers: usize,
    pub require_authentication: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            max_connections: 1000,
            listener_backlog: 100,
            send_and_receive_buffer_size: 16 * 1024,
            send_timeout: Duration::from_millis(5000),
            connection_timeout: Duration::from_millis(60_000),
            ping_frequency: Duration::ZERO,
            ping_timeout: Duration::ZERO,
            max_read_write_workers: 20,
            require_authentication: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, ip: IpAddr, port: u16) -> Self {
        self.ip = ip;
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_listener_backlog(mut self, listener_backlog: u32) -> Self {
        self.listener_backlog = listener_backlog;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.send_and_receive_buffer_size = buffer_size;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_ping_frequency(mut self, frequency: Duration) -> Self {
        self.ping_frequency = frequency;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_max_read_write_workers(mut self, workers: usize) -> Self {
        self.max_read_write_workers = workers;
        self
    }

    pub fn with_require_authentication(mut self, required: bool) -> Self {
        self.require_authentication = required;
        self
    }

    /// `max_frame_data = send_and_receive_buffer_size - 3`: every frame's
    /// 3-byte header must fit inside the buffer alongside its payload.
    pub fn max_frame_data(&self) -> Result<usize, ConfigError> {
        self.send_and_receive_buffer_size
            .checked_sub(3)
            .ok_or(ConfigError::FrameTooLarge {
                buffer_size: self.send_and_receive_buffer_size,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.listener_backlog, 100);
        assert_eq!(config.send_and_receive_buffer_size, 16 * 1024);
        assert_eq!(config.send_timeout, Duration::from_millis(5000));
        assert_eq!(config.connection_timeout, Duration::from_millis(60_000));
        assert_eq!(config.max_read_write_workers, 20);
        assert!(!config.require_authentication);
    }

    #[test]
    fn max_frame_data_subtracts_header_size() {
        let config = Config::default();
        assert_eq!(config.max_frame_data().unwrap(), 16 * 1024 - 3);
    }

    #[test]
    fn tiny_buffer_is_rejected() {
        let config = Config::default().with_buffer_size(2);
        assert!(matches!(
            config.max_frame_data(),
            Err(ConfigError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn builder_chain_applies_overrides() {
        let config = Config::new()
            .with_max_connections(5)
            .with_require_authentication(true)
            .with_ping_frequency(Duration::from_secs(30));
        assert_eq!(config.max_connections, 5);
        assert!(config.require_authentication);
        assert_eq!(config.ping_frequency, Duration::from_secs(30));
    }
}
