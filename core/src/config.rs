use serde::Deserialize;
use std::time::Duration;

/// Frames larger than this are rejected by both the decoder and the encoder.
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Client-side settings.
///
/// Every field has a default, so a config file only needs the keys it overrides.
/// Durations use serde's `{ secs, nanos }` form.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Per-call timeout, applied when the caller does not give one.
    pub call_timeout: Duration,
    /// Socket write timeout
    pub write_timeout: Duration,
    /// Ping period of the heartbeat scheduler.
    pub heartbeat_interval: Duration,
    /// Ping timeouts tolerated in a row before the heartbeat forces a reconnect.
    pub max_timeout_retry: usize,
    /// Reconnect in background when the connection breaks on write.
    pub auto_reconnect: bool,
    /// Spin iterations before a blocking call parks on its condvar.
    pub spin_count: usize,
    pub max_frame_len: usize,
    /// Read/write buffer size of the transport.
    pub stream_buf_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            max_timeout_retry: 3,
            auto_reconnect: true,
            spin_count: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stream_buf_size: 8 * 1024,
        }
    }
}

/// Server-side settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// socket read timeout, applied once a frame has started to arrive
    pub read_timeout: Duration,
    /// Socket write timeout
    pub write_timeout: Duration,
    /// Socket idle time to be close.
    pub idle_timeout: Duration,
    /// wait for all connections to be close with a timeout
    pub server_close_wait: Duration,
    pub max_frame_len: usize,
    pub stream_buf_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            server_close_wait: Duration::from_secs(90),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stream_buf_size: 8 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"spin_count": 100, "auto_reconnect": false}"#)
                .expect("parse");
        assert_eq!(config.spin_count, 100);
        assert!(!config.auto_reconnect);
        assert_eq!(config.max_timeout_retry, 3);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);

        let config: ServerConfig =
            serde_json::from_str(r#"{"idle_timeout": {"secs": 3, "nanos": 0}}"#).expect("parse");
        assert_eq!(config.idle_timeout, Duration::from_secs(3));
        assert_eq!(config.read_timeout, Duration::from_secs(5));
    }
}
