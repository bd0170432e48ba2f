//! Connection configuration
//!
//! `ConnectionConfig` holds every tunable of a client connection. Build one
//! with `ConnectionBuilder`, which also performs the handshake.

use super::connection::Connection;
use super::error::{Error, Result};
use super::settings::{Settings, SettingsBuilder};
use super::{
    DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};
use crate::http::session::SessionOps;
use std::sync::Arc;
use std::time::Duration;

/// Client connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Receive window advertised per stream and for the connection
    pub initial_window_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS advertised to the peer
    pub max_concurrent_streams: u32,
    /// Largest frame payload accepted from the peer
    pub max_frame_size: u32,
    /// HPACK decoder table size advertised to the peer
    pub header_table_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE advertised to the peer (None = unlimited)
    pub max_response_header_list_size: Option<u32>,
    /// Inactivity limit while waiting for response data (zero disables)
    pub read_timeout: Duration,
    /// Limit on waiting for flow-control credit or the writer (zero disables)
    pub write_timeout: Duration,
    /// How long the handshake waits for the peer's SETTINGS
    pub settings_timeout: Duration,
    /// How long the handshake lingers for the peer's first WINDOW_UPDATE
    pub window_update_wait: Duration,
    /// Drain time given to the writer and to open streams on close
    pub graceful_shutdown: Duration,
    /// Suffix for the reader and writer thread names
    pub name: String,
    /// Idle buffers kept by the buffer pool
    pub pool_max_buffers: usize,
    /// Capacity of freshly allocated pool buffers
    pub pool_default_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_response_header_list_size: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            settings_timeout: Duration::from_secs(10),
            window_update_wait: Duration::from_millis(50),
            graceful_shutdown: Duration::from_secs(1),
            name: "h2".to_string(),
            pool_max_buffers: 64,
            pool_default_buffer_size: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Check ranges the RFC imposes on advertised values
    pub fn validate(&self) -> Result<()> {
        if self.initial_window_size == 0 || self.initial_window_size > MAX_WINDOW_SIZE {
            return Err(Error::Internal(format!(
                "initial window size {} outside 1..=2^31-1",
                self.initial_window_size
            )));
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(Error::Internal(format!(
                "max frame size {} outside 16384..=16777215",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    /// The SETTINGS sent right after the preface
    ///
    /// Push is always disabled.
    pub fn local_settings(&self) -> Result<Settings> {
        let mut builder = SettingsBuilder::new()
            .max_concurrent_streams(self.max_concurrent_streams)
            .initial_window_size(self.initial_window_size)
            .max_frame_size(self.max_frame_size)
            .enable_push(false);
        if self.header_table_size != DEFAULT_HEADER_TABLE_SIZE {
            builder = builder.header_table_size(self.header_table_size);
        }
        if let Some(size) = self.max_response_header_list_size {
            builder = builder.max_header_list_size(size);
        }
        builder.build()
    }
}

/// Builder for client connections
///
/// # Examples
///
/// ```no_run
/// use h2mux::http::h2::ConnectionBuilder;
/// use std::net::TcpStream;
/// use std::time::Duration;
///
/// let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
/// let connection = ConnectionBuilder::new()
///     .read_timeout(Duration::from_secs(5))
///     .name("backend-1")
///     .connect(stream)
///     .unwrap();
/// assert!(connection.is_active());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: ConnectionConfig) -> Self {
        ConnectionBuilder { config }
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.initial_window_size = size;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.header_table_size = size;
        self
    }

    pub fn max_response_header_list_size(mut self, size: u32) -> Self {
        self.config.max_response_header_list_size = Some(size);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn settings_timeout(mut self, timeout: Duration) -> Self {
        self.config.settings_timeout = timeout;
        self
    }

    pub fn window_update_wait(mut self, wait: Duration) -> Self {
        self.config.window_update_wait = wait;
        self
    }

    pub fn graceful_shutdown(mut self, timeout: Duration) -> Self {
        self.config.graceful_shutdown = timeout;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn buffer_pool(mut self, max_buffers: usize, default_buffer_size: usize) -> Self {
        self.config.pool_max_buffers = max_buffers;
        self.config.pool_default_buffer_size = default_buffer_size;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.validate()?;
        self.config.local_settings()?;
        Ok(self.config)
    }

    /// Run the handshake over an established session
    pub fn connect<S: SessionOps>(self, session: S) -> Result<Connection> {
        self.connect_shared(Arc::new(session))
    }

    /// Like `connect`, for a session that is already shared
    pub fn connect_shared(self, session: Arc<dyn SessionOps>) -> Result<Connection> {
        let config = self.build()?;
        Connection::handshake(session, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.initial_window_size, 65535);
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.settings_timeout, Duration::from_secs(10));
        assert_eq!(config.window_update_wait, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_settings() {
        let settings = ConnectionConfig::default().local_settings().unwrap();
        let encoded = settings.encode();
        assert!(encoded.contains(&(0x2, 0)));
        assert!(encoded.contains(&(0x3, 100)));
        assert!(encoded.contains(&(0x4, 65535)));
        assert!(encoded.contains(&(0x5, 16384)));
        assert!(!encoded.iter().any(|(id, _)| *id == 0x1 || *id == 0x6));

        let settings = ConnectionBuilder::new()
            .max_response_header_list_size(8192)
            .header_table_size(0)
            .build()
            .unwrap()
            .local_settings()
            .unwrap();
        let encoded = settings.encode();
        assert!(encoded.contains(&(0x1, 0)));
        assert!(encoded.contains(&(0x6, 8192)));
    }

    #[test]
    fn test_builder_validation() {
        assert!(ConnectionBuilder::new().initial_window_size(0).build().is_err());
        assert!(ConnectionBuilder::new()
            .initial_window_size(MAX_WINDOW_SIZE + 1)
            .build()
            .is_err());
        assert!(ConnectionBuilder::new().max_frame_size(1024).build().is_err());

        let config = ConnectionBuilder::new()
            .initial_window_size(1 << 20)
            .name("backend")
            .buffer_pool(8, 4096)
            .build()
            .unwrap();
        assert_eq!(config.initial_window_size, 1 << 20);
        assert_eq!(config.name, "backend");
        assert_eq!(config.pool_max_buffers, 8);
    }
}
