//! Client configuration types.

use std::time::Duration;

use tinymq_core::packet::Will;
use tinymq_core::property::PropertyList;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client identifier.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// MQTT protocol version (4 = 3.1.1, 5 = 5.0).
    pub protocol_version: u8,
    /// Last will and testament.
    pub will: Option<Will>,
    /// MQTT v5 CONNECT properties.
    pub connect_properties: Option<PropertyList>,
    /// Timeout for the CONNECT/CONNACK handshake.
    pub connect_timeout: Duration,
    /// Timeout for each acknowledgment wait.
    pub command_timeout: Duration,
    /// Receive buffer size; larger PUBLISH payloads are delivered in
    /// chunks.
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            protocol_version: 4, // MQTT 3.1.1
            will: None,
            connect_properties: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            read_buffer_size: 8192,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Use MQTT 5.0 protocol.
    pub fn mqtt5(mut self) -> Self {
        self.protocol_version = 5;
        self
    }

    /// Set the last will message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set MQTT v5 CONNECT properties.
    pub fn connect_properties(mut self, properties: PropertyList) -> Self {
        self.connect_properties = Some(properties);
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-acknowledgment timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the receive buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}
