//! config -- server settings.
//!
//! Nothing here is read from a file. The binary fills this in
//! from command line options; everything else uses the defaults.
//
use std::time::Duration;

/// Settings shared read-only by every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline for each read step. Not retried.
    pub read_timeout: Duration,
    /// Total PARAMS content accepted for one request.
    pub max_params_bytes: usize,
    /// Total body accepted for one request, STDIN and extended stdin combined.
    pub max_body_bytes: usize,
    /// Largest single raw read while draining an extended stdin stream.
    pub xstdin_chunk_size: usize,
    /// Switch to this user after the listener is bound.
    pub run_as_user: Option<String>,
}

impl ServerConfig {
    /// Every read step gets this long.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Override the read timeout.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Override the user to run as.
    pub fn with_run_as_user(mut self, user: Option<String>) -> Self {
        self.run_as_user = user;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            max_params_bytes: 1_048_576, // 1 MiB
            max_body_bytes: 33_554_432,  // 32 MiB
            xstdin_chunk_size: 65_536,
            run_as_user: None,
        }
    }
}

#[test]
fn config_defaults() {
    let config = ServerConfig::default();
    assert_eq!(config.read_timeout, Duration::from_secs(5));
    assert!(config.run_as_user.is_none());
    let config = config
        .with_read_timeout(Duration::from_millis(250))
        .with_run_as_user(Some("www-data".to_string()));
    assert_eq!(config.read_timeout, Duration::from_millis(250));
    assert_eq!(config.run_as_user.as_deref(), Some("www-data"));
}
