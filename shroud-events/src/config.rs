use std::{path::Path, time::Duration};

use config::{Config as RustConfig, ConfigError};
use serde::{Deserialize, Serialize};

use crate::events::ResultEvent;

/// Default time a caller waits for a computation result
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for the result channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ShroudEventsConfig {
    /// Capacity of the channel feeding the dispatcher; unbounded when absent
    event_channel_capacity: Option<usize>,

    /// How long a single-shot subscription waits before reporting
    /// `ChannelTimeout`
    result_timeout: Duration,
}

impl ShroudEventsConfig {
    /// Getter for `event_channel_capacity`
    #[must_use]
    pub const fn event_channel_capacity(&self) -> Option<usize> {
        self.event_channel_capacity
    }

    /// Getter for `result_timeout`
    #[must_use]
    pub const fn result_timeout(&self) -> Duration {
        self.result_timeout
    }

    /// Creates the channel that feeds a `ResultEventSubscriber`, bounded
    /// when a capacity is configured
    #[must_use]
    pub fn channel(&self) -> (flume::Sender<ResultEvent>, flume::Receiver<ResultEvent>) {
        match self.event_channel_capacity {
            Some(capacity) => flume::bounded(capacity),
            None => flume::unbounded(),
        }
    }

    /// Loads the `shroud_events` section from a configuration file.
    ///
    /// Values can be overridden with `SHROUD_EVENTS__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the section is
    /// missing or malformed.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let builder = RustConfig::builder()
            .add_source(config::File::from(config_file_path.as_ref()))
            .add_source(
                config::Environment::with_prefix("SHROUD_EVENTS")
                    .keep_prefix(true)
                    .separator("__"),
            );

        builder.build()?.get::<Self>("shroud_events")
    }
}

impl Default for ShroudEventsConfig {
    fn default() -> Self {
        Builder::new().build()
    }
}

/// Builder for [`ShroudEventsConfig`]
///
/// # Example
///
/// ```rust,ignore
/// let config = Builder::new()
///     .event_channel_capacity(Some(1024))
///     .result_timeout(Duration::from_secs(30))
///     .build();
/// ```
pub struct Builder {
    event_channel_capacity: Option<usize>,
    result_timeout: Option<Duration>,
}

impl Builder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            event_channel_capacity: None,
            result_timeout: None,
        }
    }

    #[must_use]
    pub const fn event_channel_capacity(mut self, capacity: Option<usize>) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = Some(timeout);
        self
    }

    /// Builds the final config, falling back to [`DEFAULT_RESULT_TIMEOUT`]
    #[must_use]
    pub fn build(self) -> ShroudEventsConfig {
        ShroudEventsConfig {
            event_channel_capacity: self.event_channel_capacity,
            result_timeout: self.result_timeout.unwrap_or(DEFAULT_RESULT_TIMEOUT),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_config() {
        let config = Builder::new()
            .event_channel_capacity(Some(64))
            .result_timeout(Duration::from_secs(30))
            .build();

        let toml_str = toml::to_string(&config).unwrap();
        let should_be_toml_str =
            "event_channel_capacity = 64\n\n[result_timeout]\nsecs = 30\nnanos = 0\n";
        assert_eq!(toml_str, should_be_toml_str);
    }

    #[test]
    fn test_default_timeout() {
        let config = ShroudEventsConfig::default();
        assert_eq!(config.result_timeout(), DEFAULT_RESULT_TIMEOUT);
        assert!(config.event_channel_capacity().is_none());
    }

    #[test]
    fn test_from_file_path() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[shroud_events]\nevent_channel_capacity = 8\n\n[shroud_events.result_timeout]\nsecs = 2\nnanos = 0"
        )
        .unwrap();

        let config = ShroudEventsConfig::from_file_path(file.path()).unwrap();
        assert_eq!(config.event_channel_capacity(), Some(8));
        assert_eq!(config.result_timeout(), Duration::from_secs(2));

        let (sender, _receiver) = config.channel();
        assert_eq!(sender.capacity(), Some(8));
    }

    #[test]
    fn test_missing_section_is_an_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[other]\nvalue = 1").unwrap();
        assert!(ShroudEventsConfig::from_file_path(file.path()).is_err());
    }
}
