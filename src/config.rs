use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use thiserror::Error;

/// Tuning knobs for a collection cycle. All durations are serialized as
/// milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Buffer capacity of the message bus channel
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Floor wait: every responder gets at least this long to declare intent
    #[serde(default = "default_min_wait", with = "duration_ms")]
    pub min_wait: Duration,

    /// Hard ceiling on the whole collection
    #[serde(default = "default_max_wait", with = "duration_ms")]
    pub max_wait: Duration,

    /// Poll slice of the wait loop; bounds how quickly a late registration
    /// extending the deadline is noticed
    #[serde(default = "default_poll_interval", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            min_wait: default_min_wait(),
            max_wait: default_max_wait(),
            poll_interval: default_poll_interval(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    let config = serde_json::from_str(s)?;
    Ok(config)
}

fn default_buffer_size() -> usize {
    1000
}
fn default_min_wait() -> Duration {
    Duration::from_millis(200)
}
fn default_max_wait() -> Duration {
    Duration::from_secs(3)
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
