use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the log output.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Controls how the lock on a single entry is taken.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long one acquisition round keeps polling before the lock counts
    /// as contended.
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
    /// Pause between polls within a round.
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,
    /// Age after which a lock of a dead holder may be broken.
    #[serde(with = "humantime_serde")]
    pub stale: Duration,
    /// Number of further rounds after the first one.
    pub retries: u32,
    /// Pause between rounds.
    #[serde(with = "humantime_serde")]
    pub retry_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        // Checks the lock at 0ms, 50ms, ... up to 400ms per round, with
        // 600ms between rounds; all rounds together span roughly 10 seconds,
        // which is also how long an untouched lock stays credible.
        LockConfig {
            wait: Duration::from_millis(400),
            poll_period: Duration::from_millis(50),
            stale: Duration::from_secs(10),
            retries: 10,
            retry_wait: Duration::from_millis(600),
        }
    }
}

/// Controls the on-disk store.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory all entries live under. Created on first use.
    pub path: PathBuf,
    /// How long a written entry stays alive unless overridden per write.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Whether entries are sharded into subdirectories by digest prefix.
    ///
    /// Keeps directories small when the store holds many entries.
    pub subdirs: bool,
    /// Whether record and payload files are compressed on disk.
    pub zip: bool,
    /// Lock acquisition schedule.
    pub lock: LockConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: PathBuf::from("./cache"),
            ttl: Duration::from_secs(3600),
            subdirs: true,
            zip: false,
            lock: LockConfig::default(),
        }
    }
}

/// Controls the job scheduler.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at the same time.
    pub parallelism: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { parallelism: 4 }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store settings.
    pub store: StoreConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Logging settings.
    pub logging: Logging,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        // check for empty files explicitly
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
