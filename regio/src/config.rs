//! The server configuration file.

use std::fs;
use std::path::Path;

use regio_core::SchedulerConfig;
use regio_core::error::ConfigError;
use serde::Deserialize;

const DEFAULT_CONFIG: &str = include_str!("../../package-content/regio_config.json5");

/// Where the server looks for its configuration, relative to the working directory.
pub const CONFIG_PATH: &str = "regio_config.json5";

/// Everything read from `regio_config.json5`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegioConfig {
    /// Default `tracing` filter directive. `RUST_LOG` takes precedence.
    pub log_filter: String,
    /// Radius in columns of the area kept loaded around the origin.
    pub spawn_radius: i32,
    /// Scheduler tunables.
    pub scheduler: SchedulerConfig,
}

impl Default for RegioConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_owned(),
            spawn_radius: 2,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RegioConfig {
    /// Reads the configuration at `path`, writing the bundled default there first if it is
    /// missing.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            Self::parse(&fs::read_to_string(path)?)?
        } else {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, DEFAULT_CONFIG)?;
            Self::parse(DEFAULT_CONFIG)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses json5 text. Missing keys take their defaults.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        serde_json5::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks the server settings and the scheduler settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=32).contains(&self.spawn_radius) {
            return Err(ConfigError::Invalid("spawn_radius must be in 0..=32"));
        }
        self.scheduler.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::process;

    use super::*;

    #[test]
    fn test_bundled_config_matches_defaults() {
        let bundled = RegioConfig::parse(DEFAULT_CONFIG).expect("bundled config parses");
        let defaults = RegioConfig::default();
        assert_eq!(bundled.log_filter, defaults.log_filter);
        assert_eq!(bundled.spawn_radius, defaults.spawn_radius);
        assert_eq!(bundled.scheduler.tick_rate, defaults.scheduler.tick_rate);
        assert_eq!(bundled.scheduler.merge_ticks, defaults.scheduler.merge_ticks);
        assert_eq!(
            bundled.scheduler.max_entity_task_attempts,
            defaults.scheduler.max_entity_task_attempts
        );
        assert!(bundled.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = env::temp_dir().join(format!("regio-config-{}", process::id()));
        let path = dir.join("nested").join(CONFIG_PATH);
        let _ = fs::remove_dir_all(&dir);

        let config = RegioConfig::load_or_create(&path).expect("default config loads");
        assert_eq!(config.spawn_radius, 2);
        assert_eq!(fs::read_to_string(&path).expect("written"), DEFAULT_CONFIG);

        fs::write(&path, "{ spawn_radius: 0, scheduler: { tick_rate: 10 } }").expect("rewritten");
        let config = RegioConfig::load_or_create(&path).expect("edited config loads");
        assert_eq!(config.spawn_radius, 0);
        assert_eq!(config.scheduler.tick_rate, 10);
        assert_eq!(config.scheduler.section_shift, 4);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let config = RegioConfig::parse("{ spawn_radius: 99 }").expect("parses");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = RegioConfig::parse("{ scheduler: { buffer_radius: 3, merge_radius: 2 } }")
            .expect("parses");
        assert!(config.validate().is_err());

        assert!(matches!(
            RegioConfig::parse("{ spawn_radius: "),
            Err(ConfigError::Parse(_))
        ));
    }
}
