use std::path::Path;

use anyhow::Context;

use crate::{Config, StorageConfig};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read configuration from {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| format!("Failed to parse configuration in {}", path.display()))?;

    config.validate()?;

    for warning in warnings(&config) {
        log::warn!("{warning}");
    }

    Ok(config)
}

fn warnings(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();

    if matches!(config.throttle.storage, StorageConfig::Memory) {
        warnings.push(
            "Throttle counters are kept in process memory and are not shared between server instances".to_string(),
        );
    }

    if config.server.trust_forwarded_headers {
        warnings.push(
            "Client keys are taken from X-Forwarded-For/X-Real-IP; clients can spoof these unless a proxy overwrites them"
                .to_string(),
        );
    }

    warnings
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use indoc::indoc;

    use crate::Config;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_valid_file() {
        let file = write_config(indoc! {r#"
            [throttle]
            max_requests_per_interval = 1
            interval = "10s"

            [throttle.storage]
            type = "memory"
        "#});

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.throttle.max_requests_per_interval, 1);
        assert_eq!(config.throttle.interval, Duration::from_secs(10));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let file = write_config(indoc! {r#"
            [throttle]
            interval = "0s"
        "#});

        let error = Config::load(file.path()).unwrap_err();

        insta::assert_snapshot!(error.to_string(), @"interval must be at least one second, got 0ns");
    }

    #[test]
    fn load_missing_file() {
        let error = Config::load("/definitely/not/here/rethrottle.toml").unwrap_err();

        assert!(error.to_string().starts_with("Failed to read configuration"));
    }

    #[test]
    fn memory_storage_warns() {
        let config: Config = toml::from_str(indoc! {r#"
            [throttle.storage]
            type = "memory"
        "#})
        .unwrap();

        insta::assert_debug_snapshot!(super::warnings(&config), @r#"
        [
            "Throttle counters are kept in process memory and are not shared between server instances",
        ]
        "#);
    }
}
