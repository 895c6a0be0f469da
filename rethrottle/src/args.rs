use std::{borrow::Cow, fmt, io::IsTerminal, net::SocketAddr, path::PathBuf, str::FromStr};

use clap::{Parser, ValueEnum};
use config::Config;
use logforth::filter::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rethrottle", version, long_about = concat!("rethrottle v", env!("CARGO_PKG_VERSION"), ", a per-client request throttle"))]
pub struct Args {
    /// IP address on which the server will listen for incoming connections.
    /// Default: 127.0.0.1:3000
    #[arg(short, long, env = "RETHROTTLE_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,
    /// Path to the TOML configuration file
    #[arg(long, short, env = "RETHROTTLE_CONFIG_PATH", default_value = "./rethrottle.toml")]
    pub config: PathBuf,
    /// Set the logging level of the rethrottle crates. Everything else logs warnings and up.
    #[arg(long = "log", env = "RETHROTTLE_LOG", default_value_t = LogLevel::default())]
    pub log_level: LogLevel,
    /// Set the style of log output
    #[arg(long, env = "RETHROTTLE_LOG_STYLE", default_value_t = LogStyle::default())]
    pub log_style: LogStyle,
}

impl Args {
    /// Load the configuration file, or the defaults when there is none.
    pub fn config(&self) -> anyhow::Result<Config> {
        let config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            log::info!("No configuration at {}, using defaults", self.config.display());
            Config::default()
        };

        Ok(config)
    }
}

/// Output format of the logger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogStyle {
    /// Colorized text, the default on a terminal
    Color,
    /// Plain text, the default otherwise
    Text,
    /// One JSON object per line
    Json,
}

impl Default for LogStyle {
    fn default() -> Self {
        if std::io::stdout().is_terminal() {
            LogStyle::Color
        } else {
            LogStyle::Text
        }
    }
}

/// Verbosity of the rethrottle crates.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogLevel {
    /// Disable logging
    Off,
    /// Store failures and startup errors
    Error,
    /// Also refused Redis settings and risky configuration
    Warn,
    /// Also the listen address and shutdown
    #[default]
    Info,
    /// Also every throttling decision
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    /// Filter applying this level to the workspace crates and `warn` to everything else.
    pub fn env_filter(self) -> anyhow::Result<EnvFilter> {
        let filter = match self {
            LogLevel::Off => Cow::Borrowed("off"),
            level => Cow::Owned(
                WORKSPACE_CRATES
                    .iter()
                    .fold(String::from("warn"), |filter, krate| format!("{filter},{krate}={level}")),
            ),
        };

        EnvFilter::from_str(&filter).map_err(|e| anyhow::anyhow!("Invalid log filter {filter}: {e}"))
    }
}

const WORKSPACE_CRATES: [&str; 4] = ["rethrottle", "server", "throttle", "config"];

impl fmt::Display for LogStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(*self, f)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(*self, f)
    }
}

/// Display a value the way it is spelled on the command line.
fn write_value(value: impl ValueEnum, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value.to_possible_value() {
        Some(possible) => f.write_str(possible.get_name()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["rethrottle"]).unwrap();

        assert_eq!(args.listen_address, None);
        assert_eq!(args.config, PathBuf::from("./rethrottle.toml"));
        assert_eq!(args.log_level, LogLevel::Info);
    }

    #[test]
    fn flags() {
        let args = Args::try_parse_from([
            "rethrottle",
            "--listen-address",
            "0.0.0.0:8080",
            "--config",
            "/etc/rethrottle.toml",
            "--log",
            "debug",
            "--log-style",
            "json",
        ])
        .unwrap();

        assert_eq!(args.listen_address, Some("0.0.0.0:8080".parse().unwrap()));
        assert_eq!(args.config, PathBuf::from("/etc/rethrottle.toml"));
        assert_eq!(args.log_level, LogLevel::Debug);
        assert_eq!(args.log_style, LogStyle::Json);
    }

    #[test]
    fn values_display_as_spelled_on_the_command_line() {
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LogStyle::Json.to_string(), "json");
    }

    #[test]
    fn every_level_builds_a_filter() {
        for level in LogLevel::value_variants() {
            assert!(level.env_filter().is_ok(), "{level}");
        }
    }
}
