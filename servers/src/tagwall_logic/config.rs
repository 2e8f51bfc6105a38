use anyhow::{Context, Result};
use clap::Parser;
use lib_tagwall::HubConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "TagWall live feed relay", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "TAGWALL_PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[arg(long, env = "TAGWALL_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "TAGWALL_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "TAGWALL_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "TAGWALL_STREAM_URL", help = "Upstream filtered live stream WebSocket URL.")]
    pub stream_url: Option<String>,

    #[arg(long, env = "TAGWALL_SEARCH_URL", help = "Upstream search endpoint URL.")]
    pub search_url: Option<String>,

    #[arg(long, env = "TAGWALL_API_TOKEN", help = "Bearer token sent to the upstream stream and search APIs.")]
    pub api_token: Option<String>,

    #[arg(long, env = "TAGWALL_SEARCH_MAX_RETRIES", help = "Retries for transient search failures.")]
    pub search_max_retries: Option<u32>,

    #[arg(long, env = "TAGWALL_FILTER_UPDATE_RATE", help = "Live filter reconnects per second.")]
    pub filter_update_rate: Option<f64>,

    #[arg(long, env = "TAGWALL_FILTER_DEBOUNCE_MS", help = "Debounce window for filter updates, in milliseconds.")]
    pub filter_debounce_ms: Option<u64>,

    #[arg(long, env = "TAGWALL_FILTER_RECHECK_SECS", help = "Seconds between reconnect attempts while the live stream is down.")]
    pub filter_recheck_secs: Option<u64>,

    #[arg(long, env = "TAGWALL_FALLBACK_POLL_RATE", help = "Fallback searches per second.")]
    pub fallback_poll_rate: Option<f64>,

    #[arg(long, env = "TAGWALL_FALLBACK_POLL_PERIOD_SECS", help = "Seconds between fallback coverage cycles.")]
    pub fallback_poll_period_secs: Option<f64>,

    #[arg(long, env = "TAGWALL_INITIAL_LOAD_RATE", help = "Initial-load searches per second.")]
    pub initial_load_rate: Option<f64>,

    #[arg(long, env = "TAGWALL_MAX_TAGS_PER_QUERY", help = "Tags per fallback query (at most 10).")]
    pub max_tags_per_query: Option<usize>,

    #[arg(long, env = "TAGWALL_SEARCH_MAX_RESULTS", help = "Results requested per search.")]
    pub search_max_results: Option<usize>,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub stream_url: String,
    pub search_url: String,
    pub api_token: Option<String>,
    pub search_max_retries: u32,
    pub hub: HubConfig,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            stream_url: other.stream_url.or(self.stream_url),
            search_url: other.search_url.or(self.search_url),
            api_token: other.api_token.or(self.api_token),
            search_max_retries: other.search_max_retries.or(self.search_max_retries),
            filter_update_rate: other.filter_update_rate.or(self.filter_update_rate),
            filter_debounce_ms: other.filter_debounce_ms.or(self.filter_debounce_ms),
            filter_recheck_secs: other.filter_recheck_secs.or(self.filter_recheck_secs),
            fallback_poll_rate: other.fallback_poll_rate.or(self.fallback_poll_rate),
            fallback_poll_period_secs: other.fallback_poll_period_secs.or(self.fallback_poll_period_secs),
            initial_load_rate: other.initial_load_rate.or(self.initial_load_rate),
            max_tags_per_query: other.max_tags_per_query.or(self.max_tags_per_query),
            search_max_results: other.search_max_results.or(self.search_max_results),
        }
    }

    fn defaults() -> Config {
        let hub = HubConfig::default();
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            search_max_retries: Some(3),
            filter_update_rate: Some(hub.filter_update_rate),
            filter_debounce_ms: Some(hub.filter_debounce_ms),
            filter_recheck_secs: Some(hub.filter_recheck_secs),
            fallback_poll_rate: Some(hub.fallback_poll_rate),
            fallback_poll_period_secs: Some(hub.fallback_poll_period_secs),
            initial_load_rate: Some(hub.initial_load_rate),
            max_tags_per_query: Some(hub.max_tags_per_query),
            search_max_results: Some(hub.search_max_results),
            ..Default::default()
        }
    }

    /// Checks that the upstream endpoints are present and the hub settings
    /// are in range.
    pub fn resolve(self) -> Result<Settings> {
        let hub_defaults = HubConfig::default();
        let hub = HubConfig {
            filter_update_rate: self.filter_update_rate.unwrap_or(hub_defaults.filter_update_rate),
            filter_debounce_ms: self.filter_debounce_ms.unwrap_or(hub_defaults.filter_debounce_ms),
            filter_recheck_secs: self.filter_recheck_secs.unwrap_or(hub_defaults.filter_recheck_secs),
            fallback_poll_rate: self.fallback_poll_rate.unwrap_or(hub_defaults.fallback_poll_rate),
            fallback_poll_period_secs: self
                .fallback_poll_period_secs
                .unwrap_or(hub_defaults.fallback_poll_period_secs),
            initial_load_rate: self.initial_load_rate.unwrap_or(hub_defaults.initial_load_rate),
            max_tags_per_query: self.max_tags_per_query.unwrap_or(hub_defaults.max_tags_per_query),
            search_max_results: self.search_max_results.unwrap_or(hub_defaults.search_max_results),
        };
        hub.validate()?;

        Ok(Settings {
            port: self.port.unwrap_or(9003),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            stream_url: self.stream_url.context("stream URL is not configured")?,
            search_url: self.search_url.context("search URL is not configured")?,
            api_token: self.api_token,
            search_max_retries: self.search_max_retries.unwrap_or(3),
            hub,
        })
    }
}

fn read_file_config(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the JSON config file and `cli` (which already carries
/// environment variables), later layers winning.
pub fn merge_sources(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_tagwall.conf"));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_file_config(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Result<Settings> {
    // .env values become environment variables before clap reads them
    dotenvy::dotenv().ok();
    merge_sources(Config::parse()).resolve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn cli_wins_over_file_and_file_wins_over_defaults() {
        let file = file_with(
            r#"{"port": 7000, "streamUrl": "ws://file/stream", "searchUrl": "http://file/search", "fallbackPollRate": 2.0}"#,
        );
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(8000),
            ..Default::default()
        };

        let settings = merge_sources(cli).resolve().unwrap();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.stream_url, "ws://file/stream");
        assert_eq!(settings.hub.fallback_poll_rate, 2.0);
        assert_eq!(settings.hub.filter_update_rate, 0.3);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let file = file_with("not json");
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            stream_url: Some("ws://cli".to_string()),
            search_url: Some("http://cli".to_string()),
            ..Default::default()
        };
        let settings = merge_sources(cli).resolve().unwrap();
        assert_eq!(settings.port, 9003);
        assert_eq!(settings.hub, HubConfig::default());
    }

    #[test]
    fn missing_upstream_urls_are_an_error() {
        let cli = Config {
            config_path: Some(PathBuf::from("/nonexistent/server_tagwall.conf")),
            ..Default::default()
        };
        assert!(merge_sources(cli).resolve().is_err());
    }

    #[test]
    fn out_of_range_hub_settings_are_rejected() {
        let cli = Config {
            config_path: Some(PathBuf::from("/nonexistent/server_tagwall.conf")),
            stream_url: Some("ws://cli".to_string()),
            search_url: Some("http://cli".to_string()),
            filter_update_rate: Some(0.0),
            ..Default::default()
        };
        assert!(merge_sources(cli).resolve().is_err());
    }
}
