use anyhow::{bail, Context, Result};
use clap::Parser;
use lib_feedwatch::{FilterSpec, OperationKind, TargetDescriptor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::console::OutputFormat;

/// One channel entry from the config file's `targets` list.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub channel: String,
    pub uri: String,
    pub database: String,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "MongoDB change feed watcher", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FEEDWATCH_URI", help = "MongoDB connection string to watch.")]
    pub uri: Option<String>,

    #[clap(long, env = "FEEDWATCH_DATABASE", help = "Database whose changes are watched.")]
    pub database: Option<String>,

    #[clap(long, env = "FEEDWATCH_CHANNEL", help = "Channel id for the uri/database pair.")]
    pub channel: Option<String>,

    /// Extra channels. Only settable from the config file.
    #[clap(skip)]
    pub targets: Option<Vec<ChannelTarget>>,

    #[clap(long, env = "FEEDWATCH_OPERATIONS", help = "Comma-separated operation kinds to show (insert,update,...).")]
    pub operations: Option<String>,

    #[clap(long, env = "FEEDWATCH_COLLECTIONS", help = "Comma-separated collection names to show.")]
    pub collections: Option<String>,

    #[clap(long, env = "FEEDWATCH_DOCUMENT_KEY", help = "Only show events for this document key.")]
    pub document_key: Option<String>,

    #[clap(long, env = "FEEDWATCH_TIMEZONE_OFFSET", allow_negative_numbers = true, help = "Hours added to UTC when printing timestamps.")]
    pub timezone_offset: Option<f64>,

    #[clap(long, env = "FEEDWATCH_FORMAT", help = "Output format: table or json.")]
    pub format: Option<String>,

    #[clap(long, env = "FEEDWATCH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FEEDWATCH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FEEDWATCH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FEEDWATCH_SERVER_SELECTION_TIMEOUT_MS", help = "Milliseconds to wait for a usable server when opening a feed.")]
    pub server_selection_timeout_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            uri: other.uri.or(self.uri),
            database: other.database.or(self.database),
            channel: other.channel.or(self.channel),
            targets: other.targets.or(self.targets),
            operations: other.operations.or(self.operations),
            collections: other.collections.or(self.collections),
            document_key: other.document_key.or(self.document_key),
            timezone_offset: other.timezone_offset.or(self.timezone_offset),
            format: other.format.or(self.format),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            server_selection_timeout_ms: other.server_selection_timeout_ms.or(self.server_selection_timeout_ms),
        }
    }

    fn defaults() -> Config {
        Config {
            channel: Some("feedwatch-1".to_string()),
            timezone_offset: Some(0.0),
            format: Some("table".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            server_selection_timeout_ms: Some(5000),
            ..Default::default()
        }
    }

    /// Every channel to subscribe, file `targets` first, then the uri/database pair.
    pub fn channel_targets(&self) -> Result<Vec<(String, TargetDescriptor)>> {
        let mut out: Vec<(String, TargetDescriptor)> = self
            .targets
            .iter()
            .flatten()
            .map(|t| (t.channel.clone(), TargetDescriptor::new(t.uri.clone(), t.database.clone())))
            .collect();

        match (&self.uri, &self.database) {
            (Some(uri), Some(database)) => {
                let channel = self.channel.clone().unwrap_or_else(|| "feedwatch-1".to_string());
                out.push((channel, TargetDescriptor::new(uri.clone(), database.clone())));
            }
            (Some(_), None) => bail!("--uri given without --database"),
            (None, Some(_)) => bail!("--database given without --uri"),
            (None, None) => {}
        }

        if out.is_empty() {
            bail!("nothing to watch: set --uri and --database, or list targets in the config file");
        }
        Ok(out)
    }

    /// The display filter built from `operations`, `collections` and `document_key`.
    pub fn filter_spec(&self) -> Result<FilterSpec> {
        let mut kinds = Vec::new();
        for name in split_list(self.operations.as_deref()) {
            let kind: OperationKind = name
                .to_lowercase()
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid --operations")?;
            kinds.push(kind);
        }

        let mut spec = FilterSpec::new()
            .with_operations(kinds)
            .with_collections(split_list(self.collections.as_deref()));
        if let Some(key) = &self.document_key {
            spec = spec.with_document_key(key.trim());
        }
        Ok(spec)
    }

    pub fn output_format(&self) -> Result<OutputFormat> {
        self.format.as_deref().unwrap_or("table").parse().map_err(anyhow::Error::msg)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms.unwrap_or(5000))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Reads the JSON config file. A missing or broken file yields `None`.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Config>(&raw) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Defaults, then the config file, then env/CLI values in `cli`.
pub fn resolve_config(cli: Config) -> Config {
    let mut current_config = Config::defaults();

    let config_file_path = cli.config_path.clone().unwrap_or_else(default_config_path);
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    current_config.merge(cli)
}

/// `server_feedwatch.conf` in the working directory, else in the user config dir.
fn default_config_path() -> PathBuf {
    let local = PathBuf::from("server_feedwatch.conf");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("feedwatch").join("server_feedwatch.conf"))
        .filter(|path| path.exists())
        .unwrap_or(local)
}

pub fn load_config() -> Config {
    // clap::Parser handles env vars and CLI args together.
    resolve_config(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli_with_file(path: &Path) -> Config {
        Config {
            config_path: Some(path.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = resolve_config(cli_with_file(&dir.path().join("missing.conf")));
        assert_eq!(config.channel.as_deref(), Some("feedwatch-1"));
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.server_selection_timeout(), Duration::from_secs(5));
        assert_eq!(config.output_format().unwrap(), OutputFormat::Table);
        assert!(config.channel_targets().is_err());
    }

    #[test]
    fn file_values_are_overridden_by_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "uri": "mongodb://file-host",
                "database": "shop",
                "logLevel": "debug",
                "timezoneOffset": 5.5,
                "targets": [{{"channel": "audit", "uri": "mongodb://audit-host", "database": "audit"}}]
            }}"#
        )
        .unwrap();

        let mut cli = cli_with_file(file.path());
        cli.database = Some("inventory".to_string());
        let config = resolve_config(cli);

        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.timezone_offset, Some(5.5));
        let targets = config.channel_targets().unwrap();
        assert_eq!(
            targets,
            vec![
                ("audit".to_string(), TargetDescriptor::new("mongodb://audit-host", "audit")),
                ("feedwatch-1".to_string(), TargetDescriptor::new("mongodb://file-host", "inventory")),
            ]
        );
    }

    #[test]
    fn broken_file_is_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let config = resolve_config(cli_with_file(file.path()));
        assert_eq!(config.format.as_deref(), Some("table"));
    }

    #[test]
    fn half_a_target_is_an_error() {
        let config = Config {
            uri: Some("mongodb://x".to_string()),
            ..Default::default()
        };
        assert!(config.channel_targets().is_err());
    }

    #[test]
    fn filter_lists_are_parsed() {
        let config = Config {
            operations: Some("insert, Update".to_string()),
            collections: Some("orders,,users".to_string()),
            document_key: Some("  ".to_string()),
            ..Default::default()
        };
        let spec = config.filter_spec().unwrap();
        assert_eq!(spec.operation_kinds.len(), 2);
        assert!(spec.operation_kinds.contains(&OperationKind::Update));
        assert_eq!(spec.collection_names.len(), 2);
        assert_eq!(spec.document_key(), None);

        let bad = Config {
            operations: Some("upsert".to_string()),
            ..Default::default()
        };
        assert!(bad.filter_spec().is_err());
    }
}
