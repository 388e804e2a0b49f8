// ABOUTME: Settings for both roles, merged from CLI flags, a TOML file and defaults
// ABOUTME: Command-line values win over file values, file values win over defaults

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::expand_home;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_BIND_PORT: u16 = 8144;
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 600;

/// Flags shared by `watch` and `sync`.
#[derive(Args, Debug, Clone, Default)]
pub struct RelayArgs {
    /// Read settings from a TOML file (command-line flags take precedence)
    #[arg(long = "config-file", value_name = "PATH", global = true)]
    pub config_file: Option<PathBuf>,
    /// Address the primary listens on
    #[arg(long, value_name = "ADDR", global = true)]
    pub bind_addr: Option<String>,
    /// Port the primary listens on (default: 8144)
    #[arg(long, value_name = "PORT", global = true)]
    pub bind_port: Option<u16>,
    /// Minimum milliseconds between change checks on the primary (default: 1000)
    #[arg(long, value_name = "MS", global = true)]
    pub sync_interval: Option<u64>,
    /// Don't keep a pristine <db>.orig copy of the replica's first version
    #[arg(long, global = true)]
    pub no_backup: bool,
    /// Serve (watch) or connect (sync) over HTTPS
    #[arg(long, global = true)]
    pub ssl: bool,
    /// PEM private key for --ssl; a self-signed pair is generated if omitted
    #[arg(long, value_name = "PATH", global = true)]
    pub ssl_key_file: Option<PathBuf>,
    /// PEM certificate for --ssl; a self-signed pair is generated if omitted
    #[arg(long, value_name = "PATH", global = true)]
    pub ssl_cert_file: Option<PathBuf>,
    /// Accept any certificate from the primary (self-signed setups)
    #[arg(long, global = true)]
    pub ssl_skip_verify: bool,
    /// Shared secret sent and checked in the Authorization header
    #[arg(
        long,
        value_name = "KEY",
        env = "SQLITE_RELAY_AUTH_KEY",
        hide_env_values = true,
        global = true
    )]
    pub auth_key: Option<String>,
    /// sqlite3 binary to use instead of the one on PATH
    #[arg(long = "sqlite3", value_name = "PATH", global = true)]
    pub sqlite3: Option<PathBuf>,
    /// Seconds before a sqlite3 invocation is killed, 0 to wait forever (default: 600)
    #[arg(long, value_name = "SECS", global = true)]
    pub engine_timeout: Option<u64>,
}

/// On-disk configuration. Every key is optional.
#[derive(Debug, Default, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind_addr: Option<String>,
    pub bind_port: Option<u16>,
    pub sync_interval: Option<u64>,
    pub no_backup: Option<bool>,
    pub use_ssl: Option<bool>,
    pub ssl_key_file: Option<PathBuf>,
    pub ssl_cert_file: Option<PathBuf>,
    pub skip_ssl_verify: Option<bool>,
    pub auth_key: Option<String>,
    pub sync_file: Option<PathBuf>,
    pub remote_conn: Option<String>,
    pub sqlite3: Option<PathBuf>,
    pub engine_timeout: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_home(path);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub sync_file: PathBuf,
    pub remote_conn: Option<String>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub sync_interval: Duration,
    pub no_backup: bool,
    pub use_ssl: bool,
    pub ssl_key_file: Option<PathBuf>,
    pub ssl_cert_file: Option<PathBuf>,
    pub skip_ssl_verify: bool,
    pub auth_key: Option<String>,
    pub sqlite3: Option<PathBuf>,
    /// `None` means no deadline.
    pub engine_timeout: Option<Duration>,
}

impl Settings {
    /// Load the config file named by `args` (if any) and merge.
    pub fn resolve(args: &RelayArgs, db: Option<PathBuf>, remote: Option<String>) -> Result<Self> {
        let file = match &args.config_file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file, db, remote)
    }

    pub fn merge(
        args: &RelayArgs,
        file: FileConfig,
        db: Option<PathBuf>,
        remote: Option<String>,
    ) -> Result<Self> {
        let sync_file = db
            .or(file.sync_file)
            .map(|p| expand_home(&p))
            .ok_or_else(|| anyhow!("No database file given (pass it as an argument or set sync_file)"))?;

        let sync_interval_ms = args
            .sync_interval
            .or(file.sync_interval)
            .unwrap_or(DEFAULT_SYNC_INTERVAL_MS);
        if sync_interval_ms == 0 {
            bail!("sync_interval must be at least 1 millisecond");
        }

        let engine_timeout = match args
            .engine_timeout
            .or(file.engine_timeout)
            .unwrap_or(DEFAULT_ENGINE_TIMEOUT_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            sync_file,
            remote_conn: remote.or(file.remote_conn),
            bind_addr: args
                .bind_addr
                .clone()
                .or(file.bind_addr)
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            bind_port: args.bind_port.or(file.bind_port).unwrap_or(DEFAULT_BIND_PORT),
            sync_interval: Duration::from_millis(sync_interval_ms),
            no_backup: args.no_backup || file.no_backup.unwrap_or(false),
            use_ssl: args.ssl || file.use_ssl.unwrap_or(false),
            ssl_key_file: args
                .ssl_key_file
                .clone()
                .or(file.ssl_key_file)
                .map(|p| expand_home(&p)),
            ssl_cert_file: args
                .ssl_cert_file
                .clone()
                .or(file.ssl_cert_file)
                .map(|p| expand_home(&p)),
            skip_ssl_verify: args.ssl_skip_verify || file.skip_ssl_verify.unwrap_or(false),
            auth_key: args
                .auth_key
                .clone()
                .or(file.auth_key)
                .filter(|key| !key.is_empty()),
            sqlite3: args.sqlite3.clone().or(file.sqlite3).map(|p| expand_home(&p)),
            engine_timeout,
        })
    }

    pub fn bind_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.bind_addr))?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn db() -> Option<PathBuf> {
        Some(PathBuf::from("/data/app.db"))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = Settings::merge(&RelayArgs::default(), FileConfig::default(), db(), None).unwrap();

        assert_eq!(settings.bind_addr, "0.0.0.0");
        assert_eq!(settings.bind_port, 8144);
        assert_eq!(settings.sync_interval, Duration::from_millis(1000));
        assert_eq!(settings.engine_timeout, Some(Duration::from_secs(600)));
        assert!(!settings.use_ssl);
        assert!(!settings.no_backup);
        assert_eq!(settings.auth_key, None);
        assert_eq!(
            settings.bind_socket_addr().unwrap(),
            "0.0.0.0:8144".parse().unwrap()
        );
    }

    #[test]
    fn command_line_beats_file_beats_default() {
        let args = RelayArgs {
            bind_port: Some(9000),
            auth_key: Some("cli-key".to_string()),
            ..Default::default()
        };
        let file = FileConfig {
            bind_port: Some(7000),
            bind_addr: Some("127.0.0.1".to_string()),
            auth_key: Some("file-key".to_string()),
            use_ssl: Some(true),
            sync_interval: Some(250),
            ..Default::default()
        };

        let settings = Settings::merge(&args, file, db(), None).unwrap();

        assert_eq!(settings.bind_port, 9000);
        assert_eq!(settings.bind_addr, "127.0.0.1");
        assert_eq!(settings.auth_key.as_deref(), Some("cli-key"));
        assert!(settings.use_ssl);
        assert_eq!(settings.sync_interval, Duration::from_millis(250));
    }

    #[test]
    fn positional_arguments_beat_file_paths() {
        let file = FileConfig {
            sync_file: Some(PathBuf::from("/from/file.db")),
            remote_conn: Some("file-host:8144".to_string()),
            ..Default::default()
        };
        let settings = Settings::merge(
            &RelayArgs::default(),
            file.clone(),
            db(),
            Some("cli-host:8144".to_string()),
        )
        .unwrap();
        assert_eq!(settings.sync_file, PathBuf::from("/data/app.db"));
        assert_eq!(settings.remote_conn.as_deref(), Some("cli-host:8144"));

        let settings = Settings::merge(&RelayArgs::default(), file, None, None).unwrap();
        assert_eq!(settings.sync_file, PathBuf::from("/from/file.db"));
        assert_eq!(settings.remote_conn.as_deref(), Some("file-host:8144"));
    }

    #[test]
    fn missing_database_is_an_error() {
        let err = Settings::merge(&RelayArgs::default(), FileConfig::default(), None, None).unwrap_err();
        assert!(err.to_string().contains("No database file"));
    }

    #[test]
    fn zero_engine_timeout_disables_the_deadline() {
        let args = RelayArgs {
            engine_timeout: Some(0),
            ..Default::default()
        };
        let settings = Settings::merge(&args, FileConfig::default(), db(), None).unwrap();
        assert_eq!(settings.engine_timeout, None);
    }

    #[test]
    fn empty_auth_key_means_no_auth() {
        let file = FileConfig {
            auth_key: Some(String::new()),
            ..Default::default()
        };
        let settings = Settings::merge(&RelayArgs::default(), file, db(), None).unwrap();
        assert_eq!(settings.auth_key, None);
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind_port = 9100
use_ssl = true
skip_ssl_verify = true
auth_key = "s3cret"
sync_file = "/var/lib/app.db"
remote_conn = "primary.local:9100"
engine_timeout = 30
"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.bind_port, Some(9100));
        assert_eq!(config.use_ssl, Some(true));
        assert_eq!(config.skip_ssl_verify, Some(true));
        assert_eq!(config.auth_key.as_deref(), Some("s3cret"));
        assert_eq!(config.remote_conn.as_deref(), Some("primary.local:9100"));
        assert_eq!(config.engine_timeout, Some(30));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_prot = 1").unwrap();
        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("bind_prot"));
    }

    #[test]
    fn invalid_bind_address_is_reported() {
        let args = RelayArgs {
            bind_addr: Some("not-an-ip".to_string()),
            ..Default::default()
        };
        let settings = Settings::merge(&args, FileConfig::default(), db(), None).unwrap();
        assert!(settings.bind_socket_addr().is_err());
    }
}
