use std::path::Path;

use nix::unistd::User;
use serde::Deserialize;
use tracing::warn;

/// Server options. Decoded from a TOML config file, then overridden by CLI
/// flags. Immutable after boot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// User whose uid/gid child processes run under. Empty means inherit the
    /// server's own credentials.
    pub run_as_user: String,
    pub address: String,
    pub port: String,
    /// When false, INPUT frames are dropped before reaching the pty.
    pub permit_write: bool,
    pub enable_basic_auth: bool,
    /// "user:pass" for basic auth; also the WebSocket init auth token.
    pub credential: String,
    pub enable_random_url: bool,
    pub random_url_length: usize,
    /// Custom file served for `/` instead of the embedded index.
    pub index_file: String,
    pub enable_tls: bool,
    pub tls_crt_file: String,
    pub tls_key_file: String,
    pub enable_tls_client_auth: bool,
    pub tls_ca_crt_file: String,
    pub title_format: String,
    pub enable_reconnect: bool,
    pub reconnect_time: u32,
    /// 0 = unlimited concurrent sessions.
    pub max_connection: i64,
    /// Accept exactly one session, then stop listening.
    pub once: bool,
    /// Idle timeout in seconds; 0 disables it.
    pub timeout: u64,
    /// Allow clients to append `?arg=...` values to the command line.
    pub permit_arguments: bool,
    /// POSIX signal number delivered to the child on teardown.
    pub close_signal: i32,
    /// Free-form terminal emulator preferences, delivered verbatim.
    pub preferences: serde_json::Map<String, serde_json::Value>,
    /// Initial pty dimensions; 0 defers to the first resize frame.
    pub width: u16,
    pub height: u16,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            run_as_user: String::new(),
            address: String::new(),
            port: "8080".to_string(),
            permit_write: false,
            enable_basic_auth: false,
            credential: String::new(),
            enable_random_url: false,
            random_url_length: 8,
            index_file: String::new(),
            enable_tls: false,
            tls_crt_file: "~/.webtty.crt".to_string(),
            tls_key_file: "~/.webtty.key".to_string(),
            enable_tls_client_auth: false,
            tls_ca_crt_file: "~/.webtty.ca.crt".to_string(),
            title_format: "WebTTY - {{command}} ({{hostname}})".to_string(),
            enable_reconnect: false,
            reconnect_time: 10,
            max_connection: 0,
            once: false,
            timeout: 0,
            permit_arguments: false,
            close_signal: libc::SIGHUP,
            preferences: serde_json::Map::new(),
            width: 0,
            height: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: Box<toml::de::Error>,
    },
    #[error("TLS client authentication is enabled, but TLS is not enabled")]
    ClientAuthWithoutTls,
    #[error("title format string syntax error: {0}")]
    TitleFormat(String),
}

impl Options {
    /// Merge values from a TOML file over the current options. Keys absent
    /// from the file keep their current defaults.
    pub fn apply_config_file(&mut self, path: &str) -> Result<(), ConfigError> {
        let path = expand_home_dir(path);
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let parsed: Options = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path,
            source: Box::new(source),
        })?;
        *self = parsed;
        Ok(())
    }
}

/// Pure structural validation, callable any number of times.
pub fn check_config(options: &Options) -> Result<(), ConfigError> {
    if options.enable_tls_client_auth && !options.enable_tls {
        return Err(ConfigError::ClientAuthWithoutTls);
    }
    Ok(())
}

/// Expand a leading `~/` using $HOME.
pub fn expand_home_dir(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            format!("{}/{}", home.trim_end_matches('/'), rest)
        }
        None => path.to_string(),
    }
}

/// Resolve `run_as_user` to child credentials.
///
/// Returns `None` when no user is configured (children inherit the server's
/// identity). A configured user that fails to resolve falls back to (0, 0)
/// with a warning; operators running unprivileged servers must leave this
/// unset or pick a resolvable name.
pub fn lookup_uid_gid(run_as_user: &str) -> Option<(u32, u32)> {
    if run_as_user.is_empty() {
        return None;
    }
    match User::from_name(run_as_user) {
        Ok(Some(user)) => {
            let uid = user.uid.as_raw();
            let gid = user.gid.as_raw();
            tracing::info!(user = run_as_user, uid, gid, "resolved run_as_user");
            Some((uid, gid))
        }
        other => {
            warn!(
                user = run_as_user,
                result = ?other,
                "failed to resolve run_as_user, falling back to uid/gid (0, 0)"
            );
            Some((0, 0))
        }
    }
}

/// Default config file location, consulted when `--config` is not given.
pub fn default_config_path() -> Option<String> {
    let path = expand_home_dir("~/.webtty");
    Path::new(&path).exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = Options::default();
        assert_eq!(options.port, "8080");
        assert_eq!(options.random_url_length, 8);
        assert_eq!(options.reconnect_time, 10);
        assert_eq!(options.close_signal, libc::SIGHUP);
        assert_eq!(options.max_connection, 0);
        assert_eq!(options.timeout, 0);
        assert_eq!(options.width, 0);
        assert_eq!(options.height, 0);
        assert!(!options.permit_write);
        assert!(!options.once);
    }

    #[test]
    fn toml_decode_merges_over_defaults() {
        let content = r#"
            port = "9000"
            permit_write = true
            max_connection = 3
            close_signal = 15

            [preferences]
            font-size = 14
            background-color = "rgb(16, 16, 16)"
        "#;
        let options: Options = toml::from_str(content).expect("decode");
        assert_eq!(options.port, "9000");
        assert!(options.permit_write);
        assert_eq!(options.max_connection, 3);
        assert_eq!(options.close_signal, 15);
        assert_eq!(options.preferences["font-size"], 14);
        assert_eq!(options.preferences["background-color"], "rgb(16, 16, 16)");
        // untouched keys keep their defaults
        assert_eq!(options.reconnect_time, 10);
    }

    #[test]
    fn check_config_rejects_client_auth_without_tls() {
        let mut options = Options::default();
        options.enable_tls_client_auth = true;
        assert!(matches!(
            check_config(&options),
            Err(ConfigError::ClientAuthWithoutTls)
        ));

        options.enable_tls = true;
        assert!(check_config(&options).is_ok());
    }

    #[test]
    fn check_config_is_pure() {
        let options = Options::default();
        let before = format!("{options:?}");
        let _ = check_config(&options);
        let _ = check_config(&options);
        assert_eq!(before, format!("{options:?}"));
    }

    #[test]
    fn expand_home_dir_only_touches_tilde_prefix() {
        std::env::set_var("HOME", "/home/demo");
        assert_eq!(expand_home_dir("~/.webtty"), "/home/demo/.webtty");
        assert_eq!(expand_home_dir("/etc/webtty"), "/etc/webtty");
        assert_eq!(expand_home_dir("relative/path"), "relative/path");
    }

    #[test]
    fn empty_run_as_user_means_inherit() {
        assert_eq!(lookup_uid_gid(""), None);
    }

    #[test]
    fn unresolvable_user_falls_back_to_root() {
        assert_eq!(lookup_uid_gid("no-such-user-wtty"), Some((0, 0)));
    }
}
