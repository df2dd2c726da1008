use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use comfybatch_comfyui::backoff::BackoffConfig;
use comfybatch_comfyui::client::{ServerEndpoints, DEFAULT_SERVER_ADDRESS};
use comfybatch_comfyui::events::EventVocabulary;
use comfybatch_comfyui::fetcher::default_history_backoff;
use comfybatch_core::workflow::PatcherConfig;

/// Default per-item wait for a terminal progress event.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;
/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
/// Default output directory.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// Settings for one batch run.
///
/// Built from the environment by [`RunConfig::from_env`]; the CLI then
/// overrides individual fields from its flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub server: ServerEndpoints,
    /// Directory that receives the downloaded images. Created on demand.
    pub output_dir: PathBuf,
    /// How long to wait for a job to reach a terminal status.
    pub job_timeout: Duration,
    /// Timeout applied to every HTTP request.
    pub request_timeout: Duration,
    /// Polling schedule for a history entry that is not there yet.
    pub history_backoff: BackoffConfig,
    /// Schedule for (re)opening the WebSocket subscription.
    pub reconnect_backoff: BackoffConfig,
    pub patcher: PatcherConfig,
    pub vocabulary: EventVocabulary,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            server: ServerEndpoints::from_address(DEFAULT_SERVER_ADDRESS),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            history_backoff: default_history_backoff(),
            reconnect_backoff: BackoffConfig::default(),
            patcher: PatcherConfig::default(),
            vocabulary: EventVocabulary::default(),
        }
    }
}

/// An environment variable holds a value that cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{var} has invalid value {value:?}: expected {expected}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl RunConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                           | Default          |
    /// |-----------------------------------|------------------|
    /// | `COMFYBATCH_JOB_TIMEOUT_SECS`     | `600`            |
    /// | `COMFYBATCH_REQUEST_TIMEOUT_SECS` | `60`             |
    /// | `COMFYBATCH_HISTORY_ATTEMPTS`     | `5`              |
    /// | `COMFYBATCH_RECONNECT_ATTEMPTS`   | `3`              |
    /// | `COMFYBATCH_STRICT`               | `false`          |
    /// | `COMFYBATCH_ENCODER_CLASSES`      | `CLIPTextEncode` |
    ///
    /// Server address and output directory are CLI concerns and keep
    /// their defaults here.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let job_timeout_secs: u64 = parse_var(
            &lookup,
            "COMFYBATCH_JOB_TIMEOUT_SECS",
            DEFAULT_JOB_TIMEOUT_SECS,
            "whole seconds",
        )?;
        config.job_timeout = Duration::from_secs(job_timeout_secs);

        let request_timeout_secs: u64 = parse_var(
            &lookup,
            "COMFYBATCH_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            "whole seconds",
        )?;
        config.request_timeout = Duration::from_secs(request_timeout_secs);

        config.history_backoff.max_attempts = parse_var(
            &lookup,
            "COMFYBATCH_HISTORY_ATTEMPTS",
            config.history_backoff.max_attempts,
            "a positive integer",
        )?;
        config.reconnect_backoff.max_attempts = parse_var(
            &lookup,
            "COMFYBATCH_RECONNECT_ATTEMPTS",
            config.reconnect_backoff.max_attempts,
            "a positive integer",
        )?;

        if let Some(value) = lookup("COMFYBATCH_STRICT") {
            config.patcher.strict = parse_bool(&value).ok_or(ConfigError {
                var: "COMFYBATCH_STRICT",
                value,
                expected: "true or false",
            })?;
        }

        if let Some(value) = lookup("COMFYBATCH_ENCODER_CLASSES") {
            let classes: Vec<String> = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if classes.is_empty() {
                return Err(ConfigError {
                    var: "COMFYBATCH_ENCODER_CLASSES",
                    value,
                    expected: "a comma-separated list of class types",
                });
            }
            config.patcher.encoder_classes = classes;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError {
            var,
            value,
            expected,
        }),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<RunConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.job_timeout, Duration::from_secs(600));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.history_backoff.max_attempts, 5);
        assert_eq!(config.reconnect_backoff.max_attempts, 3);
        assert!(!config.patcher.strict);
        assert_eq!(config.patcher.encoder_classes, ["CLIPTextEncode"]);
        assert_eq!(config.server.api_url, "http://127.0.0.1:8188");
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn overrides_from_env() {
        let config = from_vars(&[
            ("COMFYBATCH_JOB_TIMEOUT_SECS", "30"),
            ("COMFYBATCH_HISTORY_ATTEMPTS", "8"),
            ("COMFYBATCH_STRICT", "TRUE"),
            ("COMFYBATCH_ENCODER_CLASSES", "CLIPTextEncode, CLIPTextEncodeSDXL,"),
        ])
        .unwrap();
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert_eq!(config.history_backoff.max_attempts, 8);
        assert!(config.patcher.strict);
        assert_eq!(
            config.patcher.encoder_classes,
            ["CLIPTextEncode", "CLIPTextEncodeSDXL"]
        );
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = from_vars(&[("COMFYBATCH_JOB_TIMEOUT_SECS", "ten")]).unwrap_err();
        assert_eq!(err.var, "COMFYBATCH_JOB_TIMEOUT_SECS");
        assert!(err.to_string().contains("\"ten\""));
    }

    #[test]
    fn invalid_bool_rejected() {
        assert!(from_vars(&[("COMFYBATCH_STRICT", "maybe")]).is_err());
    }

    #[test]
    fn empty_encoder_list_rejected() {
        assert!(from_vars(&[("COMFYBATCH_ENCODER_CLASSES", " , ")]).is_err());
    }
}
