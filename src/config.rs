use crate::selector::{LinkSelector, LinkSelectors};
use crate::sender::{HttpSenderOptions, DEFAULT_MAX_BEACON_BYTES};
use crate::tracker::Endpoints;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "beacon.toml";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Deserialize, Default)]
pub struct BeaconConfig {
    pub endpoints: Option<EndpointsConfig>,
    pub selectors: Option<SelectorsConfig>,
    pub beacon: Option<BeaconLimitsConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EndpointsConfig {
    pub base_url: Option<String>,
    pub page_view: Option<String>,
    pub interaction: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SelectorsConfig {
    pub outbound: Option<String>,
    pub download: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BeaconLimitsConfig {
    pub max_payload_bytes: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug)]
pub struct ResolvedConfig {
    pub base_url: String,
    pub endpoints: Endpoints,
    pub selectors: LinkSelectors,
    pub max_payload_bytes: usize,
    pub request_timeout: Option<Duration>,
    pub warnings: Vec<String>,
}

impl ResolvedConfig {
    pub fn sender_options(&self) -> HttpSenderOptions {
        HttpSenderOptions {
            base_url: self.base_url.clone(),
            max_beacon_bytes: self.max_payload_bytes,
            request_timeout: self.request_timeout,
        }
    }
}

/// `beacon.toml` in the working directory if present, otherwise the
/// per-user config directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("page-beacon").join(DEFAULT_CONFIG_FILE))
        .unwrap_or(local)
}

pub fn load_config(path: &Path) -> Option<BeaconConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to read config file"
                );
            }
            return None;
        }
    };

    match toml::from_str::<BeaconConfig>(&raw) {
        Ok(config) => Some(config),
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to parse config file"
            );
            None
        }
    }
}

pub fn resolve_config(config: Option<&BeaconConfig>) -> ResolvedConfig {
    let mut warnings = Vec::new();
    let endpoints_cfg = config.and_then(|c| c.endpoints.as_ref());
    let selectors_cfg = config.and_then(|c| c.selectors.as_ref());
    let limits_cfg = config.and_then(|c| c.beacon.as_ref());

    let base_url = match endpoints_cfg.and_then(|c| non_empty(c.base_url.as_deref())) {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => DEFAULT_BASE_URL.to_string(),
    };

    let defaults = Endpoints::default();
    let endpoints = Endpoints {
        page_view: resolve_path(
            "page_view",
            endpoints_cfg.and_then(|c| c.page_view.as_deref()),
            &defaults.page_view,
            &mut warnings,
        ),
        interaction: resolve_path(
            "interaction",
            endpoints_cfg.and_then(|c| c.interaction.as_deref()),
            &defaults.interaction,
            &mut warnings,
        ),
    };

    let selectors = LinkSelectors {
        outbound: resolve_selector(
            "outbound",
            selectors_cfg.and_then(|c| c.outbound.as_deref()),
            LinkSelector::outbound(),
            &mut warnings,
        ),
        download: resolve_selector(
            "download",
            selectors_cfg.and_then(|c| c.download.as_deref()),
            LinkSelector::download(),
            &mut warnings,
        ),
    };

    let max_payload_bytes = match limits_cfg.and_then(|c| c.max_payload_bytes) {
        Some(0) => {
            warnings.push(format!(
                "Config [beacon].max_payload_bytes must be positive; using {}.",
                DEFAULT_MAX_BEACON_BYTES
            ));
            DEFAULT_MAX_BEACON_BYTES
        }
        Some(limit) => limit,
        None => DEFAULT_MAX_BEACON_BYTES,
    };

    let request_timeout = match limits_cfg.and_then(|c| c.request_timeout_secs) {
        Some(0) => {
            warnings.push(
                "Config [beacon].request_timeout_secs is 0; leaving the timeout unset.".to_string(),
            );
            None
        }
        other => other.map(Duration::from_secs),
    };

    ResolvedConfig {
        base_url,
        endpoints,
        selectors,
        max_payload_bytes,
        request_timeout,
        warnings,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn resolve_path(key: &str, value: Option<&str>, default: &str, warnings: &mut Vec<String>) -> String {
    match non_empty(value) {
        Some(path) if path.starts_with('/') => path.to_string(),
        Some(path) => {
            warnings.push(format!(
                "Config [endpoints].{} '{}' should start with '/'; using '/{}'.",
                key, path, path
            ));
            format!("/{}", path)
        }
        None => default.to_string(),
    }
}

fn resolve_selector(
    key: &str,
    value: Option<&str>,
    default: LinkSelector,
    warnings: &mut Vec<String>,
) -> LinkSelector {
    let Some(raw) = non_empty(value) else {
        return default;
    };

    match LinkSelector::parse(raw) {
        Ok(selector) => selector,
        Err(error) => {
            warnings.push(format!(
                "Config [selectors].{} is invalid ({}); using '{}'.",
                key, error, default
            ));
            default
        }
    }
}
