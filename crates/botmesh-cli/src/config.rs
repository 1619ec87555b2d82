//! Loads proxy settings from `~/.botmesh/proxy.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use botmesh_proxy::ProxyConfig;
use botmesh_types::ProxyError;

/// Return the config path: `BOTMESH_CONFIG` if set, otherwise
/// `~/.botmesh/proxy.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("BOTMESH_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".botmesh").join("proxy.toml")
}

/// Load the config from [`config_path`], falling back to defaults when the
/// file does not exist.  Environment overrides are applied either way.
pub fn load() -> Result<ProxyConfig, ProxyError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<ProxyConfig>, ProxyError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| ProxyError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| ProxyError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `BOTMESH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BOTMESH_LISTEN_PORT` | `listen_port` |
/// | `BOTMESH_BROKER_HOST` | `broker.host` |
/// | `BOTMESH_BROKER_PORT` | `broker.port` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut ProxyConfig) {
    apply_overrides_from(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides_from(cfg: &mut ProxyConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("BOTMESH_LISTEN_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.listen_port = port;
    }
    if let Some(v) = lookup("BOTMESH_BROKER_HOST")
        && !v.is_empty()
    {
        cfg.broker.host = v;
    }
    if let Some(v) = lookup("BOTMESH_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker.port = port;
    }
}
