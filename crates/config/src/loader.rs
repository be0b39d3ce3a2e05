use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::WagateConfig};

/// Config file names, checked in order within each search directory.
const CONFIG_FILENAMES: &[&str] = &["wagate.toml", "wagate.yaml", "wagate.yml", "wagate.json"];

/// Directory set by `--config-dir`; replaces the default search path.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(path);
}

pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Load config from `path`, picking the parser from the file extension.
pub fn load_config(path: &Path) -> anyhow::Result<WagateConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&substitute_env(&raw), path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. the `--config-dir` override, exclusively, when set
/// 2. `./wagate.{toml,yaml,yml,json}`
/// 3. `~/.config/wagate/wagate.{toml,yaml,yml,json}`
///
/// A missing file yields defaults (and a default file is written). A file
/// that fails to parse also yields defaults, with a warning.
pub fn discover_and_load() -> WagateConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, writing default config");
        let config = WagateConfig::default();
        if let Err(e) = write_default_config(&config) {
            warn!(error = %e, "failed to write default config file");
        }
        return config;
    };

    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        WagateConfig::default()
    })
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Path of the config file `discover_and_load` would read, if any.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return find_in(&dir);
    }
    find_in(Path::new(".")).or_else(|| user_config_dir().and_then(|dir| find_in(&dir)))
}

fn user_config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("wagate"))
}

/// Returns the config directory: override, or `~/.config/wagate/`.
pub fn config_dir() -> Option<PathBuf> {
    config_dir_override().or_else(user_config_dir)
}

/// Returns the data directory (`~/.wagate/`) holding session credentials.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".wagate"))
        .unwrap_or_else(|| PathBuf::from(".wagate"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn write_default_config(config: &WagateConfig) -> anyhow::Result<()> {
    let Some(dir) = config_dir() else {
        return Ok(());
    };
    let path = dir.join("wagate.toml");
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&dir)?;
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, toml_str)?;
    debug!(path = %path.display(), "wrote default config file");
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<WagateConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_supported_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("a.toml");
        std::fs::write(&toml_path, "[pairing]\nqr_ttl_secs = 20\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().pairing.qr_ttl_secs, 20);

        let yaml_path = dir.path().join("a.yaml");
        std::fs::write(&yaml_path, "fetch:\n  timeout_secs: 5\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().fetch.timeout_secs, 5);

        let json_path = dir.path().join("a.json");
        std::fs::write(&json_path, r#"{"reconnect":{"max_attempts":2}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().reconnect.max_attempts, 2);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wagate.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn override_dir_is_searched_exclusively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("wagate.toml"),
            "[pairing]\ncode_timeout_secs = 7\n",
        )
        .unwrap();

        set_config_dir(dir.path().to_path_buf());
        let cfg = discover_and_load();
        clear_config_dir();

        assert_eq!(cfg.pairing.code_timeout_secs, 7);
    }
}
