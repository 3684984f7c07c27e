use std::path::{Path, PathBuf};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{
    env_subst::substitute_env,
    schema::{AiProviderKind, SwitchboardConfig},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchboard.toml",
    "switchboard.yaml",
    "switchboard.yml",
    "switchboard.json",
];

const APP_NAME: &str = "switchboard";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchboard.{toml,yaml,yml,json}`
/// 2. `~/.config/switchboard/switchboard.{toml,yaml,yml,json}`
///
/// Returns `SwitchboardConfig::default()` if no config file is found or the
/// one found cannot be parsed.
pub fn discover_and_load() -> SwitchboardConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return SwitchboardConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        SwitchboardConfig::default()
    })
}

/// First existing config file in the standard search order.
pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// User-global config directory (`~/.config/switchboard/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|d| d.config_dir().to_path_buf())
}

/// User data directory; falls back to `./.switchboard` when no home is known.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".switchboard"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Apply `SWITCHBOARD_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut SwitchboardConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(
    config: &mut SwitchboardConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(url) = lookup("SWITCHBOARD_DATABASE_URL") {
        config.store.database_url = url;
    }

    let provider_var = match config.ai.provider {
        AiProviderKind::Gemini => "GEMINI_API_KEY",
        AiProviderKind::Openai => "OPENAI_API_KEY",
    };
    if let Some(key) = lookup("SWITCHBOARD_AI_API_KEY")
        .or_else(|| config.ai.api_key.is_none().then(|| lookup(provider_var)).flatten())
        .filter(|k| !k.trim().is_empty())
    {
        config.ai.api_key = Some(Secret::new(key));
    }

    if let Some(raw) = lookup("SWITCHBOARD_CONFIDENCE_THRESHOLD") {
        match raw.trim().parse::<f32>() {
            Ok(v) => config.reply.confidence_threshold = v,
            Err(_) => warn!(value = %raw, "ignoring invalid SWITCHBOARD_CONFIDENCE_THRESHOLD"),
        }
    }
    if let Some(raw) = lookup("SWITCHBOARD_PORT") {
        match raw.trim().parse::<u16>() {
            Ok(v) => config.server.port = v,
            Err(_) => warn!(value = %raw, "ignoring invalid SWITCHBOARD_PORT"),
        }
    }
    if let Some(v) = lookup("SWITCHBOARD_HEARTBEAT_INTERVAL") {
        config.supervisor.heartbeat_interval = v;
    }
    if let Some(v) = lookup("SWITCHBOARD_BACKOFF_MIN") {
        config.supervisor.backoff_min = v;
    }
    if let Some(v) = lookup("SWITCHBOARD_BACKOFF_MAX") {
        config.supervisor.backoff_max = v;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret, std::collections::HashMap};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn loads_yaml_with_env_placeholders_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.yaml");
        std::fs::write(
            &path,
            "reply:\n  top_k: 5\nai:\n  base_url: \"${SWITCHBOARD_TEST_UNSET_VAR}\"\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.reply.top_k, 5);
        assert_eq!(
            cfg.ai.base_url.as_deref(),
            Some("${SWITCHBOARD_TEST_UNSET_VAR}")
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = SwitchboardConfig::default();
        apply_env_overrides_with(
            &mut cfg,
            env(&[
                ("SWITCHBOARD_DATABASE_URL", "sqlite::memory:"),
                ("GEMINI_API_KEY", "g-key"),
                ("SWITCHBOARD_CONFIDENCE_THRESHOLD", "0.7"),
                ("SWITCHBOARD_BACKOFF_MIN", "1s"),
                ("SWITCHBOARD_PORT", "not-a-port"),
            ]),
        );
        assert_eq!(cfg.store.database_url, "sqlite::memory:");
        assert_eq!(cfg.ai.api_key.unwrap().expose_secret(), "g-key");
        assert!((cfg.reply.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(cfg.supervisor.backoff_min, "1s");
        assert_eq!(cfg.server.port, 5005);
    }

    #[test]
    fn configured_key_wins_over_provider_env() {
        let mut cfg = SwitchboardConfig::default();
        cfg.ai.api_key = Some(Secret::new("from-file".into()));
        apply_env_overrides_with(&mut cfg, env(&[("GEMINI_API_KEY", "from-env")]));
        assert_eq!(cfg.ai.api_key.unwrap().expose_secret(), "from-file");
    }
}
