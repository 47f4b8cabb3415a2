//! Configuration file management for pivot.
//!
//! The engine config lives at `~/.config/pivot/config.toml` and is resolved
//! with the chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use pivot_core::config::EngineConfig;
use pivot_core::scheduler::ExecutionMode;

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the pivot config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/pivot` or `~/.config/pivot`,
/// never the platform-specific `dirs::config_dir()`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("pivot");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("pivot")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    EngineConfig::from_toml_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write a config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(path: &Path, config: &EngineConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = config
        .to_toml_string()
        .context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Settings that can be given on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub config_file: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub sequential: bool,
    pub auto_replan: bool,
}

/// Resolve the engine config.
///
/// An explicit `--config` file must exist; the default location is used
/// only when present.
pub fn resolve(overrides: &CliOverrides) -> Result<EngineConfig> {
    let mut config = match &overrides.config_file {
        Some(path) => load_config(path)?,
        None => {
            let path = config_path();
            if path.exists() {
                load_config(&path)?
            } else {
                EngineConfig::default()
            }
        }
    };

    config
        .apply_env()
        .context("invalid PIVOT_* environment variable")?;

    if let Some(max_parallel) = overrides.max_parallel {
        config.scheduler.max_parallel = max_parallel;
    }
    if overrides.sequential {
        config.scheduler.mode = ExecutionMode::Sequential;
    }
    if overrides.auto_replan {
        config.replan.auto_replan = true;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("pivot").join("config.toml");

        let mut original = EngineConfig::default();
        original.scheduler.max_parallel = 9;
        original.history.max_events = 50;
        save_config(&path, &original).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config(&path, &EngineConfig::default()).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn cli_flag_overrides_env_and_file() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[scheduler]\nmax_parallel = 2\n").unwrap();

        unsafe { std::env::set_var("PIVOT_MAX_PARALLEL", "5") };
        let from_env = resolve(&CliOverrides {
            config_file: Some(path.clone()),
            ..CliOverrides::default()
        });
        let from_flag = resolve(&CliOverrides {
            config_file: Some(path.clone()),
            max_parallel: Some(7),
            ..CliOverrides::default()
        });
        unsafe { std::env::remove_var("PIVOT_MAX_PARALLEL") };
        let from_file = resolve(&CliOverrides {
            config_file: Some(path),
            ..CliOverrides::default()
        });

        assert_eq!(from_env.unwrap().scheduler.max_parallel, 5);
        assert_eq!(from_flag.unwrap().scheduler.max_parallel, 7);
        assert_eq!(from_file.unwrap().scheduler.max_parallel, 2);
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let result = resolve(&CliOverrides {
            sequential: true,
            auto_replan: true,
            ..CliOverrides::default()
        });

        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        let config = result.unwrap();
        assert_eq!(config.scheduler.mode, ExecutionMode::Sequential);
        assert!(config.replan.auto_replan);
        assert_eq!(config.scheduler.max_parallel, 4);
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let _lock = lock_env();
        let err = resolve(&CliOverrides {
            config_file: Some(PathBuf::from("/nonexistent/pivot.toml")),
            ..CliOverrides::default()
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }

    #[test]
    fn invalid_flag_value_is_rejected() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let err = resolve(&CliOverrides {
            config_file: Some(path),
            max_parallel: Some(0),
            ..CliOverrides::default()
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("max_parallel"));
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("pivot/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
