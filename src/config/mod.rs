// backuptool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yml";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MOUNT_ROOT: &str = "/mnt";

/// Restic-style retention policy, expanded to `--keep-*` flags for prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_last.is_none()
            && self.keep_hourly.is_none()
            && self.keep_daily.is_none()
            && self.keep_weekly.is_none()
            && self.keep_monthly.is_none()
            && self.keep_yearly.is_none()
    }

    /// Argument list for `restic forget`, mirroring the config keys.
    pub fn to_forget_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let pairs = [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ];
        for (flag, value) in pairs {
            if let Some(count) = value {
                args.push(flag.to_string());
                args.push(count.to_string());
            }
        }
        args
    }
}

fn default_true() -> bool {
    true
}

/// Which optional phases a target runs after a successful backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseToggles {
    #[serde(default)]
    pub check: bool,
    #[serde(default = "default_true")]
    pub prune: bool,
    #[serde(default = "default_true")]
    pub sync: bool,
}

impl Default for PhaseToggles {
    fn default() -> Self {
        Self {
            check: false,
            prune: true,
            sync: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_minutes: u64,
}

/// A named backup configuration. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// ZFS dataset to snapshot, e.g. `tank/data`.
    pub dataset: String,
    /// Restic repository identifier (path or remote URI).
    pub repository: String,
    /// File holding the repository password; handed to restic via env.
    #[serde(skip_serializing)]
    pub password_file: PathBuf,
    /// Optional rclone destination the repository is mirrored to.
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub phases: PhaseToggles,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

impl TargetConfig {
    /// Effective phase decisions: a toggle only enables a phase when the
    /// target actually carries the configuration that phase needs.
    pub fn runs_check(&self) -> bool {
        self.phases.check
    }

    pub fn runs_prune(&self) -> bool {
        self.phases.prune && !self.retention.is_empty()
    }

    pub fn runs_sync(&self) -> bool {
        self.phases.sync && self.remote.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawAppConfig {
    listen_addr: Option<String>,
    mount_root: Option<PathBuf>,
    targets: Option<Vec<TargetConfig>>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub mount_root: PathBuf,
    pub targets: Vec<TargetConfig>,
}

impl AppConfig {
    pub fn load_from_yaml(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_yaml_str(&config_content)
            .with_context(|| format!("Failed to parse config file at {}", config_path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: RawAppConfig =
            serde_yaml::from_str(text).context("Failed to parse YAML configuration")?;

        let targets = raw.targets.unwrap_or_default();
        validate_targets(&targets)?;

        Ok(AppConfig {
            listen_addr: raw
                .listen_addr
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            mount_root: raw
                .mount_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_ROOT)),
            targets,
        })
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}

/// Resolves the config file location: `BACKUPTOOL_CONFIG` env var, or the
/// container-friendly default the original deployment used.
pub fn config_path_from_env() -> PathBuf {
    env::var("BACKUPTOOL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn valid_name(name: &str) -> bool {
    !name.trim().is_empty()
        && !name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
}

fn validate_targets(targets: &[TargetConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for target in targets {
        if !valid_name(&target.name) {
            anyhow::bail!(
                "Invalid target name {:?}: only alphanumerics, '_' and '-' are allowed",
                target.name
            );
        }
        if !seen.insert(target.name.as_str()) {
            anyhow::bail!("Duplicate target name in config: {}", target.name);
        }
        if target.dataset.trim().is_empty() {
            anyhow::bail!("Target {} has an empty dataset", target.name);
        }
        if target.repository.trim().is_empty() {
            anyhow::bail!("Target {} has an empty repository", target.name);
        }
        if target.password_file.as_os_str().is_empty() {
            anyhow::bail!("Target {} has an empty password_file", target.name);
        }
        if let Some(schedule) = &target.schedule {
            if schedule.interval_minutes == 0 {
                anyhow::bail!(
                    "Target {} has a zero-interval schedule; use at least 1 minute",
                    target.name
                );
            }
        }
        if let Some(remote) = &target.remote {
            if remote.trim().is_empty() {
                anyhow::bail!("Target {} has an empty remote destination", target.name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
listen_addr: "127.0.0.1:9000"
mount_root: /var/run/backuptool
targets:
  - name: tank-data
    dataset: tank/data
    repository: /srv/restic/tank-data
    password_file: /config/restic.pass
    remote: "b2:bucket/tank-data"
    retention:
      keep_daily: 7
      keep_weekly: 4
    phases:
      check: true
      prune: true
      sync: true
    schedule:
      interval_minutes: 1440
  - name: tank-home
    dataset: tank/home
    repository: /srv/restic/tank-home
    password_file: /config/restic.pass
"#;

    #[test]
    fn test_parse_full_config() -> anyhow::Result<()> {
        let config = AppConfig::from_yaml_str(FULL_CONFIG)?;

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.mount_root, PathBuf::from("/var/run/backuptool"));
        assert_eq!(config.targets.len(), 2);

        let tank = config.target("tank-data").unwrap();
        assert_eq!(tank.dataset, "tank/data");
        assert_eq!(tank.remote.as_deref(), Some("b2:bucket/tank-data"));
        assert_eq!(tank.retention.keep_daily, Some(7));
        assert_eq!(tank.schedule.as_ref().unwrap().interval_minutes, 1440);
        Ok(())
    }

    #[test]
    fn test_defaults_applied_when_fields_missing() -> anyhow::Result<()> {
        let config = AppConfig::from_yaml_str(FULL_CONFIG)?;
        let home = config.target("tank-home").unwrap();

        assert!(home.remote.is_none());
        assert!(home.retention.is_empty());
        assert!(!home.phases.check);
        assert!(home.phases.prune);
        assert!(home.schedule.is_none());

        assert_eq!(
            AppConfig::from_yaml_str("targets: []")?.listen_addr,
            DEFAULT_LISTEN_ADDR
        );
        Ok(())
    }

    #[test]
    fn test_effective_phases_need_their_configuration() -> anyhow::Result<()> {
        let config = AppConfig::from_yaml_str(FULL_CONFIG)?;

        let tank = config.target("tank-data").unwrap();
        assert!(tank.runs_check());
        assert!(tank.runs_prune());
        assert!(tank.runs_sync());

        // tank-home has no remote and no retention, so the default-on
        // toggles must not enable those phases.
        let home = config.target("tank-home").unwrap();
        assert!(!home.runs_check());
        assert!(!home.runs_prune());
        assert!(!home.runs_sync());
        Ok(())
    }

    #[test]
    fn test_retention_to_forget_args() {
        let retention = RetentionPolicy {
            keep_daily: Some(7),
            keep_weekly: Some(4),
            ..Default::default()
        };
        assert_eq!(
            retention.to_forget_args(),
            vec!["--keep-daily", "7", "--keep-weekly", "4"]
        );
        assert!(RetentionPolicy::default().to_forget_args().is_empty());
    }

    #[test]
    fn test_duplicate_target_names_rejected() {
        let yaml = r#"
targets:
  - { name: a, dataset: tank/a, repository: /r/a, password_file: /p }
  - { name: a, dataset: tank/b, repository: /r/b, password_file: /p }
"#;
        assert!(AppConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_invalid_target_name_rejected() {
        let yaml = r#"
targets:
  - { name: "tank/data", dataset: tank/a, repository: /r/a, password_file: /p }
"#;
        assert!(AppConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_zero_interval_schedule_rejected() {
        let yaml = r#"
targets:
  - name: a
    dataset: tank/a
    repository: /r/a
    password_file: /p
    schedule: { interval_minutes: 0 }
"#;
        assert!(AppConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_load_from_yaml_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, FULL_CONFIG)?;

        let config = AppConfig::load_from_yaml(&path)?;
        assert_eq!(config.targets.len(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_config_file_gives_context() {
        let err = AppConfig::load_from_yaml(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/config.yml"));
    }
}
