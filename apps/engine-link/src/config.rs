//! `~/.engine-link/config.toml` plus environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use engine_wire::Extent;
use serde::Deserialize;
use thiserror::Error;

use crate::remote::RemoteConfig;
use crate::supervisor::{LaunchTarget, SupervisorConfig};

pub const ENV_ENGINE: &str = "ENGINE_LINK_ENGINE";
pub const ENV_SERVICE: &str = "ENGINE_LINK_SERVICE";
pub const ENV_SSH: &str = "ENGINE_LINK_SSH";
pub const ENV_SCP: &str = "ENGINE_LINK_SCP";
pub const ENV_CONTROL_PATH: &str = "ENGINE_LINK_CONTROL_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub engine: EngineSection,
    pub remote: RemoteSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub service_name: String,
    pub rendezvous_dir: Option<PathBuf>,
    pub connect_timeout_secs: f64,
    pub stop_timeout_secs: f64,
    pub send_timeout_secs: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            service_name: "engine-link".to_string(),
            rendezvous_dir: None,
            connect_timeout_secs: 10.0,
            stop_timeout_secs: 5.0,
            send_timeout_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSection {
    pub ssh: PathBuf,
    pub scp: PathBuf,
    pub control_path: Option<PathBuf>,
    pub control_persist_secs: u64,
    pub compress: bool,
    pub auth_timeout_secs: f64,
    pub probe_timeout_secs: f64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            ssh: PathBuf::from("ssh"),
            scp: PathBuf::from("scp"),
            control_path: None,
            control_persist_secs: 600,
            compress: false,
            auth_timeout_secs: 120.0,
            probe_timeout_secs: 5.0,
        }
    }
}

impl LinkConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = BaseDirs::new()
            .ok_or_else(|| ConfigError::Config("unable to determine home directory".into()))?;
        Ok(base.home_dir().join(".engine-link").join("config.toml"))
    }

    /// Reads the file at `path` (or the default location), falling back to
    /// defaults when it does not exist, then applies the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
        if let Some(engine) = non_empty(ENV_ENGINE) {
            self.engine.executable = Some(PathBuf::from(engine));
        }
        if let Some(service) = non_empty(ENV_SERVICE) {
            self.engine.service_name = service;
        }
        if let Some(ssh) = non_empty(ENV_SSH) {
            self.remote.ssh = PathBuf::from(ssh);
        }
        if let Some(scp) = non_empty(ENV_SCP) {
            self.remote.scp = PathBuf::from(scp);
        }
        if let Some(control_path) = non_empty(ENV_CONTROL_PATH) {
            self.remote.control_path = Some(PathBuf::from(control_path));
        }
    }

    pub fn remote(&self) -> RemoteConfig {
        let defaults = RemoteConfig::default();
        RemoteConfig {
            ssh_program: self.remote.ssh.clone(),
            scp_program: self.remote.scp.clone(),
            control_path: self
                .remote
                .control_path
                .clone()
                .unwrap_or(defaults.control_path),
            control_persist: Duration::from_secs(self.remote.control_persist_secs),
            compress: self.remote.compress,
            auth_timeout: seconds(self.remote.auth_timeout_secs, defaults.auth_timeout),
            probe_timeout: seconds(self.remote.probe_timeout_secs, defaults.probe_timeout),
        }
    }

    /// Supervisor options for `launch`, with `size` as the first viewport.
    pub fn supervisor(&self, launch: LaunchTarget, size: Extent) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(launch);
        config.service_name = self.engine.service_name.clone();
        if let Some(dir) = &self.engine.rendezvous_dir {
            config.rendezvous_dir = dir.clone();
        }
        config.connect_timeout = seconds(self.engine.connect_timeout_secs, config.connect_timeout);
        config.stop_timeout = seconds(self.engine.stop_timeout_secs, config.stop_timeout);
        config.send_timeout = seconds(self.engine.send_timeout_secs, config.send_timeout);
        config.initial_size = size;
        config.remote = self.remote();
        config
    }

    /// Local launch target from the configured executable and arguments.
    pub fn local_launch(&self, executable: Option<PathBuf>) -> Result<LaunchTarget, ConfigError> {
        let executable = executable
            .or_else(|| self.engine.executable.clone())
            .ok_or_else(|| {
                ConfigError::Config(format!(
                    "no engine executable; pass --engine, set {ENV_ENGINE} or [engine].executable"
                ))
            })?;
        Ok(LaunchTarget::Local {
            executable,
            args: self.engine.args.clone(),
        })
    }
}

fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_sections_use_defaults() {
        let config: LinkConfig = toml::from_str("[engine]\nservice_name = \"editor-7\"\n").unwrap();
        assert_eq!(config.engine.service_name, "editor-7");
        assert_eq!(config.engine.stop_timeout_secs, 5.0);
        assert_eq!(config.remote, RemoteSection::default());
    }

    #[test]
    fn file_values_flow_into_library_configs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[engine]
executable = "/opt/engine/bin/engine"
args = ["--validation"]
rendezvous_dir = "/run/engine"
connect_timeout_secs = 1.5

[remote]
ssh = "/usr/local/bin/ssh"
control_persist_secs = 30
compress = true
probe_timeout_secs = 0.25
"#,
        )
        .unwrap();

        let config = LinkConfig::from_file(&path).unwrap();
        let launch = config.local_launch(None).unwrap();
        assert_eq!(
            launch,
            LaunchTarget::Local {
                executable: PathBuf::from("/opt/engine/bin/engine"),
                args: vec!["--validation".into()],
            }
        );

        let supervisor = config.supervisor(launch, Extent::new(800, 600));
        assert_eq!(supervisor.rendezvous_dir, PathBuf::from("/run/engine"));
        assert_eq!(supervisor.connect_timeout, Duration::from_millis(1500));
        assert_eq!(supervisor.stop_timeout, Duration::from_secs(5));
        assert_eq!(supervisor.initial_size, Extent::new(800, 600));

        let remote = supervisor.remote;
        assert_eq!(remote.ssh_program, PathBuf::from("/usr/local/bin/ssh"));
        assert_eq!(remote.scp_program, PathBuf::from("scp"));
        assert_eq!(remote.control_persist, Duration::from_secs(30));
        assert!(remote.compress);
        assert_eq!(remote.probe_timeout, Duration::from_millis(250));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine\n").unwrap();
        let err = LinkConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_without_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.remote.control_persist_secs, 600);
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_ENGINE, "/env/engine"),
            (ENV_SERVICE, "from-env"),
            (ENV_SSH, "/env/ssh"),
            (ENV_CONTROL_PATH, "/env/ctl-%C"),
            (ENV_SCP, ""),
        ]);
        let mut config = LinkConfig::default();
        config.apply_env(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.engine.executable, Some(PathBuf::from("/env/engine")));
        assert_eq!(config.engine.service_name, "from-env");
        assert_eq!(config.remote.ssh, PathBuf::from("/env/ssh"));
        assert_eq!(config.remote.scp, PathBuf::from("scp"), "empty values are ignored");
        assert_eq!(config.remote().control_path, PathBuf::from("/env/ctl-%C"));
    }

    #[test]
    fn explicit_engine_beats_config() {
        let config = LinkConfig::default();
        assert!(config.local_launch(None).is_err());
        let launch = config.local_launch(Some(PathBuf::from("./engine"))).unwrap();
        assert_eq!(launch, LaunchTarget::local("./engine"));
    }
}
