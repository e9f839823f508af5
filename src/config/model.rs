use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{ConfigError, Result};

/// Executable name that selects the Go build-and-run flow.
pub const EXECUTABLE_GO: &str = "go";

fn default_stop_grace_secs() -> u64 {
    5
}

/// Root configuration from monday.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// [[projects]] sections
    #[serde(default)]
    pub projects: Vec<Project>,
}

impl Config {
    /// Merge another config file into this one. Projects with the same name
    /// are combined: their applications and forwards concatenate.
    pub fn merge(&mut self, other: Config) {
        for project in other.projects {
            match self.projects.iter_mut().find(|p| p.name == project.name) {
                Some(existing) => {
                    existing.applications.extend(project.applications);
                    existing.forwards.extend(project.forwards);
                }
                None => self.projects.push(project),
            }
        }
    }

    pub fn project_names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.name.clone()).collect()
    }

    /// Select a project by name, or the sole configured project when no name
    /// is given. Interactive selection belongs to the caller, not here.
    pub fn select_project(&self, name: Option<&str>) -> Result<&Project> {
        match name {
            Some(name) => self
                .projects
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| {
                    ConfigError::ProjectNotFound(name.to_string(), self.project_names())
                }),
            None => match self.projects.as_slice() {
                [single] => Ok(single),
                [] => Err(ConfigError::Validation(
                    "the configuration declares no projects".to_string(),
                )),
                _ => Err(ConfigError::ProjectAmbiguous(self.project_names())),
            },
        }
    }
}

/// A named bundle of local applications and remote forwards.
/// Immutable after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub name: String,

    /// [[projects.local]] sections - applications run on the workstation
    #[serde(default, rename = "local")]
    pub applications: Vec<Application>,

    /// [[projects.forward]] sections - tunnels to remote targets
    #[serde(default, rename = "forward")]
    pub forwards: Vec<Forward>,
}

impl Project {
    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.name == name)
    }

    pub fn forward(&self, name: &str) -> Option<&Forward> {
        self.forwards.iter().find(|f| f.name == name)
    }
}

/// A local application supervised by the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Application {
    /// Unique name within the project
    pub name: String,

    /// Working directory (resolved against $GOPATH/src for Go apps)
    pub path: String,

    /// Command to invoke; the literal "go" selects `go run .`
    pub executable: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Inline environment, overrides env_file entries
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Optional KEY=VALUE file loaded before the inline env
    #[serde(default)]
    pub env_file: Option<String>,

    /// Optional hostname the app should resolve to on loopback
    #[serde(default)]
    pub hostname: Option<String>,

    /// Arm file watching for this application
    #[serde(default)]
    pub watch: bool,

    /// Seconds to wait between SIGINT and SIGKILL on stop
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Shell steps run once at project start
    #[serde(default)]
    pub setup: Vec<String>,

    /// Shell steps run before each run/restart
    #[serde(default)]
    pub build: Vec<String>,
}

impl Application {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Effective working directory. Go applications whose path does not exist
    /// on disk fall back to `$GOPATH/src/<path>`.
    pub fn effective_path(&self) -> PathBuf {
        if self.executable == EXECUTABLE_GO && !Path::new(&self.path).exists() {
            let gopath = std::env::var("GOPATH").unwrap_or_default();
            return PathBuf::from(gopath).join("src").join(&self.path);
        }

        PathBuf::from(&self.path)
    }
}

/// Tunnel type. A forward traverses the in-process proxy ("proxified") for
/// every kind except `ssh-remote`, which exposes a workstation port on the
/// remote host instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardKind {
    Kubernetes,
    KubernetesRemote,
    Ssh,
    SshRemote,
}

impl ForwardKind {
    pub fn is_proxified(self) -> bool {
        matches!(self, Self::Kubernetes | Self::KubernetesRemote | Self::Ssh)
    }
}

impl std::fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Kubernetes => "kubernetes",
            Self::KubernetesRemote => "kubernetes-remote",
            Self::Ssh => "ssh",
            Self::SshRemote => "ssh-remote",
        };
        f.write_str(s)
    }
}

/// A declarative mapping from a production hostname/port to a tunnel
/// endpoint on the workstation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forward {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ForwardKind,

    /// Restart this forward after a restart of the same-named application
    #[serde(default)]
    pub watch: bool,

    #[serde(default)]
    pub values: ForwardValues,
}

impl Forward {
    pub fn is_proxified(&self) -> bool {
        self.kind.is_proxified()
    }
}

/// Values available to each forward type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ForwardValues {
    /// Kubernetes context
    #[serde(default)]
    pub context: String,

    /// Kubernetes namespace
    #[serde(default)]
    pub namespace: String,

    /// Pod selection labels
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Target hostname rewritten onto the proxy
    #[serde(default)]
    pub hostname: String,

    /// "LOCAL:REMOTE" port mappings
    #[serde(default)]
    pub ports: Vec<String>,

    /// SSH target (user@host[:port]) or remote dial address
    #[serde(default)]
    pub remote: String,

    /// Extra tunnel flags
    #[serde(default)]
    pub args: Vec<String>,
}

/// Parse a "LOCAL:REMOTE" port mapping.
pub fn parse_port_mapping(mapping: &str) -> Result<(u16, u16)> {
    let invalid = || ConfigError::InvalidPortMapping(mapping.to_string());

    let (local, remote) = mapping.split_once(':').ok_or_else(invalid)?;
    let local = local.parse::<u16>().map_err(|_| invalid())?;
    let remote = remote.parse::<u16>().map_err(|_| invalid())?;

    Ok((local, remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(kind: ForwardKind) -> Forward {
        Forward {
            name: "test".to_string(),
            kind,
            watch: false,
            values: ForwardValues::default(),
        }
    }

    #[test]
    fn proxified_forward_kinds() {
        assert!(forward(ForwardKind::Kubernetes).is_proxified());
        assert!(forward(ForwardKind::KubernetesRemote).is_proxified());
        assert!(forward(ForwardKind::Ssh).is_proxified());
        assert!(!forward(ForwardKind::SshRemote).is_proxified());
    }

    #[test]
    fn unknown_forward_kind_is_rejected_at_parse_time() {
        let err = toml::from_str::<Forward>("name = \"f\"\ntype = \"teleport\"\n").unwrap_err();
        assert!(err.to_string().contains("teleport"), "{err}");
    }

    #[test]
    fn effective_path_returns_literal_path_for_regular_executables() {
        let app = Application {
            name: "api".to_string(),
            path: "/does/not/exist".to_string(),
            executable: "npm".to_string(),
            ..Default::default()
        };
        assert_eq!(app.effective_path(), PathBuf::from("/does/not/exist"));
    }

    #[test]
    fn effective_path_resolves_go_apps_against_gopath() {
        let app = Application {
            name: "api".to_string(),
            path: "github.com/acme/api".to_string(),
            executable: EXECUTABLE_GO.to_string(),
            ..Default::default()
        };
        let gopath = std::env::var("GOPATH").unwrap_or_default();
        assert_eq!(
            app.effective_path(),
            PathBuf::from(gopath).join("src/github.com/acme/api")
        );
    }

    #[test]
    fn effective_path_keeps_existing_go_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = Application {
            name: "api".to_string(),
            path: dir.path().to_string_lossy().to_string(),
            executable: EXECUTABLE_GO.to_string(),
            ..Default::default()
        };
        assert_eq!(app.effective_path(), dir.path());
    }

    #[test]
    fn stop_grace_defaults_to_five_seconds() {
        let app: Application =
            toml::from_str("name = \"api\"\npath = \".\"\nexecutable = \"npm\"\n").unwrap();
        assert_eq!(app.stop_grace(), Duration::from_secs(5));
    }

    #[test]
    fn port_mapping_parses() {
        assert_eq!(parse_port_mapping("80:8080").unwrap(), (80, 8080));
    }

    #[test]
    fn port_mapping_rejects_malformed_values() {
        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("a:b").is_err());
        assert!(parse_port_mapping("80:99999").is_err());
    }

    #[test]
    fn merge_combines_projects_by_name() {
        let mut base: Config = toml::from_str(
            r#"
            [[projects]]
            name = "acme"

            [[projects.local]]
            name = "api"
            path = "."
            executable = "npm"
            "#,
        )
        .unwrap();

        let extra: Config = toml::from_str(
            r#"
            [[projects]]
            name = "acme"

            [[projects.forward]]
            name = "auth"
            type = "kubernetes"

            [[projects]]
            name = "other"
            "#,
        )
        .unwrap();

        base.merge(extra);

        assert_eq!(base.project_names(), vec!["acme", "other"]);
        let acme = base.select_project(Some("acme")).unwrap();
        assert_eq!(acme.applications.len(), 1);
        assert_eq!(acme.forwards.len(), 1);
    }

    #[test]
    fn select_project_without_name_requires_a_single_project() {
        let config: Config = toml::from_str(
            r#"
            [[projects]]
            name = "a"

            [[projects]]
            name = "b"
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.select_project(None),
            Err(ConfigError::ProjectAmbiguous(_))
        ));
        assert_eq!(config.select_project(Some("b")).unwrap().name, "b");
        assert!(matches!(
            config.select_project(Some("c")),
            Err(ConfigError::ProjectNotFound(_, _))
        ));
    }
}
