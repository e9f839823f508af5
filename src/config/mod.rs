//! Configuration loading for monday.
//!
//! A `monday.toml` in the current directory is loaded first, then every
//! `*.toml` under the user config directory (`<config>/monday/`). Files merge
//! by project name, so a project can be split across a checked-in file and a
//! personal one.

mod error;
mod model;

pub use error::{ConfigError, Result};
pub use model::{
    Application, Config, EXECUTABLE_GO, Forward, ForwardKind, ForwardValues, Project,
    parse_port_mapping,
};

use std::fs;
use std::path::PathBuf;

pub const CONFIG_FILE_NAME: &str = "monday.toml";

/// Directory holding the user-level configuration files.
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("monday"))
}

/// The path `monday edit` and `monday init` operate on: the local file when
/// present, the user-level one otherwise.
pub fn edit_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return local;
    }

    user_config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .unwrap_or(local)
}

/// Load and merge every discovered configuration file.
pub fn load() -> Result<Config> {
    let mut files = Vec::new();

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        files.push(local);
    }

    if let Some(dir) = user_config_dir()
        && let Ok(entries) = fs::read_dir(&dir)
    {
        let mut user_files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        user_files.sort();
        files.extend(user_files);
    }

    if files.is_empty() {
        return Err(ConfigError::NotFound);
    }

    let mut config = Config::default();
    for path in files {
        let content =
            fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path.clone(), e))?;
        let parsed: Config = toml::from_str(&content)?;
        tracing::debug!(file = %path.display(), projects = parsed.projects.len(), "Loaded config file");
        config.merge(parsed);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_project_declaration() {
        let config: Config = toml::from_str(
            r#"
            [[projects]]
            name = "acme"

            [[projects.local]]
            name = "api"
            path = "github.com/acme/api"
            executable = "go"
            watch = true
            args = ["--port", "8080"]
            setup = ["go mod download"]
            build = ["go build ./..."]

            [projects.local.env]
            HTTP_PORT = "8080"

            [[projects.forward]]
            name = "auth"
            type = "kubernetes"

            [projects.forward.values]
            context = "staging"
            namespace = "backend"
            hostname = "auth.svc.cluster.local"
            ports = ["80:8080"]

            [projects.forward.values.labels]
            app = "auth"
            "#,
        )
        .unwrap();

        let project = config.select_project(Some("acme")).unwrap();
        let app = project.application("api").unwrap();
        assert!(app.watch);
        assert_eq!(app.env.get("HTTP_PORT").unwrap(), "8080");
        assert_eq!(app.setup, vec!["go mod download"]);

        let forward = project.forward("auth").unwrap();
        assert_eq!(forward.kind, ForwardKind::Kubernetes);
        assert!(!forward.watch);
        assert_eq!(forward.values.labels.get("app").unwrap(), "auth");
        assert_eq!(forward.values.ports, vec!["80:8080"]);
    }

    #[test]
    fn empty_document_yields_no_projects() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.projects.is_empty());
    }
}
