//! Environment composition for child processes.
//!
//! Precedence, lowest to highest: inherited environment, `env_file` pairs,
//! the inline `env` map, then one `PROXY_FORWARD_<NAME>` injection per live
//! proxy forward so children can discover the rewrites programmatically.

use std::collections::HashMap;
use std::path::Path;

use crate::config::Application;
use crate::proxy::ProxyForward;

use super::{Result, RunnerError};

/// Build the child's full environment.
pub fn compose(app: &Application, forwards: &[ProxyForward]) -> Result<HashMap<String, String>> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    if let Some(env_file) = &app.env_file {
        let path = Path::new(env_file);
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunnerError::EnvFile(path.to_path_buf(), e))?;
        for (key, value) in parse_env_file(&content) {
            env.insert(key, value);
        }
    }

    for (key, value) in &app.env {
        env.insert(key.clone(), value.clone());
    }

    for pf in forwards {
        env.insert(
            format!("PROXY_FORWARD_{}", env_var_name(&pf.name)),
            format!("{}:{}", pf.proxy_ip, pf.proxy_port),
        );
    }

    Ok(env)
}

/// Parse `KEY=VALUE` lines, skipping blanks and `#` comments.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}

fn env_var_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::Ipv4Addr;

    fn app() -> Application {
        Application {
            name: "test-app".to_string(),
            path: "/".to_string(),
            executable: "echo".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn env_file_lines_parse_with_comments_and_blanks() {
        let parsed = parse_env_file(
            "# leading comment\n\nMY_ENVFILE_VAR_1=this is ok\nMY_ENVFILE_VAR_2=this is really good\n  \nMY_ENVFILE_VAR_3=great\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("MY_ENVFILE_VAR_1".to_string(), "this is ok".to_string()),
                (
                    "MY_ENVFILE_VAR_2".to_string(),
                    "this is really good".to_string()
                ),
                ("MY_ENVFILE_VAR_3".to_string(), "great".to_string()),
            ]
        );
    }

    #[test]
    fn inline_env_overrides_env_file_overrides_inherited() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MY_VAR=other").unwrap();
        writeln!(file, "F_VAR=f").unwrap();

        let mut app = app();
        app.env_file = Some(file.path().to_string_lossy().to_string());
        app.env.insert("MY_VAR".to_string(), "value".to_string());

        let env = compose(&app, &[]).unwrap();
        assert_eq!(env.get("MY_VAR").unwrap(), "value");
        assert_eq!(env.get("F_VAR").unwrap(), "f");
        // Inherited environment survives underneath.
        assert!(env.contains_key("PATH"));
    }

    #[test]
    fn proxy_forwards_are_injected() {
        let forwards = vec![ProxyForward {
            name: "auth-api".to_string(),
            hostname: "auth.prod".to_string(),
            proxy_ip: Ipv4Addr::new(127, 1, 2, 1),
            proxy_port: 9400,
            forward_port: 61001,
            local_port: 80,
        }];

        let env = compose(&app(), &forwards).unwrap();
        assert_eq!(env.get("PROXY_FORWARD_AUTH_API").unwrap(), "127.1.2.1:9400");
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let mut app = app();
        app.env_file = Some("/definitely/not/here.env".to_string());
        assert!(matches!(
            compose(&app, &[]),
            Err(RunnerError::EnvFile(_, _))
        ));
    }
}
