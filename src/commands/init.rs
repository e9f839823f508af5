//! `monday init`: scaffold a configuration file.

use std::io::Write as _;

use crate::config::CONFIG_FILE_NAME;

const SAMPLE_CONFIG: &str = r#"# monday configuration
#
# Each project bundles local applications and remote forwards. Run it with
# `monday run <name>`.

[[projects]]
name = "example"

# A local application supervised by monday. stdout/stderr stream into the
# view, and `watch = true` restarts it when files under `path` change.
[[projects.local]]
name = "api"
path = "."
executable = "go"
watch = true
# build = ["go vet ./..."]
# env_file = ".env"

[projects.local.env]
HTTP_PORT = "8080"

# A tunnel from a production hostname to this workstation. Types:
# kubernetes, kubernetes-remote, ssh, ssh-remote.
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
"#;

pub fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = std::path::Path::new(CONFIG_FILE_NAME);

    if path.exists() && !force {
        return Err(format!(
            "{CONFIG_FILE_NAME} already exists; use --force to overwrite"
        )
        .into());
    }

    let mut file = std::fs::File::create(path)?;
    file.write_all(SAMPLE_CONFIG.as_bytes())?;

    println!("Created {CONFIG_FILE_NAME}");
    Ok(())
}
