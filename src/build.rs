//! One-shot shell steps: project setup and pre-run builds.
//!
//! Both executors stream output to the view and fail fast on the first
//! non-zero exit, which suppresses the run that would have followed.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{Application, Project};
use crate::view::{SharedView, View as _};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step '{step}' of '{app}' failed with {code}")]
    Failed { app: String, step: String, code: i32 },

    #[error("Step '{step}' of '{app}' could not start: {source}")]
    Spawn {
        app: String,
        step: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StepError>;

/// Runs each application's `setup` steps once at project start.
pub struct Setuper {
    view: SharedView,
    project: Project,
}

impl Setuper {
    pub fn new(view: SharedView, project: Project) -> Self {
        Self { view, project }
    }

    pub async fn run_all(&self) -> Result<()> {
        for app in &self.project.applications {
            self.run_app(app).await?;
        }
        Ok(())
    }

    pub async fn run_app(&self, app: &Application) -> Result<()> {
        if app.setup.is_empty() {
            return Ok(());
        }

        info!(app = %app.name, steps = app.setup.len(), "Running setup");
        run_steps(&self.view, app, &app.setup).await
    }
}

/// Runs an application's `build` steps before each run or restart.
pub struct Builder {
    view: SharedView,
    project: Project,
}

impl Builder {
    pub fn new(view: SharedView, project: Project) -> Self {
        Self { view, project }
    }

    pub async fn build_all(&self) -> Result<()> {
        for app in &self.project.applications {
            self.build_app(app).await?;
        }
        Ok(())
    }

    pub async fn build_app(&self, app: &Application) -> Result<()> {
        if app.build.is_empty() {
            return Ok(());
        }

        info!(app = %app.name, steps = app.build.len(), "Building");
        run_steps(&self.view, app, &app.build).await
    }
}

async fn run_steps(view: &SharedView, app: &Application, steps: &[String]) -> Result<()> {
    let cwd = app.effective_path();
    for step in steps {
        run_step(view, &app.name, &cwd, step).await?;
    }
    Ok(())
}

async fn run_step(view: &SharedView, app: &str, cwd: &Path, step: &str) -> Result<()> {
    view.writef(format_args!("[{app}] $ {step}"));
    debug!(app, step, cwd = %cwd.display(), "Running step");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(step)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StepError::Spawn {
            app: app.to_string(),
            step: step.to_string(),
            source: e,
        })?;

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(stream(Arc::clone(view), app.to_string(), stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(stream(Arc::clone(view), app.to_string(), stderr));
    }

    let status = child.wait().await.map_err(|e| StepError::Spawn {
        app: app.to_string(),
        step: step.to_string(),
        source: e,
    })?;
    for reader in readers {
        let _ = reader.await;
    }

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        view.writef(format_args!("[{app}] step failed with {code}: {step}"));
        return Err(StepError::Failed {
            app: app.to_string(),
            step: step.to_string(),
            code,
        });
    }

    Ok(())
}

fn stream(
    view: SharedView,
    app: String,
    output: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            view.writef(format_args!("[{app}] {line}"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{BufferedView, NullView};

    fn app_with_steps(build: Vec<&str>) -> Application {
        Application {
            name: "api".to_string(),
            path: "/".to_string(),
            executable: "true".to_string(),
            build: build.into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }

    fn project(app: Application) -> Project {
        Project {
            name: "test".to_string(),
            applications: vec![app],
            forwards: Vec::new(),
        }
    }

    #[tokio::test]
    async fn steps_run_in_order_and_stream_output() {
        let view = Arc::new(BufferedView::new(64));
        let app = app_with_steps(vec!["echo first", "echo second"]);
        let builder = Builder::new(view.clone(), project(app.clone()));

        builder.build_app(&app).await.unwrap();

        let lines = view.drain();
        let first = lines.iter().position(|l| l == "[api] first").unwrap();
        let second = lines.iter().position(|l| l == "[api] second").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn failing_step_aborts_the_sequence() {
        let view = Arc::new(BufferedView::new(64));
        let app = app_with_steps(vec!["exit 7", "echo never"]);
        let builder = Builder::new(view.clone(), project(app.clone()));

        let err = builder.build_app(&app).await.unwrap_err();
        assert!(matches!(err, StepError::Failed { code: 7, .. }));
        assert!(!view.drain().iter().any(|l| l.contains("never")));
    }

    #[tokio::test]
    async fn applications_without_steps_are_noops() {
        let app = app_with_steps(vec![]);
        let setuper = Setuper::new(Arc::new(NullView), project(app.clone()));
        setuper.run_app(&app).await.unwrap();
        setuper.run_all().await.unwrap();
    }
}
