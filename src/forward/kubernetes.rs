//! Kubernetes forward controller.
//!
//! Pods are resolved by label through `kubectl get pods -o json` and the
//! tunnel is a supervised `kubectl port-forward` child. When the tunnel
//! exits (pod deleted, connection dropped) the driver re-resolves, so the
//! controller follows pod churn onto the replacement pod.

use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Forward;
use crate::view::{SharedView, View as _};

use super::{ForwardError, ForwardState, PortMap, Result, StateCell};

#[derive(Debug, Deserialize)]
pub(crate) struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: String,
    /// RFC 3339 timestamp; kubectl emits UTC, so string order is time order
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    ready: bool,
}

/// Pick the target pod: phase `Running`, every container ready, most recent
/// start time, ties broken by the lexicographically smallest name.
pub(crate) fn select_pod(list: &PodList) -> Option<String> {
    let mut candidates: Vec<(&str, &str)> = list
        .items
        .iter()
        .filter(|pod| pod.status.phase == "Running")
        .filter(|pod| !pod.status.container_statuses.is_empty())
        .filter(|pod| pod.status.container_statuses.iter().all(|c| c.ready))
        .map(|pod| {
            (
                pod.status.start_time.as_deref().unwrap_or(""),
                pod.metadata.name.as_str(),
            )
        })
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(a.0).then(a.1.cmp(b.1)));
    candidates.first().map(|(_, name)| (*name).to_string())
}

fn label_selector(forward: &Forward) -> String {
    let mut labels: Vec<String> = forward
        .values
        .labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    labels.sort();
    labels.join(",")
}

fn cluster_args(forward: &Forward) -> Vec<String> {
    let mut args = Vec::new();
    if !forward.values.context.is_empty() {
        args.push("--context".to_string());
        args.push(forward.values.context.clone());
    }
    if !forward.values.namespace.is_empty() {
        args.push("--namespace".to_string());
        args.push(forward.values.namespace.clone());
    }
    args
}

/// Resolve the current target pod for a forward.
async fn resolve_pod(forward: &Forward) -> Result<String> {
    let selector = label_selector(forward);

    let output = Command::new("kubectl")
        .args(cluster_args(forward))
        .args(["get", "pods", "--selector", &selector, "--output", "json"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ForwardError::Kubectl(format!("cannot run kubectl: {e}")))?;

    if !output.status.success() {
        return Err(ForwardError::Kubectl(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let list: PodList = serde_json::from_slice(&output.stdout)
        .map_err(|e| ForwardError::Kubectl(format!("unexpected pod list: {e}")))?;

    select_pod(&list).ok_or_else(|| ForwardError::NoReadyPod {
        namespace: forward.values.namespace.clone(),
        labels: selector,
    })
}

/// Resolve the pod and hold a `kubectl port-forward` tunnel to it until the
/// child exits. Dropping the returned future kills the child.
pub(crate) async fn run_tunnel(
    view: &SharedView,
    forward: &Forward,
    maps: &[PortMap],
    state: &Arc<StateCell>,
    last_pod: &mut Option<String>,
) -> Result<()> {
    state.set(ForwardState::Resolving);
    let pod = resolve_pod(forward).await?;

    match last_pod.replace(pod.clone()) {
        Some(previous) if previous != pod => {
            view.writef(format_args!(
                "Forward '{}' switching pod {previous} -> {pod}",
                forward.name
            ));
            info!(forward = %forward.name, from = %previous, to = %pod, "Pod changed");
        }
        None => info!(forward = %forward.name, %pod, "Pod resolved"),
        _ => {}
    }

    state.set(ForwardState::Dialing);

    let mut command = Command::new("kubectl");
    command
        .args(cluster_args(forward))
        .arg("port-forward")
        .arg(format!("pod/{pod}"))
        .args(
            maps.iter()
                .map(|map| format!("{}:{}", map.bind_port, map.remote_port)),
        )
        .args(&forward.values.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ForwardError::Kubectl(format!("cannot run kubectl: {e}")))?;

    // kubectl announces each bound port; the first announcement means the
    // tunnel accepts connections.
    if let Some(stdout) = child.stdout.take() {
        let state = Arc::clone(state);
        let name = forward.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(forward = %name, %line, "port-forward");
                if line.starts_with("Forwarding from") {
                    state.set(ForwardState::Ready);
                }
            }
        });
    }

    // Keep the last stderr line around; it usually names the cause when the
    // tunnel dies (pod deleted, connection refused).
    let stderr_tail = Arc::new(parking_lot::Mutex::new(String::new()));
    if let Some(stderr) = child.stderr.take() {
        let tail = Arc::clone(&stderr_tail);
        let name = forward.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(forward = %name, %line, "port-forward stderr");
                *tail.lock() = line;
            }
        });
    }

    let status = child
        .wait()
        .await
        .map_err(|e| ForwardError::Kubectl(format!("wait failed: {e}")))?;

    let tail = stderr_tail.lock().clone();
    Err(ForwardError::TunnelExit(
        forward.name.clone(),
        if tail.is_empty() {
            status.to_string()
        } else {
            tail
        },
    ))
}
