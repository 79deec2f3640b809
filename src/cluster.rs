//! The node-facing cluster surface.
//!
//! The daemon reads the node object and config objects through narrow
//! capability traits and writes state transitions back through
//! [`NodeWriter`]; the cluster client proper (API machinery, informers,
//! eviction policy) lives outside this crate. The file-backed
//! [`ManifestCluster`] implementation serves standalone deployments where
//! an external sync process materializes the objects on disk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use openat_ext::OpenatDirExt;
use serde::{Deserialize, Serialize};

use crate::daemon::Event;
use crate::model::{MachineConfig, MachineState};
use crate::statefile::STATE_DIR;

/// Name of the last config known to be fully applied to this node.
pub(crate) const CURRENT_CONFIG_ANNOTATION: &str = "machineconfiguration.io/currentConfig";
/// Name of the config this node should converge to; written by the
/// cluster-level controller, never by us.
pub(crate) const DESIRED_CONFIG_ANNOTATION: &str = "machineconfiguration.io/desiredConfig";
/// One of Working/Done/Degraded; missing means Done (legacy nodes).
pub(crate) const STATE_ANNOTATION: &str = "machineconfiguration.io/state";
/// Informational marker that someone logged into the node.
pub(crate) const SSH_ANNOTATION: &str = "machineconfiguration.io/ssh";
pub(crate) const SSH_ACCESSED: &str = "accessed";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Node {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) annotations: BTreeMap<String, String>,
    /// Set when the node object is being deleted from the cluster.
    #[serde(default)]
    pub(crate) deleting: bool,
}

impl Node {
    pub(crate) fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(|s| s.as_str())
    }

    pub(crate) fn machine_state(&self) -> Result<MachineState> {
        MachineState::from_annotation(self.annotation(STATE_ANNOTATION))
    }
}

/// Cached read of the node object.
pub(crate) trait NodeLister: Send + Sync {
    fn get_node(&self, name: &str) -> Result<Node>;
}

/// Cached read of machine config objects by name.
pub(crate) trait ConfigLister: Send + Sync {
    fn get_config(&self, name: &str) -> Result<MachineConfig>;
}

/// Persists node state transitions; each call is expected to retry
/// transient write conflicts internally.
pub(crate) trait NodeWriter: Send + Sync {
    fn set_working(&self, node: &str) -> Result<()>;
    fn set_done(&self, node: &str, current: &str) -> Result<()>;
    fn set_degraded(&self, node: &str, reason: &str) -> Result<()>;
    fn set_ssh_accessed(&self, node: &str) -> Result<()>;
    fn record_event(&self, node: &str, reason: &str, message: &str) -> Result<()>;
}

/// Cordon/drain before host mutation, and the reverse once converged.
pub(crate) trait Drainer: Send + Sync {
    fn drain(&self, node: &str) -> Result<()>;
    fn uncordon(&self, node: &str) -> Result<()>;
}

const NODE_OBJECT_NAME: &str = "node.json";
const CONFIG_DIR: &str = "configs";
const EVENTS_NAME: &str = "events.jsonl";

/// One recorded node event, appended as a JSON line.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RecordedEvent {
    time: DateTime<Utc>,
    node: String,
    reason: String,
    message: String,
}

/// File-backed cluster objects under `<root>/etc/machine-config-daemon/`.
pub(crate) struct ManifestCluster {
    state_dir: openat::Dir,
}

impl ManifestCluster {
    #[context("Opening cluster manifest directory")]
    pub(crate) fn open(root: &openat::Dir) -> Result<Self> {
        root.ensure_dir_all(STATE_DIR, 0o755)
            .with_context(|| format!("creating {STATE_DIR}"))?;
        let state_dir = root.sub_dir(STATE_DIR)?;
        Ok(Self { state_dir })
    }

    fn read_node(&self) -> Result<Node> {
        let Some(f) = self.state_dir.open_file_optional(NODE_OBJECT_NAME)? else {
            anyhow::bail!("node object {STATE_DIR}/{NODE_OBJECT_NAME} not found");
        };
        let node: Node = serde_json::from_reader(std::io::BufReader::new(f))
            .with_context(|| format!("parsing {NODE_OBJECT_NAME}"))?;
        Ok(node)
    }

    /// Read-modify-write the node object; the write is an atomic replace.
    fn mutate_node(&self, node: &str, f: impl FnOnce(&mut Node)) -> Result<()> {
        let mut obj = self.read_node()?;
        if obj.name != node {
            anyhow::bail!("node object is {:?}, expected {:?}", obj.name, node);
        }
        f(&mut obj);
        self.state_dir
            .write_file_with(NODE_OBJECT_NAME, 0o644, |w| -> Result<_> {
                Ok(serde_json::to_writer_pretty(w, &obj)?)
            })
            .with_context(|| format!("writing {NODE_OBJECT_NAME}"))?;
        Ok(())
    }
}

impl NodeLister for ManifestCluster {
    fn get_node(&self, name: &str) -> Result<Node> {
        let node = self.read_node()?;
        if node.name != name {
            anyhow::bail!("node object is {:?}, expected {:?}", node.name, name);
        }
        Ok(node)
    }
}

impl ConfigLister for ManifestCluster {
    fn get_config(&self, name: &str) -> Result<MachineConfig> {
        let path = format!("{CONFIG_DIR}/{name}.json");
        let Some(f) = self.state_dir.open_file_optional(path.as_str())? else {
            anyhow::bail!("machine config {name:?} not found");
        };
        let config: MachineConfig = serde_json::from_reader(std::io::BufReader::new(f))
            .with_context(|| format!("parsing machine config {name:?}"))?;
        Ok(config)
    }
}

impl NodeWriter for ManifestCluster {
    fn set_working(&self, node: &str) -> Result<()> {
        self.mutate_node(node, |n| {
            n.annotations.insert(
                STATE_ANNOTATION.into(),
                MachineState::Working.to_string(),
            );
        })
    }

    fn set_done(&self, node: &str, current: &str) -> Result<()> {
        self.mutate_node(node, |n| {
            n.annotations
                .insert(CURRENT_CONFIG_ANNOTATION.into(), current.into());
            n.annotations
                .insert(STATE_ANNOTATION.into(), MachineState::Done.to_string());
        })
    }

    fn set_degraded(&self, node: &str, reason: &str) -> Result<()> {
        log::error!("marking node {node} degraded: {reason}");
        self.mutate_node(node, |n| {
            n.annotations
                .insert(STATE_ANNOTATION.into(), MachineState::Degraded.to_string());
        })
    }

    fn set_ssh_accessed(&self, node: &str) -> Result<()> {
        self.mutate_node(node, |n| {
            n.annotations
                .insert(SSH_ANNOTATION.into(), SSH_ACCESSED.into());
        })
    }

    fn record_event(&self, node: &str, reason: &str, message: &str) -> Result<()> {
        let ev = RecordedEvent {
            time: Utc::now(),
            node: node.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        };
        let mut f = self
            .state_dir
            .append_file(EVENTS_NAME, 0o644)
            .with_context(|| format!("opening {EVENTS_NAME}"))?;
        use std::io::Write;
        serde_json::to_writer(&mut f, &ev)?;
        f.write_all(b"\n")?;
        Ok(())
    }
}

/// Drainer for standalone deployments: there is no eviction surface to
/// talk to, so cordon/drain reduces to logging.
pub(crate) struct LoggingDrain;

impl Drainer for LoggingDrain {
    fn drain(&self, node: &str) -> Result<()> {
        log::info!("no cluster connection; skipping drain of {node}");
        Ok(())
    }

    fn uncordon(&self, node: &str) -> Result<()> {
        log::info!("no cluster connection; skipping uncordon of {node}");
        Ok(())
    }
}

/// Watch the node object file for modification and feed change events to
/// the reconciler. Stand-in for the informer `updated` callback.
pub(crate) fn spawn_node_watcher(
    root: camino::Utf8PathBuf,
    node_name: String,
    events: Sender<Event>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    const POLL: Duration = Duration::from_secs(2);
    let path = root.join(STATE_DIR).join(NODE_OBJECT_NAME);
    std::thread::spawn(move || {
        let mut last: Option<SystemTime> = None;
        while !stop.load(Ordering::SeqCst) {
            let mtime = std::fs::metadata(path.as_std_path())
                .and_then(|m| m.modified())
                .ok();
            if mtime.is_some() && mtime != last {
                last = mtime;
                if events.send(Event::NodeChanged(node_name.clone())).is_err() {
                    break;
                }
            }
            std::thread::sleep(POLL);
        }
    })
}
