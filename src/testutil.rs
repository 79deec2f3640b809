//! Fake collaborators for hermetic tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::cluster::{
    ConfigLister, Drainer, Node, NodeLister, NodeWriter, CURRENT_CONFIG_ANNOTATION,
    DESIRED_CONFIG_ANNOTATION, SSH_ACCESSED, SSH_ANNOTATION, STATE_ANNOTATION,
};
use crate::model::{MachineConfig, MachineState};
use crate::osupdater::{BootedImage, NodeUpdater};
use crate::updater::Rebooter;

pub(crate) fn data_url(contents: &str) -> String {
    format!("data:;base64,{}", BASE64.encode(contents))
}

pub(crate) fn make_node(name: &str, current: &str, desired: &str) -> Node {
    Node {
        name: name.to_string(),
        annotations: BTreeMap::from([
            (CURRENT_CONFIG_ANNOTATION.to_string(), current.to_string()),
            (DESIRED_CONFIG_ANNOTATION.to_string(), desired.to_string()),
        ]),
        deleting: false,
    }
}

/// In-memory node object, config registry, event sink and drain tracker.
pub(crate) struct FakeCluster {
    node: Mutex<Node>,
    configs: Mutex<BTreeMap<String, MachineConfig>>,
    events: Mutex<Vec<(String, String)>>,
    degraded: Mutex<Vec<String>>,
    drains: AtomicUsize,
    uncordons: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new(node: Node) -> Self {
        Self {
            node: Mutex::new(node),
            configs: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
            degraded: Mutex::new(Vec::new()),
            drains: AtomicUsize::new(0),
            uncordons: AtomicUsize::new(0),
        }
    }

    pub(crate) fn add_config(&self, config: MachineConfig) {
        self.configs
            .lock()
            .unwrap()
            .insert(config.name.clone(), config);
    }

    pub(crate) fn config(&self, name: &str) -> MachineConfig {
        self.configs.lock().unwrap().get(name).unwrap().clone()
    }

    pub(crate) fn node(&self) -> Node {
        self.node.lock().unwrap().clone()
    }

    pub(crate) fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn degraded_reasons(&self) -> Vec<String> {
        self.degraded.lock().unwrap().clone()
    }

    pub(crate) fn ssh_accessed(&self) -> bool {
        self.node().annotation(SSH_ANNOTATION) == Some(SSH_ACCESSED)
    }

    pub(crate) fn drain_count(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    pub(crate) fn uncordon_count(&self) -> usize {
        self.uncordons.load(Ordering::SeqCst)
    }

    fn annotate(&self, node: &str, key: &str, value: String) -> Result<()> {
        let mut n = self.node.lock().unwrap();
        if n.name != node {
            bail!("unknown node {node}");
        }
        n.annotations.insert(key.to_string(), value);
        Ok(())
    }
}

impl NodeLister for FakeCluster {
    fn get_node(&self, name: &str) -> Result<Node> {
        let node = self.node();
        if node.name != name {
            bail!("unknown node {name}");
        }
        Ok(node)
    }
}

impl ConfigLister for FakeCluster {
    fn get_config(&self, name: &str) -> Result<MachineConfig> {
        self.configs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("machine config {name:?} not found"))
    }
}

impl NodeWriter for FakeCluster {
    fn set_working(&self, node: &str) -> Result<()> {
        self.annotate(node, STATE_ANNOTATION, MachineState::Working.to_string())
    }

    fn set_done(&self, node: &str, current: &str) -> Result<()> {
        self.annotate(node, CURRENT_CONFIG_ANNOTATION, current.to_string())?;
        self.annotate(node, STATE_ANNOTATION, MachineState::Done.to_string())
    }

    fn set_degraded(&self, node: &str, reason: &str) -> Result<()> {
        self.degraded.lock().unwrap().push(reason.to_string());
        self.annotate(node, STATE_ANNOTATION, MachineState::Degraded.to_string())
    }

    fn set_ssh_accessed(&self, node: &str) -> Result<()> {
        self.annotate(node, SSH_ANNOTATION, SSH_ACCESSED.to_string())
    }

    fn record_event(&self, _node: &str, reason: &str, message: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), message.to_string()));
        Ok(())
    }
}

impl Drainer for FakeCluster {
    fn drain(&self, _node: &str) -> Result<()> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn uncordon(&self, _node: &str) -> Result<()> {
        self.uncordons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeNodeUpdater {
    booted: Mutex<BootedImage>,
    staged: Mutex<Vec<String>>,
}

impl FakeNodeUpdater {
    pub(crate) fn new(booted: BootedImage) -> Self {
        Self {
            booted: Mutex::new(booted),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn staged(&self) -> Vec<String> {
        self.staged.lock().unwrap().clone()
    }

    pub(crate) fn set_booted(&self, booted: BootedImage) {
        *self.booted.lock().unwrap() = booted;
    }
}

impl NodeUpdater for FakeNodeUpdater {
    fn booted_image(&self) -> Result<BootedImage> {
        Ok(self.booted.lock().unwrap().clone())
    }

    fn status(&self) -> Result<String> {
        Ok("fake deployment".to_string())
    }

    fn stage_os_update(&self, url: &str) -> Result<()> {
        self.staged.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

/// Records reboot requests instead of taking the machine down.
#[derive(Default)]
pub(crate) struct FakeRebooter {
    count: AtomicUsize,
}

impl FakeRebooter {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Rebooter for FakeRebooter {
    fn reboot(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct NullDrain;

impl Drainer for NullDrain {
    fn drain(&self, _node: &str) -> Result<()> {
        Ok(())
    }

    fn uncordon(&self, _node: &str) -> Result<()> {
        Ok(())
    }
}
