//! The reconcile loop: a single worker consuming node events from one
//! channel, gated behind the boot-time state check.
//!
//! All state transitions (annotations, pending state file, host
//! mutations) happen on the worker; auxiliary threads only feed events
//! in. The first tick after process start runs the boot check and no
//! normal sync is processed until it succeeds.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use openat_ext::OpenatDirExt;
use thiserror::Error;

use crate::cluster::{
    ConfigLister, Drainer, Node, NodeLister, NodeWriter, CURRENT_CONFIG_ANNOTATION,
    DESIRED_CONFIG_ANNOTATION,
};
use crate::imageref::same_image;
use crate::journal;
use crate::model::MachineConfig;
use crate::osupdater::NodeUpdater;
use crate::resolver::{ConfigResolver, INITIAL_ANNOTATIONS_PATH};
use crate::statefile::{RebootLoopError, StateStore};
use crate::updater::{Rebooter, Updater};
use crate::validator::{OnDiskValidator, ValidationResult, LEGACY_OS_IMAGE_PLACEHOLDER};

/// Debounce applied to node update callbacks, absorbing annotation churn.
const NODE_UPDATE_DELAY: Duration = Duration::from_secs(5);
/// First retry backoff; doubles per consecutive failure.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(5);
/// Consecutive failures for one key before the node is degraded.
const MAX_RETRIES: u32 = 15;
/// Requeue interval once degraded, so an external fix is re-observed.
const DEGRADED_REQUEUE_DELAY: Duration = Duration::from_secs(60);

const EVENT_UPDATE_STARTED: &str = "update started";
const EVENT_UPDATE_COMPLETE: &str = "update complete";
const EVENT_DEGRADED: &str = "degraded";

/// Everything that can wake the worker.
#[derive(Debug)]
pub(crate) enum Event {
    /// The node object changed; carries the node name as the work key.
    NodeChanged(String),
    /// An auxiliary task failed. Logged, never fatal.
    Background(anyhow::Error),
    Shutdown,
}

/// On-disk state diverged from the expected config; the node has been
/// marked degraded and the key must not be retried automatically.
#[derive(Debug, Error)]
#[error("unexpected on-disk state for config {config}")]
pub(crate) struct DriftError {
    pub(crate) config: String,
}

/// The updater's success path reboots the machine; coming back from it
/// means the terminal effect did not occur.
#[derive(Debug, Error)]
#[error("update to config {config} returned without rebooting")]
pub(crate) struct UpdateReturnedError {
    pub(crate) config: String,
}

pub(crate) struct Settings {
    pub(crate) node_name: String,
    pub(crate) os_image_based: bool,
    pub(crate) degrade_on_drift: bool,
    /// Disabled where journald is unavailable (once-from, tests).
    pub(crate) scan_journal: bool,
}

pub(crate) struct Daemon {
    settings: Settings,
    root: openat::Dir,
    state_store: StateStore,
    lister: Arc<dyn NodeLister>,
    configs: Arc<dyn ConfigLister>,
    writer: Arc<dyn NodeWriter>,
    drain: Arc<dyn Drainer>,
    node_updater: Arc<dyn NodeUpdater>,
    rebooter: Arc<dyn Rebooter>,
    /// Refreshed only at the start of a sync; everything downstream of a
    /// sync reads this cache.
    node: Option<Node>,
    /// Gates normal syncs until the boot check has succeeded once.
    booting: bool,
    retries: HashMap<String, u32>,
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    /// Earliest live deadline per key; heap entries not matching are stale.
    queued: HashMap<String, Instant>,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: Settings,
        root: openat::Dir,
        boot_id: String,
        lister: Arc<dyn NodeLister>,
        configs: Arc<dyn ConfigLister>,
        writer: Arc<dyn NodeWriter>,
        drain: Arc<dyn Drainer>,
        node_updater: Arc<dyn NodeUpdater>,
        rebooter: Arc<dyn Rebooter>,
    ) -> Result<Self> {
        let state_store = StateStore::new(root.try_clone().context("reopening root")?, boot_id);
        Ok(Self {
            settings,
            root,
            state_store,
            lister,
            configs,
            writer,
            drain,
            node_updater,
            rebooter,
            node: None,
            booting: true,
            retries: HashMap::new(),
            heap: BinaryHeap::new(),
            queued: HashMap::new(),
        })
    }

    /// Run until the stop event arrives or a fatal error surfaces.
    pub(crate) fn run(&mut self, events: Receiver<Event>) -> Result<()> {
        log::info!("reconciling node {}", self.settings.node_name);
        if self.settings.os_image_based {
            match self.node_updater.status() {
                Ok(status) => log::debug!("deployment status: {status}"),
                Err(e) => log::warn!("querying deployment status: {e:#}"),
            }
        }
        if libsystemd::daemon::booted() {
            use libsystemd::daemon::{self, NotifyState};
            if let Err(e) = daemon::notify(false, &[NotifyState::Ready]) {
                log::warn!("failed to notify readiness: {e}");
            }
        }
        // Bootstrap tick: run the boot check as the first unit of work.
        self.enqueue_after(self.settings.node_name.clone(), Duration::ZERO);
        loop {
            while let Some(key) = self.pop_due() {
                self.process(&key)?;
            }
            let event = match self.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match events.recv_timeout(timeout) {
                        Ok(ev) => Some(ev),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return Ok(()),
                    }
                }
                None => match events.recv() {
                    Ok(ev) => Some(ev),
                    Err(_) => return Ok(()),
                },
            };
            match event {
                Some(Event::NodeChanged(key)) => {
                    log::debug!("node {key} changed");
                    self.enqueue_after(key, NODE_UPDATE_DELAY);
                }
                Some(Event::Background(e)) => {
                    log::error!("background task failed: {e:#}");
                }
                Some(Event::Shutdown) => {
                    log::info!("stop requested, shutting down");
                    return Ok(());
                }
                None => {}
            }
        }
    }

    /// Handle one due key. The returned error is fatal to the process;
    /// everything else is folded into the retry policy.
    fn process(&mut self, key: &str) -> Result<()> {
        let was_booting = self.booting;
        let result = if self.booting {
            self.check_state_on_boot()
        } else {
            self.sync(key)
        };
        match result {
            Ok(()) => {
                if was_booting {
                    self.booting = false;
                    log::info!("boot state check complete");
                }
                self.retries.remove(key);
            }
            Err(e) => {
                if e.downcast_ref::<RebootLoopError>().is_some() {
                    return Err(e);
                }
                self.handle_err(key, e);
            }
        }
        Ok(())
    }

    /// Runs once per process start. Decides whether the previous boot's
    /// update succeeded, finalizes it, and whether a new one is needed.
    fn check_state_on_boot(&mut self) -> Result<()> {
        let node = self
            .lister
            .get_node(&self.settings.node_name)
            .context("getting node")?;
        self.node = Some(node.clone());

        // Fatal when the recorded bootID is still ours.
        let pending = self.state_store.load_pending()?;
        let resolver = ConfigResolver {
            root: &self.root,
            configs: self.configs.as_ref(),
        };
        let sc = resolver.resolve(&node, pending.as_deref())?;
        log::info!(
            "node {}: state {}, current {}, desired {}, pending {:?}, bootstrapping {}",
            node.name,
            sc.state,
            sc.current.name,
            sc.desired.name,
            sc.pending.as_ref().map(|p| p.name.as_str()),
            sc.bootstrapping,
        );

        if self.settings.scan_journal {
            match journal::boot_sessions_present() {
                Ok(true) => {
                    if let Err(e) = self.writer.set_ssh_accessed(&node.name) {
                        log::warn!("failed to annotate login access: {e:#}");
                    }
                }
                Ok(false) => {}
                Err(e) => log::warn!("scanning journal for login sessions: {e:#}"),
            }
        }

        let mut current = Arc::clone(&sc.current);
        if sc.bootstrapping {
            self.bootstrap_pivot(&current)?;
        }

        let booted = if self.settings.os_image_based {
            Some(
                self.node_updater
                    .booted_image()
                    .context("querying booted OS image")?,
            )
        } else {
            None
        };
        let target = sc.pending.as_ref().unwrap_or(&current);
        let validator = OnDiskValidator::new(
            self.root.try_clone().context("reopening root")?,
            self.settings.os_image_based,
        );
        if let ValidationResult::Errors(errs) = validator.validate(target, booted.as_ref()) {
            if self.settings.degrade_on_drift {
                let reason = format!("unexpected on-disk state validating config {}", target.name);
                if let Err(e) = self.writer.set_degraded(&node.name, &reason) {
                    log::error!("failed to mark node degraded: {e:#}");
                }
                if let Err(e) = self.writer.record_event(&node.name, EVENT_DEGRADED, &errs.join("; "))
                {
                    log::warn!("failed to record event: {e:#}");
                }
                return Err(DriftError {
                    config: target.name.clone(),
                }
                .into());
            }
            log::warn!(
                "on-disk state diverges from config {} ({} findings); degrade on drift is disabled",
                target.name,
                errs.len()
            );
        }

        let mut finalized = false;
        if let Some(pending) = sc.pending.as_ref() {
            self.writer
                .set_done(&node.name, &pending.name)
                .context("finalizing pending config")?;
            self.state_store.clear().context("clearing pending state")?;
            current = Arc::clone(pending);
            finalized = true;
        }

        if Arc::ptr_eq(&current, &sc.desired) {
            if finalized {
                self.drain
                    .uncordon(&node.name)
                    .with_context(|| format!("uncordoning node {}", node.name))?;
                if let Err(e) = self.writer.record_event(
                    &node.name,
                    EVENT_UPDATE_COMPLETE,
                    &format!("node configured to {}", current.name),
                ) {
                    log::warn!("failed to record event: {e:#}");
                }
                log::info!("update to config {} complete", current.name);
            } else {
                log::debug!("node {} is in desired config {}", node.name, current.name);
            }
            return Ok(());
        }
        self.trigger_update(&current, &sc.desired)
    }

    /// Bootstrap branch of the boot check: a freshly provisioned node may
    /// have been installed from a disk image older than its config. Pivot
    /// the OS first if so; the files and units were already laid down by
    /// the installer.
    fn bootstrap_pivot(&self, current: &MachineConfig) -> Result<()> {
        let url = current.os_image_url.as_str();
        if self.settings.os_image_based && !url.is_empty() && url != LEGACY_OS_IMAGE_PLACEHOLDER {
            let booted = self
                .node_updater
                .booted_image()
                .context("querying booted OS image")?;
            if !same_image(&booted.url, url).context("comparing OS image references")? {
                log::info!(
                    "bootstrap: booted OS {} does not match {}; pivoting",
                    booted.url,
                    url
                );
                self.node_updater
                    .stage_os_update(url)
                    .with_context(|| format!("staging OS update to {url}"))?;
                self.state_store
                    .write_pending(&current.name)
                    .context("persisting pending config")?;
                // The initial-annotations file stays in place: the next
                // boot re-enters bootstrap mode and takes the matched
                // branch below.
                self.rebooter.reboot()?;
                return Err(UpdateReturnedError {
                    config: current.name.clone(),
                }
                .into());
            }
        }
        // Booted OS matches the config; from here on drift is real drift.
        self.root
            .remove_file_optional(INITIAL_ANNOTATIONS_PATH)
            .context("removing initial annotations file")
            .map(|_| ())
    }

    /// One normal reconcile tick for `key`.
    fn sync(&mut self, key: &str) -> Result<()> {
        if key != self.settings.node_name {
            log::debug!("ignoring foreign node {key}");
            return Ok(());
        }
        let node = self.lister.get_node(key).context("getting node")?;
        if node.deleting {
            log::info!("node {key} is being deleted; nothing to do");
            return Ok(());
        }
        self.node = Some(node);
        self.prep_update()
    }

    /// Compare the current and desired annotations; on change, resolve
    /// the configs and start an update.
    fn prep_update(&mut self) -> Result<()> {
        let node = self.node.clone().context("no node cached for sync")?;
        let current_name = node
            .annotation(CURRENT_CONFIG_ANNOTATION)
            .with_context(|| format!("node {} has no current config annotation", node.name))?;
        let desired_name = node
            .annotation(DESIRED_CONFIG_ANNOTATION)
            .with_context(|| format!("node {} has no desired config annotation", node.name))?;
        if current_name == desired_name {
            log::debug!("node {} already at config {}", node.name, current_name);
            return Ok(());
        }
        log::info!(
            "node {}: config changed, {} -> {}",
            node.name,
            current_name,
            desired_name
        );
        let resolver = ConfigResolver {
            root: &self.root,
            configs: self.configs.as_ref(),
        };
        let sc = resolver.resolve(&node, None)?;
        self.trigger_update(&sc.current, &sc.desired)
    }

    /// Mark the node working and hand off to the updater. Only returns
    /// on failure; a completed update reboots the machine.
    fn trigger_update(
        &self,
        current: &MachineConfig,
        desired: &MachineConfig,
    ) -> Result<()> {
        let node = self.node.as_ref().context("no node cached for update")?;
        self.writer
            .set_working(&node.name)
            .context("setting working state")?;
        if let Err(e) = self.writer.record_event(
            &node.name,
            EVENT_UPDATE_STARTED,
            &format!("updating node to config {}", desired.name),
        ) {
            log::warn!("failed to record event: {e:#}");
        }
        let updater = Updater {
            root: &self.root,
            os_image_based: self.settings.os_image_based,
            node_updater: self.node_updater.as_ref(),
            drain: self.drain.as_ref(),
            state_store: &self.state_store,
            rebooter: self.rebooter.as_ref(),
            skip_drain: false,
        };
        updater.update(&node.name, current, desired)?;
        Err(UpdateReturnedError {
            config: desired.name.clone(),
        }
        .into())
    }

    /// Retry policy: rate-limited requeue with exponential backoff, and
    /// once the retries are exhausted, degrade once and requeue slowly.
    fn handle_err(&mut self, key: &str, err: anyhow::Error) {
        if err.downcast_ref::<DriftError>().is_some() {
            log::error!("giving up on node {key}: {err:#}");
            self.retries.remove(key);
            return;
        }
        let count = {
            let e = self.retries.entry(key.to_string()).or_insert(0);
            *e += 1;
            *e
        };
        if count < MAX_RETRIES {
            let delay = RETRY_BASE_DELAY * 2u32.pow((count - 1).min(16));
            log::info!(
                "error syncing node {key} (retry {count}/{MAX_RETRIES} in {delay:?}): {err:#}"
            );
            self.enqueue_after(key.to_string(), delay);
            return;
        }
        let reason = format!("{err:#}");
        log::error!("node {key} failed {MAX_RETRIES} consecutive syncs, degrading: {reason}");
        if let Err(e) = self.writer.set_degraded(key, &reason) {
            log::error!("failed to mark node degraded: {e:#}");
        }
        if let Err(e) = self.writer.record_event(key, EVENT_DEGRADED, &reason) {
            log::warn!("failed to record event: {e:#}");
        }
        self.retries.remove(key);
        self.enqueue_after(key.to_string(), DEGRADED_REQUEUE_DELAY);
    }

    /// Queue a key, keeping only the earliest deadline per key.
    fn enqueue_after(&mut self, key: String, delay: Duration) {
        let deadline = Instant::now() + delay;
        if let Some(existing) = self.queued.get(&key) {
            if *existing <= deadline {
                return;
            }
        }
        self.queued.insert(key.clone(), deadline);
        self.heap.push(Reverse((deadline, key)));
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, key))) = self.heap.peek() {
            match self.queued.get(key) {
                Some(d) if d == deadline => return Some(*deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    fn pop_due(&mut self) -> Option<String> {
        let now = Instant::now();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                return None;
            }
            if let Some(Reverse((deadline, key))) = self.heap.pop() {
                match self.queued.get(&key) {
                    Some(d) if *d == deadline => {
                        self.queued.remove(&key);
                        return Some(key);
                    }
                    _ => {}
                }
            }
        }
        None
    }
}
