use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use log::LevelFilter;

use crate::cluster::{LoggingDrain, ManifestCluster, NodeLister, CURRENT_CONFIG_ANNOTATION};
use crate::daemon::{Daemon, Event, Settings};
use crate::health;
use crate::journal::LoginAuditor;
use crate::model::MachineConfig;
use crate::oncefrom::{self, OnceFromConfig};
use crate::osupdater::{NodeUpdater, RpmOstreeClient};
use crate::statefile::StateStore;
use crate::updater::{SystemdRebooter, Updater};
use crate::util;
use crate::validator::{OnDiskValidator, ValidationResult};

/// Top-level command surface of the daemon binary.
#[derive(Debug, Parser)]
#[clap(
    name = "machine-config-daemon",
    about = "Per-node machine configuration reconciler",
    version
)]
pub struct Command {
    /// Raise the log level; may be repeated.
    #[clap(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    #[clap(subcommand)]
    pub cmd: Verb,
}

impl Command {
    /// Log level corresponding to the number of `-v` flags given.
    pub(crate) fn loglevel(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// Dispatch to the selected verb.
    pub fn run(self) -> Result<()> {
        match self.cmd {
            Verb::Start(opts) => run_start(opts),
            Verb::Validate(opts) => run_validate(opts),
        }
    }
}

#[derive(Debug, Parser)]
pub enum Verb {
    #[clap(name = "start", about = "Run the reconciler for this node")]
    Start(StartOpts),
    #[clap(
        name = "validate",
        about = "Validate on-disk state against the node's current config"
    )]
    Validate(ValidateOpts),
}

#[derive(Debug, Parser)]
pub struct StartOpts {
    /// Name of the node object this daemon manages.
    #[clap(long)]
    node_name: String,

    /// Operating system tag; image-based variants can pivot the OS.
    #[clap(long, default_value = "rhel-coreos")]
    operating_system: String,

    /// Mount point of the host filesystem to operate on.
    #[clap(long, default_value = "/")]
    root_mount: Utf8PathBuf,

    /// Apply a single config from a path or http(s) URL, then stop.
    #[clap(long)]
    once_from: Option<String>,

    /// Kubelet health endpoint to poll.
    #[clap(long, default_value = health::DEFAULT_HEALTH_ENDPOINT)]
    kubelet_healthz_endpoint: String,

    /// Disable kubelet health monitoring.
    #[clap(long, action)]
    disable_kubelet_healthz: bool,

    /// Log on-disk drift after reboot instead of degrading the node.
    #[clap(long, action)]
    no_degrade_on_drift: bool,
}

#[derive(Debug, Parser)]
pub struct ValidateOpts {
    /// Name of the node object this daemon manages.
    #[clap(long)]
    node_name: String,

    /// Operating system tag; image-based variants can pivot the OS.
    #[clap(long, default_value = "rhel-coreos")]
    operating_system: String,

    /// Mount point of the host filesystem to operate on.
    #[clap(long, default_value = "/")]
    root_mount: Utf8PathBuf,
}

/// Whether this OS takes updates as whole images (and can pivot), as
/// opposed to package-managed hosts where we only manage files and units.
fn os_is_image_based(tag: &str) -> bool {
    tag.contains("coreos")
}

fn register_stop_signals(events: Sender<Event>, stop: Arc<AtomicBool>) -> Result<()> {
    for signal in [libc::SIGTERM, libc::SIGINT] {
        let events = events.clone();
        let stop = stop.clone();
        // SAFETY: the handler only flips the stop flag and posts to the
        // event channel.
        unsafe {
            signal_hook_registry::register(signal, move || {
                stop.store(true, Ordering::SeqCst);
                let _ = events.send(Event::Shutdown);
            })
        }
        .with_context(|| format!("registering handler for signal {signal}"))?;
    }
    Ok(())
}

fn run_start(opts: StartOpts) -> Result<()> {
    // Everything we manage (host files, mounts, the reboot) needs root.
    if !rustix::process::getuid().is_root() {
        anyhow::bail!("machine-config-daemon must run as root to manage the host");
    }
    let boot_id = util::current_boot_id()?;
    let os_image_based = os_is_image_based(&opts.operating_system);
    log::info!(
        "machine-config-daemon starting on {} (OS {}, boot {})",
        opts.node_name,
        opts.operating_system,
        boot_id
    );

    if let Some(source) = opts.once_from.clone() {
        return run_once_from(&opts, &source, &boot_id, os_image_based);
    }

    // Must happen before anything chroots into the root mount.
    util::bind_run_secrets(&opts.root_mount)?;

    let root = openat::Dir::open(opts.root_mount.as_std_path())
        .with_context(|| format!("opening root mount {}", opts.root_mount))?;
    let cluster = Arc::new(ManifestCluster::open(&root)?);

    let (events, events_rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    register_stop_signals(events.clone(), stop.clone())?;

    let watcher = crate::cluster::spawn_node_watcher(
        opts.root_mount.clone(),
        opts.node_name.clone(),
        events.clone(),
        stop.clone(),
    );
    let health_poller = (!opts.disable_kubelet_healthz).then(|| {
        health::spawn_health_poller(
            opts.kubelet_healthz_endpoint.clone(),
            events.clone(),
            stop.clone(),
        )
    });
    let auditor =
        match LoginAuditor::spawn(cluster.clone(), opts.node_name.clone(), events.clone()) {
            Ok(a) => Some(a),
            Err(e) => {
                log::warn!("login session auditing unavailable: {e:#}");
                None
            }
        };

    let mut daemon = Daemon::new(
        Settings {
            node_name: opts.node_name.clone(),
            os_image_based,
            degrade_on_drift: !opts.no_degrade_on_drift,
            scan_journal: true,
        },
        root,
        boot_id,
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        Arc::new(LoggingDrain),
        Arc::new(RpmOstreeClient),
        Arc::new(SystemdRebooter),
    )?;
    let result = daemon.run(events_rx);

    // Wind down the auxiliaries; no subprocess outlives the stop signal.
    stop.store(true, Ordering::SeqCst);
    if let Some(auditor) = auditor {
        auditor.stop();
    }
    let _ = watcher.join();
    if let Some(h) = health_poller {
        let _ = h.join();
    }
    result
}

/// One-shot provisioning from a local or remote config, without a
/// cluster. An Ignition payload is applied in place; a machine config
/// runs the full update path (including the reboot).
fn run_once_from(
    opts: &StartOpts,
    source: &str,
    boot_id: &str,
    os_image_based: bool,
) -> Result<()> {
    let config = oncefrom::load(source)?;
    let root = openat::Dir::open(opts.root_mount.as_std_path())
        .with_context(|| format!("opening root mount {}", opts.root_mount))?;
    let state_store = StateStore::new(root.try_clone()?, boot_id.to_string());
    let node_updater = RpmOstreeClient;
    let rebooter = SystemdRebooter;
    let updater = Updater {
        root: &root,
        os_image_based,
        node_updater: &node_updater,
        drain: &LoggingDrain,
        state_store: &state_store,
        rebooter: &rebooter,
        skip_drain: true,
    };
    match config {
        OnceFromConfig::Ignition(ignition) => {
            let config = ignition.into_machine_config();
            updater.apply_to_disk(&config)?;
            log::info!("applied Ignition config from {source}");
            Ok(())
        }
        OnceFromConfig::MachineConfig(config) => {
            updater.update(&opts.node_name, &MachineConfig::default(), &config)?;
            anyhow::bail!("update to config {} returned without rebooting", config.name)
        }
    }
}

fn run_validate(opts: ValidateOpts) -> Result<()> {
    let root = openat::Dir::open(opts.root_mount.as_std_path())
        .with_context(|| format!("opening root mount {}", opts.root_mount))?;
    let cluster = ManifestCluster::open(&root)?;
    let node = cluster.get_node(&opts.node_name)?;
    let current = node
        .annotation(CURRENT_CONFIG_ANNOTATION)
        .with_context(|| format!("node {} has no current config annotation", node.name))?;
    let config = crate::cluster::ConfigLister::get_config(&cluster, current)?;
    let os_image_based = os_is_image_based(&opts.operating_system);
    let booted = if os_image_based {
        Some(RpmOstreeClient.booted_image()?)
    } else {
        None
    };
    let validator = OnDiskValidator::new(root.try_clone()?, os_image_based);
    match validator.validate(&config, booted.as_ref()) {
        ValidationResult::Valid => {
            println!("Validated: {current}");
            Ok(())
        }
        ValidationResult::Errors(errs) => {
            for err in errs {
                eprintln!("{err}");
            }
            anyhow::bail!("Caught validation errors")
        }
    }
}
