/*
 * Copyright (C) 2024 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Applies a machine config to the host and reboots into it.
//!
//! Success is a terminal effect: the machine reboots and this process
//! never observes it. Callers must treat `update()` returning `Ok` as a
//! failure of the reboot to occur.

use std::io::Write as _;
use std::process::Command;

use anyhow::{Context, Result};
use fn_error_context::context;
use openat_ext::OpenatDirExt;

use crate::cluster::Drainer;
use crate::files::{
    decode_data_url, dedup_files, dropin_path, relative_path, replace_symlink, unit_path,
    unit_wants_path, write_file_atomic, DEFAULT_FILE_MODE,
};
use crate::imageref::same_image;
use crate::model::MachineConfig;
use crate::osupdater::NodeUpdater;
use crate::statefile::StateStore;
use crate::util::CommandExt;
use crate::validator::LEGACY_OS_IMAGE_PLACEHOLDER;

/// Initiates the actual reboot; injected so the state machine can be
/// exercised without taking the host down.
pub(crate) trait Rebooter: Send + Sync {
    fn reboot(&self) -> Result<()>;
}

/// Reboot through the init system. On success this never returns.
pub(crate) struct SystemdRebooter;

impl Rebooter for SystemdRebooter {
    #[context("Initiating reboot")]
    fn reboot(&self) -> Result<()> {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        Command::new("systemctl").arg("reboot").run_checked()?;
        log::debug!("reboot requested; parking until the machine goes down");
        loop {
            std::thread::park();
        }
    }
}

pub(crate) struct Updater<'a> {
    pub(crate) root: &'a openat::Dir,
    pub(crate) os_image_based: bool,
    pub(crate) node_updater: &'a dyn NodeUpdater,
    pub(crate) drain: &'a dyn Drainer,
    pub(crate) state_store: &'a StateStore,
    pub(crate) rebooter: &'a dyn Rebooter,
    /// Standalone modes have no workloads to evict.
    pub(crate) skip_drain: bool,
}

impl Updater<'_> {
    /// Drive the node from `current` to `desired`: drain, stage files and
    /// units, stage the OS image, persist the pending record, reboot.
    /// Does not return on success.
    pub(crate) fn update(
        &self,
        node_name: &str,
        current: &MachineConfig,
        desired: &MachineConfig,
    ) -> Result<()> {
        log::info!(
            "updating node {} from config {} to {}",
            node_name,
            current.name,
            desired.name
        );
        if self.skip_drain {
            log::debug!("drain skipped");
        } else {
            self.drain
                .drain(node_name)
                .with_context(|| format!("draining node {node_name}"))?;
        }

        self.apply_to_disk(desired)?;
        self.stage_os(desired)?;

        self.state_store
            .write_pending(&desired.name)
            .context("persisting pending config")?;

        log::info!("rebooting into config {}", desired.name);
        self.rebooter.reboot()
    }

    /// Write the files, units and SSH keys of `config` to the root.
    /// Restartable: every write is a full atomic replace, so a retry after
    /// interruption converges.
    #[context("Staging config {} to disk", config.name)]
    pub(crate) fn apply_to_disk(&self, config: &MachineConfig) -> Result<()> {
        for file in dedup_files(&config.files) {
            let contents = decode_data_url(&file.contents)
                .with_context(|| format!("decoding contents of {}", file.path))?;
            write_file_atomic(
                self.root,
                relative_path(&file.path)?,
                &contents,
                file.mode.unwrap_or(DEFAULT_FILE_MODE),
            )?;
            log::debug!("wrote {}", file.path);
        }
        for unit in &config.units {
            self.apply_unit(unit)?;
        }
        self.apply_ssh_keys(config)?;
        Ok(())
    }

    fn apply_unit(&self, unit: &crate::model::SystemdUnit) -> Result<()> {
        for dropin in &unit.dropins {
            write_file_atomic(
                self.root,
                &dropin_path(&unit.name, &dropin.name),
                dropin.contents.as_bytes(),
                DEFAULT_FILE_MODE,
            )?;
        }
        let path = unit_path(&unit.name);
        if unit.mask {
            replace_symlink(self.root, &path, "/dev/null")?;
            log::debug!("masked unit {}", unit.name);
        } else if let Some(contents) = unit.contents.as_deref() {
            if !contents.is_empty() {
                write_file_atomic(self.root, &path, contents.as_bytes(), DEFAULT_FILE_MODE)?;
            }
        }
        let wants = unit_wants_path(&unit.name);
        if unit.enabled && !unit.mask {
            replace_symlink(self.root, &wants, &format!("/{path}"))?;
        } else {
            self.root
                .remove_file_optional(wants.as_str())
                .with_context(|| format!("removing {wants}"))?;
        }
        Ok(())
    }

    /// Only the first user carrying keys is handled today.
    fn apply_ssh_keys(&self, config: &MachineConfig) -> Result<()> {
        let Some(user) = config
            .passwd_users
            .iter()
            .find(|u| !u.ssh_authorized_keys.is_empty())
        else {
            return Ok(());
        };
        let sshdir = format!("home/{}/.ssh", user.name);
        self.root
            .ensure_dir_all(sshdir.as_str(), 0o700)
            .with_context(|| format!("creating {sshdir}"))?;
        let mut keys = user.ssh_authorized_keys.join("\n");
        keys.push('\n');
        write_file_atomic(
            self.root,
            &format!("{sshdir}/authorized_keys"),
            keys.as_bytes(),
            0o600,
        )?;
        log::info!("wrote authorized_keys for user {}", user.name);
        Ok(())
    }

    /// Stage the new OS image for the next boot when the desired image
    /// differs (by digest) from the booted one.
    fn stage_os(&self, desired: &MachineConfig) -> Result<()> {
        if !self.os_image_based {
            return Ok(());
        }
        let url = desired.os_image_url.as_str();
        if url.is_empty() || url == LEGACY_OS_IMAGE_PLACEHOLDER {
            return Ok(());
        }
        let booted = self
            .node_updater
            .booted_image()
            .context("querying booted OS image")?;
        if same_image(&booted.url, url).context("comparing OS image references")? {
            log::debug!("already booted into {url}");
            return Ok(());
        }
        log::info!("staging OS update {} (booted: {})", url, booted.url);
        self.node_updater
            .stage_os_update(url)
            .with_context(|| format!("staging OS update to {url}"))
    }
}
