//! Backend for pivoting the booted OS image.
//!
//! The deployment machinery itself is opaque to the reconciler; all it
//! needs is the booted image identity and an idempotent way to stage a
//! different one for the next boot.

use std::process::Command;

use anyhow::{Context, Result};
use fn_error_context::context;
use serde::Deserialize;

use crate::util::CommandExt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BootedImage {
    pub(crate) url: String,
    pub(crate) version: String,
}

pub(crate) trait NodeUpdater: Send + Sync {
    /// Identity of the currently booted OS image.
    fn booted_image(&self) -> Result<BootedImage>;
    /// Human-readable deployment status, for logging.
    fn status(&self) -> Result<String>;
    /// Stage `url` as the OS image for the next boot. Idempotent.
    fn stage_os_update(&self, url: &str) -> Result<()>;
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct RpmOstreeStatus {
    deployments: Vec<RpmOstreeDeployment>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct RpmOstreeDeployment {
    #[serde(default)]
    booted: bool,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    container_image_reference: Option<String>,
    #[serde(default)]
    origin: Option<String>,
}

/// The rpm-ostree backed implementation used on image-based hosts.
pub(crate) struct RpmOstreeClient;

impl RpmOstreeClient {
    fn base_cmd() -> Command {
        Command::new("rpm-ostree")
    }
}

impl NodeUpdater for RpmOstreeClient {
    #[context("Querying booted deployment")]
    fn booted_image(&self) -> Result<BootedImage> {
        let status: RpmOstreeStatus = Self::base_cmd().args(["status", "--json"]).output_json()?;
        let booted = status
            .deployments
            .into_iter()
            .find(|d| d.booted)
            .context("no booted deployment found")?;
        let url = booted
            .container_image_reference
            .or(booted.origin)
            .context("booted deployment has no image reference")?;
        Ok(BootedImage {
            url,
            version: booted.version.unwrap_or_default(),
        })
    }

    fn status(&self) -> Result<String> {
        Self::base_cmd().arg("status").output_text()
    }

    #[context("Staging OS update to {}", url)]
    fn stage_os_update(&self, url: &str) -> Result<()> {
        Self::base_cmd().arg("rebase").arg(url).run_checked()
    }
}
