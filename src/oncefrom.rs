//! One-shot configuration from a local file or URL, used to provision a
//! machine that has no cluster yet.
//!
//! The payload is either a raw machine config or an Ignition-shaped
//! document; the two drive different flows, so the loader returns a
//! tagged sum and callers dispatch exhaustively.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use fn_error_context::context;
use serde::Deserialize;

use crate::model::{ConfigFile, MachineConfig, PasswdUser, SystemdUnit};

#[derive(Debug)]
pub(crate) enum OnceFromConfig {
    Ignition(IgnitionConfig),
    MachineConfig(MachineConfig),
}

/// The subset of Ignition v3 this daemon can apply directly.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IgnitionConfig {
    #[serde(default)]
    pub(crate) storage: IgnitionStorage,
    #[serde(default)]
    pub(crate) systemd: IgnitionSystemd,
    #[serde(default)]
    pub(crate) passwd: IgnitionPasswd,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IgnitionStorage {
    #[serde(default)]
    pub(crate) files: Vec<IgnitionFile>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IgnitionFile {
    pub(crate) path: String,
    #[serde(default)]
    pub(crate) mode: Option<u32>,
    #[serde(default)]
    pub(crate) contents: IgnitionContents,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IgnitionContents {
    #[serde(default)]
    pub(crate) source: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IgnitionSystemd {
    #[serde(default)]
    pub(crate) units: Vec<SystemdUnit>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IgnitionPasswd {
    #[serde(default)]
    pub(crate) users: Vec<PasswdUser>,
}

impl IgnitionConfig {
    /// Flatten into the native config shape so the normal staging path
    /// can apply it. The name is synthetic; nothing records it.
    pub(crate) fn into_machine_config(self) -> MachineConfig {
        MachineConfig {
            name: "once-from-ignition".to_string(),
            os_image_url: String::new(),
            files: self
                .storage
                .files
                .into_iter()
                .map(|f| ConfigFile {
                    path: f.path,
                    contents: f.contents.source.unwrap_or_default(),
                    mode: f.mode,
                })
                .collect(),
            units: self.systemd.units,
            passwd_users: self.passwd.users,
        }
    }
}

/// Load a once-from source: a local path, or an http(s) URL.
#[context("Loading once-from config from {}", source)]
pub(crate) fn load(source: &str) -> Result<OnceFromConfig> {
    let data = if source.starts_with("http://") || source.starts_with("https://") {
        fetch_remote(source)?
    } else {
        std::fs::read_to_string(source).with_context(|| format!("reading {source}"))?
    };
    parse(&data)
}

fn fetch_remote(url: &str) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("building HTTP client")?;
    let resp = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("fetching {url}"))?;
    resp.text().context("reading response body")
}

fn parse(data: &str) -> Result<OnceFromConfig> {
    let value: serde_json::Value =
        serde_json::from_str(data).context("once-from content is not JSON")?;
    if value.get("ignition").is_some() {
        let config: IgnitionConfig =
            serde_json::from_value(value).context("parsing Ignition config")?;
        return Ok(OnceFromConfig::Ignition(config));
    }
    let config: MachineConfig =
        serde_json::from_value(value).context("parsing machine config")?;
    if config.name.is_empty() {
        bail!("unknown once-from content: neither Ignition nor a named machine config");
    }
    Ok(OnceFromConfig::MachineConfig(config))
}
