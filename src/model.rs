/*
 * Copyright (C) 2024 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named, immutable bundle describing a target machine state: OS image,
/// files, systemd units and SSH keys. Two configs are "the same config"
/// only when their names are equal; in memory that is tracked by sharing
/// one `Arc<MachineConfig>` and comparing with `Arc::ptr_eq`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MachineConfig {
    pub(crate) name: String,
    #[serde(rename = "osImageURL", default)]
    pub(crate) os_image_url: String,
    #[serde(default)]
    pub(crate) files: Vec<ConfigFile>,
    #[serde(default)]
    pub(crate) units: Vec<SystemdUnit>,
    #[serde(default)]
    pub(crate) passwd_users: Vec<PasswdUser>,
}

/// A file to provision. Contents are carried as an RFC 2397 data URL;
/// a missing mode means 0644.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigFile {
    pub(crate) path: String,
    #[serde(default)]
    pub(crate) contents: String,
    #[serde(default)]
    pub(crate) mode: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SystemdUnit {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) contents: Option<String>,
    #[serde(default)]
    pub(crate) mask: bool,
    #[serde(default)]
    pub(crate) enabled: bool,
    #[serde(default)]
    pub(crate) dropins: Vec<Dropin>,
}

/// A supplementary fragment applied to a unit under `<unit>.d/`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Dropin {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) contents: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PasswdUser {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) ssh_authorized_keys: Vec<String>,
}

/// The update state recorded in the node's `state` annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MachineState {
    Working,
    Done,
    Degraded,
}

impl MachineState {
    /// Parse an annotation value; nodes predating the annotation carry no
    /// value at all, which reads as `Done`.
    pub(crate) fn from_annotation(value: Option<&str>) -> anyhow::Result<Self> {
        match value {
            None | Some("") => Ok(MachineState::Done),
            Some(v) => v.parse(),
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Working => "Working",
            MachineState::Done => "Done",
            MachineState::Degraded => "Degraded",
        };
        f.write_str(s)
    }
}

impl FromStr for MachineState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "Working" => Ok(MachineState::Working),
            "Done" => Ok(MachineState::Done),
            "Degraded" => Ok(MachineState::Degraded),
            o => anyhow::bail!("unknown machine state {:?}", o),
        }
    }
}

/// The JSON record kept at /etc/machine-config-daemon/state.json.
///
/// This exists only between the point an update has been staged and the
/// point the next boot validates it; the bootID lets us detect a reboot
/// that never actually happened.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingState {
    #[serde(rename = "pendingConfig")]
    pub(crate) pending_config: String,
    #[serde(rename = "bootID")]
    pub(crate) boot_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    /// Validate we're not breaking the serialized format of the config
    /// objects handed to us by the cluster registry.
    #[test]
    fn test_deserialize_machine_config() -> Result<()> {
        let data = r#"{
            "name": "worker-5f6d2c8e",
            "osImageURL": "registry.example.com/os@sha256:0000000000000000000000000000000000000000000000000000000000000000",
            "files": [
                {"path": "/etc/motd", "contents": "data:,hello", "mode": 420}
            ],
            "units": [
                {"name": "kubelet.service", "enabled": true, "dropins": [
                    {"name": "10-flags.conf", "contents": "[Service]\n"}
                ]},
                {"name": "zincati.service", "mask": true}
            ],
            "passwdUsers": [
                {"name": "core", "sshAuthorizedKeys": ["ssh-ed25519 AAAA..."]}
            ]
        }"#;
        let config: MachineConfig = serde_json::from_str(data)?;
        assert_eq!(config.name, "worker-5f6d2c8e");
        assert_eq!(config.files[0].mode, Some(420));
        assert_eq!(config.units[0].dropins.len(), 1);
        assert!(!config.units[0].mask);
        assert!(config.units[1].mask);
        assert!(config.units[1].contents.is_none());
        assert_eq!(config.passwd_users[0].name, "core");
        Ok(())
    }

    /// Validate we're not breaking the serialized format of the on-disk
    /// pending state file.
    #[test]
    fn test_pending_state_format() -> Result<()> {
        let state = PendingState {
            pending_config: "worker-5f6d2c8e".into(),
            boot_id: "f4e2c5ba-8a12-49b6-ae21-0ef5a68e6be5".into(),
        };
        let data = serde_json::to_string(&state)?;
        assert_eq!(
            data,
            r#"{"pendingConfig":"worker-5f6d2c8e","bootID":"f4e2c5ba-8a12-49b6-ae21-0ef5a68e6be5"}"#
        );
        let parsed: PendingState = serde_json::from_str(&data)?;
        assert_eq!(parsed, state);
        Ok(())
    }

    #[test]
    fn test_machine_state() -> Result<()> {
        assert_eq!(MachineState::from_annotation(None)?, MachineState::Done);
        assert_eq!(MachineState::from_annotation(Some(""))?, MachineState::Done);
        assert_eq!(
            MachineState::from_annotation(Some("Working"))?,
            MachineState::Working
        );
        assert_eq!(MachineState::Degraded.to_string(), "Degraded");
        assert!(MachineState::from_annotation(Some("working")).is_err());
        Ok(())
    }
}
