/*
 * Copyright (C) 2024 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Verification that the on-disk state of a node matches a machine config.
//!
//! This is the check that closes the update loop after a reboot: files,
//! unit files, drop-ins, masks and the booted OS image are compared
//! against what the config declares. It deliberately depends on nothing
//! but a filesystem root, so it can run against any directory in tests.

use crate::files::{
    decode_data_url, dedup_files, dropin_path, read_file_optional, relative_path, unit_path,
    DEFAULT_FILE_MODE,
};
use crate::imageref::same_image;
use crate::model::{ConfigFile, MachineConfig, SystemdUnit};
use crate::osupdater::BootedImage;

/// Value carried by configs predating image-based updates; treated the
/// same as an empty OS image URL.
pub(crate) const LEGACY_OS_IMAGE_PLACEHOLDER: &str = "://dummy";

#[derive(Debug)]
pub(crate) enum ValidationResult {
    Valid,
    Errors(Vec<String>),
}

impl ValidationResult {
    pub(crate) fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

pub(crate) struct OnDiskValidator {
    root: openat::Dir,
    os_image_based: bool,
}

impl OnDiskValidator {
    pub(crate) fn new(root: openat::Dir, os_image_based: bool) -> Self {
        Self {
            root,
            os_image_based,
        }
    }

    /// Check the node against `config`. Collects every divergence as a
    /// descriptive reason; an empty list means the node matches.
    pub(crate) fn validate(
        &self,
        config: &MachineConfig,
        booted: Option<&BootedImage>,
    ) -> ValidationResult {
        let mut errs = Vec::new();

        if let Err(e) = self.check_os_image(config, booted) {
            errs.push(e);
        }
        for file in dedup_files(&config.files) {
            if let Err(e) = self.check_file(file) {
                errs.push(e);
            }
        }
        for unit in &config.units {
            self.check_unit(unit, &mut errs);
        }

        if errs.is_empty() {
            ValidationResult::Valid
        } else {
            for e in &errs {
                log::warn!("on-disk validation: {e}");
            }
            ValidationResult::Errors(errs)
        }
    }

    fn check_os_image(
        &self,
        config: &MachineConfig,
        booted: Option<&BootedImage>,
    ) -> std::result::Result<(), String> {
        if !self.os_image_based {
            return Ok(());
        }
        let desired = config.os_image_url.as_str();
        if desired.is_empty() || desired == LEGACY_OS_IMAGE_PLACEHOLDER {
            return Ok(());
        }
        let Some(booted) = booted else {
            return Err("booted OS image is unknown".to_string());
        };
        match same_image(&booted.url, desired) {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!(
                "expected OS image {} but booted {} ({})",
                desired, booted.url, booted.version
            )),
            Err(e) => Err(format!("comparing OS image references: {e:#}")),
        }
    }

    fn check_file(&self, file: &ConfigFile) -> std::result::Result<(), String> {
        let expected = decode_data_url(&file.contents)
            .map_err(|e| format!("file {}: {e:#}", file.path))?;
        let rel = relative_path(&file.path).map_err(|e| format!("{e:#}"))?;
        self.check_path(rel, &expected, file.mode.unwrap_or(DEFAULT_FILE_MODE))
            .map_err(|e| format!("file {}: {e}", file.path))
    }

    fn check_unit(&self, unit: &SystemdUnit, errs: &mut Vec<String>) {
        for dropin in &unit.dropins {
            let path = dropin_path(&unit.name, &dropin.name);
            if let Err(e) = self.check_path(&path, dropin.contents.as_bytes(), DEFAULT_FILE_MODE) {
                errs.push(format!("dropin /{path}: {e}"));
            }
        }
        let path = unit_path(&unit.name);
        if unit.mask {
            match self.root.read_link(path.as_str()) {
                Ok(target) if target.as_os_str() == "/dev/null" => {}
                Ok(target) => errs.push(format!(
                    "unit {} masked but links to {}",
                    unit.name,
                    target.display()
                )),
                Err(e) => errs.push(format!(
                    "unit {} masked but is not a symlink: {e}",
                    unit.name
                )),
            }
            return;
        }
        match unit.contents.as_deref() {
            None | Some("") => {}
            Some(contents) => {
                if let Err(e) = self.check_path(&path, contents.as_bytes(), DEFAULT_FILE_MODE) {
                    errs.push(format!("unit {}: {e}", unit.name));
                }
            }
        }
    }

    fn check_path(
        &self,
        rel: &str,
        expected: &[u8],
        mode: u32,
    ) -> std::result::Result<(), String> {
        use openat_ext::OpenatDirExt;
        let meta = self
            .root
            .metadata_optional(rel)
            .map_err(|e| format!("stat: {e}"))?
            .ok_or_else(|| "does not exist".to_string())?;
        if meta.simple_type() != openat::SimpleType::File {
            return Err(format!("not a regular file ({:?})", meta.simple_type()));
        }
        let actual_mode = meta.stat().st_mode & 0o7777;
        if actual_mode != mode {
            return Err(format!("mode is {actual_mode:o}, expected {mode:o}"));
        }
        let actual = read_file_optional(&self.root, rel)
            .map_err(|e| format!("{e:#}"))?
            .ok_or_else(|| "does not exist".to_string())?;
        if actual != expected {
            return Err(format!(
                "contents differ ({} bytes on disk, expected {})",
                actual.len(),
                expected.len()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{replace_symlink, write_file_atomic};
    use anyhow::Result;
    use crate::model::{Dropin, PasswdUser};
    use crate::testutil::data_url;

    const DIGEST_A: &str =
        "sha256:51a2b6e1c0aa204ab5fb3e46ae1bc967b9ed862e0265d9f0d85b125549ae8e35";

    fn test_config() -> MachineConfig {
        MachineConfig {
            name: "worker-5f6d2c8e".into(),
            os_image_url: format!("quay.io/openshift/os@{DIGEST_A}"),
            files: vec![
                ConfigFile {
                    path: "/etc/motd".into(),
                    contents: data_url("welcome"),
                    mode: None,
                },
                ConfigFile {
                    path: "/etc/crio/crio.conf".into(),
                    contents: data_url("[crio]\n"),
                    mode: Some(0o600),
                },
            ],
            units: vec![
                SystemdUnit {
                    name: "kubelet.service".into(),
                    contents: Some("[Unit]\nDescription=kubelet\n".into()),
                    enabled: true,
                    dropins: vec![Dropin {
                        name: "10-flags.conf".into(),
                        contents: "[Service]\n".into(),
                    }],
                    ..Default::default()
                },
                SystemdUnit {
                    name: "zincati.service".into(),
                    mask: true,
                    ..Default::default()
                },
            ],
            passwd_users: vec![PasswdUser {
                name: "core".into(),
                ssh_authorized_keys: vec!["ssh-ed25519 AAAA...".into()],
            }],
        }
    }

    fn write_config_to_disk(root: &openat::Dir, config: &MachineConfig) -> Result<()> {
        for f in dedup_files(&config.files) {
            write_file_atomic(
                root,
                relative_path(&f.path)?,
                &decode_data_url(&f.contents)?,
                f.mode.unwrap_or(DEFAULT_FILE_MODE),
            )?;
        }
        for u in &config.units {
            for d in &u.dropins {
                write_file_atomic(
                    root,
                    &dropin_path(&u.name, &d.name),
                    d.contents.as_bytes(),
                    DEFAULT_FILE_MODE,
                )?;
            }
            if u.mask {
                replace_symlink(root, &unit_path(&u.name), "/dev/null")?;
            } else if let Some(c) = u.contents.as_deref() {
                write_file_atomic(root, &unit_path(&u.name), c.as_bytes(), DEFAULT_FILE_MODE)?;
            }
        }
        Ok(())
    }

    fn booted() -> BootedImage {
        BootedImage {
            url: format!("quay.io/openshift/os@{DIGEST_A}"),
            version: "42.20240522.0".into(),
        }
    }

    #[test]
    fn test_validate_roundtrip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = openat::Dir::open(td.path())?;
        let config = test_config();
        write_config_to_disk(&root, &config)?;
        let v = OnDiskValidator::new(openat::Dir::open(td.path())?, true);
        assert!(v.validate(&config, Some(&booted())).is_valid());
        Ok(())
    }

    #[test]
    fn test_validate_divergences() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = openat::Dir::open(td.path())?;
        let config = test_config();
        write_config_to_disk(&root, &config)?;
        let v = OnDiskValidator::new(openat::Dir::open(td.path())?, true);

        // Contents drift
        std::fs::write(td.path().join("etc/motd"), "defaced")?;
        match v.validate(&config, Some(&booted())) {
            ValidationResult::Errors(errs) => {
                assert_eq!(errs.len(), 1);
                assert!(errs[0].contains("/etc/motd"), "{errs:?}");
            }
            r => panic!("expected errors, got {r:?}"),
        }
        write_config_to_disk(&root, &config)?;

        // Mode drift
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            td.path().join("etc/crio/crio.conf"),
            std::fs::Permissions::from_mode(0o644),
        )?;
        assert!(!v.validate(&config, Some(&booted())).is_valid());
        write_config_to_disk(&root, &config)?;

        // Mask replaced by a regular file
        std::fs::remove_file(td.path().join("etc/systemd/system/zincati.service"))?;
        std::fs::write(td.path().join("etc/systemd/system/zincati.service"), "")?;
        assert!(!v.validate(&config, Some(&booted())).is_valid());
        write_config_to_disk(&root, &config)?;

        // Missing dropin
        std::fs::remove_file(
            td.path()
                .join("etc/systemd/system/kubelet.service.d/10-flags.conf"),
        )?;
        assert!(!v.validate(&config, Some(&booted())).is_valid());
        Ok(())
    }

    #[test]
    fn test_validate_os_image() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = openat::Dir::open(td.path())?;
        let mut config = test_config();
        write_config_to_disk(&root, &config)?;

        // Booted something else entirely
        let other = BootedImage {
            url: format!("quay.io/openshift/os@sha256:{}", "ab".repeat(32)),
            version: "42.20240610.1".into(),
        };
        let v = OnDiskValidator::new(openat::Dir::open(td.path())?, true);
        assert!(!v.validate(&config, Some(&other)).is_valid());
        // Same digest behind a mirror still matches
        let mirrored = BootedImage {
            url: format!("registry.example.com/mirror/os@{DIGEST_A}"),
            version: "42.20240522.0".into(),
        };
        assert!(v.validate(&config, Some(&mirrored)).is_valid());
        // Unparseable reference is a validation failure, not a panic
        config.os_image_url = "quay.io/openshift/os:latest".into();
        assert!(!v.validate(&config, Some(&booted())).is_valid());

        // Empty and placeholder URLs skip the check
        config.os_image_url = String::new();
        assert!(v.validate(&config, Some(&other)).is_valid());
        config.os_image_url = LEGACY_OS_IMAGE_PLACEHOLDER.into();
        assert!(v.validate(&config, Some(&other)).is_valid());

        // Non image-based OS skips the check entirely
        let mut config = test_config();
        config.os_image_url = format!("quay.io/openshift/os@{DIGEST_A}");
        let v = OnDiskValidator::new(openat::Dir::open(td.path())?, false);
        assert!(v.validate(&config, None).is_valid());
        Ok(())
    }

    /// Later entries for the same path shadow earlier ones; validation
    /// must accept the last occurrence being on disk.
    #[test]
    fn test_validate_shadowed_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = openat::Dir::open(td.path())?;
        let config = MachineConfig {
            name: "worker-0".into(),
            files: vec![
                ConfigFile {
                    path: "/etc/foo".into(),
                    contents: data_url("X"),
                    mode: None,
                },
                ConfigFile {
                    path: "/etc/foo".into(),
                    contents: data_url("Y"),
                    mode: None,
                },
            ],
            ..Default::default()
        };
        write_file_atomic(&root, "etc/foo", b"Y", DEFAULT_FILE_MODE)?;
        let v = OnDiskValidator::new(openat::Dir::open(td.path())?, false);
        assert!(v.validate(&config, None).is_valid());
        // The earlier (shadowed) contents do not validate
        std::fs::write(td.path().join("etc/foo"), "X")?;
        assert!(!v.validate(&config, None).is_valid());
        Ok(())
    }
}
