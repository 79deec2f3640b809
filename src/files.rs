/*
 * Copyright (C) 2024 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Shared plumbing for provisioned files and systemd units: data URL
//! decoding, path handling relative to the root mount, and atomic writes.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use openat_ext::OpenatDirExt;

use crate::model::ConfigFile;

pub(crate) const SYSTEMD_UNIT_DIR: &str = "etc/systemd/system";
pub(crate) const DEFAULT_FILE_MODE: u32 = 0o644;
pub(crate) const DEFAULT_DIR_MODE: libc::mode_t = 0o755;

/// Decode RFC 2397 data URL contents as carried in config objects.
/// An empty string decodes to empty contents.
pub(crate) fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    if url.is_empty() {
        return Ok(Vec::new());
    }
    let rest = url
        .strip_prefix("data:")
        .with_context(|| format!("contents {:?} are not a data URL", truncated(url)))?;
    let (mediatype, payload) = rest
        .split_once(',')
        .with_context(|| format!("data URL {:?} has no payload", truncated(url)))?;
    if mediatype.ends_with(";base64") {
        BASE64
            .decode(payload)
            .with_context(|| format!("decoding base64 payload of {:?}", truncated(url)))
    } else {
        percent_decode(payload)
    }
}

fn truncated(s: &str) -> String {
    let mut end = 64.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn percent_decode(payload: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len());
    let mut bytes = payload.bytes();
    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let hi = bytes.next();
        let lo = bytes.next();
        let (Some(hi), Some(lo)) = (hi, lo) else {
            bail!("truncated percent escape in data URL payload");
        };
        let hex = [hi, lo];
        let hex = std::str::from_utf8(&hex)?;
        let v = u8::from_str_radix(hex, 16)
            .with_context(|| format!("invalid percent escape %{hex}"))?;
        out.push(v);
    }
    Ok(out)
}

/// De-duplicate file entries by path, iterating in reverse so that the
/// last occurrence of a path wins (later entries shadow earlier ones).
pub(crate) fn dedup_files(files: &[ConfigFile]) -> Vec<&ConfigFile> {
    let mut seen = HashSet::new();
    let mut ret = Vec::with_capacity(files.len());
    for f in files.iter().rev() {
        if seen.insert(f.path.as_str()) {
            ret.push(f);
        }
    }
    ret
}

/// Convert an absolute config-declared path into one relative to the root
/// mount directory.
pub(crate) fn relative_path(path: &str) -> Result<&str> {
    let rel = path.trim_start_matches('/');
    if rel.is_empty() {
        bail!("invalid file path {:?}", path);
    }
    Ok(rel)
}

pub(crate) fn unit_path(name: &str) -> String {
    format!("{SYSTEMD_UNIT_DIR}/{name}")
}

pub(crate) fn dropin_path(unit: &str, dropin: &str) -> String {
    format!("{SYSTEMD_UNIT_DIR}/{unit}.d/{dropin}")
}

pub(crate) fn unit_wants_path(name: &str) -> String {
    format!("{SYSTEMD_UNIT_DIR}/multi-user.target.wants/{name}")
}

/// Atomically create or replace `path` (relative to `root`) with the given
/// contents and mode, creating intermediate directories as needed. The
/// mode is applied exactly, independent of the umask.
pub(crate) fn write_file_atomic(
    root: &openat::Dir,
    path: &str,
    contents: &[u8],
    mode: u32,
) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            root.ensure_dir_all(parent, DEFAULT_DIR_MODE)
                .with_context(|| format!("creating directories for {path}"))?;
        }
    }
    let mut f = root
        .new_unnamed_file(mode as libc::mode_t)
        .with_context(|| format!("creating temp file for {path}"))?;
    f.write_all(contents)
        .with_context(|| format!("writing {path}"))?;
    f.set_permissions(std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode of {path}"))?;
    let tmp = format!("{path}.tmp");
    if root
        .exists(tmp.as_str())
        .with_context(|| format!("checking {tmp}"))?
    {
        root.remove_file(tmp.as_str())
            .with_context(|| format!("removing {tmp}"))?;
    }
    root.link_file_at(&f, tmp.as_str())
        .with_context(|| format!("linking temp file for {path}"))?;
    f.sync_all().with_context(|| format!("syncing {path}"))?;
    root.local_rename(tmp.as_str(), path)
        .with_context(|| format!("renaming into place at {path}"))?;
    Ok(())
}

/// Atomically replace `path` (relative to `root`) with a symlink to
/// `target`, via a temporary name and rename.
pub(crate) fn replace_symlink(root: &openat::Dir, path: &str, target: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            root.ensure_dir_all(parent, DEFAULT_DIR_MODE)
                .with_context(|| format!("creating directories for {path}"))?;
        }
    }
    let tmp = format!("{path}.tmp");
    let _ = root.remove_file_optional(&tmp);
    root.symlink(tmp.as_str(), target)
        .with_context(|| format!("creating symlink {path}"))?;
    root.local_rename(tmp.as_str(), path)
        .with_context(|| format!("renaming symlink into place at {path}"))?;
    Ok(())
}

/// Read the contents of `path` relative to `root`; `None` when absent.
pub(crate) fn read_file_optional(root: &openat::Dir, path: &str) -> Result<Option<Vec<u8>>> {
    let Some(mut f) = root
        .open_file_optional(path)
        .with_context(|| format!("opening {path}"))?
    else {
        return Ok(None);
    };
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)
        .with_context(|| format!("reading {path}"))?;
    Ok(Some(buf))
}
