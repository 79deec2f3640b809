use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;

/// Path to the kernel-provided identifier for the current boot.
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Checked execution for the handful of host tools this daemon drives
/// (`mount`, `journalctl`, `rpm-ostree`, `systemctl`). A non-zero exit is
/// always an error, and captured stderr travels inside the error so it
/// reaches the log or the degrade reason rather than a stray tty.
pub(crate) trait CommandExt {
    /// Wait for the child; fail unless it exits zero.
    fn run_checked(&mut self) -> Result<()>;
    /// Wait for the child and return its stdout as UTF-8.
    fn output_text(&mut self) -> Result<String>;
    /// Wait for the child and deserialize its stdout as JSON.
    fn output_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

fn command_label(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

impl CommandExt for Command {
    fn run_checked(&mut self) -> Result<()> {
        let label = command_label(self);
        let status = self
            .status()
            .with_context(|| format!("spawning {label}"))?;
        if !status.success() {
            bail!("{label} exited with {status}");
        }
        Ok(())
    }

    fn output_text(&mut self) -> Result<String> {
        let label = command_label(self);
        let out = self
            .output()
            .with_context(|| format!("spawning {label}"))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("{label} exited with {}: {}", out.status, stderr.trim());
        }
        String::from_utf8(out.stdout).with_context(|| format!("{label} emitted non-UTF-8 output"))
    }

    fn output_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let label = command_label(self);
        let stdout = self.output_text()?;
        serde_json::from_str(&stdout).with_context(|| format!("parsing {label} output as JSON"))
    }
}

/// The identifier for the current boot, fixed once at process start and
/// passed explicitly to everything that needs it.
pub(crate) fn current_boot_id() -> Result<String> {
    read_boot_id(Path::new(BOOT_ID_PATH))
}

pub(crate) fn read_boot_id(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading boot ID from {}", path.display()))?;
    let id = raw.trim();
    if id.is_empty() {
        bail!("empty boot ID in {}", path.display());
    }
    Ok(id.to_string())
}

/// When operating on a root other than `/` (i.e. we will chroot into the
/// target), bind-mount `/run/secrets` into it first so that service account
/// tokens remain visible afterwards. Must happen before the reconciler starts.
pub(crate) fn bind_run_secrets(root: &Utf8Path) -> Result<()> {
    const SECRETS: &str = "/run/secrets";
    if root == "/" || !Path::new(SECRETS).exists() {
        return Ok(());
    }
    let target = root.join("run/secrets");
    std::fs::create_dir_all(&target).with_context(|| format!("creating {target}"))?;
    Command::new("mount")
        .args(["--rbind", SECRETS])
        .arg(&target)
        .run_checked()
        .with_context(|| format!("bind mounting {SECRETS} into {target}"))
}
