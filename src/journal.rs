//! Login-session auditing via the systemd journal.
//!
//! Interactive access to a managed node is worth surfacing: a human who
//! logged in may have changed on-disk state behind our back. We look for
//! logind's session-start records, once for the current boot at startup
//! and then continuously by tailing the journal.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use fn_error_context::context;

use crate::cluster::NodeWriter;
use crate::daemon::Event;
use crate::util::CommandExt;

/// journald MESSAGE_ID of logind's "New session" record.
const SESSION_STARTED_MESSAGE_ID: &str = "8d45620c1a4348dbb17410da57c60c66";

fn journalctl_match() -> String {
    format!("MESSAGE_ID={SESSION_STARTED_MESSAGE_ID}")
}

/// Whether any login session was started during the current boot.
#[context("Scanning journal for login sessions")]
pub(crate) fn boot_sessions_present() -> Result<bool> {
    let out = Command::new("journalctl")
        .args(["-b", "-o", "cat", &journalctl_match()])
        .output_text()?;
    Ok(out.lines().any(|l| !l.trim().is_empty()))
}

/// Consume session records line by line, annotating the node for each.
/// A line reader, not a fixed-size buffer: records can be arbitrarily
/// long and must not be split mid-message. Read failures and EOF are
/// reported to the error channel; neither is fatal to the daemon.
fn tail_sessions(
    input: impl BufRead,
    writer: &dyn NodeWriter,
    node_name: &str,
    events: &Sender<Event>,
) {
    for line in input.lines() {
        match line {
            Ok(l) if l.trim().is_empty() => {}
            Ok(_) => {
                log::info!("login session detected on {node_name}");
                if let Err(e) = writer.set_ssh_accessed(node_name) {
                    log::error!("failed to annotate login on {node_name}: {e:#}");
                }
            }
            Err(e) => {
                let _ = events.send(Event::Background(anyhow!("reading journal tail: {e}")));
                return;
            }
        }
    }
    let _ = events.send(Event::Background(anyhow!("journal tail exited")));
}

/// Tails the journal for new session-start records and applies the
/// SSH-accessed annotation for each one. The subprocess must not outlive
/// the stop signal; call [`LoginAuditor::stop`].
pub(crate) struct LoginAuditor {
    child: Child,
    reader: Option<JoinHandle<()>>,
}

impl LoginAuditor {
    pub(crate) fn spawn(
        writer: Arc<dyn NodeWriter>,
        node_name: String,
        events: Sender<Event>,
    ) -> Result<Self> {
        let mut child = Command::new("journalctl")
            .args(["-b", "-f", "-o", "cat", &journalctl_match()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning journalctl")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("journalctl has no stdout"))?;
        let reader = std::thread::spawn(move || {
            tail_sessions(BufReader::new(stdout), writer.as_ref(), &node_name, &events);
        });
        Ok(Self {
            child,
            reader: Some(reader),
        })
    }

    pub(crate) fn stop(mut self) {
        if let Err(e) = self.child.kill() {
            log::warn!("failed to kill journal tail: {e}");
        }
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}
