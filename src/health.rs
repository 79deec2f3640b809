//! Periodic kubelet health probing.
//!
//! The kubelet exposes a plain-text healthz endpoint; a healthy node
//! answers `ok`. Persistent failure to answer is surfaced on the central
//! error channel so the operator sees it, but it does not stop the
//! reconciler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use crate::daemon::Event;

pub(crate) const DEFAULT_HEALTH_ENDPOINT: &str = "http://localhost:10248/healthz";

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Consecutive hard failures before we signal the error channel.
const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug)]
enum Probe {
    Healthy,
    /// The endpoint answered, but not with `ok`. Logged, not counted
    /// toward the failure threshold.
    Unexpected(String),
    Failed(String),
}

fn probe_once(client: &reqwest::blocking::Client, url: &str) -> Probe {
    match client.get(url).send().and_then(|r| r.text()) {
        Ok(body) if body == "ok" => Probe::Healthy,
        Ok(body) => {
            let mut body = body;
            body.truncate(64);
            Probe::Unexpected(body)
        }
        Err(e) => Probe::Failed(e.to_string()),
    }
}

/// Fold one probe result into the consecutive-failure counter; returns
/// the error to report once the threshold is crossed.
fn register_probe(failures: &mut u32, url: &str, probe: Probe) -> Option<anyhow::Error> {
    match probe {
        Probe::Healthy => {
            if *failures > 0 {
                log::info!("kubelet health endpoint recovered");
            }
            *failures = 0;
            None
        }
        Probe::Unexpected(body) => {
            log::warn!("kubelet health endpoint answered {body:?}, expected \"ok\"");
            None
        }
        Probe::Failed(e) => {
            *failures += 1;
            log::warn!(
                "kubelet health probe failed ({}/{FAILURE_THRESHOLD}): {e}",
                *failures
            );
            if *failures >= FAILURE_THRESHOLD {
                *failures = 0;
                Some(anyhow!(
                    "kubelet health endpoint {url} failed {FAILURE_THRESHOLD} consecutive probes: {e}"
                ))
            } else {
                None
            }
        }
    }
}

pub(crate) fn spawn_health_poller(
    url: String,
    events: Sender<Event>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let client = match reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                let _ = events.send(Event::Background(anyhow!(
                    "building kubelet health client: {e}"
                )));
                return;
            }
        };
        let mut failures = 0u32;
        while !stop.load(Ordering::SeqCst) {
            let probe = probe_once(&client, &url);
            if let Some(err) = register_probe(&mut failures, &url, probe) {
                if events.send(Event::Background(err)).is_err() {
                    return;
                }
            }
            // Sleep in slices so stop is honored promptly.
            let mut slept = Duration::ZERO;
            while slept < POLL_INTERVAL && !stop.load(Ordering::SeqCst) {
                let slice = Duration::from_secs(1);
                std::thread::sleep(slice);
                slept += slice;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_register_probe_counting() {
        let mut failures = 0;
        let url = DEFAULT_HEALTH_ENDPOINT;
        // Soft failures never count
        for _ in 0..10 {
            assert!(register_probe(&mut failures, url, Probe::Unexpected("no".into())).is_none());
        }
        assert_eq!(failures, 0);
        // Two hard failures, then recovery: counter resets
        assert!(register_probe(&mut failures, url, Probe::Failed("refused".into())).is_none());
        assert!(register_probe(&mut failures, url, Probe::Failed("refused".into())).is_none());
        assert!(register_probe(&mut failures, url, Probe::Healthy).is_none());
        assert_eq!(failures, 0);
        // Three consecutive hard failures signal exactly once and reset
        assert!(register_probe(&mut failures, url, Probe::Failed("refused".into())).is_none());
        assert!(register_probe(&mut failures, url, Probe::Failed("refused".into())).is_none());
        let err = register_probe(&mut failures, url, Probe::Failed("refused".into()));
        assert!(err.unwrap().to_string().contains("3 consecutive"));
        assert_eq!(failures, 0);
    }

    fn one_shot_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut sock, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes());
            }
        });
        format!("http://{addr}/healthz")
    }

    #[test]
    fn test_probe_once() {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let url = one_shot_server("ok");
        assert!(matches!(probe_once(&client, &url), Probe::Healthy));
        let url = one_shot_server("shutting down");
        match probe_once(&client, &url) {
            Probe::Unexpected(b) => assert_eq!(b, "shutting down"),
            p => panic!("expected unexpected-body probe, got {p:?}"),
        }
        // Nothing listening
        match probe_once(&client, "http://127.0.0.1:1/healthz") {
            Probe::Failed(_) => {}
            p => panic!("expected failed probe, got {p:?}"),
        }
    }
}
