//! Helpers shared by the PTY-backed tests.

use crate::session::{Outbound, SessionOptions, SessionRegistry};
use persh_core::{EnvironmentCustomizer, LaunchSpec, PershResult, ShellRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Launches a fixed `sh -c` script instead of a real interactive shell.
pub struct Script(pub &'static str);

impl EnvironmentCustomizer for Script {
    fn customize(&self, _request: &ShellRequest) -> PershResult<LaunchSpec> {
        Ok(LaunchSpec::command(["/bin/sh", "-c", self.0]))
    }
}

pub fn registry(script: &'static str) -> Arc<SessionRegistry> {
    registry_with(script, SessionOptions::default())
}

pub fn registry_with(script: &'static str, options: SessionOptions) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(options, Arc::new(Script(script))))
}

/// Poll `cond` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Append PTY output from `rx` to `buf` until it ends with `suffix`.
pub async fn read_until(rx: &mut mpsc::Receiver<Outbound>, buf: &mut Vec<u8>, suffix: &[u8]) {
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    while !buf.ends_with(suffix) {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Outbound::Output(bytes)) => buf.extend_from_slice(&bytes),
                Some(Outbound::Notice(text)) => panic!("unexpected notice: {text:?}"),
                None => panic!("outbound closed before {:?}", String::from_utf8_lossy(suffix)),
            },
            _ = &mut deadline => panic!(
                "timed out; got {:?}, want suffix {:?}",
                String::from_utf8_lossy(buf),
                String::from_utf8_lossy(suffix)
            ),
        }
    }
}

/// Append PTY output from `rx` to `buf` until it contains `needle`.
pub async fn read_until_contains(rx: &mut mpsc::Receiver<Outbound>, buf: &mut Vec<u8>, needle: &[u8]) {
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    while !buf.windows(needle.len()).any(|w| w == needle) {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Outbound::Output(bytes)) => buf.extend_from_slice(&bytes),
                Some(Outbound::Notice(text)) => panic!("unexpected notice: {text:?}"),
                None => panic!("outbound closed before {:?}", String::from_utf8_lossy(needle)),
            },
            _ = &mut deadline => panic!(
                "timed out; got {:?}, want {:?}",
                String::from_utf8_lossy(buf),
                String::from_utf8_lossy(needle)
            ),
        }
    }
}
