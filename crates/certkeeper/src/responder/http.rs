//! http-01 responder.
//!
//! For a token `T` the key authorization must be fetchable at
//! `http://<host>/.well-known/acme-challenge/T` from any address the CA
//! picks. Three delivery paths are attempted at once: files dropped into
//! webroots, loopback HTTP listeners (for a proxying front-end or the
//! redirector), and a user start hook. Any one of them working is enough,
//! so individual failures are logged and ignored.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::http::header;
use axum::routing::get;
use axum::Router;
use futures::future::join_all;
use openssl::pkey::{PKey, Private};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Config, HttpChallengeInfo, Responder};
use crate::crypto;

/// Standard ephemeral webroot, written in addition to any configured
/// webroots; the redirector serves challenges out of here.
pub const STANDARD_WEBROOT_PATH: &str = "/var/run/acme/acme-challenge";

const DEFAULT_PORTS: &[u16] = &[80, 402, 4402];
const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn new(cfg: Config) -> Result<Box<dyn Responder>> {
    Ok(Box::new(HttpResponder::build(cfg)?))
}

struct ListenerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    local: SocketAddr,
}

pub(super) struct HttpResponder {
    cfg: Config,
    ka: String,
    validation: serde_json::Value,
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
    listeners: Vec<ListenerHandle>,
    notify_supported: bool,
    started: bool,
}

impl HttpResponder {
    pub(super) fn build(cfg: Config) -> Result<HttpResponder> {
        let ka = crypto::key_authorization(&cfg.account_key, &cfg.token)?;
        let validation = serde_json::json!({
            "resource": "challenge",
            "type": "http-01",
            "keyAuthorization": ka.clone(),
        });
        // size-1, drop-on-full: concurrent hits coalesce and the HTTP
        // handler never blocks
        let (tx, rx) = mpsc::channel(1);
        Ok(HttpResponder {
            cfg,
            ka,
            validation,
            tx,
            rx,
            listeners: Vec::new(),
            notify_supported: true,
            started: false,
        })
    }

    fn router(&self) -> Router {
        let ka = self.ka.clone();
        let tx = self.tx.clone();
        let handler = move || {
            let ka = ka.clone();
            let tx = tx.clone();
            async move {
                let _ = tx.try_send(());
                ([(header::CONTENT_TYPE, "text/plain")], ka)
            }
        };
        Router::new().route(
            &format!("/.well-known/acme-challenge/{}", self.cfg.token),
            get(handler),
        )
    }

    async fn start_listeners(&mut self) {
        for addr in parse_listen_addrs(&self.cfg.challenge.http_ports) {
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    // another daemon may own the port; webroot or hook
                    // delivery can still succeed
                    debug!(%addr, error = %e, "failed to listen");
                    continue;
                }
            };
            let local = match listener.local_addr() {
                Ok(a) => a,
                Err(_) => addr,
            };
            debug!(%local, "listening for http-01 challenge requests");

            let router = self.router();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                });
                if let Err(e) = serve.await {
                    debug!(error = %e, "challenge listener exited");
                }
            });
            self.listeners.push(ListenerHandle {
                stop: Some(stop_tx),
                task,
                local,
            });
        }
    }

    fn webroots(&self) -> BTreeSet<String> {
        let mut roots: BTreeSet<String> = self
            .cfg
            .challenge
            .web_paths
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.trim_end_matches('/').to_string())
            .collect();
        roots.insert(STANDARD_WEBROOT_PATH.to_string());
        roots
    }

    fn write_webroot_files(&self) {
        for root in self.webroots() {
            let _ = fs::create_dir_all(&root);
            let path = Path::new(&root).join(&self.cfg.token);
            debug!(?path, "writing webroot challenge file");

            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true).mode(0o644);
            if root.starts_with("/var/run/") {
                // /var/run is typically a world-writable tmpfs; never
                // follow a symlink planted there
                opts.custom_flags(libc::O_NOFOLLOW);
            }
            match opts.open(&path) {
                Ok(mut f) => {
                    let _ = f.write_all(self.ka.as_bytes());
                }
                Err(e) => debug!(?path, error = %e, "failed to write webroot file"),
            }
        }
    }

    fn remove_webroot_files(&self) {
        for root in self.webroots() {
            let path = Path::new(&root).join(&self.cfg.token);
            debug!(?path, "removing webroot challenge file");
            let _ = fs::remove_file(&path);
        }
    }

    fn run_hook(&self, hook: &Option<std::sync::Arc<super::HookFunc>>, what: &str) {
        if let Some(hook) = hook {
            let info = HttpChallengeInfo {
                filename: self.cfg.token.clone(),
                body: self.ka.clone(),
            };
            if let Err(e) = hook(&info) {
                warn!(what, error = %e, "challenge hook failed");
            }
        }
    }

    /// Verify the challenge is actually reachable via the hostname under
    /// validation. Skipped when no hostname was given.
    async fn self_test(&mut self) -> Result<()> {
        let Some(hostname) = self.cfg.hostname.clone() else {
            return Ok(());
        };

        let url = format!(
            "http://{}/.well-known/acme-challenge/{}",
            hostname, self.cfg.token
        );
        debug!(%url, "http-01 self test");

        let client = reqwest::Client::builder()
            .timeout(SELF_TEST_TIMEOUT)
            .build()?;
        let resp = client
            .get(&url)
            .send()
            .await
            .context("http-01 self-test request")?;
        if resp.status().as_u16() != 200 {
            bail!("http-01 self-test: non-200 status {}", resp.status());
        }
        let body = resp.text().await.context("http-01 self-test body")?;
        if body.trim() != self.ka {
            bail!("http-01 self-test: 200 response with the wrong data");
        }

        // the self-test went through our own delivery path exactly once;
        // if the handler did not see it, request detection is useless
        self.notify_supported = self.rx.try_recv().is_ok();
        while self.rx.try_recv().is_ok() {}

        Ok(())
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn start(&mut self) -> Result<()> {
        self.started = true;
        self.start_listeners().await;
        self.write_webroot_files();
        self.run_hook(&self.cfg.challenge.start_hook, "start");

        if let Err(e) = self.self_test().await {
            warn!(error = %e, "http-01 self test failed");
            let _ = self.stop().await;
            return Err(e);
        }

        debug!("http-01 responder started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;

        let mut tasks = Vec::new();
        for mut l in std::mem::take(&mut self.listeners) {
            if let Some(stop) = l.stop.take() {
                let _ = stop.send(());
            }
            tasks.push(l.task);
        }
        join_all(tasks).await;

        self.remove_webroot_files();
        self.run_hook(&self.cfg.challenge.stop_hook, "stop");
        Ok(())
    }

    fn validation(&self) -> Option<serde_json::Value> {
        Some(self.validation.clone())
    }

    fn validation_signing_key(&self) -> Option<PKey<Private>> {
        None
    }

    fn request_detected(&mut self) -> Option<&mut mpsc::Receiver<()>> {
        if self.notify_supported {
            Some(&mut self.rx)
        } else {
            None
        }
    }
}

impl HttpResponder {
    #[cfg(test)]
    fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local).collect()
    }
}

/// Expand configured listen strings into socket addresses. A bare integer
/// binds the port on both loopbacks; anything else must parse as a socket
/// address. Empty input expands to the default port set.
fn parse_listen_addrs(ports: &[String]) -> Vec<SocketAddr> {
    let mut addrs = BTreeSet::new();
    let loopbacks = |port: u16| {
        [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
        ]
    };

    if ports.is_empty() {
        for port in DEFAULT_PORTS {
            addrs.extend(loopbacks(*port));
        }
        return addrs.into_iter().collect();
    }

    for s in ports {
        if let Ok(port) = s.parse::<u16>() {
            addrs.extend(loopbacks(port));
            continue;
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => {
                addrs.insert(a);
            }
            Err(e) => warn!(addr = %s, error = %e, "invalid listen addr"),
        }
    }

    addrs.into_iter().collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
