//! Challenge responders.
//!
//! A responder makes one challenge verifiable by the ACME server: started
//! before the response is submitted, stopped once polling settles. Types
//! are looked up in a process-wide registry keyed by the ACME challenge
//! type string, so additional challenge types can be plugged in without
//! touching the solver.

pub mod http;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, Once};

use anyhow::{bail, Result};
use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use tokio::sync::mpsc;
use tracing::warn;

/// What a challenge hook gets told: the token filename and the full
/// key-authorization body an external agent must publish.
#[derive(Debug, Clone)]
pub struct HttpChallengeInfo {
    pub filename: String,
    pub body: String,
}

pub type HookFunc = dyn Fn(&HttpChallengeInfo) -> Result<()> + Send + Sync;

/// Looks up the private key for a given SPKI, if we hold it. Absence is
/// `Ok(None)`, not an error; errors short-circuit the challenge.
pub type PriorKeyFunc = dyn Fn(&[u8]) -> Result<Option<PKey<Private>>> + Send + Sync;

/// Environment a responder may use to get the challenge answered, beyond
/// what the ACME server supplied.
#[derive(Clone, Default)]
pub struct ChallengeConfig {
    /// http-01: webroot directories to drop the key authorization into.
    pub web_paths: Vec<String>,
    /// http-01: listen addresses; a bare integer means a port on both
    /// loopback addresses. Empty means the default port set.
    pub http_ports: Vec<String>,
    /// proofOfPossession: resolve an acceptable public key to a held
    /// private key.
    pub prior_key: Option<Arc<PriorKeyFunc>>,
    pub start_hook: Option<Arc<HookFunc>>,
    pub stop_hook: Option<Arc<HookFunc>>,
}

/// Everything needed to instantiate a responder for one challenge.
pub struct Config {
    /// ACME challenge type, e.g. `http-01`.
    pub ctype: String,
    pub account_key: PKey<Private>,
    pub token: String,
    /// Hostname being verified; enables the pre-submission self-test.
    pub hostname: Option<String>,
    pub challenge: ChallengeConfig,
}

/// A live challenge responder.
///
/// `start` on success must be paired with `stop`, which must also run when
/// the surrounding operation fails later. `stop` without a successful
/// `start` is a no-op.
#[async_trait]
pub trait Responder: Send {
    /// Become ready to be interrogated by the ACME server.
    async fn start(&mut self) -> Result<()>;

    /// Stop responding and release all resources. Idempotent.
    async fn stop(&mut self) -> Result<()>;

    /// Challenge response object to submit; `None` submits nothing.
    fn validation(&self) -> Option<serde_json::Value>;

    /// Key that must sign the validation object; `None` means the account
    /// key.
    fn validation_signing_key(&self) -> Option<PKey<Private>>;

    /// Receives a message when the ACME server was seen fetching the
    /// challenge, hinting that polling may be fruitful. `None` when
    /// request detection is unsupported.
    fn request_detected(&mut self) -> Option<&mut mpsc::Receiver<()>>;
}

type NewResponderFn = fn(Config) -> Result<Box<dyn Responder>>;

static REGISTRY: LazyLock<Mutex<HashMap<&'static str, NewResponderFn>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register a responder type. A type may only be registered once; a
/// duplicate registration keeps the first and panics in debug builds.
pub fn register(ctype: &'static str, construct: NewResponderFn) {
    let mut map = REGISTRY.lock().unwrap();
    if map.contains_key(ctype) {
        debug_assert!(false, "responder type {ctype} registered twice");
        warn!(ctype, "duplicate responder registration ignored");
        return;
    }
    map.insert(ctype, construct);
}

/// Register the built-in responder set. Safe to call more than once.
pub fn register_builtin() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register("http-01", http::new);
    });
}

pub fn supported(ctype: &str) -> bool {
    REGISTRY.lock().unwrap().contains_key(ctype)
}

/// Instantiate a responder for the challenge described by `cfg`.
pub fn new_responder(cfg: Config) -> Result<Box<dyn Responder>> {
    let construct = match REGISTRY.lock().unwrap().get(cfg.ctype.as_str()) {
        Some(f) => *f,
        None => bail!("challenge type not supported: {}", cfg.ctype),
    };
    construct(cfg)
}
