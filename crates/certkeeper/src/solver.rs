//! Runs one authorization end-to-end.
//!
//! For a hostname, create the authorization, then walk the offered
//! challenges: instantiate the registered responder for each, start it,
//! submit the response, poll until the server settles, stop it. The first
//! challenge that completes wins; challenge types with no registered
//! responder are skipped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::acme::{AccountCreds, AcmeClient, AuthorizationStatus, RemoteAuthorization, RemoteChallenge};
use crate::responder::{self, ChallengeConfig, Config, PriorKeyFunc, Responder};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Two minutes of polling per challenge before giving up.
const MAX_POLLS: u32 = 24;

/// Environment the solver hands to responders.
#[derive(Clone)]
pub struct SolverConfig {
    pub web_paths: Vec<String>,
    pub http_ports: Vec<String>,
    pub prior_key: Option<Arc<PriorKeyFunc>>,
    /// Verify challenge reachability through the hostname before asking
    /// the server to validate. Disable only when the hostname cannot
    /// resolve back to this machine.
    pub self_test: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            web_paths: Vec::new(),
            http_ports: Vec::new(),
            prior_key: None,
            self_test: true,
        }
    }
}

/// Obtain a (valid) authorization for `hostname` on the given account.
pub async fn authorize(
    acme: &dyn AcmeClient,
    creds: &AccountCreds<'_>,
    hostname: &str,
    cfg: &SolverConfig,
) -> Result<RemoteAuthorization> {
    let az = acme
        .new_authorization(creds, hostname)
        .await
        .with_context(|| format!("create authorization for {}", hostname))?;

    if az.status == AuthorizationStatus::Valid {
        debug!(hostname, "authorization already valid");
        return Ok(az);
    }

    let mut last_err = None;
    for ch in &az.challenges {
        if !responder::supported(&ch.ctype) {
            debug!(hostname, ctype = %ch.ctype, "no responder for challenge type");
            continue;
        }
        debug!(hostname, ctype = %ch.ctype, "attempting challenge");
        match attempt_challenge(acme, creds, &az, ch, hostname, cfg).await {
            Ok(done) => return Ok(done),
            Err(e) => {
                warn!(hostname, ctype = %ch.ctype, "challenge failed: {:#}", e);
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(e.context(format!("no challenge succeeded for {}", hostname))),
        None => bail!("no supported challenge offered for {}", hostname),
    }
}

async fn attempt_challenge(
    acme: &dyn AcmeClient,
    creds: &AccountCreds<'_>,
    az: &RemoteAuthorization,
    ch: &RemoteChallenge,
    hostname: &str,
    cfg: &SolverConfig,
) -> Result<RemoteAuthorization> {
    let mut resp = responder::new_responder(Config {
        ctype: ch.ctype.clone(),
        account_key: creds.key.clone(),
        token: ch.token.clone(),
        hostname: cfg.self_test.then(|| hostname.to_string()),
        challenge: ChallengeConfig {
            web_paths: cfg.web_paths.clone(),
            http_ports: cfg.http_ports.clone(),
            prior_key: cfg.prior_key.clone(),
            start_hook: None,
            stop_hook: None,
        },
    })?;

    resp.start().await.context("start responder")?;

    // whatever happens next, the responder must be stopped
    let result = run_challenge(acme, creds, az, ch, resp.as_mut()).await;
    if let Err(e) = resp.stop().await {
        warn!(error = %e, "failed to stop responder");
    }
    result
}

async fn run_challenge(
    acme: &dyn AcmeClient,
    creds: &AccountCreds<'_>,
    az: &RemoteAuthorization,
    ch: &RemoteChallenge,
    resp: &mut dyn Responder,
) -> Result<RemoteAuthorization> {
    if let Some(validation) = resp.validation() {
        let signing_key = resp.validation_signing_key();
        acme.respond_to_challenge(creds, ch, validation, signing_key.as_ref())
            .await
            .context("submit challenge response")?;
    }

    for _ in 0..MAX_POLLS {
        let current = acme
            .load_authorization(creds, &az.url)
            .await
            .context("poll authorization")?;
        match current.status {
            AuthorizationStatus::Valid => return Ok(current),
            AuthorizationStatus::Invalid => {
                bail!("authorization for {} was rejected", current.hostname)
            }
            AuthorizationStatus::Pending | AuthorizationStatus::Unknown => {}
        }

        // a detected request means the server is fetching: poll again soon
        match resp.request_detected() {
            Some(rx) => {
                let _ = tokio::time::timeout(POLL_INTERVAL, rx.recv()).await;
            }
            None => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }

    bail!("authorization for {} did not settle in time", az.hostname)
}
