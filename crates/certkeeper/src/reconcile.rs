//! The reconciliation loop.
//!
//! One pass downloads any certificates we only know by URL, then walks the
//! targets: a target whose best satisfying certificate is fresh is skipped,
//! everything else gets the full treatment: registration upsert, missing
//! authorizations, new key, CSR, issuance, download. A failing target never
//! blocks the others; failures are collected into a [`MultiError`]. After
//! the pass the whole store reloads so derived data (links, mappings)
//! reflects what actually landed on disk.

use std::collections::HashSet;
use std::fmt;

use anyhow::{bail, Context, Result};
use openssl::x509::X509;
use tracing::{debug, error, warn};

use crate::acme::{AccountCreds, AcmeClient};
use crate::crypto;
use crate::solver::{self, SolverConfig};
use crate::storage::{determine_certificate_id, Authorization, Certificate, Store};

/// Failure to satisfy one target. Other targets proceed regardless.
#[derive(Debug)]
pub struct TargetError {
    pub target: String,
    pub error: anyhow::Error,
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error satisfying target {}: {:#}", self.target, self.error)
    }
}

impl std::error::Error for TargetError {}

/// Every per-target failure from one reconcile run.
#[derive(Debug)]
pub struct MultiError(pub Vec<TargetError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the following errors occurred:")?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "\n{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl Store {
    /// Run reconciliation, then reload the store from disk whatever the
    /// outcome. A reload failure only surfaces when reconciliation itself
    /// succeeded.
    pub async fn reconcile(
        &mut self,
        acme: &dyn AcmeClient,
        solver_cfg: &SolverConfig,
    ) -> Result<()> {
        let result = self.reconcile_inner(acme, solver_cfg).await;
        match self.load() {
            Ok(()) => result,
            Err(reload_err) => match result {
                Ok(()) => Err(reload_err.context("reload after reconciliation")),
                Err(e) => {
                    error!("failed to reload after reconciliation: {:#}", reload_err);
                    Err(e)
                }
            },
        }
    }

    async fn reconcile_inner(
        &mut self,
        acme: &dyn AcmeClient,
        solver_cfg: &SolverConfig,
    ) -> Result<()> {
        if self.have_uncached_certificates() {
            debug!("uncached certificates present, downloading");
            self.download_uncached_certificates(acme).await?;
            self.load().context("reload after downloading certificates")?;
            if self.have_uncached_certificates() {
                bail!("cannot obtain one or more uncached certificates");
            }
        }

        let mut errors = Vec::new();
        let tkeys: Vec<String> = self.targets.keys().cloned().collect();
        for tkey in tkeys {
            let (satisfied, target_str) = {
                let Some(tgt) = self.targets.get(&tkey) else { continue };
                let satisfied = self
                    .find_best_certificate_satisfying(tgt)
                    .map(|c| !self.certificate_needs_renewing(c))
                    .unwrap_or(false);
                (satisfied, tgt.to_string())
            };
            if satisfied {
                debug!(target = %target_str, "have best certificate which does not need renewing");
                continue;
            }

            debug!(target = %target_str, "requesting certificate");
            if let Err(e) = self.request_certificate_for_target(acme, &tkey, solver_cfg).await {
                warn!(target = %target_str, "failed to satisfy target: {:#}", e);
                errors.push(TargetError {
                    target: target_str,
                    error: e,
                });
            }
        }
        debug!(errors = errors.len(), "target pass complete");

        if !errors.is_empty() {
            return Err(MultiError(errors).into());
        }
        Ok(())
    }

    fn have_uncached_certificates(&self) -> bool {
        self.certs.values().any(|c| !c.cached)
    }

    async fn download_uncached_certificates(&mut self, acme: &dyn AcmeClient) -> Result<()> {
        let ids: Vec<String> = self
            .certs
            .iter()
            .filter(|(_, c)| !c.cached)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.download_certificate(acme, &id).await?;
        }
        Ok(())
    }

    /// Fetch the chain for a stored certificate URL and write `cert`,
    /// `chain` and `fullchain`. `fullchain` lands last: its presence is
    /// what marks the certificate as cached on the next load.
    async fn download_certificate(&mut self, acme: &dyn AcmeClient, cert_id: &str) -> Result<()> {
        let url = self
            .certs
            .get(cert_id)
            .with_context(|| format!("unknown certificate {}", cert_id))?
            .url
            .clone();
        debug!(cert_id, %url, "downloading certificate");

        let chain = acme
            .wait_for_certificate(&url)
            .await
            .with_context(|| format!("download certificate {}", url))?;
        if chain.is_empty() {
            bail!("server returned an empty chain for {}", url);
        }

        let mut cert_pem = Vec::new();
        let mut chain_pem = Vec::new();
        let mut fullchain_pem = Vec::new();
        for (i, der) in chain.iter().enumerate() {
            let pem = X509::from_der(der)
                .context("parse downloaded certificate")?
                .to_pem()?;
            if i == 0 {
                cert_pem.extend_from_slice(&pem);
            } else {
                chain_pem.extend_from_slice(&pem);
            }
            fullchain_pem.extend_from_slice(&pem);
        }

        let c = self.db.collection(&format!("certs/{}", cert_id));
        c.write("cert", &cert_pem)?;
        c.write("chain", &chain_pem)?;
        c.write("fullchain", &fullchain_pem)?;

        if let Some(cert) = self.certs.get_mut(cert_id) {
            cert.certificates = chain;
            cert.cached = true;
        }
        Ok(())
    }

    async fn request_certificate_for_target(
        &mut self,
        acme: &dyn AcmeClient,
        tkey: &str,
        solver_cfg: &SolverConfig,
    ) -> Result<()> {
        let (account_id, request_names) = {
            let tgt = self
                .targets
                .get(tkey)
                .with_context(|| format!("target {:?} vanished during reconcile", tkey))?;
            (tgt.request.account_id.clone(), tgt.request.names.clone())
        };
        let (base_url, account_key) = {
            let account = self
                .accounts
                .get(&account_id)
                .with_context(|| format!("account {:?} is not loaded", account_id))?;
            (account.base_url.clone(), account.private_key.clone())
        };
        let creds = AccountCreds {
            directory_url: &base_url,
            key: &account_key,
        };

        acme.upsert_registration(&creds)
            .await
            .context("ensure registration")?;

        for name in self.determine_necessary_authorizations(tkey) {
            debug!(hostname = %name, "obtaining authorization");
            self.obtain_authorization(acme, &creds, &account_id, &name, solver_cfg)
                .await
                .with_context(|| format!("could not obtain authorization for {}", name))?;
        }

        let (key, _key_id) = self.create_new_cert_key()?;
        let csr = crypto::create_csr(&key, &request_names)?;
        let issued = acme
            .request_certificate(&creds, &csr)
            .await
            .context("request certificate")?;

        let cert_id = determine_certificate_id(&issued.url);
        self.db
            .collection(&format!("certs/{}", cert_id))
            .write("url", issued.url.as_bytes())?;
        self.certs.insert(
            cert_id.clone(),
            Certificate {
                url: issued.url.clone(),
                certificates: Vec::new(),
                cached: false,
                key_id: None,
            },
        );

        self.download_certificate(acme, &cert_id).await
    }

    /// Names from the target's request list not covered by a currently
    /// valid authorization, preserving the request order.
    fn determine_necessary_authorizations(&self, tkey: &str) -> Vec<String> {
        let Some(tgt) = self.targets.get(tkey) else {
            return Vec::new();
        };
        let mut needed: HashSet<&str> = tgt.request.names.iter().map(String::as_str).collect();
        if let Some(account) = self.accounts.get(&tgt.request.account_id) {
            for auth in account.authorizations.values() {
                if auth.is_valid() {
                    needed.remove(auth.name.as_str());
                }
            }
        }
        tgt.request
            .names
            .iter()
            .filter(|n| needed.contains(n.as_str()))
            .cloned()
            .collect()
    }

    async fn obtain_authorization(
        &mut self,
        acme: &dyn AcmeClient,
        creds: &AccountCreds<'_>,
        account_id: &str,
        name: &str,
        solver_cfg: &SolverConfig,
    ) -> Result<()> {
        let az = solver::authorize(acme, creds, name, solver_cfg).await?;

        let Some(expires) = az.expires else {
            // without an expiry the authorization cannot be cached; it
            // still served its purpose for this issuance
            warn!(hostname = %name, "authorization has no expiry, not persisting");
            return Ok(());
        };

        let c = self
            .db
            .collection(&format!("accounts/{}/authorizations/{}", account_id, name));
        c.write("expiry", expires.to_rfc3339().as_bytes())?;
        c.write("url", az.url.as_bytes())?;

        if let Some(account) = self.accounts.get_mut(account_id) {
            account.authorizations.insert(
                name.to_string(),
                Authorization {
                    name: name.to_string(),
                    url: az.url,
                    expires,
                },
            );
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
