//! The state directory: schema, load pipeline, matcher and mutations.
//!
//! The store is an arena view of the directory tree: accounts, keys,
//! certificates and targets are loaded into maps keyed by their derived
//! IDs, every mutation goes back through [`fdb`] atomically, and derived
//! data is refreshed by a full reload rather than incremental updates.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::acme::{self, valid_url};
use crate::crypto;
use crate::fdb::{Collection, Db, Link, Permission};
use crate::notify::Notifier;
use crate::responder::PriorKeyFunc;

/// Default state directory.
pub const RECOMMENDED_PATH: &str = "/var/lib/certkeeper";

static STORE_PERMISSIONS: &[Permission] = &[
    Permission { path: ".", dir_mode: 0o755, file_mode: 0o644 },
    Permission { path: "accounts", dir_mode: 0o700, file_mode: 0o600 },
    Permission { path: "desired", dir_mode: 0o755, file_mode: 0o644 },
    Permission { path: "live", dir_mode: 0o755, file_mode: 0o644 },
    Permission { path: "certs", dir_mode: 0o755, file_mode: 0o644 },
    // written by the haproxy hook, carries the private key
    Permission { path: "certs/*/haproxy", dir_mode: 0o700, file_mode: 0o600 },
    Permission { path: "keys", dir_mode: 0o700, file_mode: 0o600 },
    Permission { path: "conf", dir_mode: 0o755, file_mode: 0o644 },
    Permission { path: "tmp", dir_mode: 0o700, file_mode: 0o600 },
];

/// Load-time violations of the state directory schema. These are fatal:
/// reconciliation refuses to run against a directory it cannot trust.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("account ID mismatch: {actual:?} != {expected:?}")]
    AccountIdMismatch { expected: String, actual: String },
    #[error("key ID mismatch: {actual:?} != {expected:?}")]
    KeyIdMismatch { expected: String, actual: String },
    #[error("certificate ID mismatch: {actual:?} != {expected:?}")]
    CertificateIdMismatch { expected: String, actual: String },
    #[error("certificate {0} has an invalid URL")]
    InvalidCertificateUrl(String),
    #[error("provider URL is not a valid HTTPS URL: {0:?}")]
    InvalidProviderUrl(String),
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
    #[error("invalid authorization expiry: {0:?}")]
    InvalidExpiry(String),
    #[error("invalid private key at {0}: {1}")]
    InvalidPrivateKey(String, String),
    #[error("invalid stored certificate {0}: {1}")]
    InvalidStoredCertificate(String, String),
    #[error("malformed account directory name: {0:?}")]
    MalformedAccountDir(String),
    #[error("malformed target {name:?}: {message}")]
    MalformedTarget { name: String, message: String },
}

// ── Stored records ────────────────────────────────────────────────────────────

/// One registration with one provider. Never destroyed by the reconciler.
pub struct Account {
    /// `urlEncode(baseURL)/keyID(privateKey)`; doubles as the on-disk path.
    pub id: String,
    pub private_key: PKey<Private>,
    /// Provider directory URL.
    pub base_url: String,
    /// Authorizations held by this account, by hostname.
    pub authorizations: HashMap<String, Authorization>,
}

impl Account {
    pub fn matches_url(&self, url: &str) -> bool {
        self.base_url == url
    }
}

/// Proof of control over one hostname, with an expiry.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub name: String,
    pub url: String,
    pub expires: DateTime<Utc>,
}

impl Authorization {
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires
    }
}

/// A stored private key. The material stays on disk; only the ID is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub id: String,
}

/// A stored certificate, identified by the hash of its URL.
pub struct Certificate {
    pub url: String,
    /// DER chain, end-entity first. Empty until downloaded.
    pub certificates: Vec<Vec<u8>>,
    /// True once the chain is present on disk.
    pub cached: bool,
    /// ID of the matching stored private key, when we hold it.
    pub key_id: Option<String>,
}

impl Certificate {
    pub fn id(&self) -> String {
        determine_certificate_id(&self.url)
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({})", self.id())
    }
}

// ── Targets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSatisfy {
    /// Hostnames this target requires coverage for.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// The subset of `names` this target owns after disjoining.
    #[serde(skip)]
    pub reduced_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetRequest {
    /// SAN list for new CSRs. Defaults to the satisfy names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// True when `names` was defaulted, so the default is not reserialized.
    #[serde(skip)]
    pub implicit_names: bool,
    /// Provider directory URL; empty means the configured default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Resolved account ID.
    #[serde(skip)]
    pub account_id: String,
}

impl TargetRequest {
    fn is_empty(&self) -> bool {
        self.names.is_empty() && self.provider.is_none()
    }
}

/// A declarative request: keep these names covered by a certificate from
/// this provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    pub satisfy: TargetSatisfy,
    #[serde(skip_serializing_if = "TargetRequest::is_empty")]
    pub request: TargetRequest,
    #[serde(skip_serializing_if = "is_zero")]
    pub priority: i32,

    /// Legacy flat schema, migrated into `satisfy`/`request` on load.
    #[serde(rename = "names", skip_serializing)]
    pub legacy_names: Vec<String>,
    #[serde(rename = "provider", skip_serializing)]
    pub legacy_provider: Option<String>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Target({};{};{})",
            self.satisfy.names.join(","),
            self.request.provider.as_deref().unwrap_or(""),
            self.priority
        )
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// The open state directory.
pub struct Store {
    pub(crate) db: Db,
    pub(crate) path: PathBuf,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) accounts: HashMap<String, Account>,
    pub(crate) keys: HashMap<String, Key>,
    pub(crate) certs: HashMap<String, Certificate>,
    pub(crate) targets: HashMap<String, Target>,
    pub(crate) default_target: Target,
    pub(crate) webroot_paths: Vec<String>,
    pub(crate) preferred_rsa_key_size: u32,
    /// The bijective hostname → target-file mapping from disjoining.
    pub(crate) hostname_targets: HashMap<String, String>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Store {
    /// Open the state directory at `path`, enforcing modes and running the
    /// full load pipeline.
    pub fn open(path: &Path, notifier: Arc<dyn Notifier>) -> Result<Store> {
        let db = Db::open(path, STORE_PERMISSIONS)?;
        let mut store = Store {
            db,
            path: path.to_path_buf(),
            notifier,
            accounts: HashMap::new(),
            keys: HashMap::new(),
            certs: HashMap::new(),
            targets: HashMap::new(),
            default_target: Target::default(),
            webroot_paths: Vec::new(),
            preferred_rsa_key_size: 0,
            hostname_targets: HashMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn webroot_paths(&self) -> &[String] {
        &self.webroot_paths
    }

    /// Re-read everything and rebuild all derived data.
    pub(crate) fn load(&mut self) -> Result<()> {
        self.accounts.clear();
        self.keys.clear();
        self.certs.clear();
        self.targets.clear();
        self.default_target = Target::default();
        self.hostname_targets.clear();

        self.load_conf()?;
        self.load_accounts()?;
        self.load_keys()?;
        self.load_certs()?;
        self.load_targets()?;
        self.disjoin_targets();
        self.link_targets()?;
        Ok(())
    }

    fn load_conf(&mut self) -> Result<()> {
        let conf = self.db.collection("conf");

        self.preferred_rsa_key_size = match conf.read_opt("rsa-key-size")? {
            Some(b) => String::from_utf8_lossy(&b)
                .trim()
                .parse::<u32>()
                .context("conf/rsa-key-size is not an integer")?,
            None => 0,
        };

        self.webroot_paths = match conf.read_opt("webroot-path")? {
            Some(b) => String::from_utf8_lossy(&b)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        Ok(())
    }

    // ── Accounts ──────────────────────────────────────────────────────────

    fn load_accounts(&mut self) -> Result<()> {
        let c = self.db.collection("accounts");
        for server_name in c.list()? {
            let sc = c.subcollection(&server_name);
            for account_name in sc.list()? {
                self.validate_account(&server_name, &account_name, sc.subcollection(&account_name))?;
            }
        }
        Ok(())
    }

    fn validate_account(
        &mut self,
        server_name: &str,
        account_name: &str,
        c: Collection,
    ) -> Result<()> {
        let where_ = format!("accounts/{}/{}", server_name, account_name);
        let pem = c.read("privkey")?;
        let private_key = crypto::load_private_key(&pem)
            .map_err(|e| SchemaError::InvalidPrivateKey(where_.clone(), format!("{:#}", e)))?;

        let base_url = decode_account_url_part(server_name)?;
        let expected = determine_account_id(&base_url, &private_key)?;
        let actual = format!("{}/{}", server_name, account_name);
        if expected != actual {
            bail!(SchemaError::AccountIdMismatch { expected, actual });
        }

        let mut account = Account {
            id: actual.clone(),
            private_key,
            base_url,
            authorizations: HashMap::new(),
        };
        self.load_authorizations(&mut account, &c)?;
        self.accounts.insert(actual, account);
        Ok(())
    }

    fn load_authorizations(&self, account: &mut Account, c: &Collection) -> Result<()> {
        let ac = c.subcollection("authorizations");
        for name in ac.list()? {
            let auc = ac.subcollection(&name);

            let expiry = auc.read_string("expiry")?;
            let expires = DateTime::parse_from_rfc3339(expiry.trim())
                .map_err(|_| SchemaError::InvalidExpiry(expiry.trim().to_string()))?
                .with_timezone(&Utc);

            // a missing or invalid URL is tolerated; the authorization is
            // still usable for skipping re-authorization
            let url = auc
                .read_opt("url")?
                .map(|b| String::from_utf8_lossy(&b).trim().to_string())
                .filter(|u| valid_url(u))
                .unwrap_or_default();

            account.authorizations.insert(
                name.clone(),
                Authorization { name, url, expires },
            );
        }
        Ok(())
    }

    // ── Keys ──────────────────────────────────────────────────────────────

    fn load_keys(&mut self) -> Result<()> {
        let c = self.db.collection("keys");
        for key_id in c.list()? {
            let kc = c.subcollection(&key_id);
            let pem = kc.read("privkey")?;
            let key = crypto::load_private_key(&pem).map_err(|e| {
                SchemaError::InvalidPrivateKey(format!("keys/{}", key_id), format!("{:#}", e))
            })?;

            let actual = crypto::key_id(&key)?;
            if actual != key_id {
                bail!(SchemaError::KeyIdMismatch {
                    expected: actual,
                    actual: key_id,
                });
            }
            self.keys.insert(actual.clone(), Key { id: actual });
        }
        Ok(())
    }

    // ── Certificates ──────────────────────────────────────────────────────

    fn load_certs(&mut self) -> Result<()> {
        let c = self.db.collection("certs");
        for cert_id in c.list()? {
            self.validate_cert(&cert_id, c.subcollection(&cert_id))?;
        }
        Ok(())
    }

    fn validate_cert(&mut self, cert_id: &str, c: Collection) -> Result<()> {
        let url = c.read_string("url")?.trim().to_string();
        if !valid_url(&url) {
            bail!(SchemaError::InvalidCertificateUrl(cert_id.to_string()));
        }

        let actual = determine_certificate_id(&url);
        if actual != cert_id {
            bail!(SchemaError::CertificateIdMismatch {
                expected: actual,
                actual: cert_id.to_string(),
            });
        }

        let mut cert = Certificate {
            url,
            certificates: Vec::new(),
            cached: false,
            key_id: None,
        };

        if let Some(fullchain) = c.read_opt("fullchain")? {
            let parsed = X509::stack_from_pem(&fullchain).map_err(|e| {
                SchemaError::InvalidStoredCertificate(cert_id.to_string(), e.to_string())
            })?;
            if parsed.is_empty() {
                bail!(SchemaError::InvalidStoredCertificate(
                    cert_id.to_string(),
                    "fullchain contains no certificates".into()
                ));
            }

            let spki = parsed[0]
                .public_key()
                .and_then(|k| k.public_key_to_der())
                .map_err(|e| {
                    SchemaError::InvalidStoredCertificate(cert_id.to_string(), e.to_string())
                })?;
            let key_id = crypto::key_id_from_spki(&spki);
            if self.keys.contains_key(&key_id) {
                // self-healing: always point privkey back at the key store
                c.write_link(
                    "privkey",
                    &Link {
                        target: format!("keys/{}/privkey", key_id),
                    },
                )?;
                cert.key_id = Some(key_id);
            }

            cert.certificates = parsed
                .iter()
                .map(|x| x.to_der())
                .collect::<Result<Vec<_>, _>>()?;
            cert.cached = true;
        }

        self.certs.insert(cert_id.to_string(), cert);
        Ok(())
    }

    // ── Targets ───────────────────────────────────────────────────────────

    fn load_targets(&mut self) -> Result<()> {
        // the default target only contributes request defaults; any names
        // on it are discarded
        let conf = self.db.collection("conf");
        if conf.exists("target") {
            match self.validate_target_inner("target", &conf) {
                Ok(mut dtgt) => {
                    dtgt.satisfy.names.clear();
                    dtgt.satisfy.reduced_names.clear();
                    dtgt.request.names.clear();
                    self.default_target = dtgt;
                }
                Err(e) => {
                    warn!(error = %e, "ignoring unusable conf/target");
                    self.default_target = Target::default();
                }
            }
        }

        let c = self.db.collection("desired");
        for name in c.list()? {
            let tgt = self.validate_target_inner(&name, &c)?;
            self.targets.insert(name, tgt);
        }
        Ok(())
    }

    fn validate_target_inner(&mut self, key: &str, c: &Collection) -> Result<Target> {
        let bytes = c.read(key)?;
        let mut tgt: Target =
            serde_yaml::from_slice(&bytes).map_err(|e| SchemaError::MalformedTarget {
                name: key.to_string(),
                message: e.to_string(),
            })?;

        if tgt.satisfy.names.is_empty() {
            if !tgt.legacy_names.is_empty() {
                tgt.satisfy.names = std::mem::take(&mut tgt.legacy_names);
            } else {
                tgt.satisfy.names = vec![key.to_string()];
            }
        }
        if tgt.request.provider.is_none() {
            tgt.request.provider = tgt.legacy_provider.take();
        }

        normalize_names(&mut tgt.satisfy.names)
            .with_context(|| format!("invalid target {:?}", key))?;

        if tgt.request.names.is_empty() {
            tgt.request.names = tgt.satisfy.names.clone();
            tgt.request.implicit_names = true;
        } else {
            normalize_names(&mut tgt.request.names)
                .with_context(|| format!("invalid target {:?}", key))?;
        }

        tgt.request.account_id = self.account_id_by_provider(tgt.request.provider.as_deref())?;
        Ok(tgt)
    }

    /// Find the account for a provider string, creating account and key
    /// when no existing account matches. Empty falls back to the default
    /// target's provider, then to the global default directory.
    fn account_id_by_provider(&mut self, provider: Option<&str>) -> Result<String> {
        let mut p = provider.unwrap_or("").to_string();
        if p.is_empty() {
            p = self
                .default_target
                .request
                .provider
                .as_deref()
                .unwrap_or("")
                .to_string();
        }
        if p.is_empty() {
            p = acme::DEFAULT_DIRECTORY_URL.to_string();
        }
        if !valid_url(&p) {
            bail!(SchemaError::InvalidProviderUrl(p));
        }

        if let Some(a) = self.accounts.values().find(|a| a.matches_url(&p)) {
            return Ok(a.id.clone());
        }
        self.create_new_account(&p)
    }

    fn create_new_account(&mut self, base_url: &str) -> Result<String> {
        debug!(provider = base_url, "creating new account");
        let url_part = account_url_part(base_url)?;
        let c = self.db.collection(&format!("accounts/{}", url_part));
        let (private_key, key_id) = self.create_key(&c)?;

        let id = format!("{}/{}", url_part, key_id);
        self.accounts.insert(
            id.clone(),
            Account {
                id: id.clone(),
                private_key,
                base_url: base_url.to_string(),
                authorizations: HashMap::new(),
            },
        );
        Ok(id)
    }

    // ── Key management ────────────────────────────────────────────────────

    fn create_key(&self, c: &Collection) -> Result<(PKey<Private>, String)> {
        let bits = clamp_rsa_key_size(self.preferred_rsa_key_size);
        let key = crypto::generate_rsa_key(bits)?;
        let key_id = self.save_key_under_id(c, &key)?;
        Ok((key, key_id))
    }

    /// Generate and store a key for a new certificate.
    pub(crate) fn create_new_cert_key(&mut self) -> Result<(PKey<Private>, String)> {
        let c = self.db.collection("keys");
        let (key, key_id) = self.create_key(&c)?;
        self.keys.insert(key_id.clone(), Key { id: key_id.clone() });
        Ok((key, key_id))
    }

    fn save_key(&self, c: &Collection, key: &PKey<Private>) -> Result<()> {
        let pem = crypto::private_key_to_pem(key)?;
        let mut w = c.create("privkey")?;
        w.write_all(&pem)?;
        w.commit()
    }

    fn save_key_under_id(&self, c: &Collection, key: &PKey<Private>) -> Result<String> {
        let key_id = crypto::key_id(key)?;
        self.save_key(&c.subcollection(&key_id), key)?;
        Ok(key_id)
    }

    /// Look up a prior private key by SPKI, for proof-of-possession style
    /// challenges. Absence and unreadable keys resolve to `None`.
    pub fn prior_key_lookup(&self) -> Arc<PriorKeyFunc> {
        let db = self.db.clone();
        let known: HashSet<String> = self.keys.keys().cloned().collect();
        Arc::new(move |spki: &[u8]| {
            let key_id = crypto::key_id_from_spki(spki);
            if !known.contains(&key_id) {
                debug!(%key_id, "no prior key with wanted SPKI");
                return Ok(None);
            }
            let pem = match db.collection(&format!("keys/{}", key_id)).read("privkey") {
                Ok(p) => p,
                Err(e) => {
                    warn!(%key_id, error = %e, "failed to read prior key");
                    return Ok(None);
                }
            };
            match crypto::load_private_key(&pem) {
                Ok(k) => Ok(Some(k)),
                Err(e) => {
                    warn!(%key_id, error = %e, "failed to parse prior key");
                    Ok(None)
                }
            }
        })
    }

    // ── Disjoining and linking ────────────────────────────────────────────

    /// Partition hostnames over targets: every hostname is owned by the
    /// greatest target claiming it.
    fn disjoin_targets(&mut self) {
        let mut order: Vec<String> = self.targets.keys().cloned().collect();
        // sorted filenames are the stable base order
        order.sort();
        order.sort_by(|a, b| {
            let (ta, tb) = (&self.targets[a], &self.targets[b]);
            if target_gt(ta, tb) {
                std::cmp::Ordering::Less
            } else if target_gt(tb, ta) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });

        let mut mapping: HashMap<String, String> = HashMap::new();
        let mut reduced: HashMap<String, Vec<String>> = HashMap::new();
        for tkey in &order {
            for name in &self.targets[tkey].satisfy.names {
                if !mapping.contains_key(name) {
                    mapping.insert(name.clone(), tkey.clone());
                    reduced.entry(tkey.clone()).or_default().push(name.clone());
                }
            }
        }

        for (tkey, tgt) in self.targets.iter_mut() {
            tgt.satisfy.reduced_names = reduced.remove(tkey).unwrap_or_default();
        }
        for (name, tkey) in &mapping {
            debug!(hostname = %name, target = %tkey, "disjoint hostname mapping");
        }
        self.hostname_targets = mapping;
    }

    /// Point `live/<hostname>` at the best satisfying certificate for each
    /// owned hostname, and report the set of changed links.
    fn link_targets(&mut self) -> Result<()> {
        let mut updated = Vec::new();
        let live = self.db.collection("live");

        let mut hostnames: Vec<&String> = self.hostname_targets.keys().collect();
        hostnames.sort();
        for name in hostnames {
            let tgt = &self.targets[&self.hostname_targets[name]];
            let Some(cert) = self.find_best_certificate_satisfying(tgt) else {
                continue;
            };
            let lt = format!("certs/{}", cert.id());
            let current = live.read_link(name)?;
            if current.as_ref().map(|l| l.target != lt).unwrap_or(true) {
                debug!(hostname = %name, target = %lt, was = ?current, "relinking");
                live.write_link(name, &Link { target: lt })?;
                updated.push(name.clone());
            }
        }

        if let Err(e) = self.notifier.notify("live-updated", &self.path, &updated) {
            warn!(error = %e, "notification hook failed");
        }
        Ok(())
    }

    // ── Matching ──────────────────────────────────────────────────────────

    pub(crate) fn find_best_certificate_satisfying(&self, t: &Target) -> Option<&Certificate> {
        let mut best: Option<&Certificate> = None;
        for c in self.certs.values() {
            if self.cert_satisfies(c, t) && best.map(|b| cert_better_than(c, b)).unwrap_or(true) {
                best = Some(c);
            }
        }
        best
    }

    /// A certificate satisfies a target iff we hold its key, it parses,
    /// and its SAN DNS names cover the satisfy set.
    pub(crate) fn cert_satisfies(&self, c: &Certificate, t: &Target) -> bool {
        if c.certificates.is_empty() {
            debug!(cert = %c, target = %t, "cannot satisfy: no certificate data");
            return false;
        }
        if c.key_id.is_none() {
            debug!(cert = %c, target = %t, "cannot satisfy: no private key held");
            return false;
        }
        let meta = match parse_cert_meta(&c.certificates[0]) {
            Ok(m) => m,
            Err(e) => {
                debug!(cert = %c, target = %t, error = %e, "cannot satisfy: unparseable");
                return false;
            }
        };
        let names: HashSet<&str> = meta.dns_names.iter().map(String::as_str).collect();
        for want in &t.satisfy.names {
            if !names.contains(want.as_str()) {
                debug!(cert = %c, target = %t, hostname = %want, "cannot satisfy: name not covered");
                return false;
            }
        }
        true
    }

    pub(crate) fn certificate_needs_renewing(&self, c: &Certificate) -> bool {
        if c.certificates.is_empty() {
            return false;
        }
        let meta = match parse_cert_meta(&c.certificates[0]) {
            Ok(m) => m,
            Err(_) => {
                debug!(cert = %c, "not renewing: end certificate unparseable");
                return false;
            }
        };
        let at = renew_time(meta.not_before, meta.not_after);
        let needs = Utc::now() >= at;
        debug!(cert = %c, needs, renew_at = %at, not_after = %meta.not_after, "renewal check");
        needs
    }

    // ── Mutations ─────────────────────────────────────────────────────────

    /// Set the provider directory URL used when targets name none.
    pub fn set_default_provider(&mut self, provider_url: &str) -> Result<()> {
        if !valid_url(provider_url) {
            bail!(SchemaError::InvalidProviderUrl(provider_url.to_string()));
        }
        self.default_target.request.provider = Some(provider_url.to_string());
        self.save_default_target()
    }

    fn save_default_target(&self) -> Result<()> {
        let data = target_yaml(&self.default_target)?;
        self.db.collection("conf").write("target", &data)
    }

    pub fn set_preferred_rsa_key_size(&mut self, bits: u32) -> Result<()> {
        self.preferred_rsa_key_size = bits;
        self.db
            .collection("conf")
            .write("rsa-key-size", format!("{}\n", bits).as_bytes())
    }

    pub fn set_webroot_paths(&mut self, paths: Vec<String>) -> Result<()> {
        let data = paths
            .iter()
            .map(|p| format!("{}\n", p))
            .collect::<String>();
        self.db.collection("conf").write("webroot-path", data.as_bytes())?;
        self.webroot_paths = paths;
        Ok(())
    }

    /// Add a target. A no-op when some existing target already covers all
    /// of the requested names.
    pub fn add_target(&mut self, mut tgt: Target) -> Result<()> {
        if tgt.satisfy.names.is_empty() {
            return Ok(());
        }
        normalize_names(&mut tgt.satisfy.names)?;
        if !tgt.request.names.is_empty() {
            normalize_names(&mut tgt.request.names)?;
        }

        if self.find_target_with_all_names(&tgt.satisfy.names).is_some() {
            debug!(target = %tgt, "already covered by an existing target");
            return Ok(());
        }

        if tgt.request.names.is_empty() {
            tgt.request.names = tgt.satisfy.names.clone();
            tgt.request.implicit_names = true;
        }
        tgt.request.account_id = self.account_id_by_provider(tgt.request.provider.as_deref())?;

        let name = make_unique_target_name(&tgt);
        let data = target_yaml(&tgt)?;
        self.db.collection("desired").write(&name, &data)?;
        self.targets.insert(name, tgt);
        Ok(())
    }

    fn find_target_with_all_names(&self, names: &[String]) -> Option<&Target> {
        self.targets
            .values()
            .find(|t| names.iter().all(|n| t.satisfy.names.contains(n)))
    }

    /// Remove `hostname` from every target; targets left with no satisfy
    /// names are deleted.
    pub fn remove_target_hostname(&mut self, hostname: &str) -> Result<()> {
        let mut names = vec![hostname.to_string()];
        normalize_names(&mut names)?;
        let hostname = names.pop().unwrap_or_default();

        let keys: Vec<String> = self.targets.keys().cloned().collect();
        for k in keys {
            let Some(tgt) = self.targets.get_mut(&k) else {
                continue;
            };
            if !tgt.satisfy.names.iter().any(|n| n == &hostname) {
                continue;
            }
            tgt.satisfy.names.retain(|n| n != &hostname);
            tgt.request.names.retain(|n| n != &hostname);

            if tgt.satisfy.names.is_empty() {
                self.db.collection("desired").delete(&k)?;
                self.targets.remove(&k);
            } else {
                let data = target_yaml(tgt)?;
                self.db.collection("desired").write(&k, &data)?;
            }
        }
        Ok(())
    }

    /// Install a PEM private key. A no-op when the key is already stored.
    pub fn import_key(&mut self, pem: &[u8]) -> Result<()> {
        let key = crypto::load_private_key(pem)?;
        let key_id = crypto::key_id(&key)?;

        let c = self.db.collection(&format!("keys/{}", key_id));
        if c.exists("privkey") {
            return Ok(());
        }
        c.write("privkey", pem)?;
        self.keys.insert(key_id.clone(), Key { id: key_id });
        Ok(())
    }

    /// Record a certificate URL; the body downloads on the next reconcile.
    pub fn import_certificate(&mut self, url: &str) -> Result<()> {
        if !valid_url(url) {
            bail!(SchemaError::InvalidProviderUrl(url.to_string()));
        }
        let cert_id = determine_certificate_id(url);
        if self.certs.contains_key(&cert_id) {
            return Ok(());
        }
        self.db
            .collection(&format!("certs/{}", cert_id))
            .write("url", url.as_bytes())?;
        self.certs.insert(
            cert_id,
            Certificate {
                url: url.to_string(),
                certificates: Vec::new(),
                cached: false,
                key_id: None,
            },
        );
        Ok(())
    }

    /// Install an account private key for a provider. A no-op when that
    /// account already exists.
    pub fn import_account_key(&mut self, provider_url: &str, pem: &[u8]) -> Result<()> {
        if !valid_url(provider_url) {
            bail!(SchemaError::InvalidProviderUrl(provider_url.to_string()));
        }
        let key = crypto::load_private_key(pem)?;
        let account_id = determine_account_id(provider_url, &key)?;
        if self.accounts.contains_key(&account_id) {
            return Ok(());
        }
        self.save_key(&self.db.collection(&format!("accounts/{}", account_id)), &key)?;
        self.accounts.insert(
            account_id.clone(),
            Account {
                id: account_id,
                private_key: key,
                base_url: provider_url.to_string(),
                authorizations: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Human-readable summary of the active configuration.
    pub fn status(&self) -> String {
        let mut out = String::new();
        out.push_str("Global configuration:\n");
        out.push_str(&format!("  Path: {}\n", self.path.display()));
        out.push_str(&format!(
            "  Default provider: {}\n",
            self.default_target
                .request
                .provider
                .as_deref()
                .unwrap_or(acme::DEFAULT_DIRECTORY_URL)
        ));
        out.push_str(&format!("  Webroot paths: {:?}\n", self.webroot_paths));
        out.push_str(&format!(
            "  Preferred RSA key size: {}\n",
            clamp_rsa_key_size(self.preferred_rsa_key_size)
        ));

        out.push_str("\nAccounts:\n");
        let mut ids: Vec<&String> = self.accounts.keys().collect();
        ids.sort();
        for id in ids {
            out.push_str(&format!("  {}\n", id));
        }

        out.push_str("\nTargets:\n");
        let mut tkeys: Vec<&String> = self.targets.keys().collect();
        tkeys.sort();
        for k in tkeys {
            let t = &self.targets[k];
            let verdict = match self.find_best_certificate_satisfying(t) {
                Some(c) if !self.certificate_needs_renewing(c) => {
                    format!("up to date ({})", c.id())
                }
                Some(c) => format!("needs renewal ({})", c.id()),
                None => "no satisfying certificate".to_string(),
            };
            out.push_str(&format!("  {} : {}\n", t, verdict));
        }
        out
    }
}

// ── Matcher primitives ────────────────────────────────────────────────────────

/// Strict-weak target order: priority, then name count, then the sorted
/// name list for determinism.
pub(crate) fn target_gt(a: &Target, b: &Target) -> bool {
    if a.priority != b.priority {
        return a.priority > b.priority;
    }
    if a.satisfy.names.len() != b.satisfy.names.len() {
        return a.satisfy.names.len() > b.satisfy.names.len();
    }
    let mut an = a.satisfy.names.clone();
    let mut bn = b.satisfy.names.clone();
    an.sort();
    bn.sort();
    an > bn
}

/// Preference order between two certificates: longer chain, then later
/// expiry; parse failures lose, two failures are incomparable.
pub(crate) fn cert_better_than(a: &Certificate, b: &Certificate) -> bool {
    if a.certificates.len() != b.certificates.len() || b.certificates.is_empty() {
        return a.certificates.len() > b.certificates.len();
    }
    match (
        parse_cert_meta(&a.certificates[0]),
        parse_cert_meta(&b.certificates[0]),
    ) {
        (Ok(am), Ok(bm)) => am.not_after > bm.not_after,
        (Ok(_), Err(_)) => true,
        _ => false,
    }
}

/// The instant from which a certificate counts as needing renewal:
/// `notAfter - min(30 days, validity/3)`.
pub(crate) fn renew_time(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> DateTime<Utc> {
    let mut renew_span = (not_after - not_before) / 3;
    if renew_span > Duration::days(30) {
        renew_span = Duration::days(30);
    }
    not_after - renew_span
}

pub(crate) fn clamp_rsa_key_size(bits: u32) -> u32 {
    if bits == 0 {
        return 2048;
    }
    bits.clamp(2048, 4096)
}

pub(crate) struct CertMeta {
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// SAN DNS names and the validity window of a DER certificate.
pub(crate) fn parse_cert_meta(der: &[u8]) -> Result<CertMeta> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
        .map_err(|e| anyhow::anyhow!("parse certificate: {}", e))?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for gn in &san.value.general_names {
            if let GeneralName::DNSName(d) = gn {
                dns_names.push(d.trim_end_matches('.').to_lowercase());
            }
        }
    }

    let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .context("certificate notBefore out of range")?;
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .context("certificate notAfter out of range")?;

    Ok(CertMeta {
        dns_names,
        not_before,
        not_after,
    })
}

// ── IDs and names ─────────────────────────────────────────────────────────────

pub fn determine_account_id(base_url: &str, key: &PKey<Private>) -> Result<String> {
    Ok(format!(
        "{}/{}",
        account_url_part(base_url)?,
        crypto::key_id(key)?
    ))
}

pub fn determine_certificate_id(url: &str) -> String {
    crypto::hash_id(url.as_bytes())
}

/// Reversible filename-safe encoding of a provider URL: the scheme is
/// dropped (always `https`), every byte outside `[A-Za-z0-9._-]` becomes
/// `%xx`.
fn account_url_part(url: &str) -> Result<String> {
    if !valid_url(url) {
        bail!(SchemaError::InvalidProviderUrl(url.to_string()));
    }
    let rest = url.strip_prefix("https://").unwrap_or(url);
    let mut out = String::with_capacity(rest.len());
    for b in rest.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    Ok(out)
}

fn decode_account_url_part(enc: &str) -> Result<String> {
    let bytes = enc.as_bytes();
    let mut out = Vec::with_capacity(enc.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                bail!(SchemaError::MalformedAccountDir(enc.to_string()));
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| SchemaError::MalformedAccountDir(enc.to_string()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let rest =
        String::from_utf8(out).map_err(|_| SchemaError::MalformedAccountDir(enc.to_string()))?;
    Ok(format!("https://{}", rest))
}

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?\.)*[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?$")
        .unwrap()
});

fn valid_hostname(name: &str) -> bool {
    name.len() <= 253 && HOSTNAME_RE.is_match(name)
}

/// Lower-case, strip trailing dots, and validate every name in place.
fn normalize_names(names: &mut [String]) -> Result<()> {
    for n in names.iter_mut() {
        let t = n.trim().to_lowercase();
        let t = t.trim_end_matches('.').to_string();
        if !valid_hostname(&t) {
            bail!(SchemaError::InvalidHostname(t));
        }
        *n = t;
    }
    Ok(())
}

/// Serialize a target, leaving defaulted request names implicit.
fn target_yaml(tgt: &Target) -> Result<Vec<u8>> {
    let mut t = tgt.clone();
    if t.request.implicit_names {
        t.request.names.clear();
    }
    Ok(serde_yaml::to_string(&t)?.into_bytes())
}

/// Targets get random filenames: a first-hostname prefix for the human,
/// base32 randomness against collisions.
fn make_unique_target_name(tgt: &Target) -> String {
    let prefix = tgt
        .satisfy
        .names
        .first()
        .map(|n| format!("{}-", n))
        .unwrap_or_default();
    let rand = base32::encode(
        base32::Alphabet::Rfc4648 { padding: false },
        Uuid::new_v4().as_bytes(),
    )
    .to_ascii_lowercase();
    format!("{}{}", prefix, rand)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::x509::extension::SubjectAlternativeName;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use tempfile::TempDir;

    pub(crate) fn open_store(dir: &Path) -> Store {
        Store::open(dir, Arc::new(LogNotifier)).unwrap()
    }

    /// Self-signed DER certificate with the given SANs and validity window
    /// in days relative to now.
    pub(crate) fn make_cert(
        key: &PKey<Private>,
        names: &[&str],
        not_before_days: i64,
        not_after_days: i64,
    ) -> Vec<u8> {
        let mut b = X509Builder::new().unwrap();
        b.set_version(2).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", names[0]).unwrap();
        let name = name.build();
        b.set_subject_name(&name).unwrap();
        b.set_issuer_name(&name).unwrap();
        b.set_pubkey(key).unwrap();

        let nb = (Utc::now() + Duration::days(not_before_days)).timestamp();
        let na = (Utc::now() + Duration::days(not_after_days)).timestamp();
        b.set_not_before(&Asn1Time::from_unix(nb).unwrap()).unwrap();
        b.set_not_after(&Asn1Time::from_unix(na).unwrap()).unwrap();

        let mut san = SubjectAlternativeName::new();
        for n in names {
            san.dns(n);
        }
        let ext = san.build(&b.x509v3_context(None, None)).unwrap();
        b.append_extension(ext).unwrap();

        b.sign(key, MessageDigest::sha256()).unwrap();
        b.build().to_der().unwrap()
    }

    fn mem_cert(url: &str, chain: Vec<Vec<u8>>, key_id: Option<&str>) -> Certificate {
        Certificate {
            url: url.to_string(),
            certificates: chain,
            cached: true,
            key_id: key_id.map(str::to_string),
        }
    }

    #[test]
    fn test_account_url_part_round_trip() {
        let url = "https://acme-v01.api.letsencrypt.org/directory";
        let enc = account_url_part(url).unwrap();
        assert!(!enc.contains('/'));
        assert_eq!(decode_account_url_part(&enc).unwrap(), url);
    }

    #[test]
    fn test_hostname_validation() {
        let mut ok = vec!["A.Test.".to_string(), "www.example.com".to_string()];
        normalize_names(&mut ok).unwrap();
        assert_eq!(ok, vec!["a.test", "www.example.com"]);

        let mut bad = vec!["not a hostname".to_string()];
        let err = normalize_names(&mut bad).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::InvalidHostname(_))
        ));

        let mut dashes = vec!["-leading.test".to_string()];
        assert!(normalize_names(&mut dashes).is_err());

        // single labels are accepted (internal hostnames)
        let mut single = vec!["localhost".to_string()];
        assert!(normalize_names(&mut single).is_ok());
    }

    #[test]
    fn test_renew_time_arithmetic() {
        let t0 = Utc::now();
        assert_eq!(renew_time(t0, t0 + Duration::days(90)), t0 + Duration::days(60));
        assert_eq!(
            renew_time(t0, t0 + Duration::days(3650)),
            t0 + Duration::days(3650) - Duration::days(30)
        );
    }

    #[test]
    fn test_clamp_rsa_key_size() {
        assert_eq!(clamp_rsa_key_size(0), 2048);
        assert_eq!(clamp_rsa_key_size(512), 2048);
        assert_eq!(clamp_rsa_key_size(3072), 3072);
        assert_eq!(clamp_rsa_key_size(16384), 4096);
    }

    #[test]
    fn test_cert_better_than_prefers_longer_chain_then_expiry() {
        let key = crypto::generate_p256_key().unwrap();
        let ee_60 = make_cert(&key, &["a.test"], -1, 60);
        let ee_90 = make_cert(&key, &["a.test"], -1, 90);
        let inter = make_cert(&key, &["ca.test"], -1, 365);

        let short = mem_cert("https://ca.test/c/1", vec![ee_60.clone()], Some("k"));
        let long = mem_cert(
            "https://ca.test/c/2",
            vec![ee_60.clone(), inter.clone()],
            Some("k"),
        );
        assert!(cert_better_than(&long, &short));
        assert!(!cert_better_than(&short, &long));

        // identical chain length: later NotAfter strictly preferred
        let older = mem_cert("https://ca.test/c/3", vec![ee_60, inter.clone()], Some("k"));
        let newer = mem_cert("https://ca.test/c/4", vec![ee_90, inter], Some("k"));
        assert!(cert_better_than(&newer, &older));
        assert!(!cert_better_than(&older, &newer));

        // an empty certificate always loses
        let empty = mem_cert("https://ca.test/c/5", vec![], Some("k"));
        assert!(cert_better_than(&newer, &empty));
        assert!(!cert_better_than(&empty, &newer));
    }

    #[test]
    fn test_cert_better_than_parse_errors() {
        let key = crypto::generate_p256_key().unwrap();
        let good = mem_cert(
            "https://ca.test/c/1",
            vec![make_cert(&key, &["a.test"], -1, 60)],
            Some("k"),
        );
        let junk = mem_cert("https://ca.test/c/2", vec![vec![0u8; 16]], Some("k"));
        assert!(cert_better_than(&good, &junk));
        assert!(!cert_better_than(&junk, &good));

        let junk2 = mem_cert("https://ca.test/c/3", vec![vec![1u8; 16]], Some("k"));
        assert!(!cert_better_than(&junk, &junk2));
        assert!(!cert_better_than(&junk2, &junk));
    }

    #[test]
    fn test_cert_satisfies_requires_key_and_names() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        let key = crypto::generate_p256_key().unwrap();
        let der = make_cert(&key, &["a.test", "b.test"], -1, 60);

        let mut tgt = Target::default();
        tgt.satisfy.names = vec!["a.test".into(), "b.test".into()];

        let with_key = mem_cert("https://ca.test/c/1", vec![der.clone()], Some("k"));
        assert!(store.cert_satisfies(&with_key, &tgt));

        let without_key = mem_cert("https://ca.test/c/1", vec![der.clone()], None);
        assert!(!store.cert_satisfies(&without_key, &tgt));

        let mut more = Target::default();
        more.satisfy.names = vec!["a.test".into(), "c.test".into()];
        assert!(!store.cert_satisfies(&with_key, &more));
    }

    #[test]
    fn test_target_gt_ordering() {
        let mut hi = Target::default();
        hi.satisfy.names = vec!["a.test".into()];
        hi.priority = 5;
        let mut lo = Target::default();
        lo.satisfy.names = vec!["a.test".into(), "b.test".into()];
        lo.priority = 0;
        assert!(target_gt(&hi, &lo));
        assert!(!target_gt(&lo, &hi));

        let mut wide = Target::default();
        wide.satisfy.names = vec!["a.test".into(), "b.test".into()];
        let mut narrow = Target::default();
        narrow.satisfy.names = vec!["a.test".into()];
        assert!(target_gt(&wide, &narrow));
    }

    #[test]
    fn test_add_target_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(dir.path());
            let mut t = Target::default();
            t.satisfy.names = vec!["A.Test".into(), "www.a.test".into()];
            store.add_target(t).unwrap();

            // covered by the first target: must not create a second file
            let mut dup = Target::default();
            dup.satisfy.names = vec!["a.test".into()];
            store.add_target(dup).unwrap();
        }

        let store = open_store(dir.path());
        assert_eq!(store.targets.len(), 1);
        let tgt = store.targets.values().next().unwrap();
        assert_eq!(tgt.satisfy.names, vec!["a.test", "www.a.test"]);
        // request names defaulted, not serialized
        assert!(tgt.request.implicit_names);
        assert_eq!(tgt.request.names, tgt.satisfy.names);
        assert_eq!(store.hostname_targets.len(), 2);
    }

    #[test]
    fn test_add_target_rejects_invalid_hostname() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(dir.path());
        let mut t = Target::default();
        t.satisfy.names = vec!["bad name!".into()];
        assert!(store.add_target(t).is_err());
    }

    #[test]
    fn test_legacy_target_schema_migrates() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path());
            store
                .db
                .collection("desired")
                .write("old", b"names: [a.test, b.test]\nprovider: https://ca.test/dir\n")
                .unwrap();
        }
        let store = open_store(dir.path());
        let tgt = &store.targets["old"];
        assert_eq!(tgt.satisfy.names, vec!["a.test", "b.test"]);
        assert_eq!(tgt.request.provider.as_deref(), Some("https://ca.test/dir"));
        assert!(tgt.legacy_names.is_empty());
    }

    #[test]
    fn test_disjoin_overlapping_targets() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(dir.path());
            let mut t1 = Target::default();
            t1.satisfy.names = vec!["a.test".into(), "b.test".into()];
            t1.priority = 1;
            store.add_target(t1).unwrap();
            let mut t2 = Target::default();
            t2.satisfy.names = vec!["b.test".into(), "c.test".into()];
            store.add_target(t2).unwrap();
        }

        let store = open_store(dir.path());
        assert_eq!(store.targets.len(), 2);
        for tgt in store.targets.values() {
            if tgt.priority == 1 {
                assert_eq!(tgt.satisfy.reduced_names, vec!["a.test", "b.test"]);
            } else {
                assert_eq!(tgt.satisfy.reduced_names, vec!["c.test"]);
            }
        }
        // every hostname owned by exactly one target
        for name in ["a.test", "b.test", "c.test"] {
            assert!(store.hostname_targets.contains_key(name));
        }
        assert_eq!(store.hostname_targets.len(), 3);
    }

    #[test]
    fn test_remove_target_hostname() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(dir.path());
            let mut t = Target::default();
            t.satisfy.names = vec!["a.test".into(), "b.test".into()];
            store.add_target(t).unwrap();
            let mut solo = Target::default();
            solo.satisfy.names = vec!["only.test".into()];
            store.add_target(solo).unwrap();
        }

        {
            let mut store = open_store(dir.path());
            store.remove_target_hostname("b.test").unwrap();
            store.remove_target_hostname("only.test").unwrap();
        }

        let store = open_store(dir.path());
        assert_eq!(store.targets.len(), 1);
        let tgt = store.targets.values().next().unwrap();
        assert_eq!(tgt.satisfy.names, vec!["a.test"]);
    }

    #[test]
    fn test_conf_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(dir.path());
            store.set_preferred_rsa_key_size(3072).unwrap();
            store
                .set_webroot_paths(vec![
                    "/var/www/.well-known/acme-challenge".into(),
                    "/srv/challenges".into(),
                ])
                .unwrap();
            assert_eq!(store.preferred_rsa_key_size, 3072);
        }

        assert_eq!(
            std::fs::read_to_string(dir.path().join("conf/rsa-key-size")).unwrap(),
            "3072\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("conf/webroot-path")).unwrap(),
            "/var/www/.well-known/acme-challenge\n/srv/challenges\n"
        );

        let store = open_store(dir.path());
        assert_eq!(store.preferred_rsa_key_size, 3072);
        assert_eq!(
            store.webroot_paths(),
            ["/var/www/.well-known/acme-challenge", "/srv/challenges"]
        );
    }

    #[test]
    fn test_import_key_round_trip_and_id_invariant() {
        let dir = TempDir::new().unwrap();
        let key = crypto::generate_p256_key().unwrap();
        let pem = crypto::private_key_to_pem(&key).unwrap();
        let key_id = crypto::key_id(&key).unwrap();

        {
            let mut store = open_store(dir.path());
            store.import_key(&pem).unwrap();
            // importing again is a no-op
            store.import_key(&pem).unwrap();
        }

        assert!(dir.path().join(format!("keys/{}/privkey", key_id)).exists());
        let store = open_store(dir.path());
        assert!(store.keys.contains_key(&key_id));
    }

    #[test]
    fn test_corrupted_key_fails_load() {
        let dir = TempDir::new().unwrap();
        let key = crypto::generate_p256_key().unwrap();
        let pem = crypto::private_key_to_pem(&key).unwrap();
        {
            let mut store = open_store(dir.path());
            store.import_key(&pem).unwrap();
        }

        // moving the key under a wrong ID violates the ID invariant
        let key_id = crypto::key_id(&key).unwrap();
        std::fs::rename(
            dir.path().join(format!("keys/{}", key_id)),
            dir.path().join("keys/aaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
        )
        .unwrap();

        let err = Store::open(dir.path(), Arc::new(LogNotifier)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::KeyIdMismatch { .. })
        ));
    }

    #[test]
    fn test_import_certificate_and_id_invariant() {
        let dir = TempDir::new().unwrap();
        let url = "https://ca.test/acme/cert/12345";
        {
            let mut store = open_store(dir.path());
            store.import_certificate(url).unwrap();
            store.import_certificate(url).unwrap();
            assert!(store.import_certificate("http://insecure.test/c").is_err());
        }

        let cert_id = determine_certificate_id(url);
        let store = open_store(dir.path());
        assert!(store.certs.contains_key(&cert_id));
        assert!(!store.certs[&cert_id].cached);

        // tampering with the stored URL breaks the ID invariant
        store
            .db
            .collection(&format!("certs/{}", cert_id))
            .write("url", b"https://ca.test/acme/cert/OTHER")
            .unwrap();
        let err = Store::open(dir.path(), Arc::new(LogNotifier)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::CertificateIdMismatch { .. })
        ));
    }

    #[test]
    fn test_import_account_key_and_reload() {
        let dir = TempDir::new().unwrap();
        let key = crypto::generate_rsa_key(2048).unwrap();
        let pem = crypto::private_key_to_pem(&key).unwrap();
        let provider = "https://ca.test/directory";
        let account_id = determine_account_id(provider, &key).unwrap();

        {
            let mut store = open_store(dir.path());
            store.import_account_key(provider, &pem).unwrap();
        }

        let store = open_store(dir.path());
        let account = &store.accounts[&account_id];
        assert_eq!(account.base_url, provider);
        assert!(account.authorizations.is_empty());
    }

    #[test]
    fn test_round_trip_load_equality() {
        let dir = TempDir::new().unwrap();
        let account_key = crypto::generate_rsa_key(2048).unwrap();
        let account_pem = crypto::private_key_to_pem(&account_key).unwrap();
        let cert_key = crypto::generate_p256_key().unwrap();
        let cert_pem = crypto::private_key_to_pem(&cert_key).unwrap();

        {
            let mut store = open_store(dir.path());
            store.set_default_provider("https://ca.test/directory").unwrap();
            store
                .import_account_key("https://ca.test/directory", &account_pem)
                .unwrap();
            store.import_key(&cert_pem).unwrap();
            store.import_certificate("https://ca.test/cert/1").unwrap();
            let mut t = Target::default();
            t.satisfy.names = vec!["a.test".into()];
            store.add_target(t).unwrap();
        }

        let snapshot = |s: &Store| {
            let mut accounts: Vec<String> = s.accounts.keys().cloned().collect();
            accounts.sort();
            let mut keys: Vec<String> = s.keys.keys().cloned().collect();
            keys.sort();
            let mut certs: Vec<String> = s.certs.keys().cloned().collect();
            certs.sort();
            let mut targets: Vec<(String, Vec<String>, Vec<String>)> = s
                .targets
                .iter()
                .map(|(k, t)| {
                    (
                        k.clone(),
                        t.satisfy.names.clone(),
                        t.satisfy.reduced_names.clone(),
                    )
                })
                .collect();
            targets.sort();
            let mut hosts: Vec<(String, String)> = s
                .hostname_targets
                .iter()
                .map(|(h, t)| (h.clone(), t.clone()))
                .collect();
            hosts.sort();
            (accounts, keys, certs, targets, hosts)
        };

        let first = snapshot(&open_store(dir.path()));
        let second = snapshot(&open_store(dir.path()));
        assert_eq!(first, second);
        assert!(!first.0.is_empty());
        assert_eq!(first.1.len(), 1);
        assert_eq!(first.2.len(), 1);
    }

    #[test]
    fn test_loaded_fullchain_links_key_and_caches() {
        let dir = TempDir::new().unwrap();
        let key = crypto::generate_p256_key().unwrap();
        let key_pem = crypto::private_key_to_pem(&key).unwrap();
        let key_id = crypto::key_id(&key).unwrap();

        let ee = make_cert(&key, &["a.test"], -1, 90);
        let url = "https://ca.test/cert/abc";
        let cert_id = determine_certificate_id(url);

        {
            let mut store = open_store(dir.path());
            store.import_key(&key_pem).unwrap();
            store.import_certificate(url).unwrap();

            let pem = X509::from_der(&ee).unwrap().to_pem().unwrap();
            let c = store.db.collection(&format!("certs/{}", cert_id));
            c.write("cert", &pem).unwrap();
            c.write("chain", b"").unwrap();
            c.write("fullchain", &pem).unwrap();
        }

        let store = open_store(dir.path());
        let cert = &store.certs[&cert_id];
        assert!(cert.cached);
        assert_eq!(cert.key_id.as_deref(), Some(key_id.as_str()));
        let lnk = store
            .db
            .collection(&format!("certs/{}", cert_id))
            .read_link("privkey")
            .unwrap()
            .unwrap();
        assert_eq!(lnk.target, format!("keys/{}/privkey", key_id));
    }

    #[test]
    fn test_invalid_stored_cert_url_is_schema_error() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path());
            store
                .db
                .collection("certs/aaaaaaaaaaaaaaaaaaaaaaaaaaaa")
                .write("url", b"not-a-url")
                .unwrap();
        }
        let err = Store::open(dir.path(), Arc::new(LogNotifier)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::InvalidCertificateUrl(_))
        ));
    }
}
