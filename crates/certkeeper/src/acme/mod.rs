//! ACME client contract.
//!
//! The store and solver only ever talk to [`AcmeClient`]; the bundled HTTP
//! transport lives in [`client`] and tests substitute their own. Every call
//! is made on behalf of one account, identified by [`AccountCreds`].

pub mod client;
pub mod jws;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use url::Url;

/// Directory URL used when no provider is configured anywhere.
pub const DEFAULT_DIRECTORY_URL: &str = "https://acme-v01.api.letsencrypt.org/directory";

/// One account's view of a provider: its directory URL and private key.
pub struct AccountCreds<'a> {
    pub directory_url: &'a str,
    pub key: &'a PKey<Private>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    /// Anything the server said that we do not model; treated as pending.
    Unknown,
}

impl AuthorizationStatus {
    pub fn parse(s: &str) -> AuthorizationStatus {
        match s {
            "pending" | "processing" => AuthorizationStatus::Pending,
            "valid" => AuthorizationStatus::Valid,
            "invalid" | "revoked" | "deactivated" | "expired" => AuthorizationStatus::Invalid,
            _ => AuthorizationStatus::Unknown,
        }
    }
}

/// A challenge offered inside an authorization.
#[derive(Debug, Clone)]
pub struct RemoteChallenge {
    /// Challenge type string, e.g. `http-01`.
    pub ctype: String,
    pub url: String,
    pub token: String,
}

/// An authorization as the server currently sees it.
#[derive(Debug, Clone)]
pub struct RemoteAuthorization {
    pub url: String,
    pub hostname: String,
    pub status: AuthorizationStatus,
    pub expires: Option<DateTime<Utc>>,
    pub challenges: Vec<RemoteChallenge>,
}

/// Result of submitting a CSR.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub url: String,
    /// End-entity certificate, DER. May be empty when the server issues
    /// asynchronously; fetch via [`AcmeClient::wait_for_certificate`].
    pub certificate: Vec<u8>,
    pub extra_certificates: Vec<Vec<u8>>,
}

/// The protocol operations the reconciler needs from a provider.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Idempotently ensure the account is registered, agreeing to the
    /// current terms. "Already registered" is success.
    async fn upsert_registration(&self, creds: &AccountCreds<'_>) -> Result<()>;

    /// Create a new authorization for `hostname`.
    async fn new_authorization(
        &self,
        creds: &AccountCreds<'_>,
        hostname: &str,
    ) -> Result<RemoteAuthorization>;

    /// Submit a challenge response. `validation` is the responder-provided
    /// response object; `signing_key` overrides the account key when the
    /// challenge demands a different signer.
    async fn respond_to_challenge(
        &self,
        creds: &AccountCreds<'_>,
        challenge: &RemoteChallenge,
        validation: serde_json::Value,
        signing_key: Option<&PKey<Private>>,
    ) -> Result<()>;

    /// Refresh an authorization from its URL (used for polling).
    async fn load_authorization(
        &self,
        creds: &AccountCreds<'_>,
        url: &str,
    ) -> Result<RemoteAuthorization>;

    /// Submit a CSR and return where the certificate lives.
    async fn request_certificate(
        &self,
        creds: &AccountCreds<'_>,
        csr_der: &[u8],
    ) -> Result<IssuedCertificate>;

    /// Download the certificate chain (end-entity first) from `url`,
    /// waiting out any pending issuance.
    async fn wait_for_certificate(&self, url: &str) -> Result<Vec<Vec<u8>>>;
}

/// A provider or certificate URL is only acceptable as an absolute HTTPS
/// URL with a host.
pub fn valid_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(u) => u.scheme() == "https" && u.has_host(),
        Err(_) => false,
    }
}
