//! HTTP transport implementing the [`AcmeClient`](super::AcmeClient)
//! contract against a provider's directory.
//!
//! The directory is fetched once per provider and cached; replay nonces
//! are pooled per provider and refreshed from every response. A request
//! rejected for a stale nonce is retried once with a fresh one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::jws;
use super::{
    valid_url, AccountCreds, AcmeClient, AuthorizationStatus, IssuedCertificate,
    RemoteAuthorization, RemoteChallenge,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);
const MAX_CERT_POLLS: u32 = 30;
const MAX_CHAIN_DEPTH: usize = 5;

#[derive(Clone, Default)]
struct Directory {
    new_reg: Option<String>,
    new_authz: Option<String>,
    new_cert: Option<String>,
}

fn parse_directory(v: &Value) -> Directory {
    let get = |k: &str| v[k].as_str().map(str::to_string);
    Directory {
        new_reg: get("new-reg"),
        new_authz: get("new-authz"),
        new_cert: get("new-cert"),
    }
}

/// A fully-read response: status, headers and body.
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    fn location(&self) -> Option<String> {
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body).context("parse response JSON")
    }

    /// Human-readable failure description from an RFC 7807 problem body.
    fn problem(&self) -> String {
        match self.json() {
            Ok(v) => {
                let detail = v["detail"].as_str().unwrap_or("");
                let ptype = v["type"].as_str().unwrap_or("");
                if detail.is_empty() && ptype.is_empty() {
                    format!("HTTP {}", self.status)
                } else {
                    format!("HTTP {}: {} ({})", self.status, detail, ptype)
                }
            }
            Err(_) => format!("HTTP {}", self.status),
        }
    }

    fn problem_type(&self) -> String {
        self.json()
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string))
            .unwrap_or_default()
    }
}

async fn read_reply(resp: reqwest::Response) -> Result<Reply> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.bytes().await.context("read response body")?.to_vec();
    Ok(Reply {
        status,
        headers,
        body,
    })
}

fn nonce_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Replay-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Extract the target of a `Link` header with the given relation.
fn link_header(headers: &HeaderMap, rel: &str) -> Option<String> {
    let want = format!("rel=\"{}\"", rel);
    for value in headers.get_all(header::LINK) {
        let Ok(value) = value.to_str() else { continue };
        for part in value.split(',') {
            if !part.contains(&want) {
                continue;
            }
            let start = part.find('<')?;
            let end = part.find('>')?;
            if start < end {
                return Some(part[start + 1..end].to_string());
            }
        }
    }
    None
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Resolve a possibly-relative link against the URL it came from.
fn resolve_link(base: &str, link: &str) -> Result<String> {
    Ok(Url::parse(base)
        .with_context(|| format!("bad base URL {:?}", base))?
        .join(link)
        .with_context(|| format!("bad link {:?}", link))?
        .to_string())
}

pub struct HttpAcmeClient {
    http: reqwest::Client,
    directories: Mutex<HashMap<String, Directory>>,
    nonces: Mutex<HashMap<String, Vec<String>>>,
}

impl HttpAcmeClient {
    pub fn new() -> Result<HttpAcmeClient> {
        Ok(HttpAcmeClient {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent(concat!("certkeeper/", env!("CARGO_PKG_VERSION")))
                .build()?,
            directories: Mutex::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
        })
    }

    async fn directory(&self, url: &str) -> Result<Directory> {
        if let Some(d) = self.directories.lock().unwrap().get(url) {
            return Ok(d.clone());
        }
        if !valid_url(url) {
            bail!("provider URL is not a valid HTTPS URL: {:?}", url);
        }

        debug!(url, "fetching directory");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        let reply = read_reply(resp).await?;
        self.store_nonce(url, &reply.headers);
        if !reply.status.is_success() {
            bail!("fetch directory: {}", reply.problem());
        }

        let dir = parse_directory(&reply.json()?);
        self.directories
            .lock()
            .unwrap()
            .insert(url.to_string(), dir.clone());
        Ok(dir)
    }

    fn store_nonce(&self, dir_url: &str, headers: &HeaderMap) {
        if let Some(n) = nonce_of(headers) {
            self.nonces
                .lock()
                .unwrap()
                .entry(dir_url.to_string())
                .or_default()
                .push(n);
        }
    }

    async fn take_nonce(&self, dir_url: &str) -> Result<String> {
        if let Some(n) = self
            .nonces
            .lock()
            .unwrap()
            .get_mut(dir_url)
            .and_then(Vec::pop)
        {
            return Ok(n);
        }
        let resp = self
            .http
            .head(dir_url)
            .send()
            .await
            .with_context(|| format!("HEAD {}", dir_url))?;
        nonce_of(resp.headers()).context("server supplied no replay nonce")
    }

    async fn post_signed(
        &self,
        creds: &AccountCreds<'_>,
        url: &str,
        payload: &Value,
        signing_key: Option<&PKey<Private>>,
    ) -> Result<Reply> {
        for attempt in 0..2 {
            let nonce = self.take_nonce(creds.directory_url).await?;
            let key = signing_key.unwrap_or(creds.key);
            let body = jws::sign(key, &nonce, payload)?;

            let resp = self
                .http
                .post(url)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("POST {}", url))?;
            let reply = read_reply(resp).await?;
            self.store_nonce(creds.directory_url, &reply.headers);

            if attempt == 0
                && reply.status == StatusCode::BAD_REQUEST
                && reply.problem_type().ends_with("badNonce")
            {
                debug!(url, "stale nonce, retrying");
                continue;
            }
            return Ok(reply);
        }
        bail!("nonce retries exhausted for {}", url)
    }
}

fn parse_authorization(url: &str, fallback_host: &str, v: &Value) -> RemoteAuthorization {
    let hostname = v["identifier"]["value"]
        .as_str()
        .unwrap_or(fallback_host)
        .to_string();
    let status = AuthorizationStatus::parse(v["status"].as_str().unwrap_or("pending"));
    let expires = v["expires"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let challenges = v["challenges"]
        .as_array()
        .map(|cs| {
            cs.iter()
                .filter_map(|c| {
                    let ctype = c["type"].as_str()?.to_string();
                    let curl = c["uri"].as_str().or_else(|| c["url"].as_str())?.to_string();
                    Some(RemoteChallenge {
                        ctype,
                        url: curl,
                        token: c["token"].as_str().unwrap_or("").to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    RemoteAuthorization {
        url: url.to_string(),
        hostname,
        status,
        expires,
        challenges,
    }
}

#[async_trait]
impl AcmeClient for HttpAcmeClient {
    async fn upsert_registration(&self, creds: &AccountCreds<'_>) -> Result<()> {
        let dir = self.directory(creds.directory_url).await?;
        let new_reg = dir
            .new_reg
            .context("directory offers no registration endpoint")?;

        let reply = self
            .post_signed(creds, &new_reg, &json!({"resource": "new-reg"}), None)
            .await?;

        let reg_url = match reply.status.as_u16() {
            // created, or provider says the key is already registered
            201 | 409 => reply.location(),
            _ if reply.status.is_success() => reply.location(),
            _ => bail!("registration failed: {}", reply.problem()),
        };
        let Some(reg_url) = reg_url else {
            return Ok(());
        };

        // fetch the registration and agree to the current terms
        let reply = self
            .post_signed(creds, &reg_url, &json!({"resource": "reg"}), None)
            .await?;
        if let Some(tos) = link_header(&reply.headers, "terms-of-service") {
            let tos = resolve_link(&reg_url, &tos)?;
            let reply = self
                .post_signed(
                    creds,
                    &reg_url,
                    &json!({"resource": "reg", "agreement": tos}),
                    None,
                )
                .await?;
            if !reply.status.is_success() {
                bail!("agreeing to terms failed: {}", reply.problem());
            }
        }
        Ok(())
    }

    async fn new_authorization(
        &self,
        creds: &AccountCreds<'_>,
        hostname: &str,
    ) -> Result<RemoteAuthorization> {
        let dir = self.directory(creds.directory_url).await?;
        let new_authz = dir
            .new_authz
            .context("directory offers no authorization endpoint")?;

        let payload = json!({
            "resource": "new-authz",
            "identifier": {"type": "dns", "value": hostname},
        });
        let reply = self.post_signed(creds, &new_authz, &payload, None).await?;
        if !reply.status.is_success() {
            bail!("new-authz failed: {}", reply.problem());
        }
        let url = reply
            .location()
            .context("authorization carries no Location")?;
        Ok(parse_authorization(&url, hostname, &reply.json()?))
    }

    async fn respond_to_challenge(
        &self,
        creds: &AccountCreds<'_>,
        challenge: &RemoteChallenge,
        validation: Value,
        signing_key: Option<&PKey<Private>>,
    ) -> Result<()> {
        let reply = self
            .post_signed(creds, &challenge.url, &validation, signing_key)
            .await?;
        if !reply.status.is_success() {
            bail!("challenge response rejected: {}", reply.problem());
        }
        Ok(())
    }

    async fn load_authorization(
        &self,
        _creds: &AccountCreds<'_>,
        url: &str,
    ) -> Result<RemoteAuthorization> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        let reply = read_reply(resp).await?;
        if !reply.status.is_success() {
            bail!("fetch authorization: {}", reply.problem());
        }
        Ok(parse_authorization(url, "", &reply.json()?))
    }

    async fn request_certificate(
        &self,
        creds: &AccountCreds<'_>,
        csr_der: &[u8],
    ) -> Result<IssuedCertificate> {
        let dir = self.directory(creds.directory_url).await?;
        let new_cert = dir
            .new_cert
            .context("directory offers no certificate endpoint")?;

        let payload = json!({
            "resource": "new-cert",
            "csr": URL_SAFE_NO_PAD.encode(csr_der),
        });
        let reply = self.post_signed(creds, &new_cert, &payload, None).await?;
        if !reply.status.is_success() {
            bail!("certificate request failed: {}", reply.problem());
        }
        let url = reply.location().context("certificate carries no Location")?;
        Ok(IssuedCertificate {
            url,
            certificate: reply.body,
            extra_certificates: Vec::new(),
        })
    }

    async fn wait_for_certificate(&self, url: &str) -> Result<Vec<Vec<u8>>> {
        for _ in 0..MAX_CERT_POLLS {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .with_context(|| format!("GET {}", url))?;
            let reply = read_reply(resp).await?;

            match reply.status.as_u16() {
                // issuance still pending
                202 => {
                    let wait = retry_after(&reply.headers)
                        .unwrap_or(DEFAULT_RETRY_AFTER)
                        .min(MAX_RETRY_AFTER);
                    debug!(url, ?wait, "certificate not ready yet");
                    tokio::time::sleep(wait).await;
                }
                200 => {
                    if reply.body.is_empty() {
                        bail!("certificate body is empty");
                    }
                    let mut chain = vec![reply.body.clone()];

                    // intermediates hang off rel="up" links
                    let mut base = url.to_string();
                    let mut next = link_header(&reply.headers, "up");
                    while let Some(link) = next {
                        if chain.len() > MAX_CHAIN_DEPTH {
                            bail!("certificate chain too deep");
                        }
                        let up_url = resolve_link(&base, &link)?;
                        let resp = self
                            .http
                            .get(&up_url)
                            .send()
                            .await
                            .with_context(|| format!("GET {}", up_url))?;
                        let reply = read_reply(resp).await?;
                        if !reply.status.is_success() {
                            bail!("fetch chain certificate: {}", reply.problem());
                        }
                        chain.push(reply.body.clone());
                        next = link_header(&reply.headers, "up");
                        base = up_url;
                    }
                    return Ok(chain);
                }
                _ => bail!("fetch certificate: {}", reply.problem()),
            }
        }
        bail!("certificate was not issued in time")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_directory_keys() {
        let v = json!({
            "new-reg": "https://ca.test/acme/new-reg",
            "new-authz": "https://ca.test/acme/new-authz",
            "new-cert": "https://ca.test/acme/new-cert",
            "revoke-cert": "https://ca.test/acme/revoke-cert",
        });
        let d = parse_directory(&v);
        assert_eq!(d.new_reg.as_deref(), Some("https://ca.test/acme/new-reg"));
        assert_eq!(d.new_authz.as_deref(), Some("https://ca.test/acme/new-authz"));
        assert_eq!(d.new_cert.as_deref(), Some("https://ca.test/acme/new-cert"));
    }

    #[test]
    fn test_link_header_extraction() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::LINK,
            HeaderValue::from_static(
                "<https://ca.test/terms>;rel=\"terms-of-service\", </acme/issuer>;rel=\"up\"",
            ),
        );
        assert_eq!(
            link_header(&headers, "terms-of-service").as_deref(),
            Some("https://ca.test/terms")
        );
        assert_eq!(link_header(&headers, "up").as_deref(), Some("/acme/issuer"));
        assert_eq!(link_header(&headers, "index"), None);
    }

    #[test]
    fn test_resolve_relative_link() {
        let abs = resolve_link("https://ca.test/acme/cert/1", "/acme/issuer").unwrap();
        assert_eq!(abs, "https://ca.test/acme/issuer");
        let already = resolve_link("https://ca.test/acme/cert/1", "https://x.test/i").unwrap();
        assert_eq!(already, "https://x.test/i");
    }

    #[test]
    fn test_parse_authorization_fields() {
        let v = json!({
            "identifier": {"type": "dns", "value": "a.test"},
            "status": "pending",
            "expires": "2026-09-01T00:00:00Z",
            "challenges": [
                {"type": "http-01", "uri": "https://ca.test/chal/1", "token": "tok1"},
                {"type": "dns-01", "url": "https://ca.test/chal/2", "token": "tok2"},
                {"type": "broken"},
            ],
        });
        let az = parse_authorization("https://ca.test/authz/1", "x", &v);
        assert_eq!(az.hostname, "a.test");
        assert_eq!(az.status, AuthorizationStatus::Pending);
        assert!(az.expires.is_some());
        assert_eq!(az.challenges.len(), 2);
        assert_eq!(az.challenges[0].ctype, "http-01");
        assert_eq!(az.challenges[0].token, "tok1");
        assert_eq!(az.challenges[1].url, "https://ca.test/chal/2");
    }

    #[test]
    fn test_retry_after_parse() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}
