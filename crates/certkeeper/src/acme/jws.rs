//! JWS signing for the ACME transport.
//!
//! Every signed request is a flattened JWS JSON object whose protected
//! header carries the account JWK and the replay nonce. RSA keys sign
//! RS256, P-256 keys sign ES256 (raw `r || s`, 32 bytes each).

use anyhow::{bail, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey, Private};
use openssl::sha::sha256;
use openssl::sign::Signer;
use serde_json::{json, Value};

use crate::crypto;

pub fn sign(key: &PKey<Private>, nonce: &str, payload: &Value) -> Result<Value> {
    let alg = match key.id() {
        Id::RSA => "RS256",
        Id::EC => "ES256",
        other => bail!("unsupported signing key type: {:?}", other),
    };

    let protected = json!({
        "alg": alg,
        "jwk": crypto::jwk(key)?,
        "nonce": nonce,
    });
    let protected64 = URL_SAFE_NO_PAD.encode(serde_json::to_string(&protected)?);
    let payload64 = URL_SAFE_NO_PAD.encode(serde_json::to_string(payload)?);
    let signing_input = format!("{}.{}", protected64, payload64);

    let signature = match key.id() {
        Id::RSA => {
            let mut signer = Signer::new(MessageDigest::sha256(), key)?;
            signer.update(signing_input.as_bytes())?;
            signer.sign_to_vec()?
        }
        Id::EC => {
            let digest = sha256(signing_input.as_bytes());
            let ec_key = key.ec_key()?;
            let sig = EcdsaSig::sign(&digest, &ec_key)?;
            let mut raw = sig.r().to_vec_padded(32)?;
            raw.extend(sig.s().to_vec_padded(32)?);
            raw
        }
        _ => unreachable!("alg match rejects other key types"),
    };

    Ok(json!({
        "protected": protected64,
        "payload": payload64,
        "signature": URL_SAFE_NO_PAD.encode(signature),
    }))
}
