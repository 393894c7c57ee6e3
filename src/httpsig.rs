// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! HTTP signature capability.
//!
//! The actual signature scheme is consumed from outside the core: the outbox
//! signs every POST to a remote inbox through [`RequestSigner`], and the
//! inbox recovers the signing actor from the request through
//! [`SignatureVerifier`]. The static-key implementations below are
//! development-grade (a keyed digest, no public-key cryptography) and exist
//! so the federation plane can be exercised end to end without an external
//! signature library.

use crate::cas::resource_hash;
use crate::error::Error;
use async_trait::async_trait;
use http::{HeaderMap, Method, Uri};
use parking_lot::RwLock;
use std::collections::HashMap;
use url::Url;

pub const SIGNATURE_HEADER: &str = "signature";

/// Signs outbound requests on behalf of the local service.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &mut reqwest::Request, body: &[u8]) -> Result<(), Error>;
}

/// Verifies inbound requests and recovers the actor whose key signed.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(
        &self,
        headers: &HeaderMap,
        method: &Method,
        uri: &Uri,
        body: &[u8],
    ) -> Result<Url, Error>;
}

fn keyed_digest(secret: &str, method: &Method, uri: &Uri, body: &[u8]) -> String {
    let mut material = Vec::with_capacity(secret.len() + body.len() + 16);
    material.extend_from_slice(secret.as_bytes());
    material.extend_from_slice(method.as_str().as_bytes());
    material.extend_from_slice(uri.path().as_bytes());
    material.extend_from_slice(body);
    resource_hash(&material)
}

/// Development-grade signer bound to one actor identity.
pub struct StaticKeySigner {
    key_id: Url,
    secret: String,
}

impl StaticKeySigner {
    pub fn new(key_id: Url, secret: impl Into<String>) -> Self {
        StaticKeySigner {
            key_id,
            secret: secret.into(),
        }
    }
}

impl RequestSigner for StaticKeySigner {
    fn sign(&self, request: &mut reqwest::Request, body: &[u8]) -> Result<(), Error> {
        let uri: Uri = request
            .url()
            .as_str()
            .parse()
            .map_err(|_| Error::bad_request("unsignable request URL"))?;
        let digest = keyed_digest(&self.secret, request.method(), &uri, body);
        let value = format!(r#"keyId="{}",digest="{digest}""#, self.key_id);
        request.headers_mut().insert(
            SIGNATURE_HEADER,
            value
                .parse()
                .map_err(|_| Error::bad_request("unencodable signature header"))?,
        );
        Ok(())
    }
}

/// Development-grade verifier holding the shared secrets of known actors.
#[derive(Default)]
pub struct StaticKeyVerifier {
    secrets: RwLock<HashMap<Url, String>>,
}

impl StaticKeyVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, actor: Url, secret: impl Into<String>) {
        self.secrets.write().insert(actor, secret.into());
    }
}

#[async_trait]
impl SignatureVerifier for StaticKeyVerifier {
    async fn verify(
        &self,
        headers: &HeaderMap,
        method: &Method,
        uri: &Uri,
        body: &[u8],
    ) -> Result<Url, Error> {
        let header = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| Error::unauthorized("missing signature header"))?
            .to_str()
            .map_err(|_| Error::unauthorized("unreadable signature header"))?;

        let mut key_id = None;
        let mut digest = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("keyId", value)) => key_id = Some(value.trim_matches('"').to_string()),
                Some(("digest", value)) => digest = Some(value.trim_matches('"').to_string()),
                _ => {}
            }
        }
        let key_id = key_id.ok_or_else(|| Error::unauthorized("signature missing keyId"))?;
        let digest = digest.ok_or_else(|| Error::unauthorized("signature missing digest"))?;

        let actor =
            Url::parse(&key_id).map_err(|_| Error::unauthorized("signature keyId is not a URL"))?;
        let secret = self
            .secrets
            .read()
            .get(&actor)
            .cloned()
            .ok_or_else(|| Error::unauthorized(format!("unknown signing actor {actor}")))?;

        if keyed_digest(&secret, method, uri, body) != digest {
            return Err(Error::unauthorized(format!("bad signature from {actor}")));
        }
        Ok(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> Url {
        Url::parse("https://alpha.example/services/anchor").unwrap()
    }

    fn signed_request(secret: &str, body: &[u8]) -> (HeaderMap, Method, Uri) {
        let signer = StaticKeySigner::new(actor(), secret);
        let client = reqwest::Client::new();
        let mut request = client
            .post("https://beta.example/services/anchor/inbox")
            .body(body.to_vec())
            .build()
            .unwrap();
        signer.sign(&mut request, body).unwrap();

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers() {
            headers.insert(name.clone(), value.clone());
        }
        let uri: Uri = request.url().as_str().parse().unwrap();
        (headers, Method::POST, uri)
    }

    #[tokio::test]
    async fn sign_verify_roundtrip_recovers_the_actor() {
        let verifier = StaticKeyVerifier::new();
        verifier.add_key(actor(), "s3cret");

        let (headers, method, uri) = signed_request("s3cret", b"{}");
        let recovered = verifier.verify(&headers, &method, &uri, b"{}").await.unwrap();
        assert_eq!(recovered, actor());
    }

    #[tokio::test]
    async fn tampered_body_fails() {
        let verifier = StaticKeyVerifier::new();
        verifier.add_key(actor(), "s3cret");

        let (headers, method, uri) = signed_request("s3cret", b"{}");
        let err = verifier
            .verify(&headers, &method, &uri, b"{\"tampered\":true}")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn unknown_actor_fails() {
        let verifier = StaticKeyVerifier::new();
        let (headers, method, uri) = signed_request("s3cret", b"{}");
        assert!(
            verifier
                .verify(&headers, &method, &uri, b"{}")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn missing_header_fails() {
        let verifier = StaticKeyVerifier::new();
        let headers = HeaderMap::new();
        let uri: Uri = "https://beta.example/inbox".parse().unwrap();
        assert!(
            verifier
                .verify(&headers, &Method::POST, &uri, b"{}")
                .await
                .is_err()
        );
    }
}
