// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Content-addressed storage.
//!
//! The concrete backend is a consumed capability; the core addresses content
//! exclusively by resource hash (a SHA2-256 multihash in multibase base64url
//! form) and treats every other spelling as a transport hint. The resolver
//! layered on top follows hashlink hints to remote gateways when the local
//! store misses, verifying that fetched bytes actually hash to the requested
//! address before caching them.

use crate::anchor::Hashlink;
use crate::error::Error;
use backon::{ExponentialBuilder, Retryable};
use data_encoding::BASE64URL_NOPAD;
use multihash_codetable::{Code, MultihashDigest};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Computes the canonical resource hash for `content`.
pub fn resource_hash(content: &[u8]) -> String {
    let digest = Code::Sha2_256.digest(content);
    format!("u{}", BASE64URL_NOPAD.encode(&digest.to_bytes()))
}

/// The HTTP gateway URL a service serves its CAS content at.
pub fn gateway_url(service_iri: &url::Url, hash: &str) -> Result<url::Url, Error> {
    let base = service_iri.as_str().trim_end_matches('/');
    Ok(url::Url::parse(&format!("{base}/cas/{hash}"))?)
}

/// Checks that `hash` is a well-formed multibase multihash of the kind this
/// node mints (sha2-256).
pub fn validate_resource_hash(hash: &str) -> Result<(), Error> {
    let encoded = hash
        .strip_prefix('u')
        .ok_or_else(|| Error::bad_request(format!("unsupported multibase prefix in {hash}")))?;
    let bytes = BASE64URL_NOPAD
        .decode(encoded.as_bytes())
        .map_err(|e| Error::bad_request(format!("resource hash {hash}: {e}")))?;
    // Compare against the shape the code table produces for sha2-256.
    let reference = Code::Sha2_256.digest(&[]).to_bytes();
    if bytes.len() != reference.len() || bytes[..2] != reference[..2] {
        return Err(Error::bad_request(format!(
            "resource hash {hash} is not a supported multihash"
        )));
    }
    Ok(())
}

pub trait ContentStore: Send + Sync {
    /// Stores content and returns its resource hash.
    fn put(&self, content: &[u8]) -> Result<String, Error>;

    /// Reads content by resource hash; `NotFound` on a miss.
    fn get(&self, hash: &str) -> Result<Vec<u8>, Error>;

    fn contains(&self, hash: &str) -> Result<bool, Error> {
        match self.get(hash) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A thread-safe in-memory [`ContentStore`].
#[derive(Default)]
pub struct MemoryCas {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCas {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentStore for MemoryCas {
    fn put(&self, content: &[u8]) -> Result<String, Error> {
        let hash = resource_hash(content);
        self.blobs.write().insert(hash.clone(), content.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>, Error> {
        self.blobs
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no content at {hash}")))
    }

    fn contains(&self, hash: &str) -> Result<bool, Error> {
        Ok(self.blobs.read().contains_key(hash))
    }
}

/// Resolves hashlinks: local store first, then HTTP(S) transport hints with
/// bounded retries. Content fetched from a gateway is verified against the
/// requested hash and written through to the local store.
pub struct CasResolver {
    cas: Arc<dyn ContentStore>,
    client: reqwest::Client,
}

impl CasResolver {
    pub fn new(cas: Arc<dyn ContentStore>, request_timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(CasResolver { cas, client })
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.cas
    }

    pub async fn resolve(&self, hashlink: &Hashlink) -> Result<Vec<u8>, Error> {
        let hash = hashlink.resource_hash();
        match self.cas.get(hash) {
            Ok(content) => return Ok(content),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        for hint in hashlink.hints() {
            if hint.scheme() != "https" && hint.scheme() != "http" {
                debug!("skipping non-HTTP transport hint {hint}");
                continue;
            }
            match self.fetch(hint).await {
                Ok(content) if resource_hash(&content) == hash => {
                    self.cas.put(&content)?;
                    return Ok(content);
                }
                Ok(_) => {
                    warn!("content from {hint} does not hash to {hash}");
                }
                Err(e) => {
                    debug!("transport hint {hint} failed: {e}");
                }
            }
        }

        // The anchor may simply not have propagated yet.
        Err(Error::transient(format!(
            "content {hash} unavailable locally and via {} hint(s)",
            hashlink.hints().len()
        )))
    }

    async fn fetch(&self, url: &url::Url) -> Result<Vec<u8>, Error> {
        let attempt = || async {
            let response = self.client.get(url.clone()).send().await?;
            let response = response.error_for_status().map_err(Error::from)?;
            Ok::<_, Error>(response.bytes().await?.to_vec())
        };
        attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_times(2),
            )
            .when(Error::is_transient)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hash_is_stable_and_validates() {
        let a = resource_hash(b"anchor bytes");
        let b = resource_hash(b"anchor bytes");
        assert_eq!(a, b);
        assert!(a.starts_with('u'));
        validate_resource_hash(&a).unwrap();

        assert!(validate_resource_hash("zNotBase64Url").is_err());
        assert!(validate_resource_hash("uAAAA").is_err());
    }

    #[test]
    fn memory_cas_roundtrip() {
        let cas = MemoryCas::new();
        let hash = cas.put(b"content").unwrap();
        assert_eq!(cas.get(&hash).unwrap(), b"content");
        assert!(cas.contains(&hash).unwrap());
        assert!(cas.get("uMissing").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn resolver_prefers_local_content() {
        let cas: Arc<dyn ContentStore> = Arc::new(MemoryCas::new());
        let hash = cas.put(b"local").unwrap();
        let resolver = CasResolver::new(cas, Duration::from_secs(1)).unwrap();

        let content = resolver.resolve(&Hashlink::new(hash)).await.unwrap();
        assert_eq!(content, b"local");
    }

    #[tokio::test]
    async fn resolver_miss_is_transient() {
        let cas: Arc<dyn ContentStore> = Arc::new(MemoryCas::new());
        let resolver = CasResolver::new(cas, Duration::from_secs(1)).unwrap();

        let missing = Hashlink::new(resource_hash(b"never stored"))
            .with_hints(vec![url::Url::parse("ipfs://uEiAnothttp").unwrap()]);
        let err = resolver.resolve(&missing).await.unwrap_err();
        assert!(err.is_transient());
    }
}
