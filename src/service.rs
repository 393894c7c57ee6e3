// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Service (actor) descriptors and their resolution.
//!
//! Every federation peer is described by an actor document served at its IRI.
//! The resolver keeps a bounded, TTL-stamped LRU of descriptors in front of
//! the activity store and the network, and falls back to a host-meta lookup
//! when a peer does not serve its descriptor directly at the IRI.

use crate::activity::one_or_many;
use crate::error::Error;
use crate::store::ActivityStore;
use hashlink::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Media type used for all federation exchanges.
pub const FEDERATION_CONTENT_TYPE: &str = "application/activity+json";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum ServiceKind {
    Service,
}

/// Public-key descriptor advertised by an actor document. The key material is
/// opaque to the core; the HTTP signature capability interprets it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: Url,
    pub owner: Url,
    pub public_key_pem: String,
}

/// An actor document: the service IRI plus its exchange endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    #[serde(
        rename = "@context",
        with = "one_or_many",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    context: Vec<String>,
    id: Url,
    #[serde(rename = "type")]
    kind: ServiceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<PublicKey>,
    inbox: Url,
    outbox: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    followers: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    following: Option<Url>,
}

impl ServiceDescriptor {
    /// Builds a descriptor with the conventional endpoint layout under the
    /// service IRI.
    pub fn new(iri: Url) -> Result<Self, Error> {
        let join = |suffix: &str| -> Result<Url, Error> {
            let mut base = iri.clone();
            if !base.path().ends_with('/') {
                base.set_path(&format!("{}/", base.path()));
            }
            Ok(base.join(suffix)?)
        };
        Ok(ServiceDescriptor {
            context: vec![crate::activity::CONTEXT_ACTIVITY_STREAMS.to_string()],
            inbox: join("inbox")?,
            outbox: join("outbox")?,
            followers: Some(join("followers")?),
            following: Some(join("following")?),
            id: iri,
            kind: ServiceKind::Service,
            public_key: None,
        })
    }

    pub fn with_public_key(mut self, key: PublicKey) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn with_inbox(mut self, inbox: Url) -> Self {
        self.inbox = inbox;
        self
    }

    pub fn id(&self) -> &Url {
        &self.id
    }

    pub fn inbox(&self) -> &Url {
        &self.inbox
    }

    pub fn outbox(&self) -> &Url {
        &self.outbox
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn followers(&self) -> Option<&Url> {
        self.followers.as_ref()
    }

    pub fn following(&self) -> Option<&Url> {
        self.following.as_ref()
    }
}

/// JRD-like host-meta document, the discovery fallback for actors that do not
/// serve their descriptor at the IRI itself.
#[derive(Debug, Deserialize)]
struct HostMeta {
    #[serde(default)]
    links: Vec<HostMetaLink>,
}

#[derive(Debug, Deserialize)]
struct HostMetaLink {
    rel: String,
    #[serde(rename = "type", default)]
    media_type: Option<String>,
    #[serde(default)]
    href: Option<Url>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResolverConfig {
    /// Bound on the number of cached descriptors.
    pub cache_size: usize,
    /// How long a cached descriptor stays fresh.
    pub cache_ttl: Duration,
    /// Per-request deadline for descriptor fetches.
    pub request_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            cache_size: 100,
            cache_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct CacheEntry {
    descriptor: ServiceDescriptor,
    fetched_at: Instant,
}

/// Resolves actor IRIs to descriptors: LRU cache, then network (direct, then
/// host-meta), then the activity store as a last resort when the peer is
/// unreachable. Successful fetches are written through to the store.
pub struct ServiceResolver {
    config: ResolverConfig,
    client: reqwest::Client,
    cache: Mutex<LruCache<Url, CacheEntry>>,
    store: Arc<dyn ActivityStore>,
}

impl ServiceResolver {
    pub fn new(config: ResolverConfig, store: Arc<dyn ActivityStore>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(ServiceResolver {
            cache: Mutex::new(LruCache::new(config.cache_size)),
            config,
            client,
            store,
        })
    }

    pub async fn resolve(&self, iri: &Url) -> Result<ServiceDescriptor, Error> {
        if let Some(descriptor) = self.cached(iri) {
            return Ok(descriptor);
        }

        let fetched = match self.fetch(iri.clone()).await {
            Ok(descriptor) => Ok(descriptor),
            Err(e) if e.is_not_found() => self.host_meta_lookup(iri).await,
            Err(e) => Err(e),
        };

        match fetched {
            Ok(descriptor) => {
                self.update(descriptor.clone());
                Ok(descriptor)
            }
            // An unreachable peer may still be known from earlier exchanges.
            Err(e) => self.store.get_actor(iri).map_err(|_| e),
        }
    }

    /// The inbox endpoint of the actor, resolving the descriptor if needed.
    pub async fn resolve_inbox(&self, iri: &Url) -> Result<Url, Error> {
        Ok(self.resolve(iri).await?.inbox().clone())
    }

    /// Replaces the cached descriptor. Called with every updated actor
    /// document the node receives.
    pub fn update(&self, descriptor: ServiceDescriptor) {
        if let Err(e) = self.store.put_actor(&descriptor) {
            tracing::warn!(actor = %descriptor.id(), "failed to persist actor descriptor: {e}");
        }
        self.cache.lock().insert(
            descriptor.id().clone(),
            CacheEntry {
                descriptor,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, iri: &Url) {
        self.cache.lock().remove(iri);
    }

    fn cached(&self, iri: &Url) -> Option<ServiceDescriptor> {
        let mut cache = self.cache.lock();
        let fresh = match cache.get(iri) {
            Some(entry) if entry.fetched_at.elapsed() < self.config.cache_ttl => {
                return Some(entry.descriptor.clone());
            }
            Some(_) => false,
            None => return None,
        };
        if !fresh {
            cache.remove(iri);
        }
        None
    }

    async fn fetch(&self, url: Url) -> Result<ServiceDescriptor, Error> {
        let response = self
            .client
            .get(url.clone())
            .header(http::header::ACCEPT.as_str(), FEDERATION_CONTENT_TYPE)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("no actor document at {url}")));
        }
        if status.is_client_error() {
            return Err(Error::bad_request(format!(
                "actor fetch from {url} failed with {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::transient(format!(
                "actor fetch from {url} failed with {status}"
            )));
        }
        Ok(response.json::<ServiceDescriptor>().await?)
    }

    async fn host_meta_lookup(&self, iri: &Url) -> Result<ServiceDescriptor, Error> {
        let mut host_meta_url = iri.clone();
        host_meta_url.set_path("/.well-known/host-meta.json");
        host_meta_url.set_query(None);

        let response = self
            .client
            .get(host_meta_url.clone())
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::not_found(format!("host-meta lookup for {iri}: {e}")))?;
        let host_meta: HostMeta = response.json().await?;

        let href = host_meta
            .links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link.media_type.as_deref() == Some(FEDERATION_CONTENT_TYPE)
            })
            .and_then(|link| link.href.clone())
            .ok_or_else(|| Error::not_found(format!("no self link in host-meta for {iri}")))?;

        self.fetch(href).await
    }
}
