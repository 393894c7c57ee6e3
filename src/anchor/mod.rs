// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Anchors: content-addressed, witness-signed batches of DID operations.
//!
//! The canonical payload is the anchor linkset; parsing goes through a
//! per-(namespace, version) registry so new payload versions can coexist with
//! deployed ones.

mod hashlink;

pub use self::hashlink::Hashlink;

use crate::error::Error;
use crate::vc::Credential;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Default namespace and payload version minted by this node.
pub const NAMESPACE: &str = "did:anchorage";
pub const VERSION: u64 = 1;

/// The anchor linkset: one batch of DID operations, the index file that
/// carries them, per-suffix chain links and the embedded credential.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorLinkset {
    /// Minted when the anchor is offered or announced; never part of the
    /// hashed bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Url>,

    namespace: String,

    version: u64,

    /// CAS URI of the Sidetree core index file.
    core_index: Url,

    operation_count: u64,

    /// DID suffix → previous anchor hashlink. `None` marks a suffix created
    /// in this anchor.
    previous: IndexMap<String, Option<Hashlink>>,

    credential: Credential,
}

impl AnchorLinkset {
    pub fn new(
        core_index: Url,
        operation_count: u64,
        previous: IndexMap<String, Option<Hashlink>>,
        credential: Credential,
    ) -> Self {
        AnchorLinkset {
            id: None,
            namespace: NAMESPACE.to_string(),
            version: VERSION,
            core_index,
            operation_count,
            previous,
            credential,
        }
    }

    pub fn with_id(mut self, id: Url) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<&Url> {
        self.id.as_ref()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn core_index(&self) -> &Url {
        &self.core_index
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count
    }

    pub fn previous(&self) -> &IndexMap<String, Option<Hashlink>> {
        &self.previous
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn credential_mut(&mut self) -> &mut Credential {
        &mut self.credential
    }

    /// The anchor string handed to the operation processor.
    pub fn anchor_string(&self) -> String {
        format!("{}.{}", self.operation_count, self.core_index)
    }

    /// The bytes that are hashed and stored in the CAS: the linkset without
    /// its minted id.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut stripped = self.clone();
        stripped.id = None;
        Ok(serde_json::to_vec(&stripped)?)
    }
}

/// Version-specific payload parser.
pub trait AnchorParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<AnchorLinkset, Error>;
}

/// Parser for version 1 linkset payloads.
pub struct LinksetV1Parser;

impl AnchorParser for LinksetV1Parser {
    fn parse(&self, bytes: &[u8]) -> Result<AnchorLinkset, Error> {
        let linkset: AnchorLinkset = serde_json::from_slice(bytes)?;
        if linkset.operation_count() == 0 {
            return Err(Error::bad_request("anchor carries no operations"));
        }
        if linkset.previous().is_empty() {
            return Err(Error::bad_request("anchor references no DID suffixes"));
        }
        Ok(linkset)
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    namespace: String,
    version: u64,
}

/// Registry of payload parsers keyed by (namespace, version), with a
/// `NotSupported` fallback for everything unregistered.
pub struct AnchorParserRegistry {
    parsers: HashMap<(String, u64), Arc<dyn AnchorParser>>,
}

impl AnchorParserRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        AnchorParserRegistry {
            parsers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        version: u64,
        parser: Arc<dyn AnchorParser>,
    ) {
        self.parsers.insert((namespace.into(), version), parser);
    }

    /// Probes the payload for its namespace/version and returns the matching
    /// parser.
    pub fn parser_for(&self, bytes: &[u8]) -> Result<Arc<dyn AnchorParser>, Error> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        self.parsers
            .get(&(probe.namespace.clone(), probe.version))
            .cloned()
            .ok_or_else(|| {
                Error::NotSupported(format!(
                    "anchor payload {} version {}",
                    probe.namespace, probe.version
                ))
            })
    }
}

impl Default for AnchorParserRegistry {
    /// Registry with the node's own namespace/version parser registered.
    fn default() -> Self {
        let mut registry = AnchorParserRegistry::new();
        registry.register(NAMESPACE, VERSION, Arc::new(LinksetV1Parser));
        registry
    }
}
