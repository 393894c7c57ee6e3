// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::error::Error;
use data_encoding::BASE64URL_NOPAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use url::Url;

const SCHEME_PREFIX: &str = "hl:";

/// A content address: the resource multihash plus optional transport hints.
///
/// Text form is `hl:<multibase-multihash>[:<transport-hints>]` where the
/// hints section is base64url over a JSON array of gateway URLs. The
/// canonical reference is always the bare resource hash; everything carrying
/// hints is an alternate spelling of the same anchor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Hashlink {
    resource_hash: String,
    hints: Vec<Url>,
}

impl Hashlink {
    pub fn new(resource_hash: impl Into<String>) -> Self {
        Hashlink {
            resource_hash: resource_hash.into(),
            hints: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: Vec<Url>) -> Self {
        self.hints = hints;
        self
    }

    /// The canonical reference: the multibase multihash alone.
    pub fn resource_hash(&self) -> &str {
        &self.resource_hash
    }

    pub fn hints(&self) -> &[Url] {
        &self.hints
    }

    /// The canonical `hl:` URI without hints.
    pub fn canonical_uri(&self) -> Result<Url, Error> {
        Ok(Url::parse(&format!(
            "{SCHEME_PREFIX}{}",
            self.resource_hash
        ))?)
    }

    /// The full `hl:` URI including hints.
    pub fn uri(&self) -> Result<Url, Error> {
        Ok(Url::parse(&self.to_string())?)
    }
}

impl fmt::Display for Hashlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}", self.resource_hash)?;
        if !self.hints.is_empty() {
            let urls: Vec<&str> = self.hints.iter().map(Url::as_str).collect();
            let metadata = serde_json::to_vec(&urls).map_err(|_| fmt::Error)?;
            write!(f, ":{}", BASE64URL_NOPAD.encode(&metadata))?;
        }
        Ok(())
    }
}

impl FromStr for Hashlink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let rest = s
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| Error::bad_request(format!("not a hashlink: {s}")))?;

        let (hash, metadata) = match rest.split_once(':') {
            Some((hash, metadata)) => (hash, Some(metadata)),
            None => (rest, None),
        };
        if hash.is_empty() {
            return Err(Error::bad_request("hashlink with empty resource hash"));
        }

        let mut hints = Vec::new();
        if let Some(metadata) = metadata {
            let raw = BASE64URL_NOPAD
                .decode(metadata.as_bytes())
                .map_err(|e| Error::bad_request(format!("hashlink metadata: {e}")))?;
            let urls: Vec<String> = serde_json::from_slice(&raw)?;
            for url in urls {
                match Url::parse(&url) {
                    Ok(parsed) => hints.push(parsed),
                    Err(e) => {
                        tracing::debug!("skipping malformed transport hint {url}: {e}");
                    }
                }
            }
        }

        Ok(Hashlink {
            resource_hash: hash.to_string(),
            hints,
        })
    }
}

impl Serialize for Hashlink {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hashlink {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
