// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Verifiable-credential seam.
//!
//! The credential format and its proof cryptography are consumed
//! capabilities: the core parses the structural shape it needs (issuer,
//! issuance time, the proof list) and delegates proof checking to a
//! [`CredentialVerifier`] supplied by the embedder.

use crate::activity::one_or_many;
use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CONTEXT_CREDENTIALS: &str = "https://www.w3.org/2018/credentials/v1";

/// An opaque proof document. The core only ever looks at the attribution
/// fields; the bytes are checked by the verifier capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Proof(serde_json::Value);

impl Proof {
    /// Wraps a proof document, rejecting anything that is not a JSON object.
    pub fn new(value: serde_json::Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Err(Error::bad_request("proof must be a JSON object"));
        }
        Ok(Proof(value))
    }

    pub fn verification_method(&self) -> Option<&str> {
        self.0.get("verificationMethod").and_then(|v| v.as_str())
    }

    pub fn domain(&self) -> Option<&str> {
        self.0.get("domain").and_then(|v| v.as_str())
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// The embedded anchor credential: issuer attribution, issuance time and the
/// accumulated witness proofs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(
        rename = "@context",
        with = "one_or_many",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    context: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Url>,

    #[serde(rename = "type", with = "one_or_many")]
    types: Vec<String>,

    issuer: Url,

    issuance_date: DateTime<Utc>,

    credential_subject: serde_json::Value,

    #[serde(
        with = "one_or_many",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    proof: Vec<Proof>,
}

impl Credential {
    pub fn new(issuer: Url, subject: serde_json::Value) -> Self {
        Credential {
            context: vec![CONTEXT_CREDENTIALS.to_string()],
            id: None,
            types: vec!["VerifiableCredential".to_string()],
            issuer,
            issuance_date: Utc::now(),
            credential_subject: subject,
            proof: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: Url) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_issuance_date(mut self, issued: DateTime<Utc>) -> Self {
        self.issuance_date = issued;
        self
    }

    pub fn issuer(&self) -> &Url {
        &self.issuer
    }

    /// Issuance time; becomes the transaction time of the anchored batch.
    pub fn issued(&self) -> DateTime<Utc> {
        self.issuance_date
    }

    pub fn subject(&self) -> &serde_json::Value {
        &self.credential_subject
    }

    pub fn proofs(&self) -> &[Proof] {
        &self.proof
    }

    /// Appends a witness proof. Duplicates (by verification method) collapse.
    pub fn add_proof(&mut self, proof: Proof) {
        let dup = proof.verification_method().is_some_and(|method| {
            self.proof
                .iter()
                .any(|existing| existing.verification_method() == Some(method))
        });
        if !dup {
            self.proof.push(proof);
        }
    }
}

/// Proof-checking capability supplied by the embedder.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &Credential) -> Result<(), Error>;
}

/// Development-grade verifier: accepts any credential that carries at least
/// one structurally valid proof. Real deployments plug in a verifier that
/// checks the proof cryptography.
pub struct AcceptAllVerifier;

#[async_trait]
impl CredentialVerifier for AcceptAllVerifier {
    async fn verify(&self, credential: &Credential) -> Result<(), Error> {
        if credential.proofs().is_empty() {
            return Err(Error::bad_request("credential carries no proof"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn proof(method: &str) -> Proof {
        Proof::new(serde_json::json!({
            "type": "Ed25519Signature2020",
            "verificationMethod": method,
            "created": "2023-03-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn credential_roundtrip_with_single_proof() {
        let mut credential = Credential::new(
            Url::parse("https://alpha.example/services/anchor").unwrap(),
            serde_json::json!({"anchor": "hl:uEiAabc"}),
        );
        credential.add_proof(proof("https://beta.example/keys/main"));

        let value = serde_json::to_value(&credential).unwrap();
        // A single proof serializes as a bare object, the common wire shape.
        assert!(value["proof"].is_object());

        let parsed: Credential = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, credential);
    }

    #[test]
    fn duplicate_proofs_collapse() {
        let mut credential = Credential::new(
            Url::parse("https://alpha.example/services/anchor").unwrap(),
            serde_json::json!({}),
        );
        credential.add_proof(proof("https://beta.example/keys/main"));
        credential.add_proof(proof("https://beta.example/keys/main"));
        credential.add_proof(proof("https://gamma.example/keys/main"));
        assert_eq!(credential.proofs().len(), 2);
    }

    #[test]
    fn non_object_proof_rejected() {
        assert!(Proof::new(serde_json::json!("signature")).is_err());
    }

    #[tokio::test]
    async fn accept_all_still_requires_a_proof() {
        let bare = Credential::new(
            Url::parse("https://alpha.example/services/anchor").unwrap(),
            serde_json::json!({}),
        );
        assert!(AcceptAllVerifier.verify(&bare).await.is_err());
    }
}
