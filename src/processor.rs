// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Seam to the Sidetree operation processor.
//!
//! The core never interprets DID operations itself: it builds a transaction
//! descriptor from a verified anchor and hands it to the registered processor
//! for the anchor's namespace/version, trusting it to apply the operations to
//! the local operation store.

use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Descriptor of one anchored batch, as handed to the processor.
#[derive(Clone, Debug, PartialEq)]
pub struct AnchorTransaction {
    pub namespace: String,
    pub version: u64,
    /// Issuance time of the anchor credential.
    pub transaction_time: DateTime<Utc>,
    /// `<operation count>.<core index URI>`.
    pub anchor_string: String,
    /// The resource hash alone.
    pub canonical_reference: String,
    /// Every other known spelling of the anchor, hints included.
    pub equivalent_references: Vec<String>,
}

/// Applies the operations of one anchored batch.
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    /// Processes the transaction, restricted to `suffixes` when non-empty.
    /// Returns the number of operations applied; zero means everything in
    /// the batch was already known.
    async fn process(
        &self,
        transaction: &AnchorTransaction,
        suffixes: &[String],
    ) -> Result<u64, Error>;
}

/// Processor registry keyed by (namespace, version).
pub struct ProcessorRegistry {
    processors: HashMap<(String, u64), Arc<dyn OperationProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        ProcessorRegistry {
            processors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        version: u64,
        processor: Arc<dyn OperationProcessor>,
    ) {
        self.processors.insert((namespace.into(), version), processor);
    }

    pub fn get(&self, namespace: &str, version: u64) -> Result<Arc<dyn OperationProcessor>, Error> {
        self.processors
            .get(&(namespace.to_string(), version))
            .cloned()
            .ok_or_else(|| {
                Error::NotSupported(format!("operation processor {namespace} version {version}"))
            })
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        ProcessorRegistry::new()
    }
}
