// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Federated DID anchoring core.
//!
//! Nodes in a peer-to-peer federation cooperate to order, witness and replay
//! batches of DID operations. This crate implements the part that makes the
//! federation work as a distributed system:
//!
//! - the ActivityPub message plane: an [`inbox`] that verifies and
//!   dispatches incoming activities and an [`outbox`] that delivers outgoing
//!   ones with retries and undeliverable bookkeeping;
//! - the witness protocol: [`handler::witness`] drives the Offer/Like
//!   exchange until a policy-defined quorum of proofs is collected and the
//!   anchor becomes eligible for announcement;
//! - the [`observer`] pipeline, which replays anchors fetched from
//!   content-addressed storage into the local operation store, idempotently;
//! - the internal [`pubsub`] with redelivery backoff that bridges the
//!   components, available in-process and broker-backed.
//!
//! The HTTP signature scheme, the concrete CAS backend, the Sidetree
//! operation processor and the credential proof checker are consumed through
//! trait seams ([`httpsig`], [`cas`], [`processor`], [`vc`]).

pub mod activity;
pub mod anchor;
pub mod cas;
pub mod error;
pub mod handler;
pub mod httpsig;
pub mod inbox;
pub mod lifecycle;
pub mod observer;
pub mod outbox;
pub mod processor;
pub mod pubsub;
pub mod service;
pub mod store;
pub mod vc;

#[cfg(test)]
mod test_utils;

pub use error::Error;
