// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Uniform start/stop capability shared by every long-running component.
//! Components compose lifecycles by containment: a parent starts its children
//! and stops them in reverse order.

use crate::error::Error;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopped,
}

/// Atomic state machine backing [`Runnable`] implementations.
///
/// Transitions are Idle → Running → Stopped. Stop is permanent: a stopped
/// component cannot be restarted, and operations on it fail with
/// [`Error::AlreadyStopped`].
pub struct Lifecycle(AtomicU8);

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle(AtomicU8::new(IDLE))
    }

    /// A lifecycle born running, for components that are ready on
    /// construction.
    pub fn new_running() -> Self {
        Lifecycle(AtomicU8::new(RUNNING))
    }

    pub fn state(&self) -> State {
        match self.0.load(Ordering::Acquire) {
            IDLE => State::Idle,
            RUNNING => State::Running,
            _ => State::Stopped,
        }
    }

    /// Idempotent while not stopped.
    pub fn start(&self) -> Result<(), Error> {
        match self
            .0
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(RUNNING) => Ok(()),
            Err(_) => Err(Error::AlreadyStopped),
        }
    }

    /// Safe to call exactly once; the second call reports `AlreadyStopped`.
    pub fn stop(&self) -> Result<(), Error> {
        match self.0.swap(STOPPED, Ordering::AcqRel) {
            STOPPED => Err(Error::AlreadyStopped),
            _ => Ok(()),
        }
    }

    pub fn ensure_running(&self) -> Result<(), Error> {
        match self.state() {
            State::Running => Ok(()),
            State::Idle => Err(Error::NotStarted),
            State::Stopped => Err(Error::AlreadyStopped),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

/// The capability every long-running component exposes. Starting is
/// asynchronous (components subscribe to their topics during start); stopping
/// closes ingress synchronously and lets in-flight work drain.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn start(&self) -> Result<(), Error>;
    fn stop(&self) -> Result<(), Error>;
    fn state(&self) -> State;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), State::Idle);
        assert!(matches!(
            lifecycle.ensure_running(),
            Err(Error::NotStarted)
        ));

        lifecycle.start().unwrap();
        assert_eq!(lifecycle.state(), State::Running);
        lifecycle.start().unwrap();
        lifecycle.ensure_running().unwrap();

        lifecycle.stop().unwrap();
        assert!(matches!(lifecycle.stop(), Err(Error::AlreadyStopped)));
        assert!(matches!(
            lifecycle.ensure_running(),
            Err(Error::AlreadyStopped)
        ));
    }

    #[test]
    fn stopped_cannot_restart() {
        let lifecycle = Lifecycle::new_running();
        lifecycle.stop().unwrap();
        assert!(matches!(lifecycle.start(), Err(Error::AlreadyStopped)));
    }
}
