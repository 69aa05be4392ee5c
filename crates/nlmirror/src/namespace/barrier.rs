//! One-shot barrier released when every startup namespace finished its
//! initial dump.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::netlink::{Error, Result};

#[derive(Debug)]
struct Failure {
    namespace: String,
    reason: String,
}

#[derive(Debug, Default)]
struct BarrierState {
    target: Option<usize>,
    done: usize,
    fired: bool,
    failure: Option<Failure>,
}

impl BarrierState {
    fn settled(&self) -> bool {
        self.fired || self.failure.is_some()
    }
}

/// Counts dump completions and fires exactly once.
///
/// The target is unknown until the startup set is sealed, so completions
/// may arrive before [`arm`](Self::arm); they are counted and the barrier
/// fires as soon as both the target is set and reached. A startup dump
/// that gives up [`fail`](Self::fail)s the barrier instead, and it never
/// fires afterwards.
#[derive(Debug)]
pub struct SyncBarrier {
    state: Mutex<BarrierState>,
    // Flips to true once the barrier fires or fails.
    settled: watch::Sender<bool>,
}

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBarrier {
    pub fn new() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            state: Mutex::new(BarrierState::default()),
            settled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the number of completions required. Returns true if this call
    /// fired the barrier.
    pub fn arm(&self, target: usize) -> bool {
        let mut state = self.lock();
        if state.target.is_none() {
            state.target = Some(target);
        }
        self.try_fire(&mut state)
    }

    /// Record one completion. Returns true if this call fired the barrier.
    pub fn complete_one(&self) -> bool {
        let mut state = self.lock();
        state.done += 1;
        self.try_fire(&mut state)
    }

    /// Record that `namespace` will never complete. Returns true if this
    /// call failed the barrier; false once it already fired or failed.
    pub fn fail(&self, namespace: &str, reason: &str) -> bool {
        let mut state = self.lock();
        if state.settled() {
            return false;
        }
        state.failure = Some(Failure {
            namespace: namespace.to_string(),
            reason: reason.to_string(),
        });
        self.settled.send_replace(true);
        true
    }

    fn try_fire(&self, state: &mut BarrierState) -> bool {
        if state.settled() {
            return false;
        }
        match state.target {
            Some(target) if state.done >= target => {
                state.fired = true;
                self.settled.send_replace(true);
                true
            }
            _ => false,
        }
    }

    /// True once the barrier has fired.
    pub fn is_fired(&self) -> bool {
        self.lock().fired
    }

    /// Wait until the barrier fires or fails.
    pub async fn wait(&self) -> Result<()> {
        let mut settled = self.settled.subscribe();
        // The sender lives in self, so this cannot fail while we borrow it.
        let _ = settled.wait_for(|s| *s).await;

        match &self.lock().failure {
            Some(failure) => Err(Error::InitialDump {
                namespace: failure.namespace.clone(),
                reason: failure.reason.clone(),
            }),
            None => Ok(()),
        }
    }
}
