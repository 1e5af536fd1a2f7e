// Copyright (c) 2024-present, vdo-core contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-subsystem lifecycle state and the read-only notifier message bus.
//!
//! Replaces the source's singleton global-state broadcast with an explicit
//! channel (spec §9, "Read-only notifier (global-state broadcast) ->
//! message bus"): each mutating subsystem holds a `ReadOnlyNotifier`
//! (effectively a sender), and a single sink drains the cascade.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

/// The lifecycle state of a zone or subsystem (spec glossary "Admin state").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminStateCode {
    /// Accepting mutations normally.
    Normal = 0,
    /// Draining in-flight work before suspending.
    Suspending = 1,
    /// Draining and flushing dirty state for a clean save.
    Saving = 2,
    /// Saving in preparation for an index rebuild/scrub.
    SaveForScrubbing = 3,
    /// Scrubbing recovered slabs in the background.
    Scrubbing = 4,
    /// Replaying the recovery journal after a crash.
    Recovering = 5,
    /// Rebuilding metadata from scratch after unrecoverable loss.
    Rebuilding = 6,
    /// I/O failure or invariant violation occurred; rejects all mutation.
    ReadOnly = 7,
}

impl AdminStateCode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Suspending,
            2 => Self::Saving,
            3 => Self::SaveForScrubbing,
            4 => Self::Scrubbing,
            5 => Self::Recovering,
            6 => Self::Rebuilding,
            _ => Self::ReadOnly,
        }
    }

    /// Whether new mutations are accepted while in this state.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Normal)
    }

    /// Whether the subsystem is in the middle of draining (spec §5
    /// "Cancellation/timeouts": entry into SUSPENDING or SAVING starts a
    /// drain, rejecting new adjustments).
    #[must_use]
    pub fn is_draining(self) -> bool {
        matches!(self, Self::Suspending | Self::Saving | Self::SaveForScrubbing)
    }
}

/// Atomic admin-state cell, shared by a zone's subsystems.
#[derive(Debug)]
pub struct AdminState {
    code: AtomicU8,
}

impl Default for AdminState {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminState {
    /// Creates a new admin state in `NORMAL`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            code: AtomicU8::new(AdminStateCode::Normal as u8),
        }
    }

    /// Reads the current state.
    #[must_use]
    pub fn get(&self) -> AdminStateCode {
        AdminStateCode::from_u8(self.code.load(Ordering::Acquire))
    }

    /// Transitions to `state`, logging the change.
    pub fn set(&self, state: AdminStateCode) {
        let previous = self.get();
        self.code.store(state as u8, Ordering::Release);
        if previous != state {
            log::info!("admin state transition: {previous:?} -> {state:?}");
        }
    }

    /// Returns `Ok(())` if mutations are currently accepted, otherwise
    /// `Err(Error::InvalidAdminState)`. Does not itself suspend anything;
    /// callers check this before attempting a mutation, per spec §5/§7.
    pub fn check_writable(&self) -> Result<()> {
        if self.get().is_writable() {
            Ok(())
        } else {
            Err(Error::InvalidAdminState)
        }
    }

    /// Begins a drain by transitioning to `SUSPENDING` if currently
    /// writable. Idempotent: a subsystem already draining or read-only is
    /// left alone.
    pub fn begin_suspend(&self) {
        if self.get().is_writable() {
            self.set(AdminStateCode::Suspending);
        }
    }

    /// Enters read-only mode unconditionally. One-shot: once set, only
    /// `Self::get` and drain-related observers may progress (spec §5).
    pub fn enter_read_only(&self) {
        self.set(AdminStateCode::ReadOnly);
    }
}

/// A message posted on the read-only bus.
#[derive(Debug, Clone)]
pub struct ReadOnlyEvent {
    /// Human-readable reason, logged by the sink.
    pub reason: String,
}

/// A sender half of the read-only notifier bus. Cloned into every
/// mutating subsystem; calling [`Self::enter_read_only`] posts an event to
/// the single consuming sink and flips the subsystem's own admin state.
#[derive(Clone)]
pub struct ReadOnlyNotifier {
    sender: Sender<ReadOnlyEvent>,
}

impl ReadOnlyNotifier {
    /// Notifies the sink that this subsystem is entering read-only mode,
    /// and flips `state` to `ReadOnly` locally. I/O errors and
    /// invariant-violating assertions use this path (spec §7); semantic
    /// errors like `RefCountInvalid` do not.
    pub fn enter_read_only(&self, state: &AdminState, reason: impl Into<String>) {
        let reason = reason.into();
        state.enter_read_only();
        log::error!("entering read-only mode: {reason}");
        // The sink may already have been dropped (e.g. in a unit test that
        // doesn't drain the bus); that's not itself an error for the
        // notifying subsystem.
        let _ = self.sender.send(ReadOnlyEvent { reason });
    }
}

/// The single consuming end of the read-only bus. Typically owned by a
/// top-level "volume" object that fans the cascade out to every zone's
/// `AdminState`.
pub struct ReadOnlySink {
    receiver: Receiver<ReadOnlyEvent>,
}

impl ReadOnlySink {
    /// Creates a fresh bus, returning the sink and a notifier that can be
    /// cloned for every mutating subsystem.
    #[must_use]
    pub fn new() -> (Self, ReadOnlyNotifier) {
        let (sender, receiver) = channel();
        (Self { receiver }, ReadOnlyNotifier { sender })
    }

    /// Drains all pending events without blocking, applying `handler` to
    /// each. Used by the owning thread to propagate a read-only
    /// transition to sibling zones.
    pub fn drain(&self, mut handler: impl FnMut(&ReadOnlyEvent)) {
        while let Ok(event) = self.receiver.try_recv() {
            handler(&event);
        }
    }
}

/// Convenience wrapper bundling a per-zone `AdminState` with a shared
/// notifier, for subsystems that only need "am I writable" + "go
/// read-only" without owning the bus themselves.
#[derive(Clone)]
pub struct ZoneAdmin {
    state: Arc<AdminState>,
    notifier: ReadOnlyNotifier,
}

impl ZoneAdmin {
    /// Builds a zone admin handle from a shared state cell and notifier.
    #[must_use]
    pub fn new(state: Arc<AdminState>, notifier: ReadOnlyNotifier) -> Self {
        Self { state, notifier }
    }

    /// Current admin state.
    #[must_use]
    pub fn state(&self) -> &AdminState {
        &self.state
    }

    /// Returns `Err` if not currently writable.
    pub fn check_writable(&self) -> Result<()> {
        self.state.check_writable()
    }

    /// Enters read-only mode and notifies the bus.
    pub fn enter_read_only(&self, reason: impl Into<String>) {
        self.notifier.enter_read_only(&self.state, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_writable() {
        let state = AdminState::new();
        assert!(state.check_writable().is_ok());
        assert_eq!(state.get(), AdminStateCode::Normal);
    }

    #[test]
    fn suspend_blocks_writes() {
        let state = AdminState::new();
        state.begin_suspend();
        assert!(matches!(
            state.check_writable(),
            Err(Error::InvalidAdminState)
        ));
        assert!(state.get().is_draining());
    }

    #[test]
    fn read_only_is_one_shot_and_rejects_writes() {
        let state = AdminState::new();
        state.enter_read_only();
        assert!(state.check_writable().is_err());
        // Re-entering is a no-op, still read-only.
        state.enter_read_only();
        assert_eq!(state.get(), AdminStateCode::ReadOnly);
    }

    #[test]
    fn notifier_cascades_to_sink() {
        let (sink, notifier) = ReadOnlySink::new();
        let state_a = AdminState::new();
        let state_b = AdminState::new();

        notifier.enter_read_only(&state_a, "simulated I/O error");

        let mut seen = vec![];
        sink.drain(|event| seen.push(event.reason.clone()));
        assert_eq!(seen, vec!["simulated I/O error".to_string()]);

        // The sink observing the event is how a sibling would learn to
        // flip its own state; simulate that here.
        state_b.enter_read_only();
        assert!(!state_a.get().is_writable());
        assert!(!state_b.get().is_writable());
    }
}
