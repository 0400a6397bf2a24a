// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types for tracking the state of a [`crate::TelemetryMessenger`].

use std::fmt;

/// Indicates the part of the lifecycle the messenger is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    /// Started, waiting for the event sender to open
    Starting,
    /// Event sender is open and events are being sent
    Started,
    /// Tearing down links
    Stopping,
    /// Not started. Initial state.
    Stopped,
    /// Unrecoverable failure. The messenger must be stopped.
    Error,
}

/// Callback invoked with `(previous_state, new_state)` on each state change
pub type StateChangedCallback = Box<dyn FnMut(MessengerState, MessengerState) + Send>;

/// Current state of the messenger, notifying an observer of every change.
pub(crate) struct StateTracker {
    current: MessengerState,
    on_state_changed: Option<StateChangedCallback>,
}

impl StateTracker {
    pub fn new(on_state_changed: Option<StateChangedCallback>) -> Self {
        Self {
            current: MessengerState::Stopped,
            on_state_changed,
        }
    }

    pub fn current(&self) -> MessengerState {
        self.current
    }

    /// Move to `new_state`. Does nothing if already in that state.
    pub fn transition(&mut self, new_state: MessengerState) {
        if new_state == self.current {
            return;
        }
        let previous_state = self.current;
        self.current = new_state;
        match new_state {
            MessengerState::Error => {
                log::error!("Messenger state changed from {previous_state:?} to {new_state:?}");
            }
            _ => log::info!("Messenger state changed from {previous_state:?} to {new_state:?}"),
        }
        if let Some(on_state_changed) = self.on_state_changed.as_mut() {
            on_state_changed(previous_state, new_state);
        }
    }
}

impl fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTracker")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
