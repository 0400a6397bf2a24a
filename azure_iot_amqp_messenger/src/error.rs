// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types

use thiserror::Error;

use crate::messenger::MessengerState;

/// Error reported by an operation on the underlying AMQP transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct TransportError {
    /// The transport operation that failed
    operation: &'static str,
    /// Description of the failure
    reason: String,
}

impl TransportError {
    /// Creates a new [`TransportError`]
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }

    /// Returns the name of the transport operation that failed
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

/// Error executing an operation on a [`TelemetryMessenger`](crate::TelemetryMessenger)
#[derive(Debug, Error)]
pub enum MessengerError {
    /// The operation is not permitted in the current messenger state
    #[error("operation not permitted while messenger is {0:?}")]
    InvalidState(MessengerState),
    /// The messenger is already subscribed for cloud-to-device messages
    #[error("messenger is already subscribed for messages")]
    AlreadySubscribed,
    /// The messenger is not subscribed for cloud-to-device messages
    #[error("messenger is not subscribed for messages")]
    NotSubscribed,
    /// No message receiver is currently active
    #[error("message receiver is not active")]
    ReceiverNotActive,
    /// The requested disposition cannot be sent to the service
    #[error("disposition result NONE cannot be sent")]
    UnsupportedDisposition,
    /// The option cannot be applied in the current messenger state
    #[error("option '{name}' cannot be set while messenger is {state:?}")]
    OptionNotSettable {
        /// Name of the option
        name: &'static str,
        /// State of the messenger when the option was rejected
        state: MessengerState,
    },
    /// The value provided for the option is invalid
    #[error("invalid value for option '{name}': {reason}")]
    InvalidOptionValue {
        /// Name of the option
        name: &'static str,
        /// Why the value was rejected
        reason: String,
    },
    /// The underlying transport reported an error
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reason an event (telemetry message) was not delivered
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EventSendError {
    /// The message could not be encoded for transmission
    #[error("message could not be encoded")]
    CannotParse,
    /// The message could not be sent, or the service did not accept it
    #[error("message could not be sent")]
    FailSending,
    /// The message was not acknowledged within the event send timeout
    #[error("message send timed out")]
    Timeout,
    /// The messenger was destroyed before the message could be sent
    #[error("messenger was destroyed before the message was sent")]
    MessengerDestroyed,
}
