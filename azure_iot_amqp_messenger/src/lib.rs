// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Batched telemetry delivery and cloud-to-device message reception over AMQP links for
//! IoT Hub device clients

pub use crate::config::{
    MessengerConfig, MessengerConfigBuilder, MessengerConfigBuilderError, MessengerOption,
    SavedMessengerOptions,
};
pub use crate::error::{EventSendError, MessengerError, TransportError};
pub use crate::messenger::{
    DispositionInfo, DispositionResult, MessengerState, SendStatus, TelemetryMessenger,
};

pub mod codec;
pub mod config;
pub mod error;
pub mod interface;
pub mod interface_mocks;
pub mod messenger;

#[macro_use]
extern crate derive_builder;

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;
