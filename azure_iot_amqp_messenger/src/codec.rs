// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conversion between device messages and their AMQP representation.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::interface::AmqpMessage;

/// Converts device messages to and from AMQP.
///
/// Outbound messages are encoded into a single binary blob that becomes one data section of a
/// batch. Inbound AMQP messages are decoded back into device messages.
pub trait MessageCodec {
    /// Device message type handled by this codec
    type Message;
    /// Error returned when a conversion fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encode a device message into its binary AMQP form
    ///
    /// # Errors
    /// Returns [`MessageCodec::Error`] if the message cannot be encoded
    fn encode(&self, message: &Self::Message) -> Result<Bytes, Self::Error>;

    /// Decode a received AMQP message into a device message
    ///
    /// # Errors
    /// Returns [`MessageCodec::Error`] if the message cannot be decoded
    fn decode(&self, message: &AmqpMessage) -> Result<Self::Message, Self::Error>;
}

/// Error converting a message with [`RawBytesCodec`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RawBytesCodecError {
    /// The received message has no data sections
    #[error("message has no body data")]
    NoBodyData,
}

/// Codec treating device messages as opaque bytes.
///
/// Encoding is the identity. Decoding concatenates all data sections of the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytesCodec;

impl MessageCodec for RawBytesCodec {
    type Message = Bytes;
    type Error = RawBytesCodecError;

    fn encode(&self, message: &Bytes) -> Result<Bytes, RawBytesCodecError> {
        Ok(message.clone())
    }

    fn decode(&self, message: &AmqpMessage) -> Result<Bytes, RawBytesCodecError> {
        match message.body() {
            [] => Err(RawBytesCodecError::NoBodyData),
            [single] => Ok(single.clone()),
            sections => {
                let mut buf = BytesMut::with_capacity(message.body_len());
                for section in sections {
                    buf.extend_from_slice(section);
                }
                Ok(buf.freeze())
            }
        }
    }
}
