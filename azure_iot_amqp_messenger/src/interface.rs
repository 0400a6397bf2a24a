// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types describing the AMQP link layer consumed by the messenger.
//!
//! The messenger never owns a connection or session. It is handed an [`AmqpSession`] on start,
//! creates links, senders and receivers on it, and observes their progress through typed events
//! delivered over an [`EventSink`].

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc::{error::SendError, unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::TransportError;

/// Message format code identifying a batch of encoded messages
pub const BATCHING_FORMAT_CODE: u32 = 0x8001_3700;

/// Delivery number of a message received on a receiver link
pub type DeliveryNumber = u32;

/// Properties sent as part of a link attach
pub type AttachProperties = HashMap<String, String>;

/// Role of a link on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Link sends messages to the peer
    Sender,
    /// Link receives messages from the peer
    Receiver,
}

/// Settlement mode requested for a receiver link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// Receiver settles spontaneously
    First,
    /// Receiver settles only after the sender settles
    Second,
}

/// State reported by a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderState {
    /// Not opened
    #[default]
    Idle,
    /// Attach in progress
    Opening,
    /// Ready to send
    Open,
    /// Detach in progress
    Closing,
    /// Unrecoverable failure
    Error,
}

/// State reported by a message receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverState {
    /// Not opened
    #[default]
    Idle,
    /// Attach in progress
    Opening,
    /// Ready to receive
    Open,
    /// Detach in progress
    Closing,
    /// Unrecoverable failure
    Error,
}

/// Result of an asynchronous send reported by a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSendResult {
    /// The peer accepted the message
    Ok,
    /// The send failed or the peer did not accept the message
    Error,
    /// The send timed out in the link layer
    Timeout,
    /// The send was cancelled before completion
    Cancelled,
}

/// Disposition applied to a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message was processed
    Accepted,
    /// The message was not processed and may be redelivered
    Released,
    /// The message was not processed and must not be redelivered
    Rejected {
        /// Symbolic error condition
        condition: String,
        /// Human readable description
        description: String,
    },
}

impl DeliveryOutcome {
    /// Creates a [`DeliveryOutcome::Rejected`] with the given condition and description
    pub fn rejected(condition: impl Into<String>, description: impl Into<String>) -> Self {
        DeliveryOutcome::Rejected {
            condition: condition.into(),
            description: description.into(),
        }
    }
}

/// An AMQP message as exchanged with the link layer.
///
/// The body is a sequence of data sections. A batch is a message with the
/// [`BATCHING_FORMAT_CODE`] format whose data sections each hold one encoded message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpMessage {
    message_format: u32,
    body: Vec<Bytes>,
}

impl AmqpMessage {
    /// Creates an empty message with the default (zero) message format
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty batch message
    #[must_use]
    pub fn batch() -> Self {
        Self {
            message_format: BATCHING_FORMAT_CODE,
            body: Vec::new(),
        }
    }

    /// Creates a message with a single data section
    pub fn with_data(data: impl Into<Bytes>) -> Self {
        Self {
            message_format: 0,
            body: vec![data.into()],
        }
    }

    /// Returns the message format code
    #[must_use]
    pub fn message_format(&self) -> u32 {
        self.message_format
    }

    /// Returns true if this message carries a batch of encoded messages
    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.message_format == BATCHING_FORMAT_CODE
    }

    /// Appends a data section to the body
    pub fn add_body_data(&mut self, data: Bytes) {
        self.body.push(data);
    }

    /// Returns the data sections of the body
    #[must_use]
    pub fn body(&self) -> &[Bytes] {
        &self.body
    }

    /// Total number of bytes across all data sections
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }
}

/// A message delivered on a receiver link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Delivery number assigned by the receiver link
    pub delivery_number: DeliveryNumber,
    /// The received message
    pub message: AmqpMessage,
}

/// Opaque token identifying one asynchronous send.
///
/// Passed to [`AmqpMessageSender::send_async`] and handed back unchanged in
/// [`SenderEvent::SendComplete`]. Tokens are never reused by a messenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SendToken(u64);

impl SendToken {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

/// Event reported by a message sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    /// The sender changed state
    StateChanged {
        /// State after the change
        new_state: SenderState,
        /// State before the change
        previous_state: SenderState,
    },
    /// An asynchronous send finished
    SendComplete {
        /// Token provided when the send was issued
        token: SendToken,
        /// Result of the send
        result: MessageSendResult,
        /// Delivery state reported by the peer, if any
        outcome: Option<DeliveryOutcome>,
    },
}

/// Event reported by a message receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// The receiver changed state
    StateChanged {
        /// State after the change
        new_state: ReceiverState,
        /// State before the change
        previous_state: ReceiverState,
    },
    /// A message was received and awaits a disposition
    MessageReceived(ReceivedMessage),
}

/// Used by the link layer to report events back to the messenger.
///
/// Events are queued and processed the next time the messenger does work,
/// so reporting never re-enters the messenger.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: UnboundedSender<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    /// Report an event.
    ///
    /// # Errors
    /// Returns a [`SendError`] if the event could not be reported
    /// (i.e. the link was already torn down by the messenger).
    pub fn notify(&self, event: E) -> Result<(), SendError<E>> {
        self.tx.send(event)
    }
}

/// Sink for [`SenderEvent`]s
pub type SenderEventSink = EventSink<SenderEvent>;
/// Sink for [`ReceiverEvent`]s
pub type ReceiverEventSink = EventSink<ReceiverEvent>;

/// Create a connected event sink and the receiving half drained by the messenger
pub(crate) fn event_channel<E>() -> (EventSink<E>, UnboundedReceiver<E>) {
    let (tx, rx) = unbounded_channel();
    (EventSink { tx }, rx)
}

// ---------- Link layer abstractions ----------

/// An open AMQP session on which links can be created.
///
/// The session is supplied by the owner of the messenger and is not owned by it.
/// Links, senders and receivers are destroyed by dropping them; the messenger always
/// drops a sender or receiver before the link it was created on.
pub trait AmqpSession {
    /// Link type created on this session
    type Link: AmqpLink;
    /// Message sender type created on this session
    type Sender: AmqpMessageSender;
    /// Message receiver type created on this session
    type Receiver: AmqpMessageReceiver;

    /// Create a link with the given name, role, source and target addresses
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the link could not be created
    fn create_link(
        &self,
        name: &str,
        role: LinkRole,
        source: &str,
        target: &str,
    ) -> Result<Self::Link, TransportError>;

    /// Create a message sender on a link. State changes and send completions are reported on `events`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the sender could not be created
    fn create_message_sender(
        &self,
        link: &Self::Link,
        events: SenderEventSink,
    ) -> Result<Self::Sender, TransportError>;

    /// Create a message receiver on a link. State changes and received messages are reported on `events`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the receiver could not be created
    fn create_message_receiver(
        &self,
        link: &Self::Link,
        events: ReceiverEventSink,
    ) -> Result<Self::Receiver, TransportError>;
}

/// A unidirectional named channel over a session
pub trait AmqpLink {
    /// Name of the link
    fn name(&self) -> &str;

    /// Set the max message size advertised on attach
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the value could not be set
    fn set_max_message_size(&mut self, max_message_size: u64) -> Result<(), TransportError>;

    /// Set the properties sent on attach
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the properties could not be set
    fn set_attach_properties(&mut self, properties: AttachProperties)
        -> Result<(), TransportError>;

    /// Set the receiver settle mode requested on attach
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the mode could not be set
    fn set_receiver_settle_mode(&mut self, mode: ReceiverSettleMode)
        -> Result<(), TransportError>;

    /// Max message size the peer negotiated on attach
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the value is not available
    fn peer_max_message_size(&self) -> Result<u64, TransportError>;
}

/// Sends messages over a sender link
pub trait AmqpMessageSender {
    /// Begin opening the sender. Completion is reported as a [`SenderEvent::StateChanged`].
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the open could not be started
    fn open(&mut self) -> Result<(), TransportError>;

    /// Hand a message to the link layer. The result is reported later as a
    /// [`SenderEvent::SendComplete`] carrying `token`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the message could not be queued for sending
    fn send_async(&mut self, message: AmqpMessage, token: SendToken)
        -> Result<(), TransportError>;
}

/// Receives messages over a receiver link
pub trait AmqpMessageReceiver {
    /// Begin opening the receiver. Completion is reported as a [`ReceiverEvent::StateChanged`].
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the open could not be started
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the receiver
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the close failed
    fn close(&mut self) -> Result<(), TransportError>;

    /// Name of the link messages are received on
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the name is not available
    fn link_name(&self) -> Result<String, TransportError>;

    /// Settle a previously received message with the given outcome
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the disposition could not be sent
    fn send_message_disposition(
        &mut self,
        link_name: &str,
        delivery_number: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError>;
}
