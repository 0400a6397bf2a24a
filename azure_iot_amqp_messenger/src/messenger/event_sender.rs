// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle of the outbound telemetry link and its message sender.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::config::MessengerConfig;
use crate::error::TransportError;
use crate::interface::{
    event_channel, AmqpLink, AmqpMessage, AmqpMessageSender, AmqpSession, LinkRole, SendToken,
    SenderEvent, SenderState,
};
use crate::messenger::link_attach::{attach_client_version, LinkEndpoints};

/// Max message size advertised on the event sender link
pub(crate) const EVENT_SENDER_MAX_LINK_SIZE: u64 = u64::MAX;

/// An opened (or opening) event sender.
///
/// Dropping it destroys the message sender and then the link.
pub(crate) struct EventSender<S: AmqpSession> {
    // NOTE: Field order matters, the sender must be dropped before its link.
    sender: S::Sender,
    link: S::Link,
    events: UnboundedReceiver<SenderEvent>,
    current_state: SenderState,
    previous_state: SenderState,
    last_state_change: Instant,
}

impl<S: AmqpSession> EventSender<S> {
    /// Create the sender link and message sender on `session`, and begin opening it.
    ///
    /// Anything created before a failure is torn down again.
    pub fn create(
        session: &S,
        config: &MessengerConfig,
        product_info: &str,
    ) -> Result<Self, TransportError> {
        let endpoints = LinkEndpoints::event_sender(config);
        let mut link = session.create_link(
            &endpoints.link_name,
            LinkRole::Sender,
            &endpoints.source,
            &endpoints.target,
        )?;
        if let Err(e) = link.set_max_message_size(EVENT_SENDER_MAX_LINK_SIZE) {
            log::warn!("Failed setting event sender link max message size: {e}");
        }
        attach_client_version(&mut link, product_info);

        let (sink, events) = event_channel();
        let mut sender = session.create_message_sender(&link, sink)?;
        sender.open()?;
        log::info!("Opening event sender link {}", endpoints.link_name);

        Ok(Self {
            sender,
            link,
            events,
            current_state: SenderState::Idle,
            previous_state: SenderState::Idle,
            last_state_change: Instant::now(),
        })
    }

    /// Take the next event reported by the link layer, recording state changes.
    pub fn next_event(&mut self) -> Option<SenderEvent> {
        let event = self.events.try_recv().ok()?;
        if let SenderEvent::StateChanged {
            new_state,
            previous_state,
        } = event
        {
            if new_state != previous_state {
                self.current_state = new_state;
                self.previous_state = previous_state;
                self.last_state_change = Instant::now();
            }
        }
        Some(event)
    }

    /// Last state reported by the message sender
    pub fn state(&self) -> SenderState {
        self.current_state
    }

    /// Whether the message sender has reported any state change since creation
    pub fn has_changed_state(&self) -> bool {
        self.current_state != self.previous_state
    }

    /// Time elapsed since the last reported state change (or creation)
    pub fn time_in_state(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_state_change)
    }

    pub fn peer_max_message_size(&self) -> Result<u64, TransportError> {
        self.link.peer_max_message_size()
    }

    pub fn send_async(
        &mut self,
        message: AmqpMessage,
        token: SendToken,
    ) -> Result<(), TransportError> {
        self.sender.send_async(message, token)
    }
}

impl<S: AmqpSession> std::fmt::Debug for EventSender<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("link", &self.link.name())
            .field("current_state", &self.current_state)
            .field("previous_state", &self.previous_state)
            .finish_non_exhaustive()
    }
}
