// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle of the inbound cloud-to-device link and its message receiver.
//! Only present while the messenger is subscribed for messages.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::config::MessengerConfig;
use crate::error::TransportError;
use crate::interface::{
    event_channel, AmqpLink, AmqpMessageReceiver, AmqpSession, DeliveryNumber, DeliveryOutcome,
    LinkRole, ReceiverEvent, ReceiverSettleMode, ReceiverState,
};
use crate::messenger::link_attach::{attach_client_version, LinkEndpoints};

/// Max message size advertised on the message receiver link
pub(crate) const MESSAGE_RECEIVER_MAX_LINK_SIZE: u64 = 65536;

/// An opened (or opening) message receiver.
///
/// Dropping it closes and destroys the message receiver, and then destroys the link.
pub(crate) struct MessageReceiver<S: AmqpSession> {
    // NOTE: Field order matters, the receiver must be dropped before its link.
    receiver: S::Receiver,
    link: S::Link,
    events: UnboundedReceiver<ReceiverEvent>,
    link_name: String,
    current_state: ReceiverState,
    previous_state: ReceiverState,
    last_state_change: Instant,
}

impl<S: AmqpSession> MessageReceiver<S> {
    /// Create the receiver link and message receiver on `session`, and begin opening it.
    ///
    /// Anything created before a failure is torn down again.
    pub fn create(
        session: &S,
        config: &MessengerConfig,
        product_info: &str,
    ) -> Result<Self, TransportError> {
        let endpoints = LinkEndpoints::message_receiver(config);
        let mut link = session.create_link(
            &endpoints.link_name,
            LinkRole::Receiver,
            &endpoints.source,
            &endpoints.target,
        )?;
        link.set_receiver_settle_mode(ReceiverSettleMode::First)?;
        if let Err(e) = link.set_max_message_size(MESSAGE_RECEIVER_MAX_LINK_SIZE) {
            log::warn!("Failed setting message receiver link max message size: {e}");
        }
        attach_client_version(&mut link, product_info);

        let (sink, events) = event_channel();
        let mut receiver = session.create_message_receiver(&link, sink)?;
        if let Err(e) = receiver.open() {
            // Not yet open, so there is nothing to close on teardown.
            drop(receiver);
            return Err(e);
        }
        log::info!("Opening message receiver link {}", endpoints.link_name);

        Ok(Self {
            receiver,
            link,
            events,
            link_name: endpoints.link_name,
            current_state: ReceiverState::Idle,
            previous_state: ReceiverState::Idle,
            last_state_change: Instant::now(),
        })
    }

    /// Take the next event reported by the link layer, recording state changes.
    pub fn next_event(&mut self) -> Option<ReceiverEvent> {
        let event = self.events.try_recv().ok()?;
        if let ReceiverEvent::StateChanged {
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

    /// Last state reported by the message receiver
    pub fn state(&self) -> ReceiverState {
        self.current_state
    }

    /// Whether the message receiver has reported any state change since creation
    pub fn has_changed_state(&self) -> bool {
        self.current_state != self.previous_state
    }

    /// Time elapsed since the last reported state change (or creation)
    pub fn time_in_state(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_state_change)
    }

    /// Name of the link as reported by the message receiver
    pub fn link_name(&self) -> Result<String, TransportError> {
        self.receiver.link_name()
    }

    /// Name the link was created with
    pub fn attached_link_name(&self) -> &str {
        &self.link_name
    }

    pub fn send_message_disposition(
        &mut self,
        link_name: &str,
        delivery_number: DeliveryNumber,
        outcome: DeliveryOutcome,
    ) -> Result<(), TransportError> {
        self.receiver
            .send_message_disposition(link_name, delivery_number, outcome)
    }
}

impl<S: AmqpSession> Drop for MessageReceiver<S> {
    fn drop(&mut self) {
        if let Err(e) = self.receiver.close() {
            log::warn!(
                "Failed closing message receiver on link {} (ignored): {e}",
                self.link_name
            );
        }
    }
}

impl<S: AmqpSession> std::fmt::Debug for MessageReceiver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("link", &self.link.name())
            .field("current_state", &self.current_state)
            .field("previous_state", &self.previous_state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessengerConfigBuilder;
    use crate::interface_mocks::MockSession;

    fn config() -> MessengerConfig {
        MessengerConfigBuilder::default()
            .device_id("dev1")
            .module_id("mod1")
            .iothub_host_fqdn("h.example.com")
            .build()
            .unwrap()
    }

    #[test]
    fn create_opens_receiver() {
        let session = MockSession::new();
        let receiver = MessageReceiver::create(&session, &config(), "test").unwrap();

        let links = session.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].role, LinkRole::Receiver);
        assert_eq!(
            links[0].source,
            "amqps://h.example.com/devices/dev1/modules/mod1/messages/devicebound"
        );
        assert_eq!(links[0].settle_mode, Some(ReceiverSettleMode::First));
        assert_eq!(
            links[0].max_message_size,
            Some(MESSAGE_RECEIVER_MAX_LINK_SIZE)
        );
        assert_eq!(session.receivers_opened(), 1);
        assert_eq!(receiver.state(), ReceiverState::Idle);
    }

    #[test]
    fn drop_closes_and_destroys() {
        let session = MockSession::new();
        let receiver = MessageReceiver::create(&session, &config(), "test").unwrap();
        drop(receiver);
        assert_eq!(session.receivers_closed(), 1);
        assert_eq!(session.live_receivers(), 0);
        assert_eq!(session.live_links(), 0);
    }

    #[test]
    fn failed_creation_tears_down() {
        let session = MockSession::new();
        session.fail_receiver_creation(true);
        assert!(MessageReceiver::create(&session, &config(), "test").is_err());
        assert_eq!(session.live_links(), 0);
    }

    #[test]
    fn failed_open_tears_down_without_close() {
        let session = MockSession::new();
        session.fail_receiver_open(true);
        assert!(MessageReceiver::create(&session, &config(), "test").is_err());
        assert_eq!(session.receivers_closed(), 0);
        assert_eq!(session.live_receivers(), 0);
        assert_eq!(session.live_links(), 0);
    }

    #[test]
    fn state_changes_are_recorded() {
        let session = MockSession::new();
        let mut receiver = MessageReceiver::create(&session, &config(), "test").unwrap();
        while receiver.next_event().is_some() {}
        assert_eq!(receiver.state(), ReceiverState::Opening);
        session.set_receiver_state(ReceiverState::Open);
        receiver.next_event();
        assert_eq!(receiver.state(), ReceiverState::Open);
    }
}
