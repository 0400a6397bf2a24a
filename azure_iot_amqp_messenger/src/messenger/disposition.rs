// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Delivery of cloud-to-device messages to the subscriber, and their acknowledgment.

use crate::codec::MessageCodec;
use crate::error::MessengerError;
use crate::interface::{AmqpSession, DeliveryNumber, DeliveryOutcome, ReceivedMessage};
use crate::messenger::message_receiver::MessageReceiver;

const DECODE_FAILURE_CONDITION: &str = "Rejected due to failure reading AMQP message";
const DECODE_FAILURE_DESCRIPTION: &str = "Failed reading AMQP message";
const APPLICATION_REJECT_CONDITION: &str = "Rejected by application";
const APPLICATION_REJECT_DESCRIPTION: &str = "Rejected by application";

/// Acknowledgment of a received message, as decided by the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionResult {
    /// Send no acknowledgment now. The message remains unsettled until
    /// [`send_message_disposition`](crate::TelemetryMessenger::send_message_disposition) is called.
    None,
    /// The message was processed
    Accepted,
    /// The message was not processed and may be redelivered
    Released,
    /// The message was not processed and must not be redelivered
    Rejected,
}

impl DispositionResult {
    /// Protocol outcome to send, if any
    fn outcome(self) -> Option<DeliveryOutcome> {
        match self {
            DispositionResult::None => None,
            DispositionResult::Accepted => Some(DeliveryOutcome::Accepted),
            DispositionResult::Released => Some(DeliveryOutcome::Released),
            DispositionResult::Rejected => Some(DeliveryOutcome::rejected(
                APPLICATION_REJECT_CONDITION,
                APPLICATION_REJECT_DESCRIPTION,
            )),
        }
    }
}

/// Identifies a received message so it can be acknowledged later.
///
/// Does not reference the message itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispositionInfo {
    source: String,
    delivery_number: DeliveryNumber,
}

impl DispositionInfo {
    /// Name of the link the message was received on
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Delivery number of the message on its link
    #[must_use]
    pub fn delivery_number(&self) -> DeliveryNumber {
        self.delivery_number
    }
}

/// Callback invoked for each received message. The returned result is sent to the service.
pub type OnMessageReceived<M> = Box<dyn FnMut(M, DispositionInfo) -> DispositionResult + Send>;

fn send_outcome<S: AmqpSession>(
    receiver: &mut MessageReceiver<S>,
    link_name: &str,
    delivery_number: DeliveryNumber,
    outcome: DeliveryOutcome,
) {
    if let Err(e) = receiver.send_message_disposition(link_name, delivery_number, outcome) {
        log::error!("Failed sending disposition for delivery {delivery_number} on link {link_name}: {e}");
    }
}

/// Hand a received message to the subscriber and apply the disposition it returns.
///
/// Messages that cannot be decoded are rejected without invoking the subscriber. Messages that
/// arrive while nobody is subscribed are released.
pub(crate) fn handle_received_message<S, C>(
    receiver: &mut MessageReceiver<S>,
    codec: &C,
    subscriber: Option<&mut OnMessageReceived<C::Message>>,
    received: ReceivedMessage,
) where
    S: AmqpSession,
    C: MessageCodec,
{
    let delivery_number = received.delivery_number;

    let Some(subscriber) = subscriber else {
        log::warn!("Received message {delivery_number} with no subscriber, releasing it");
        let link_name = receiver.attached_link_name().to_string();
        send_outcome(receiver, &link_name, delivery_number, DeliveryOutcome::Released);
        return;
    };

    let source = match receiver.link_name() {
        Ok(source) => source,
        Err(e) => {
            log::error!("Could not get link name for received message {delivery_number}, releasing it: {e}");
            let link_name = receiver.attached_link_name().to_string();
            send_outcome(receiver, &link_name, delivery_number, DeliveryOutcome::Released);
            return;
        }
    };

    let message = match codec.decode(&received.message) {
        Ok(message) => message,
        Err(e) => {
            log::error!("Failed decoding received message {delivery_number}, rejecting it: {e}");
            send_outcome(
                receiver,
                &source,
                delivery_number,
                DeliveryOutcome::rejected(DECODE_FAILURE_CONDITION, DECODE_FAILURE_DESCRIPTION),
            );
            return;
        }
    };

    let info = DispositionInfo {
        source: source.clone(),
        delivery_number,
    };
    let result = subscriber(message, info);
    match result.outcome() {
        Some(outcome) => {
            log::debug!("Settling received message {delivery_number} as {result:?}");
            send_outcome(receiver, &source, delivery_number, outcome);
        }
        None => log::debug!("Received message {delivery_number} left unsettled by subscriber"),
    }
}

/// Acknowledge a message previously handed to the subscriber.
///
/// # Errors
/// - [`MessengerError::ReceiverNotActive`] if there is no message receiver
/// - [`MessengerError::UnsupportedDisposition`] if `result` is [`DispositionResult::None`]
/// - [`MessengerError::Transport`] if the disposition could not be sent
pub(crate) fn send_deferred_disposition<S: AmqpSession>(
    receiver: Option<&mut MessageReceiver<S>>,
    info: &DispositionInfo,
    result: DispositionResult,
) -> Result<(), MessengerError> {
    let receiver = receiver.ok_or(MessengerError::ReceiverNotActive)?;
    let outcome = result
        .outcome()
        .ok_or(MessengerError::UnsupportedDisposition)?;
    receiver.send_message_disposition(&info.source, info.delivery_number, outcome)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use test_case::test_case;

    use super::*;
    use crate::codec::RawBytesCodec;
    use crate::config::{MessengerConfig, MessengerConfigBuilder};
    use crate::interface::AmqpMessage;
    use crate::interface_mocks::MockSession;

    fn config() -> MessengerConfig {
        MessengerConfigBuilder::default()
            .device_id("dev1")
            .iothub_host_fqdn("h.example.com")
            .build()
            .unwrap()
    }

    fn received(delivery_number: DeliveryNumber, body: &'static [u8]) -> ReceivedMessage {
        ReceivedMessage {
            delivery_number,
            message: AmqpMessage::with_data(Bytes::from_static(body)),
        }
    }

    fn subscriber(
        result: DispositionResult,
        calls: &Arc<Mutex<Vec<(Bytes, DispositionInfo)>>>,
    ) -> OnMessageReceived<Bytes> {
        let calls = calls.clone();
        Box::new(move |message, info| {
            calls.lock().unwrap().push((message, info));
            result
        })
    }

    #[test_case(DispositionResult::Accepted, DeliveryOutcome::Accepted; "accepted")]
    #[test_case(DispositionResult::Released, DeliveryOutcome::Released; "released")]
    #[test_case(
        DispositionResult::Rejected,
        DeliveryOutcome::rejected("Rejected by application", "Rejected by application");
        "rejected"
    )]
    fn subscriber_result_is_sent(result: DispositionResult, expected: DeliveryOutcome) {
        let session = MockSession::new();
        let mut receiver = MessageReceiver::create(&session, &config(), "test").unwrap();
        let calls = Arc::default();
        let mut on_received = subscriber(result, &calls);

        handle_received_message(
            &mut receiver,
            &RawBytesCodec,
            Some(&mut on_received),
            received(7, b"hello"),
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Bytes::from_static(b"hello"));
        assert_eq!(calls[0].1.delivery_number(), 7);
        assert_eq!(calls[0].1.source(), receiver.attached_link_name());
        assert_eq!(
            session.dispositions(),
            vec![(receiver.attached_link_name().to_string(), 7, expected)]
        );
    }

    #[test]
    fn none_leaves_message_unsettled() {
        let session = MockSession::new();
        let mut receiver = MessageReceiver::create(&session, &config(), "test").unwrap();
        let calls = Arc::default();
        let mut on_received = subscriber(DispositionResult::None, &calls);

        handle_received_message(
            &mut receiver,
            &RawBytesCodec,
            Some(&mut on_received),
            received(1, b"hello"),
        );

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(session.dispositions().is_empty());

        // Acknowledged later with the captured info
        let info = calls.lock().unwrap()[0].1.clone();
        send_deferred_disposition(Some(&mut receiver), &info, DispositionResult::Accepted).unwrap();
        assert_eq!(
            session.dispositions(),
            vec![(info.source().to_string(), 1, DeliveryOutcome::Accepted)]
        );
    }

    #[test]
    fn undecodable_message_is_rejected() {
        let session = MockSession::new();
        let mut receiver = MessageReceiver::create(&session, &config(), "test").unwrap();
        let calls = Arc::default();
        let mut on_received = subscriber(DispositionResult::Accepted, &calls);

        handle_received_message(
            &mut receiver,
            &RawBytesCodec,
            Some(&mut on_received),
            ReceivedMessage {
                delivery_number: 3,
                message: AmqpMessage::new(),
            },
        );

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(
            session.dispositions(),
            vec![(
                receiver.attached_link_name().to_string(),
                3,
                DeliveryOutcome::rejected(DECODE_FAILURE_CONDITION, DECODE_FAILURE_DESCRIPTION)
            )]
        );
    }

    #[test]
    fn unsubscribed_message_is_released() {
        let session = MockSession::new();
        let mut receiver = MessageReceiver::create(&session, &config(), "test").unwrap();

        handle_received_message(&mut receiver, &RawBytesCodec, None, received(4, b"late"));

        assert_eq!(
            session.dispositions(),
            vec![(
                receiver.attached_link_name().to_string(),
                4,
                DeliveryOutcome::Released
            )]
        );
    }

    #[test]
    fn missing_link_name_releases_message() {
        let session = MockSession::new();
        let mut receiver = MessageReceiver::create(&session, &config(), "test").unwrap();
        session.fail_receiver_link_name(true);
        let calls = Arc::default();
        let mut on_received = subscriber(DispositionResult::Accepted, &calls);

        handle_received_message(
            &mut receiver,
            &RawBytesCodec,
            Some(&mut on_received),
            received(5, b"hello"),
        );

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(session.dispositions()[0].2, DeliveryOutcome::Released);
    }

    #[test]
    fn deferred_disposition_errors() {
        let session = MockSession::new();
        let mut receiver = MessageReceiver::create(&session, &config(), "test").unwrap();
        let info = DispositionInfo {
            source: receiver.attached_link_name().to_string(),
            delivery_number: 9,
        };

        assert!(matches!(
            send_deferred_disposition::<MockSession>(None, &info, DispositionResult::Accepted),
            Err(MessengerError::ReceiverNotActive)
        ));
        assert!(matches!(
            send_deferred_disposition(Some(&mut receiver), &info, DispositionResult::None),
            Err(MessengerError::UnsupportedDisposition)
        ));

        session.fail_disposition(true);
        assert!(matches!(
            send_deferred_disposition(Some(&mut receiver), &info, DispositionResult::Released),
            Err(MessengerError::Transport(_))
        ));
        assert!(session.dispositions().is_empty());
    }
}
