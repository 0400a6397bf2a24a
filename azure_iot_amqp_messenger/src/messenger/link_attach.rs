// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Addressing and naming of the messenger's links, and the metadata attached to them.

use uuid::Uuid;

use crate::config::MessengerConfig;
use crate::interface::{AmqpLink, AttachProperties};

const EVENT_SENDER_LINK_NAME_PREFIX: &str = "link-snd";
const MESSAGE_RECEIVER_LINK_NAME_PREFIX: &str = "link-rcv";
/// Attach property identifying the client software to the service
pub(crate) const CLIENT_VERSION_PROPERTY: &str = "com.microsoft:client-version";

/// Name and addresses used to attach one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkEndpoints {
    pub link_name: String,
    pub source: String,
    pub target: String,
}

impl LinkEndpoints {
    /// Endpoints of the outbound telemetry link
    pub fn event_sender(config: &MessengerConfig) -> Self {
        let link_name = unique_link_name(EVENT_SENDER_LINK_NAME_PREFIX, &config.device_id);
        Self {
            source: format!("{link_name}-source"),
            target: format!("amqps://{}/messages/events", devices_path(config)),
            link_name,
        }
    }

    /// Endpoints of the inbound cloud-to-device link
    pub fn message_receiver(config: &MessengerConfig) -> Self {
        let link_name = unique_link_name(MESSAGE_RECEIVER_LINK_NAME_PREFIX, &config.device_id);
        Self {
            source: format!("amqps://{}/messages/devicebound", devices_path(config)),
            target: format!("{link_name}-target"),
            link_name,
        }
    }
}

/// `{host}/devices/{device}` or `{host}/devices/{device}/modules/{module}`
fn devices_path(config: &MessengerConfig) -> String {
    match &config.module_id {
        Some(module_id) => format!(
            "{}/devices/{}/modules/{module_id}",
            config.iothub_host_fqdn, config.device_id
        ),
        None => format!("{}/devices/{}", config.iothub_host_fqdn, config.device_id),
    }
}

fn unique_link_name(prefix: &str, device_id: &str) -> String {
    format!("{prefix}-{device_id}-{}", Uuid::new_v4())
}

/// Attach the client version reported by the product info to the link.
///
/// Failure is logged and otherwise ignored; the link can still be used.
pub(crate) fn attach_client_version<L: AmqpLink>(link: &mut L, product_info: &str) {
    let properties =
        AttachProperties::from([(CLIENT_VERSION_PROPERTY.to_string(), product_info.to_string())]);
    if let Err(e) = link.set_attach_properties(properties) {
        log::warn!(
            "Unable to attach the device client type to link {}: {e}",
            link.name()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessengerConfigBuilder;

    fn config(module_id: Option<&str>) -> MessengerConfig {
        let builder = MessengerConfigBuilder::default()
            .device_id("dev1")
            .iothub_host_fqdn("h.example.com");
        match module_id {
            Some(module_id) => builder.module_id(module_id),
            None => builder,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn event_sender_endpoints() {
        let endpoints = LinkEndpoints::event_sender(&config(None));
        assert!(endpoints.link_name.starts_with("link-snd-dev1-"));
        assert_eq!(endpoints.source, format!("{}-source", endpoints.link_name));
        assert_eq!(
            endpoints.target,
            "amqps://h.example.com/devices/dev1/messages/events"
        );
    }

    #[test]
    fn message_receiver_endpoints() {
        let endpoints = LinkEndpoints::message_receiver(&config(None));
        assert!(endpoints.link_name.starts_with("link-rcv-dev1-"));
        assert_eq!(
            endpoints.source,
            "amqps://h.example.com/devices/dev1/messages/devicebound"
        );
        assert_eq!(endpoints.target, format!("{}-target", endpoints.link_name));
    }

    #[test]
    fn module_endpoints() {
        let config = config(Some("mod1"));
        assert_eq!(
            LinkEndpoints::event_sender(&config).target,
            "amqps://h.example.com/devices/dev1/modules/mod1/messages/events"
        );
        assert_eq!(
            LinkEndpoints::message_receiver(&config).source,
            "amqps://h.example.com/devices/dev1/modules/mod1/messages/devicebound"
        );
    }

    #[test]
    fn link_names_are_unique() {
        let config = config(None);
        assert_ne!(
            LinkEndpoints::event_sender(&config).link_name,
            LinkEndpoints::event_sender(&config).link_name
        );
    }
}
