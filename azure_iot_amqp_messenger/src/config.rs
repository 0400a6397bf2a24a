// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Messenger configuration and runtime options

use std::env::{self, VarError};
use std::time::Duration;

/// Default time to wait for an event batch to be acknowledged before reporting a timeout
pub const DEFAULT_EVENT_SEND_TIMEOUT: Duration = Duration::from_secs(600);
/// Default number of consecutive failed send passes tolerated before the messenger errors
pub const DEFAULT_EVENT_SEND_RETRY_LIMIT: usize = 10;

/// Name of the [`MessengerOption::EventSendTimeoutSecs`] option
pub const OPTION_EVENT_SEND_TIMEOUT_SECS: &str = "telemetry_event_send_timeout_secs";
/// Name of the [`MessengerOption::EventSendRetryLimit`] option
pub const OPTION_EVENT_SEND_RETRY_LIMIT: &str = "telemetry_event_send_retry_limit";
/// Name of the [`MessengerOption::ModuleId`] option
pub const OPTION_MODULE_ID: &str = "telemetry_module_id";
/// Name of the [`MessengerOption::SavedOptions`] option
pub const OPTION_SAVED_OPTIONS: &str = "saved_telemetry_messenger_options";

/// Identity and behavior settings of a [`TelemetryMessenger`](crate::TelemetryMessenger).
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct MessengerConfig {
    /// Device identifier
    pub(crate) device_id: String,
    /// Module identifier, if the messenger acts on behalf of a module
    #[builder(default = "None", setter(into, strip_option))]
    pub(crate) module_id: Option<String>,
    /// FQDN of the IoT Hub
    pub(crate) iothub_host_fqdn: String,
    /// Max time to wait for a sent batch to complete. Zero disables the timeout.
    #[builder(default = "DEFAULT_EVENT_SEND_TIMEOUT")]
    pub(crate) event_send_timeout: Duration,
    /// Number of consecutive failed send passes before the messenger errors. Zero disables.
    #[builder(default = "DEFAULT_EVENT_SEND_RETRY_LIMIT")]
    pub(crate) event_send_retry_limit: usize,
}

impl MessengerConfig {
    /// Device identifier
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Module identifier, if any
    #[must_use]
    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    /// FQDN of the IoT Hub
    #[must_use]
    pub fn iothub_host_fqdn(&self) -> &str {
        &self.iothub_host_fqdn
    }
}

impl MessengerConfigBuilder {
    /// Initialize the [`MessengerConfigBuilder`] from environment variables.
    ///
    /// Reads `IOTHUB_DEVICE_ID`, `IOTHUB_MODULE_ID`, `IOTHUB_HOSTNAME`,
    /// `IOTHUB_EVENT_SEND_TIMEOUT_SECS` and `IOTHUB_EVENT_SEND_RETRY_LIMIT`.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are invalid.
    pub fn from_environment() -> Result<Self, String> {
        let device_id = string_from_environment("IOTHUB_DEVICE_ID")?;
        let module_id = string_from_environment("IOTHUB_MODULE_ID")?;
        let iothub_host_fqdn = string_from_environment("IOTHUB_HOSTNAME")?;
        let event_send_timeout = string_from_environment("IOTHUB_EVENT_SEND_TIMEOUT_SECS")?
            .map(|v| v.parse::<u64>().map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("IOTHUB_EVENT_SEND_TIMEOUT_SECS: {e}"))?;
        let event_send_retry_limit = string_from_environment("IOTHUB_EVENT_SEND_RETRY_LIMIT")?
            .map(|v| v.parse::<usize>())
            .transpose()
            .map_err(|e| format!("IOTHUB_EVENT_SEND_RETRY_LIMIT: {e}"))?;

        // NOTE: Missing required values are not an error here, since they may still be provided
        // on the builder. The validation on build will report them.
        if device_id.is_none() {
            log::warn!("IOTHUB_DEVICE_ID is not set in environment");
        }
        if iothub_host_fqdn.is_none() {
            log::warn!("IOTHUB_HOSTNAME is not set in environment");
        }

        Ok(Self {
            device_id,
            module_id: Some(module_id),
            iothub_host_fqdn,
            event_send_timeout,
            event_send_retry_limit,
        })
    }

    /// Validate the messenger configuration.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - `device_id` is empty or contains a '/'
    /// - `module_id` is provided but empty or contains a '/'
    /// - `iothub_host_fqdn` is empty
    fn validate(&self) -> Result<(), String> {
        if let Some(device_id) = &self.device_id {
            if device_id.is_empty() {
                return Err("device_id cannot be empty".to_string());
            }
            if device_id.contains('/') {
                return Err(format!("device_id '{device_id}' cannot contain '/'"));
            }
        }
        if let Some(Some(module_id)) = &self.module_id {
            if module_id.is_empty() {
                return Err("module_id cannot be empty if provided".to_string());
            }
            if module_id.contains('/') {
                return Err(format!("module_id '{module_id}' cannot contain '/'"));
            }
        }
        if let Some(iothub_host_fqdn) = &self.iothub_host_fqdn {
            if iothub_host_fqdn.is_empty() {
                return Err("iothub_host_fqdn cannot be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Runtime option of a [`TelemetryMessenger`](crate::TelemetryMessenger)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessengerOption {
    /// Seconds to wait for a sent batch to complete. Zero disables the timeout.
    EventSendTimeoutSecs(u64),
    /// Consecutive failed send passes tolerated. Zero disables escalation.
    EventSendRetryLimit(usize),
    /// Module identifier. Can only be changed while the messenger is stopped.
    ModuleId(String),
    /// Options previously returned by
    /// [`retrieve_options`](crate::TelemetryMessenger::retrieve_options)
    SavedOptions(SavedMessengerOptions),
}

impl MessengerOption {
    /// Name of the option
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MessengerOption::EventSendTimeoutSecs(_) => OPTION_EVENT_SEND_TIMEOUT_SECS,
            MessengerOption::EventSendRetryLimit(_) => OPTION_EVENT_SEND_RETRY_LIMIT,
            MessengerOption::ModuleId(_) => OPTION_MODULE_ID,
            MessengerOption::SavedOptions(_) => OPTION_SAVED_OPTIONS,
        }
    }
}

/// Snapshot of the runtime options of a messenger, to be re-applied to another instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedMessengerOptions {
    /// Seconds to wait for a sent batch to complete
    pub event_send_timeout_secs: u64,
    /// Consecutive failed send passes tolerated
    pub event_send_retry_limit: usize,
}

/// Helper function to get an environment variable as a string.
fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => {
            Err("Could not parse non-unicode environment variable".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn minimum_configuration() {
        let config = MessengerConfigBuilder::default()
            .device_id("dev1")
            .iothub_host_fqdn("h.example.com")
            .build()
            .unwrap();
        assert_eq!(config.device_id(), "dev1");
        assert_eq!(config.module_id(), None);
        assert_eq!(config.iothub_host_fqdn(), "h.example.com");
        assert_eq!(config.event_send_timeout, DEFAULT_EVENT_SEND_TIMEOUT);
        assert_eq!(config.event_send_retry_limit, DEFAULT_EVENT_SEND_RETRY_LIMIT);
    }

    #[test]
    fn module_configuration() {
        let config = MessengerConfigBuilder::default()
            .device_id("dev1")
            .module_id("mod1")
            .iothub_host_fqdn("h.example.com")
            .build()
            .unwrap();
        assert_eq!(config.module_id(), Some("mod1"));
    }

    #[test_case(Some(""), Some("h.example.com"), None; "empty device id")]
    #[test_case(Some("dev/1"), Some("h.example.com"), None; "device id with separator")]
    #[test_case(Some("dev1"), Some(""), None; "empty host")]
    #[test_case(Some("dev1"), Some("h.example.com"), Some(""); "empty module id")]
    #[test_case(None, Some("h.example.com"), None; "device id missing")]
    #[test_case(Some("dev1"), None, None; "host missing")]
    fn invalid_configuration(
        device_id: Option<&str>,
        host: Option<&str>,
        module_id: Option<&str>,
    ) {
        let mut builder = MessengerConfigBuilder::default();
        if let Some(device_id) = device_id {
            builder = builder.device_id(device_id);
        }
        if let Some(host) = host {
            builder = builder.iothub_host_fqdn(host);
        }
        if let Some(module_id) = module_id {
            builder = builder.module_id(module_id);
        }
        assert!(builder.build().is_err());
    }

    #[test]
    fn from_environment_full_configuration() {
        temp_env::with_vars(
            [
                ("IOTHUB_DEVICE_ID", Some("dev1")),
                ("IOTHUB_MODULE_ID", Some("mod1")),
                ("IOTHUB_HOSTNAME", Some("h.example.com")),
                ("IOTHUB_EVENT_SEND_TIMEOUT_SECS", Some("30")),
                ("IOTHUB_EVENT_SEND_RETRY_LIMIT", Some("3")),
            ],
            || {
                let builder = MessengerConfigBuilder::from_environment().unwrap();
                assert_eq!(builder.device_id, Some("dev1".to_string()));
                assert_eq!(builder.module_id, Some(Some("mod1".to_string())));
                assert_eq!(builder.iothub_host_fqdn, Some("h.example.com".to_string()));
                assert_eq!(builder.event_send_timeout, Some(Duration::from_secs(30)));
                assert_eq!(builder.event_send_retry_limit, Some(3));
                assert!(builder.build().is_ok());
            },
        );
    }

    #[test]
    fn from_environment_minimal_configuration() {
        temp_env::with_vars(
            [
                ("IOTHUB_DEVICE_ID", Some("dev1")),
                ("IOTHUB_MODULE_ID", None),
                ("IOTHUB_HOSTNAME", Some("h.example.com")),
                ("IOTHUB_EVENT_SEND_TIMEOUT_SECS", None),
                ("IOTHUB_EVENT_SEND_RETRY_LIMIT", None),
            ],
            || {
                let config = MessengerConfigBuilder::from_environment()
                    .unwrap()
                    .build()
                    .unwrap();
                assert_eq!(config.module_id(), None);
                assert_eq!(config.event_send_timeout, DEFAULT_EVENT_SEND_TIMEOUT);
            },
        );
    }

    #[test_case("IOTHUB_EVENT_SEND_TIMEOUT_SECS", "not numeric"; "event_send_timeout")]
    #[test_case("IOTHUB_EVENT_SEND_RETRY_LIMIT", "-1"; "event_send_retry_limit")]
    fn from_environment_nonnumeric_value_parsing(env_var: &str, invalid_value: &str) {
        temp_env::with_vars(
            [
                ("IOTHUB_DEVICE_ID", Some("dev1")),
                ("IOTHUB_HOSTNAME", Some("h.example.com")),
                (env_var, Some(invalid_value)),
            ],
            || {
                assert!(MessengerConfigBuilder::from_environment().is_err());
            },
        );
    }

    #[test]
    fn option_names() {
        assert_eq!(
            MessengerOption::EventSendTimeoutSecs(1).name(),
            OPTION_EVENT_SEND_TIMEOUT_SECS
        );
        assert_eq!(
            MessengerOption::SavedOptions(SavedMessengerOptions {
                event_send_timeout_secs: 1,
                event_send_retry_limit: 1,
            })
            .name(),
            OPTION_SAVED_OPTIONS
        );
    }
}
