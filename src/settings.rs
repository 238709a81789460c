//! Engine configuration.
//!
//! Settings arrive as a flat string map (the embedding application owns the
//! parsing of whatever file format it prefers) and are resolved into a typed
//! [`EngineSettings`] once, at controller construction.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::time::Duration;
use thiserror::Error;

pub const SCHEDULE_MINIMUM_NANOSECONDS: &str = "flowcontroller.minimum.nanoseconds";
pub const GRACEFUL_SHUTDOWN_SECONDS: &str = "graceful.shutdown.seconds";
pub const HEARTBEAT_INTERVAL_SECONDS: &str = "node.heartbeat.interval";
pub const REMOTE_INPUT_SOCKET_PORT: &str = "remote.input.socket.port";
pub const SITE_TO_SITE_SECURE: &str = "site.to.site.secure";
pub const STATUS_SNAPSHOT_FREQUENCY_MILLIS: &str = "component.status.snapshot.frequency";
pub const FLOWFILE_REPOSITORY_IMPLEMENTATION: &str = "flowfile.repository.implementation";
pub const CONTENT_REPOSITORY_IMPLEMENTATION: &str = "content.repository.implementation";
pub const PROVENANCE_REPOSITORY_IMPLEMENTATION: &str = "provenance.repository.implementation";
pub const SWAP_MANAGER_IMPLEMENTATION: &str = "swap.manager.implementation";
pub const COMPONENT_STATUS_REPOSITORY_IMPLEMENTATION: &str =
    "component.status.repository.implementation";

pub const DEFAULT_GRACEFUL_SHUTDOWN_SECONDS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_STATUS_SNAPSHOT_MILLIS: u64 = 300_000;

/// Errors raised while resolving the settings map.
#[derive(Debug, Error, Diagnostic)]
pub enum SettingsError {
    /// A key was present but its value failed to parse.
    #[error("invalid value for {key}: {value}")]
    #[diagnostic(code(floweave::settings::invalid_value))]
    InvalidValue { key: &'static str, value: String },

    /// Secure site-to-site was requested without a TLS context.
    #[error("site.to.site.secure=true requires a TLS context")]
    #[diagnostic(
        code(floweave::settings::tls_required),
        help("Provide a TlsContext when building the controller, or disable site.to.site.secure.")
    )]
    TlsContextRequired,
}

/// Opaque handle to whatever TLS material the embedding application carries.
/// The core only checks for its presence when secure site-to-site is on.
#[derive(Clone, Debug)]
pub struct TlsContext {
    pub identity: String,
}

/// Resolved engine configuration.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Floor applied to timer and primary-only scheduling periods.
    pub schedule_minimum: Duration,
    /// Shutdown drain budget. Values below one second fall back to default.
    pub graceful_shutdown: Duration,
    /// Heartbeat generator cadence.
    pub heartbeat_interval: Duration,
    /// Inbound site-to-site listener port; `None` disables the listener.
    pub remote_input_socket_port: Option<u16>,
    /// Whether site-to-site communications require TLS.
    pub site_to_site_secure: bool,
    /// Status aggregator cadence.
    pub status_snapshot_interval: Duration,
    /// Plug-in implementation names for the delegated repositories. The core
    /// does not instantiate these itself; they are surfaced so the embedding
    /// application can resolve them through its registry.
    pub flowfile_repository_implementation: Option<String>,
    pub content_repository_implementation: Option<String>,
    pub provenance_repository_implementation: Option<String>,
    pub swap_manager_implementation: Option<String>,
    pub component_status_repository_implementation: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            schedule_minimum: Duration::from_nanos(0),
            graceful_shutdown: Duration::from_secs(DEFAULT_GRACEFUL_SHUTDOWN_SECONDS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
            remote_input_socket_port: None,
            site_to_site_secure: false,
            status_snapshot_interval: Duration::from_millis(DEFAULT_STATUS_SNAPSHOT_MILLIS),
            flowfile_repository_implementation: None,
            content_repository_implementation: None,
            provenance_repository_implementation: None,
            swap_manager_implementation: None,
            component_status_repository_implementation: None,
        }
    }
}

impl EngineSettings {
    /// Resolve settings from a raw key/value map.
    ///
    /// Unknown keys are ignored. A malformed value for a known key is an
    /// error, except `graceful.shutdown.seconds` where sub-second values
    /// silently fall back to the default drain budget.
    pub fn from_map(raw: &FxHashMap<String, String>) -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        if let Some(v) = raw.get(SCHEDULE_MINIMUM_NANOSECONDS) {
            let nanos: u64 = v.parse().map_err(|_| SettingsError::InvalidValue {
                key: SCHEDULE_MINIMUM_NANOSECONDS,
                value: v.clone(),
            })?;
            settings.schedule_minimum = Duration::from_nanos(nanos);
        }

        if let Some(v) = raw.get(GRACEFUL_SHUTDOWN_SECONDS) {
            match v.parse::<i64>() {
                Ok(secs) if secs >= 1 => {
                    settings.graceful_shutdown = Duration::from_secs(secs as u64);
                }
                _ => {
                    tracing::warn!(
                        value = %v,
                        default = DEFAULT_GRACEFUL_SHUTDOWN_SECONDS,
                        "graceful shutdown budget below minimum, using default"
                    );
                }
            }
        }

        if let Some(v) = raw.get(HEARTBEAT_INTERVAL_SECONDS) {
            let secs: u64 = v.parse().map_err(|_| SettingsError::InvalidValue {
                key: HEARTBEAT_INTERVAL_SECONDS,
                value: v.clone(),
            })?;
            settings.heartbeat_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(v) = raw.get(REMOTE_INPUT_SOCKET_PORT) {
            let port: u16 = v.parse().map_err(|_| SettingsError::InvalidValue {
                key: REMOTE_INPUT_SOCKET_PORT,
                value: v.clone(),
            })?;
            settings.remote_input_socket_port = Some(port);
        }

        if let Some(v) = raw.get(SITE_TO_SITE_SECURE) {
            settings.site_to_site_secure = v.parse().map_err(|_| SettingsError::InvalidValue {
                key: SITE_TO_SITE_SECURE,
                value: v.clone(),
            })?;
        }

        if let Some(v) = raw.get(STATUS_SNAPSHOT_FREQUENCY_MILLIS) {
            let millis: u64 = v.parse().map_err(|_| SettingsError::InvalidValue {
                key: STATUS_SNAPSHOT_FREQUENCY_MILLIS,
                value: v.clone(),
            })?;
            settings.status_snapshot_interval = Duration::from_millis(millis.max(1));
        }

        settings.flowfile_repository_implementation =
            raw.get(FLOWFILE_REPOSITORY_IMPLEMENTATION).cloned();
        settings.content_repository_implementation =
            raw.get(CONTENT_REPOSITORY_IMPLEMENTATION).cloned();
        settings.provenance_repository_implementation =
            raw.get(PROVENANCE_REPOSITORY_IMPLEMENTATION).cloned();
        settings.swap_manager_implementation = raw.get(SWAP_MANAGER_IMPLEMENTATION).cloned();
        settings.component_status_repository_implementation = raw
            .get(COMPONENT_STATUS_REPOSITORY_IMPLEMENTATION)
            .cloned();

        Ok(settings)
    }

    /// Validate cluster-facing requirements that depend on optional inputs.
    pub fn verify_site_to_site(&self, tls: Option<&TlsContext>) -> Result<(), SettingsError> {
        if self.site_to_site_secure && tls.is_none() {
            return Err(SettingsError::TlsContextRequired);
        }
        Ok(())
    }
}
