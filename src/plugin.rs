//! Decoder plugins and the plugin registry.
//!
//! A plugin maps an opaque byte buffer to a canonical [`TelemetryRecord`]
//! for one protocol. Decoders are statically registered (a build-time table
//! rather than runtime loading); membership may change only at quiescence
//! via [`PluginRegistry::register`] / [`PluginRegistry::remove`].
//!
//! The registry isolates misbehaving plugins: a hook that panics is caught,
//! the error is recorded, and the plugin is quarantined — skipped by
//! matching from then on. Failures never propagate to the caller.

use crate::config::PluginSettings;
use crate::error::{GatewayError, Result};
use crate::record::TelemetryRecord;
use crate::{lock_read, lock_write};
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Closed set of protocol tags. `Other` is valid for third-party decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolTag {
    /// NMEA 0183 sentences.
    Nmea,
    /// u-blox UBX binary.
    Ublox,
    /// Trimble ASCII Interface Protocol.
    Taip,
    /// Any other protocol.
    Other,
}

impl ProtocolTag {
    /// Canonical upper-case tag, as stored under the `Protocol` extended key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nmea => "NMEA",
            Self::Ublox => "UBLOX",
            Self::Taip => "TAIP",
            Self::Other => "OTHER",
        }
    }

    /// Lower-case tag, as used in topic names.
    pub fn as_topic_segment(&self) -> &'static str {
        match self {
            Self::Nmea => "nmea",
            Self::Ublox => "ublox",
            Self::Taip => "taip",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol decoder.
///
/// Implementations must be reentrant: multiple pipeline workers may call the
/// same decoder simultaneously. The capability predicate must be pure and
/// cheap (it runs on every unmatched frame) and decoders return errors, never
/// panic — a panic quarantines the plugin.
pub trait DecoderPlugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn version(&self) -> &str;

    /// Protocol this decoder handles.
    fn protocol(&self) -> ProtocolTag;

    /// Cheap capability predicate over the leading bytes of a frame.
    fn can_decode(&self, payload: &[u8]) -> bool;

    /// Decodes a frame into a canonical record.
    fn decode(&self, payload: &[u8], device_id: &str) -> Result<TelemetryRecord>;

    /// Plugin-specific record validation, run before the central validator.
    fn validate(&self, record: &TelemetryRecord) -> std::result::Result<(), String> {
        let _ = record;
        Ok(())
    }

    /// Init hook, invoked once at registration with a configuration view.
    fn init(&self, settings: &PluginSettings) -> Result<()> {
        let _ = settings;
        Ok(())
    }

    /// Cleanup hook, invoked at registry shutdown.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct PluginEntry {
    plugin: Arc<dyn DecoderPlugin>,
    quarantined: AtomicBool,
}

/// Ordered collection of decoder plugins.
///
/// Matching walks plugins in registration order and returns the first whose
/// capability predicate accepts the frame; the registration-order tie-break
/// is observable and part of the contract.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<Vec<PluginEntry>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin, invoking its init hook first. A failing or
    /// panicking init leaves the registry unchanged.
    pub fn register(
        &self,
        plugin: Arc<dyn DecoderPlugin>,
        settings: &PluginSettings,
    ) -> Result<()> {
        let name = plugin.name().to_string();
        let init_result = catch_unwind(AssertUnwindSafe(|| plugin.init(settings)));
        match init_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(GatewayError::plugin_init(name, e.to_string()));
            }
            Err(panic) => {
                return Err(GatewayError::plugin_init(name, panic_message(panic)));
            }
        }

        info!(
            plugin = %plugin.name(),
            version = %plugin.version(),
            protocol = %plugin.protocol(),
            "Registered decoder plugin"
        );
        lock_write!(self.entries).push(PluginEntry {
            plugin,
            quarantined: AtomicBool::new(false),
        });
        Ok(())
    }

    /// Returns the first non-quarantined plugin whose capability predicate
    /// accepts the payload, in registration order.
    pub fn match_for_bytes(&self, payload: &[u8]) -> Option<Arc<dyn DecoderPlugin>> {
        let entries = lock_read!(self.entries);
        for entry in entries.iter() {
            if entry.quarantined.load(Ordering::Relaxed) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| entry.plugin.can_decode(payload))) {
                Ok(true) => return Some(Arc::clone(&entry.plugin)),
                Ok(false) => {}
                Err(panic) => {
                    error!(
                        plugin = %entry.plugin.name(),
                        "Capability predicate panicked, quarantining plugin: {}",
                        panic_message(panic)
                    );
                    entry.quarantined.store(true, Ordering::Relaxed);
                }
            }
        }
        None
    }

    /// Direct lookup by protocol tag.
    pub fn get_by_protocol(&self, tag: ProtocolTag) -> Option<Arc<dyn DecoderPlugin>> {
        lock_read!(self.entries)
            .iter()
            .find(|e| !e.quarantined.load(Ordering::Relaxed) && e.plugin.protocol() == tag)
            .map(|e| Arc::clone(&e.plugin))
    }

    /// Runs a plugin's decode hook with panic isolation. A panic quarantines
    /// the plugin and surfaces as [`GatewayError::PluginRuntime`].
    pub fn decode_with(
        &self,
        plugin: &Arc<dyn DecoderPlugin>,
        payload: &[u8],
        device_id: &str,
    ) -> Result<TelemetryRecord> {
        match catch_unwind(AssertUnwindSafe(|| plugin.decode(payload, device_id))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic);
                error!(
                    plugin = %plugin.name(),
                    "Decoder panicked, quarantining plugin: {}",
                    reason
                );
                self.quarantine(plugin.name());
                Err(GatewayError::plugin_runtime(plugin.name(), reason))
            }
        }
    }

    /// Removes a plugin by name, invoking its cleanup hook. Must only be
    /// called at quiescence (no in-flight matches), which the pipeline
    /// guarantees during reload.
    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut entries = lock_write!(self.entries);
            let mut extracted = None;
            entries.retain(|e| {
                if e.plugin.name() == name {
                    extracted = Some(Arc::clone(&e.plugin));
                    false
                } else {
                    true
                }
            });
            extracted
        };
        match removed {
            Some(plugin) => {
                run_shutdown_hook(&plugin);
                true
            }
            None => false,
        }
    }

    /// Invokes every cleanup hook in reverse registration order. Individual
    /// failures are logged but never abort the sweep.
    pub fn shutdown(&self) {
        let plugins: Vec<_> = {
            let mut entries = lock_write!(self.entries);
            entries.drain(..).map(|e| e.plugin).collect()
        };
        for plugin in plugins.into_iter().rev() {
            run_shutdown_hook(&plugin);
        }
    }

    /// Number of registered (including quarantined) plugins.
    pub fn len(&self) -> usize {
        lock_read!(self.entries).len()
    }

    /// Whether the registry holds no plugins.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn quarantine(&self, name: &str) {
        let entries = lock_read!(self.entries);
        if let Some(entry) = entries.iter().find(|e| e.plugin.name() == name) {
            entry.quarantined.store(true, Ordering::Relaxed);
        }
    }
}

fn run_shutdown_hook(plugin: &Arc<dyn DecoderPlugin>) {
    match catch_unwind(AssertUnwindSafe(|| plugin.shutdown())) {
        Ok(Ok(())) => info!(plugin = %plugin.name(), "Plugin shut down"),
        Ok(Err(e)) => warn!(plugin = %plugin.name(), "Plugin cleanup failed: {}", e),
        Err(panic) => warn!(
            plugin = %plugin.name(),
            "Plugin cleanup panicked: {}",
            panic_message(panic)
        ),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
