//! Input port discovery and selection validation.
//!
//! The audio server presents capture sources as named input ports, and
//! the operator's selection is stored by name, so a saved configuration
//! can outlive the graph it was made against (an interface unplugged, a
//! server restarted). [`InputGraph`] is a point-in-time snapshot of the
//! live graph: the engine scans it before applying a selection and the
//! ports that vanished come back as a `PortValidation` error for the
//! reselection prompt.

use serde::{Deserialize, Serialize};

use crate::error::{HindsightError, Result};

/// One selectable capture source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPort {
    /// Port name as reported by the audio server; the unit of selection.
    pub name: String,
    /// Whether the server would route capture here with no selection.
    pub is_default: bool,
}

/// Snapshot of the input side of the audio graph.
#[derive(Debug, Clone, Default)]
pub struct InputGraph {
    ports: Vec<InputPort>,
}

impl InputGraph {
    /// Enumerate the live graph. A scan failure yields an empty graph
    /// (every selection then fails validation, which is the honest
    /// answer when the server cannot be queried).
    #[cfg(feature = "audio-cpal")]
    pub fn scan() -> Self {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let mut ports = Vec::new();
        match host.input_devices() {
            Ok(devices) => {
                for device in devices {
                    // Ports the server cannot name cannot be selected by
                    // name either; skip them rather than invent labels.
                    let Ok(name) = device.name() else { continue };
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    ports.push(InputPort { name, is_default });
                }
            }
            Err(e) => tracing::warn!("input graph scan failed: {e}"),
        }
        Self { ports }
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn scan() -> Self {
        Self::default()
    }

    pub fn ports(&self) -> &[InputPort] {
        &self.ports
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ports.iter().any(|p| p.name == name)
    }

    /// Check a saved selection against this snapshot. Every requested
    /// name must still resolve; anything gone is reported so the
    /// operator can be asked to reselect.
    pub fn validate(&self, requested: &[String]) -> Result<()> {
        let missing: Vec<String> = requested
            .iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(HindsightError::PortValidation { missing })
        }
    }
}
