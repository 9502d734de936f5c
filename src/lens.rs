//! Capture device selection.
//!
//! Device inventories are unreliable: some phones and boards report no camera
//! for the facing the caller asked for, while a USB camera shows up as
//! "external". `resolve` always prefers the requested facing but degrades to
//! whatever usable device is present instead of failing the whole flow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FlowError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LensFacing {
    Front,
    #[serde(alias = "rear")]
    Back,
    #[serde(alias = "usb")]
    External,
}

impl LensFacing {
    /// The other built-in facing. External devices have no opposite.
    pub fn opposite(self) -> Option<LensFacing> {
        match self {
            LensFacing::Front => Some(LensFacing::Back),
            LensFacing::Back => Some(LensFacing::Front),
            LensFacing::External => None,
        }
    }
}

impl fmt::Display for LensFacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LensFacing::Front => "front",
            LensFacing::Back => "back",
            LensFacing::External => "external",
        };
        f.write_str(name)
    }
}

impl FromStr for LensFacing {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" => Ok(LensFacing::Front),
            "back" | "rear" => Ok(LensFacing::Back),
            "external" | "usb" => Ok(LensFacing::External),
            other => Err(anyhow::anyhow!(
                "unknown lens facing {:?} (expected front, back or external)",
                other
            )),
        }
    }
}

/// One entry of the platform's device inventory. Enumerated fresh on every
/// session start and never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub facing: LensFacing,
    pub id: String,
    pub name: String,
    /// False when the platform lists the device but cannot stream from it.
    pub supported: bool,
}

impl DeviceDescriptor {
    pub fn new(facing: LensFacing, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            facing,
            name: id.clone(),
            id,
            supported: true,
        }
    }
}

/// Pick the device for `preferred` from `devices`.
///
/// Order: exact facing, then the opposite built-in facing, then the first
/// usable device of any facing. Fallbacks are logged as degraded operation.
pub fn resolve(
    preferred: LensFacing,
    devices: &[DeviceDescriptor],
) -> Result<DeviceDescriptor, FlowError> {
    let available: Vec<&DeviceDescriptor> = devices.iter().filter(|d| d.supported).collect();

    if let Some(device) = available.iter().find(|d| d.facing == preferred) {
        return Ok((*device).clone());
    }

    if let Some(opposite) = preferred.opposite() {
        if let Some(device) = available.iter().find(|d| d.facing == opposite) {
            log::warn!(
                "no {} camera available, falling back to {} camera {}",
                preferred,
                opposite,
                device.id
            );
            return Ok((*device).clone());
        }
    }

    if let Some(device) = available.first() {
        log::warn!(
            "no {} camera available, using {} camera {}",
            preferred,
            device.facing,
            device.id
        );
        return Ok((*device).clone());
    }

    log::error!(
        "no usable camera among {} enumerated device(s)",
        devices.len()
    );
    Err(FlowError::NoDeviceAvailable)
}
