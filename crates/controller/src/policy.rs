//! Crop threshold policy: a frozen table of crops and the upper soil-moisture
//! percentage each one tolerates.
//!
//! The percentage is scaled linearly into both the raw ADC threshold
//! (`percent * 100`) and the watering pulse length (`percent * 60` seconds).
//! Existing installations are tuned against exactly this scaling.

use serde::Serialize;

use crate::error::EngineError;

/// Crop name -> upper moisture percentage.
const CROP_TABLE: &[(&str, u32)] = &[
    ("garlic", 5),
    ("onion", 5),
    ("shallots", 5),
    ("artichoke", 10),
    ("asparagus", 10),
    ("carrot", 10),
    ("leek", 15),
    ("parsnip", 15),
    ("pea", 15),
];

const THRESHOLD_PER_PERCENT: u32 = 100;
const RUNTIME_SECS_PER_PERCENT: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CropProfile {
    pub crop: &'static str,
    pub moisture_threshold_percent: u32,
    pub sensor_threshold: u32,
    pub runtime_secs: u64,
}

impl CropProfile {
    fn from_percent(crop: &'static str, percent: u32) -> Self {
        Self {
            crop,
            moisture_threshold_percent: percent,
            sensor_threshold: percent * THRESHOLD_PER_PERCENT,
            runtime_secs: u64::from(percent) * RUNTIME_SECS_PER_PERCENT,
        }
    }
}

/// Look up a crop by name (surrounding whitespace and case are ignored).
pub fn resolve(crop: &str) -> Result<CropProfile, EngineError> {
    let wanted = crop.trim();
    CROP_TABLE
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
        .map(|&(name, percent)| CropProfile::from_percent(name, percent))
        .ok_or_else(|| EngineError::UnknownCrop(wanted.to_string()))
}

/// Every profile in table order, for the settings form.
pub fn all() -> Vec<CropProfile> {
    CROP_TABLE
        .iter()
        .map(|&(name, percent)| CropProfile::from_percent(name, percent))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
