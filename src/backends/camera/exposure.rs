// SPDX-License-Identifier: GPL-3.0-only

//! Shutter speed presentation
//!
//! Sensors settle on exposure times close to, but rarely equal to, the value
//! requested. Read-back values are snapped to a table of familiar shutter
//! speeds before they are shown. The snapped value is never fed back into
//! the device.

use crate::constants::exposure::DEFAULT_SHUTTER_TABLE_US;
use serde::{Deserialize, Serialize};

/// Ascending list of shutter speeds in microseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct ShutterTable(Vec<u32>);

impl ShutterTable {
    /// Build a table, rejecting empty or unsorted input
    pub fn new(values: Vec<u32>) -> Result<Self, String> {
        if values.is_empty() {
            return Err("shutter table is empty".to_string());
        }
        if values.windows(2).any(|w| w[0] >= w[1]) {
            return Err("shutter table must be strictly ascending".to_string());
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[u32] {
        &self.0
    }

    /// Nearest table entry to `shutter_us`
    ///
    /// Equal distances resolve to the smaller entry; values outside the
    /// table clamp to its first or last entry.
    pub fn quantize(&self, shutter_us: f64) -> u32 {
        let table = &self.0;
        let pos = table.partition_point(|&v| (v as f64) < shutter_us);
        if pos == 0 {
            return table[0];
        }
        if pos == table.len() {
            return table[table.len() - 1];
        }
        let before = table[pos - 1];
        let after = table[pos];
        if (after as f64 - shutter_us) < (shutter_us - before as f64) {
            after
        } else {
            before
        }
    }
}

impl Default for ShutterTable {
    fn default() -> Self {
        Self(DEFAULT_SHUTTER_TABLE_US.to_vec())
    }
}

impl TryFrom<Vec<u32>> for ShutterTable {
    type Error = String;

    fn try_from(values: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<ShutterTable> for Vec<u32> {
    fn from(table: ShutterTable) -> Self {
        table.0
    }
}
