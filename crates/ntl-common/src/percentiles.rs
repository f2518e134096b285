//! Display stretch bounds attached to every mosaic.

use serde::{Deserialize, Serialize};

/// 2nd and 98th percentile of the valid pixels of a mosaic.
///
/// An image without valid pixels has bounds `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Percentiles {
    pub p02: f64,
    pub p98: f64,
}

impl Percentiles {
    pub fn new(p02: f64, p98: f64) -> Self {
        Self { p02, p98 }
    }

    pub fn is_empty(&self) -> bool {
        self.p02 == 0.0 && self.p98 == 0.0
    }
}
