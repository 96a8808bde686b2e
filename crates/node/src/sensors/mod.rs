//! Concrete measurement sources.  Each one reaches its hardware through a
//! small trait so the host build can plug in simulated parts.

pub mod atmospheric;
pub mod battery;
pub mod rain;
pub mod soil_temp;

use crate::persist::Slot;

// Retained `LastUpdate` slot per sensor.  Fixed so the table layout is stable
// across firmware builds.
pub const RAIN_SLOT: Slot = Slot::LastUpdate(0);
pub const SOIL_TEMP_SLOT: Slot = Slot::LastUpdate(1);
pub const ATMOSPHERIC_SLOT: Slot = Slot::LastUpdate(2);
pub const BATTERY_SLOT: Slot = Slot::LastUpdate(3);
