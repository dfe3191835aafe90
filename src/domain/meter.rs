//! Auto-meter strategies
//!
//! Deterministic meter-value and SoC progression for a connector while a
//! transaction is active. The tick loop itself lives on the charge point
//! (it needs the transport to send MeterValues); this module holds the
//! strategy configuration and the pure per-tick math so the curve shapes
//! are unit-testable.

use serde::{Deserialize, Serialize};

/// SoC above which charge power tapers (CCCV knee).
const TAPER_KNEE_SOC: f64 = 80.0;
/// Power ratio left at 100% SoC.
const TAPER_FLOOR: f64 = 0.2;

fn default_interval_seconds() -> u64 {
    5
}

/// How the meter progresses each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "camelCase")]
pub enum MeterStrategy {
    /// Fixed increment every `interval_seconds`; stops when either limit
    /// is reached.
    #[serde(rename_all = "camelCase")]
    Increment {
        #[serde(default = "default_interval_seconds")]
        interval_seconds: u64,
        increment_value: i64,
        max_time_seconds: Option<u64>,
        max_value: Option<i64>,
    },
    /// Integrates charge power into Wh and SoC, tapering above 80% SoC
    /// with a Li-ion CCCV shape. Stops at SoC ≥ 100%.
    #[serde(rename_all = "camelCase")]
    BatteryCurve {
        capacity_kwh: f64,
        initial_soc: f64,
        max_power_w: f64,
        #[serde(default = "default_interval_seconds")]
        interval_seconds: u64,
    },
}

impl MeterStrategy {
    pub fn interval_seconds(&self) -> u64 {
        match self {
            Self::Increment { interval_seconds, .. }
            | Self::BatteryCurve { interval_seconds, .. } => (*interval_seconds).max(1),
        }
    }
}

/// Auto-meter configuration attached to a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMeterConfig {
    #[serde(flatten)]
    pub strategy: MeterStrategy,
    /// Send a MeterValues CALL after each tick, not just update locally.
    #[serde(default)]
    pub send_meter_values: bool,
}

// ── Battery curve math ─────────────────────────────────────────

/// Charge power at `soc` percent: constant up to the knee, then linear
/// down to `TAPER_FLOOR * max_power_w` at 100%.
pub fn battery_power_w(max_power_w: f64, soc: f64) -> f64 {
    if soc <= TAPER_KNEE_SOC {
        return max_power_w;
    }
    let span = 100.0 - TAPER_KNEE_SOC;
    let over = (soc.min(100.0) - TAPER_KNEE_SOC) / span;
    let ratio = 1.0 - over * (1.0 - TAPER_FLOOR);
    max_power_w * ratio
}

/// One integration step: energy gained over `dt_secs` and the new SoC.
pub fn battery_step(
    capacity_kwh: f64,
    max_power_w: f64,
    soc: f64,
    dt_secs: f64,
) -> (f64, f64) {
    let power = battery_power_w(max_power_w, soc);
    let energy_wh = power * dt_secs / 3600.0;
    let capacity_wh = capacity_kwh * 1000.0;
    let new_soc = if capacity_wh > 0.0 {
        (soc + energy_wh / capacity_wh * 100.0).min(100.0)
    } else {
        100.0
    };
    (energy_wh, new_soc)
}
