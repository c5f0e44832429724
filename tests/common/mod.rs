#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::cell::Cell;
use std::path::{Path, PathBuf};

use energy_insight::{AcquisitionDriver, Clock, MeterConfig, SignalProfile, SimulatedAdc};

pub const TEST_CONFIG: &str = r#"
[general]
adc_samples = 400
adc_resolution = 65535.0
vref = 3.3
sample_rate = 20000.0
batch_size = 5

[ct]
burden_resistance = 24.0
winding_ratio = 2000.0

[influx]
bucket = "power"

[calibration]
tolerance = 0.01
max_passes = 3

[[phases]]
voltage = 230.0
transformer_output_voltage = 9.0
transformer_divider = 11.0
vac = { channel = 3 }
bias = { channel = 7 }

[[phases.cts]]
channel = 0

[[phases.cts]]
channel = 1
kwh = 4.0
reset_utc = "2024-01-01T00:00:00Z"

[[phases]]
voltage = 230.0
transformer_output_voltage = 9.0
transformer_divider = 11.0
vac = { channel = 2 }
bias = { channel = 7 }

[[phases.cts]]
channel = 4
kwh = 1.5
reset_utc = "2024-01-01T00:00:00Z"
"#;

pub const START: i64 = 1_700_000_000;

pub fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, TEST_CONFIG).unwrap();
    path
}

pub fn test_config() -> MeterConfig {
    toml::from_str(TEST_CONFIG).unwrap()
}

/// Advances by a fixed step every time it is read.
pub struct SteppingClock {
    now: Cell<DateTime<Utc>>,
    step: Duration,
}

impl SteppingClock {
    pub fn new(step: Duration) -> Self {
        Self {
            now: Cell::new(start()),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

pub fn start() -> DateTime<Utc> {
    Utc.timestamp_opt(START, 0).unwrap()
}

pub fn simulated(config: &MeterConfig, phase: usize, profile: SignalProfile) -> Box<dyn AcquisitionDriver> {
    let calibration = config.calibration_table().phases[phase].clone();
    let bias = (config.general.adc_resolution / 2.0).round() as i32;
    Box::new(SimulatedAdc::new(profile, calibration, bias, config.general.sample_rate))
}

/// 230 V with in-phase 8 A on every CT.
pub fn resistive_profile() -> SignalProfile {
    SignalProfile {
        currents_rms: [8.0; 6],
        current_phases: [0.0; 6],
        ..SignalProfile::default()
    }
}
