use chrono::{DateTime, Utc};

pub const FREQ_NOMINAL_50: f64 = 50.0;

pub const ADC_CHANNELS: usize = 8; // MCP3008: 8 single ended inputs
pub const CT_CHANNELS: usize = 6;
pub const MAX_PHASES: usize = 3;

pub const DEFAULT_BATCH_SIZE: usize = 5;

/* RMS currents below 100 mA are swinging around 0 */
pub const CURRENT_NOISE_FLOOR: f64 = 0.10;

/* 3600 s/h * 1000 W/kW: watt-seconds to kWh */
pub const WATT_SECONDS_PER_KWH: f64 = 3_600_000.0;

/// One raw frame per sample instant: one reading per physical ADC channel.
pub type AdcFrame = [i32; ADC_CHANNELS];

/// Physical ADC channels requested from the acquisition driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMask(pub u8);

impl ChannelMask {
    pub const ALL: ChannelMask = ChannelMask(0xff);

    pub fn from_channels(channels: &[usize]) -> Self {
        ChannelMask(
            channels
                .iter()
                .filter(|&&c| c < ADC_CHANNELS)
                .fold(0u8, |mask, &c| mask | (1 << c)),
        )
    }

    pub fn contains(&self, channel: usize) -> bool {
        channel < ADC_CHANNELS && self.0 & (1 << channel) != 0
    }

    /// Channel list as understood by the SPI helper (`"01234567"`).
    pub fn as_digits(&self) -> String {
        (0..ADC_CHANNELS)
            .filter(|&c| self.contains(c))
            .map(|c| char::from(b'0' + c as u8))
            .collect()
    }
}

/// Raw samples of one acquisition cycle for every channel of one phase.
#[derive(Debug, Clone)]
pub struct ChannelBuffer {
    pub frames: Vec<AdcFrame>,     // One frame per sample, fixed channel order
    pub acquired_at: DateTime<Utc>, // Wall clock at the first sample
    pub sample_rate: f64,           // Samples per second
}

impl ChannelBuffer {
    pub fn new(frames: Vec<AdcFrame>, acquired_at: DateTime<Utc>, sample_rate: f64) -> Self {
        Self {
            frames,
            acquired_at,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Readings of one physical channel across the whole cycle.
    pub fn channel(&self, channel: usize) -> Vec<i32> {
        self.frames.iter().map(|frame| frame[channel]).collect()
    }
}

/// Conditioned waveforms (volts, amps) of one phase for one cycle.
#[derive(Debug, Clone, Default)]
pub struct PhaseSamples {
    pub t: Vec<f64>,                     // Epoch seconds per sample
    pub vac: Vec<f64>,                   // Voltage reference in volts
    pub ct: [Vec<f64>; CT_CHANNELS],     // Current channels in amps
    pub bias: Vec<f64>,                  // Bias channel after its own factor
}

impl PhaseSamples {
    pub fn len(&self) -> usize {
        self.vac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vac.is_empty()
    }
}

/// Power results of one CT channel for one cycle (or a round average).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelPower {
    pub rms_voltage: f64,
    pub rms_current: f64,
    pub watts: f64,
    pub apparent_power: f64,
    pub power_factor: f64,
}

impl ChannelPower {
    /// Reporting view, all values rounded to 2 decimals.
    pub fn rounded(&self) -> ChannelPower {
        ChannelPower {
            rms_voltage: round2(self.rms_voltage),
            rms_current: round2(self.rms_current),
            watts: round2(self.watts),
            apparent_power: round2(self.apparent_power),
            power_factor: round2(self.power_factor),
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Calibration of one current channel, already resolved to engine units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibration {
    pub adc_channel: usize, // Physical ADC input
    pub factor: f64,        // Effective counts to amps factor
    pub shift: f64,         // Static phase correction in radians
    pub cutoff: f64,        // Minimum |watts|, 0 disables
}

/// Per-phase calibration resolved from the configuration store.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCalibration {
    pub vac_channel: usize,
    pub vac_factor: f64, // Counts to volts, includes transformer and divider ratio
    pub bias_channel: usize,
    pub bias_factor: f64,
    pub cts: Vec<ChannelCalibration>, // Installed CTs, at most CT_CHANNELS
}

impl PhaseCalibration {
    pub fn ct_count(&self) -> usize {
        self.cts.len()
    }

    pub fn cutoff(&self, ct: usize) -> f64 {
        self.cts.get(ct).map(|c| c.cutoff).unwrap_or(0.0)
    }

    pub fn channel_mask(&self) -> ChannelMask {
        let mut channels = vec![self.vac_channel, self.bias_channel];
        channels.extend(self.cts.iter().map(|c| c.adc_channel));
        ChannelMask::from_channels(&channels)
    }
}

/// State of one electrical phase, owned by the control loop and mutated each cycle.
#[derive(Debug, Clone)]
pub struct PhaseMeasurementSet {
    pub phase: usize, // 1-based phase number
    pub samples: PhaseSamples,
    pub calibration: PhaseCalibration,
    pub energy: [f64; CT_CHANNELS], // Cumulative kWh per CT, written by the energy ledger only
    pub power: [ChannelPower; CT_CHANNELS],
}

impl PhaseMeasurementSet {
    pub fn new(phase: usize, calibration: PhaseCalibration, totals: [f64; CT_CHANNELS]) -> Self {
        Self {
            phase,
            samples: PhaseSamples::default(),
            calibration,
            energy: totals,
            power: [ChannelPower::default(); CT_CHANNELS],
        }
    }

    pub fn ct_count(&self) -> usize {
        self.calibration.ct_count()
    }
}
