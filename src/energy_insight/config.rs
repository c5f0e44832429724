use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

use super::error::{MeterError, MeterResult};
use super::types::*;

/// Installation, calibration and persisted totals as stored in `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    pub general: GeneralConfig,
    pub ct: CtConfig,
    #[serde(default)]
    pub influx: InfluxConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Samples per acquisition cycle
    pub adc_samples: usize,
    pub adc_resolution: f64,
    pub vref: f64,
    /// Samples per second the ADC delivers
    pub sample_rate: f64,
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    /// Cycles averaged into one emitted round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: usize,
}

fn default_frequency() -> f64 {
    FREQ_NOMINAL_50
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_failures() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtConfig {
    pub burden_resistance: f64,
    pub winding_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_influx_url() -> String {
    "http://localhost:8086".into()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Residual phase error (radians) accepted as converged
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Estimate/rotate passes before giving up on convergence
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_max_passes() -> usize {
    1
}

fn default_report_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            max_passes: default_max_passes(),
            report_dir: default_report_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub channel: usize,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Nominal mains voltage at the transformer primary
    pub voltage: f64,
    pub transformer_output_voltage: f64,
    pub transformer_divider: f64,
    pub vac: InputConfig,
    pub bias: InputConfig,
    #[serde(default)]
    pub cts: Vec<CtChannelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtChannelConfig {
    pub channel: usize,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub shift: f64,
    #[serde(default)]
    pub cutoff: f64,
    #[serde(default)]
    pub kwh: f64,
    /// Last detected counter reset; absent means never set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_utc: Option<DateTime<Utc>>,
}

impl MeterConfig {
    /// Load TOML from disk, apply INFLUX_URL/INFLUX_TOKEN overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> MeterResult<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let mut cfg: Self = toml::from_str(&raw)?;

        if let Ok(url) = env::var("INFLUX_URL") {
            cfg.influx.url = url;
        }
        if let Ok(token) = env::var("INFLUX_TOKEN") {
            cfg.influx.token = token;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> MeterResult<()> {
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> MeterResult<()> {
        let g = &self.general;
        if g.adc_samples < 2 {
            return Err(MeterError::Config("general.adc_samples must be at least 2".into()));
        }
        if g.adc_resolution <= 0.0 || g.vref <= 0.0 || g.sample_rate <= 0.0 {
            return Err(MeterError::Config(
                "general.adc_resolution, vref and sample_rate must be positive".into(),
            ));
        }
        if g.batch_size == 0 {
            return Err(MeterError::Config("general.batch_size must be at least 1".into()));
        }
        if self.ct.burden_resistance <= 0.0 || self.ct.winding_ratio <= 0.0 {
            return Err(MeterError::Config(
                "ct.burden_resistance and ct.winding_ratio must be positive".into(),
            ));
        }
        if self.phases.is_empty() || self.phases.len() > MAX_PHASES {
            return Err(MeterError::Config(format!(
                "expected 1 to {} phases, found {}",
                MAX_PHASES,
                self.phases.len()
            )));
        }

        for (p, phase) in self.phases.iter().enumerate() {
            if phase.cts.len() > CT_CHANNELS {
                return Err(MeterError::Config(format!(
                    "phase {} declares {} CTs, at most {} are supported",
                    p + 1,
                    phase.cts.len(),
                    CT_CHANNELS
                )));
            }
            if phase.transformer_output_voltage <= 0.0 || phase.transformer_divider <= 0.0 {
                return Err(MeterError::Config(format!(
                    "phase {} transformer_output_voltage and transformer_divider must be positive",
                    p + 1
                )));
            }

            let mut used = [false; ADC_CHANNELS];
            let inputs = [phase.vac.channel, phase.bias.channel]
                .into_iter()
                .chain(phase.cts.iter().map(|ct| ct.channel));
            for channel in inputs {
                if channel >= ADC_CHANNELS {
                    return Err(MeterError::Config(format!(
                        "phase {} uses ADC channel {}, only 0..{} exist",
                        p + 1,
                        channel,
                        ADC_CHANNELS - 1
                    )));
                }
                if used[channel] {
                    return Err(MeterError::Config(format!(
                        "phase {} uses ADC channel {} twice",
                        p + 1,
                        channel
                    )));
                }
                used[channel] = true;
            }

            for (c, ct) in phase.cts.iter().enumerate() {
                if ct.kwh.is_nan() || ct.kwh < 0.0 {
                    return Err(MeterError::Config(format!(
                        "phase {} ct {} has a negative or invalid kwh total",
                        p + 1,
                        c + 1
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Counts to amps: ADC volts through the burden resistor and winding ratio.
    pub fn ct_adc_factor(&self) -> f64 {
        (self.general.vref / self.general.adc_resolution) / (self.ct.burden_resistance / self.ct.winding_ratio)
    }

    /// Counts to volts: ADC volts through the divider and the transformer ratio.
    pub fn vac_adc_factor(&self, phase: usize) -> f64 {
        let cfg = &self.phases[phase];
        (self.general.vref / self.general.adc_resolution)
            * (cfg.voltage / (cfg.transformer_output_voltage / cfg.transformer_divider))
    }

    pub fn calibration_table(&self) -> CalibrationTable {
        let ct_factor = self.ct_adc_factor();
        let phases = self
            .phases
            .iter()
            .enumerate()
            .map(|(p, cfg)| PhaseCalibration {
                vac_channel: cfg.vac.channel,
                vac_factor: cfg.vac.factor * self.vac_adc_factor(p),
                bias_channel: cfg.bias.channel,
                bias_factor: cfg.bias.factor,
                cts: cfg
                    .cts
                    .iter()
                    .map(|ct| ChannelCalibration {
                        adc_channel: ct.channel,
                        factor: ct.factor * ct_factor,
                        shift: ct.shift,
                        cutoff: ct.cutoff,
                    })
                    .collect(),
            })
            .collect();

        CalibrationTable { phases }
    }

    /// Persisted kWh per CT of one phase (0-based), unused CTs read 0.
    pub fn totals(&self, phase: usize) -> [f64; CT_CHANNELS] {
        let mut totals = [0.0; CT_CHANNELS];
        for (c, ct) in self.phases[phase].cts.iter().enumerate() {
            totals[c] = ct.kwh;
        }
        totals
    }

    pub fn ct(&self, phase: usize, ct: usize) -> Option<&CtChannelConfig> {
        self.phases.get(phase).and_then(|p| p.cts.get(ct))
    }

    pub fn ct_mut(&mut self, phase: usize, ct: usize) -> Option<&mut CtChannelConfig> {
        self.phases.get_mut(phase).and_then(|p| p.cts.get_mut(ct))
    }
}

/// Strongly typed calibration constants indexed by (phase, ct), both 0-based.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    pub phases: Vec<PhaseCalibration>,
}

impl CalibrationTable {
    pub fn phase(&self, phase: usize) -> Option<&PhaseCalibration> {
        self.phases.get(phase)
    }

    pub fn channel(&self, phase: usize, ct: usize) -> Option<&ChannelCalibration> {
        self.phases.get(phase).and_then(|p| p.cts.get(ct))
    }
}

/// Owner of the configuration file: the engine reads it once and writes back
/// totals, reset timestamps and calibrated shifts.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: MeterConfig,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> MeterResult<Self> {
        let path = path.into();
        let config = MeterConfig::load(&path)?;
        Ok(Self {
            path: Some(path),
            config,
        })
    }

    /// Store without backing file, flushes are no-ops.
    pub fn in_memory(config: MeterConfig) -> MeterResult<Self> {
        config.validate()?;
        Ok(Self { path: None, config })
    }

    /// In-memory copy for modes that must leave the file alone.
    pub fn detached(&self) -> Self {
        Self {
            path: None,
            config: self.config.clone(),
        }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn set_energy(&mut self, phase: usize, ct: usize, kwh: f64, reset_utc: Option<DateTime<Utc>>) {
        if let Some(cfg) = self.config.ct_mut(phase, ct) {
            cfg.kwh = kwh;
            cfg.reset_utc = reset_utc;
        }
    }

    pub fn set_shift(&mut self, phase: usize, ct: usize, shift: f64) {
        if let Some(cfg) = self.config.ct_mut(phase, ct) {
            cfg.shift = shift;
        }
    }

    pub fn flush(&self) -> MeterResult<()> {
        match &self.path {
            Some(path) => {
                self.config.save(path)?;
                log::debug!("Configuration written to {}", path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_CONFIG: &str = r#"
[general]
adc_samples = 400
adc_resolution = 1023.0
vref = 3.3
sample_rate = 20000.0
batch_size = 5

[ct]
burden_resistance = 24.0
winding_ratio = 2000.0

[influx]
url = "http://influx.local:8086"
org = "home"
bucket = "power"
token = "secret"

[[phases]]
voltage = 230.0
transformer_output_voltage = 9.0
transformer_divider = 11.0
vac = { channel = 3 }
bias = { channel = 7 }

[[phases.cts]]
channel = 0
kwh = 12.5
reset_utc = "2024-01-01T00:00:00Z"

[[phases.cts]]
channel = 1
shift = 0.05
cutoff = 5.0
"#;

    pub(crate) fn sample_config() -> MeterConfig {
        toml::from_str(SAMPLE_CONFIG).expect("sample config parses")
    }

    #[test]
    fn parses_defaults_and_validates() {
        let cfg = sample_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.general.frequency, 50.0);
        assert_eq!(cfg.calibration.max_passes, 1);
        assert_eq!(cfg.phases[0].cts[1].cutoff, 5.0);
        assert!(cfg.phases[0].cts[1].reset_utc.is_none());
        assert!(cfg.phases[0].cts[0].reset_utc.is_some());
    }

    #[test]
    fn rejects_duplicate_adc_channel() {
        let mut cfg = sample_config();
        cfg.phases[0].cts[1].channel = 3;
        assert!(matches!(cfg.validate(), Err(MeterError::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_channel_and_phase_count() {
        let mut cfg = sample_config();
        cfg.phases[0].cts[0].channel = 8;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.phases = vec![cfg.phases[0].clone(); 4];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn calibration_table_folds_adc_scaling_into_factors() {
        let cfg = sample_config();
        let table = cfg.calibration_table();
        let phase = table.phase(0).unwrap();

        let ct_factor = (3.3 / 1023.0) / (24.0 / 2000.0);
        let vac_factor = (3.3 / 1023.0) * (230.0 / (9.0 / 11.0));
        assert!((phase.cts[0].factor - ct_factor).abs() < 1e-12);
        assert!((phase.vac_factor - vac_factor).abs() < 1e-9);
        assert_eq!(table.channel(0, 1).unwrap().shift, 0.05);
        assert!(table.channel(0, 2).is_none());
        assert_eq!(cfg.totals(0), [12.5, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }
}
