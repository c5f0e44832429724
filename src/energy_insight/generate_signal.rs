use ndarray::Array1;
use rand::Rng;
use std::f64::consts::{PI, SQRT_2};

use super::types::*;

const DEFAULT_VOLTAGE_RMS: f64 = 230.0;
const DEFAULT_CURRENTS_RMS: [f64; CT_CHANNELS] = [8.0, 8.0, 2.0, 3.0, 0.5, 50.0];
const DEFAULT_CURRENT_PHASES: [f64; CT_CHANNELS] = [0.45, 0.30, 0.15, -0.30, -0.45, -0.60];

/// Sinusoid sampled at `sample_rate`: amplitude * sin(2*pi*f*t + phase).
pub fn sine_wave(amplitude: f64, frequency: f64, sample_rate: f64, samples: usize, phase: f64) -> Vec<f64> {
    let t = Array1::range(0.0, samples as f64, 1.0);
    t.iter()
        .map(|&s| amplitude * (2.0 * PI * frequency / sample_rate * s + phase).sin())
        .collect()
}

/// Physical signals synthesised for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalProfile {
    pub voltage_rms: f64,
    pub frequency: f64,
    pub currents_rms: [f64; CT_CHANNELS],
    pub current_phases: [f64; CT_CHANNELS], // Radians, negative lags voltage
    pub noise_percent: f64,                 // Random noise relative to each peak
}

impl Default for SignalProfile {
    fn default() -> Self {
        Self {
            voltage_rms: DEFAULT_VOLTAGE_RMS,
            frequency: FREQ_NOMINAL_50,
            currents_rms: DEFAULT_CURRENTS_RMS,
            current_phases: DEFAULT_CURRENT_PHASES,
            noise_percent: 0.0,
        }
    }
}

fn to_counts(value: f64, factor: f64, bias: i32) -> i32 {
    if factor == 0.0 {
        return bias;
    }
    (value / factor).round() as i32 + bias
}

/*
* @brief Generate raw ADC frames of one phase from a signal profile.
* @param profile Voltage and current waveforms to synthesise
* @param calibration Channel layout and factors used to turn values into counts
* @param bias_counts Mid scale level seen on the bias channel
* @param sample_rate Samples per second
* @param start_sample Index of the first sample, keeps consecutive cycles continuous
* @param samples Number of frames
* @return One frame per sample with every physical channel filled
*/
pub fn generate_phase_frames(
    profile: &SignalProfile,
    calibration: &PhaseCalibration,
    bias_counts: i32,
    sample_rate: f64,
    start_sample: u64,
    samples: usize,
) -> Vec<AdcFrame> {
    let mut rng = rand::thread_rng();
    let omega = 2.0 * PI * profile.frequency / sample_rate;
    let v_peak = profile.voltage_rms * SQRT_2;

    (0..samples)
        .map(|i| {
            let s = (start_sample + i as u64) as f64;
            let mut frame = [bias_counts; ADC_CHANNELS];

            let mut noise = |peak: f64| {
                if profile.noise_percent > 0.0 {
                    peak * profile.noise_percent / 100.0 * rng.gen_range(-1.0..1.0)
                } else {
                    0.0
                }
            };

            let v = v_peak * (omega * s).sin() + noise(v_peak);
            frame[calibration.vac_channel] = to_counts(v, calibration.vac_factor, bias_counts);

            for (ct, cal) in calibration.cts.iter().enumerate() {
                let i_peak = profile.currents_rms[ct] * SQRT_2;
                let current = i_peak * (omega * s + profile.current_phases[ct]).sin() + noise(i_peak);
                frame[cal.adc_channel] = to_counts(current, cal.factor, bias_counts);
            }

            frame[calibration.bias_channel] = bias_counts;
            frame
        })
        .collect()
}
