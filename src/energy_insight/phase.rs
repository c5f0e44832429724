/* ----------------- Phase Estimation and Correction ------------------ */

use num_complex::Complex;
use realfft::RealFftPlanner;
use rustfft::FftPlanner;

use super::error::{MeterError, MeterResult};
use super::types::PhaseMeasurementSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDirection {
    Lagging, // Current lags voltage (positive shift)
    Leading, // Current leads voltage (negative shift)
    InPhase,
}

impl PhaseDirection {
    pub fn from_shift(shift: f64) -> Self {
        if shift > 1e-6 {
            PhaseDirection::Lagging
        } else if shift < -1e-6 {
            PhaseDirection::Leading
        } else {
            PhaseDirection::InPhase
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseDirection::Lagging => "current lags voltage",
            PhaseDirection::Leading => "current leads voltage",
            PhaseDirection::InPhase => "in phase",
        }
    }
}

/*
* @brief Analytic signal of a real waveform (Hilbert transform).
* @param signal Real waveform
* @return x + j*H(x), same length as the input
* @note Negative frequencies are zeroed and positive ones doubled; DC and the
*       Nyquist bin (even lengths) keep unit weight.
*/
pub fn analytic_signal(signal: &[f64]) -> Vec<Complex<f64>> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f64>> = signal.iter().map(|&s| Complex::new(s, 0.0)).collect();
    forward.process(&mut buffer);

    let half = n / 2;
    for (k, bin) in buffer.iter_mut().enumerate() {
        let weight = if k == 0 || (n % 2 == 0 && k == half) {
            1.0
        } else if k < (n + 1) / 2 {
            2.0
        } else {
            0.0
        };
        *bin *= weight;
    }

    inverse.process(&mut buffer);

    let scale = 1.0 / n as f64;
    buffer.iter().map(|c| c * scale).collect()
}

/*
* @brief Phase offset between a current channel and the voltage reference.
* @param voltage Voltage waveform
* @param current Current waveform, same length as the voltage
* @return Signed angle in radians, positive when the current lags
* @note angle( <Hv, conj(Hi)> / sqrt(<Hv, conj(Hv)> * <Hi, conj(Hi)>) )
* @note A zero energy channel has no defined phase and is reported as an error.
*/
pub fn estimate_phase_shift(voltage: &[f64], current: &[f64]) -> MeterResult<f64> {
    if voltage.len() < 2 || voltage.len() != current.len() {
        return Err(MeterError::DegenerateSignal(format!(
            "phase estimation needs two equal waveforms of at least 2 samples (got {} and {})",
            voltage.len(),
            current.len()
        )));
    }

    let hv = analytic_signal(voltage);
    let hi = analytic_signal(current);

    let cross: Complex<f64> = hv.iter().zip(hi.iter()).map(|(v, i)| v * i.conj()).sum();
    let energy_v: f64 = hv.iter().map(|v| v.norm_sqr()).sum();
    let energy_i: f64 = hi.iter().map(|i| i.norm_sqr()).sum();

    let norm = (energy_v * energy_i).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(MeterError::DegenerateSignal(
            "zero energy waveform, phase offset undefined".into(),
        ));
    }

    Ok((cross / norm).arg())
}

/*
* @brief Shift a waveform in phase through the frequency domain.
* @param signal Real waveform
* @param angle Rotation in radians
* @return Rotated waveform, same length as the input
* @note Every bin with a conjugate partner is multiplied by exp(j*angle), which
*       is a fractional sample time shift. DC and the even-length Nyquist bin
*       are purely real and stay untouched, so +angle then -angle is lossless.
*/
pub fn rotate_phase(signal: &[f64], angle: f64) -> MeterResult<Vec<f64>> {
    let n = signal.len();
    if n < 2 || angle == 0.0 {
        return Ok(signal.to_vec());
    }

    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(n);
    let c2r = planner.plan_fft_inverse(n);

    let mut input = signal.to_vec();
    let mut spectrum = r2c.make_output_vec();
    r2c.process(&mut input, &mut spectrum)
        .map_err(|e| MeterError::Fft(e.to_string()))?;

    let rotation = Complex::from_polar(1.0, angle);
    let last = spectrum.len() - 1;
    for (k, bin) in spectrum.iter_mut().enumerate() {
        if k == 0 || (n % 2 == 0 && k == last) {
            bin.im = 0.0;
            continue;
        }
        *bin *= rotation;
    }

    let mut output = c2r.make_output_vec();
    c2r.process(&mut spectrum, &mut output)
        .map_err(|e| MeterError::Fft(e.to_string()))?;

    let scale = 1.0 / n as f64;
    Ok(output.iter().map(|s| s * scale).collect())
}

impl PhaseMeasurementSet {
    /// Phase offset of one CT (0-based) against the voltage reference.
    pub fn estimate_phase_shift(&self, ct: usize) -> MeterResult<f64> {
        estimate_phase_shift(&self.samples.vac, &self.samples.ct[ct])
    }

    /// Rotate one CT waveform in place.
    pub fn shift_phase(&mut self, ct: usize, amount: f64) -> MeterResult<()> {
        let shifted = rotate_phase(&self.samples.ct[ct], amount)?;
        self.samples.ct[ct] = shifted;
        Ok(())
    }

    /// Apply the configured static shift of every installed CT.
    pub fn apply_phase_corrections(&mut self) -> MeterResult<()> {
        for ct in 0..self.ct_count() {
            let shift = self.calibration.cts[ct].shift;
            if shift != 0.0 {
                self.shift_phase(ct, shift)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy_insight::generate_signal::sine_wave;

    const FS: f64 = 20_000.0;
    const F: f64 = 50.0;
    const N: usize = 1600; // 4 full cycles

    fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    #[test]
    fn rotation_round_trip_restores_waveform() {
        let mut wave = sine_wave(10.0, F, FS, N, 0.2);
        let third = sine_wave(2.0, 3.0 * F, FS, N, 0.0);
        for (w, h) in wave.iter_mut().zip(third) {
            *w += h + 1.5; // harmonic plus DC
        }

        let there = rotate_phase(&wave, 0.7).unwrap();
        let back = rotate_phase(&there, -0.7).unwrap();

        assert_eq!(back.len(), wave.len());
        assert!(max_abs_diff(&back, &wave) < 1e-9);
    }

    #[test]
    fn rotation_keeps_odd_lengths() {
        let wave = sine_wave(1.0, F, FS, 401, 0.0);
        let rotated = rotate_phase(&wave, 0.3).unwrap();
        assert_eq!(rotated.len(), 401);
        let back = rotate_phase(&rotated, -0.3).unwrap();
        assert!(max_abs_diff(&back, &wave) < 1e-9);
    }

    #[test]
    fn estimates_injected_offset_and_corrects_it() {
        let delta = 0.25;
        let voltage = sine_wave(325.0, F, FS, N, 0.0);
        let current = sine_wave(11.3, F, FS, N, -delta); // lags by delta

        let estimate = estimate_phase_shift(&voltage, &current).unwrap();
        assert!((estimate - delta).abs() < 1e-6, "estimate {estimate}");
        assert_eq!(PhaseDirection::from_shift(estimate), PhaseDirection::Lagging);

        let corrected = rotate_phase(&current, estimate).unwrap();
        let residual = estimate_phase_shift(&voltage, &corrected).unwrap();
        assert!(residual.abs() < 1e-6, "residual {residual}");
    }

    #[test]
    fn leading_current_gives_negative_shift() {
        let voltage = sine_wave(325.0, F, FS, N, 0.0);
        let current = sine_wave(5.0, F, FS, N, 0.4);
        let estimate = estimate_phase_shift(&voltage, &current).unwrap();
        assert!((estimate + 0.4).abs() < 1e-6);
    }

    #[test]
    fn zero_energy_channel_is_an_error() {
        let voltage = sine_wave(325.0, F, FS, N, 0.0);
        let silent = vec![0.0; N];
        assert!(matches!(
            estimate_phase_shift(&voltage, &silent),
            Err(MeterError::DegenerateSignal(_))
        ));
        assert!(estimate_phase_shift(&voltage[..1], &silent[..1]).is_err());
    }

    #[test]
    fn analytic_signal_of_cosine_has_unit_magnitude() {
        let wave = sine_wave(1.0, F, FS, N, std::f64::consts::FRAC_PI_2);
        let analytic = analytic_signal(&wave);
        for c in analytic.iter().skip(10).take(100) {
            assert!((c.norm() - 1.0).abs() < 1e-9);
        }
    }
}
