use super::types::*;

/*
* @brief Remove the bias and scale one raw channel to physical units.
* @param raw Raw ADC readings of the channel
* @param bias Raw ADC readings of the bias channel, same instants
* @param factor Counts to volts/amps factor
* @return Conditioned waveform, same length as the input
* @note conditioned[i] = (raw[i] - bias[i]) * factor
*/
pub fn condition_channel(raw: &[i32], bias: &[i32], factor: f64) -> Vec<f64> {
    raw.iter()
        .zip(bias.iter())
        .map(|(&r, &b)| (r - b) as f64 * factor)
        .collect()
}

/*
* @brief Wall clock time of every sample of a cycle.
* @param buffer Raw cycle buffer
* @return Epoch seconds per sample
*/
pub fn sample_timestamps(buffer: &ChannelBuffer) -> Vec<f64> {
    let start = buffer.acquired_at.timestamp_micros() as f64 / 1_000_000.0;
    let period = if buffer.sample_rate > 0.0 { 1.0 / buffer.sample_rate } else { 0.0 };

    (0..buffer.len()).map(|i| start + i as f64 * period).collect()
}

/*
* @brief Condition one acquisition cycle of a phase.
* @param buffer Raw cycle buffer with every physical channel
* @param calibration Channel layout and factors of the phase
* @return Conditioned voltage, CT and bias waveforms
* @note CTs that are not installed stay as zero waveforms of the cycle length.
*/
pub fn condition_cycle(buffer: &ChannelBuffer, calibration: &PhaseCalibration) -> PhaseSamples {
    let bias = buffer.channel(calibration.bias_channel);
    let length = buffer.len();

    let mut samples = PhaseSamples {
        t: sample_timestamps(buffer),
        vac: condition_channel(&buffer.channel(calibration.vac_channel), &bias, calibration.vac_factor),
        ct: Default::default(),
        bias: bias.iter().map(|&b| b as f64 * calibration.bias_factor).collect(),
    };

    for (ct, wave) in samples.ct.iter_mut().enumerate() {
        *wave = match calibration.cts.get(ct) {
            Some(cal) => condition_channel(&buffer.channel(cal.adc_channel), &bias, cal.factor),
            None => vec![0.0; length],
        };
    }

    samples
}

/*
* @brief Average bias channel level in volts.
* @param raw_bias Raw ADC readings of the bias channel
* @param adc_resolution Full scale ADC count
* @param vref ADC reference voltage
* @param factor Bias channel correction factor
* @return Bias voltage, 0 for an empty buffer
*/
pub fn bias_voltage(raw_bias: &[i32], adc_resolution: f64, vref: f64, factor: f64) -> f64 {
    if raw_bias.is_empty() {
        return 0.0;
    }

    let avg_reading = raw_bias.iter().map(|&b| b as f64).sum::<f64>() / raw_bias.len() as f64;
    (avg_reading / adc_resolution) * vref * factor
}

impl PhaseMeasurementSet {
    /// Overwrite the samples with a freshly acquired cycle.
    pub fn load_cycle(&mut self, buffer: &ChannelBuffer) {
        self.samples = condition_cycle(buffer, &self.calibration);
    }
}
