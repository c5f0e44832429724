use super::types::*;

/*
* @brief Calculate RMS, real power and power factor of one CT channel.
* @param voltage Conditioned voltage waveform
* @param current Conditioned current waveform, same length
* @param cutoff Minimum |real power| in watts, 0 disables the cutoff
* @return Full precision power results
* @note DC offsets left after the bias removal are subtracted from every term.
* @note RMS currents under the noise floor read 0 and carry no real power.
* @note A zero apparent power gives PF 0.
*/
pub fn calculate_channel_power(voltage: &[f64], current: &[f64], cutoff: f64) -> ChannelPower {
    let num_samples = voltage.len().min(current.len());
    if num_samples == 0 {
        return ChannelPower::default();
    }

    let mut sum_raw_voltage = 0.0;
    let mut sum_raw_current = 0.0;
    let mut sum_squared_voltage = 0.0;
    let mut sum_squared_current = 0.0;
    let mut sum_inst_power = 0.0;

    // Single pass over the cycle
    for (&v, &i) in voltage.iter().zip(current.iter()) {
        sum_raw_voltage += v;
        sum_raw_current += i;
        sum_squared_voltage += v * v;
        sum_squared_current += i * i;
        sum_inst_power += v * i;
    }

    let n = num_samples as f64;
    let avg_voltage = sum_raw_voltage / n;
    let avg_current = sum_raw_current / n;

    let mut real_power = sum_inst_power / n - avg_voltage * avg_current;

    let rms_voltage = (sum_squared_voltage / n - avg_voltage * avg_voltage).abs().sqrt();
    let mut rms_current = (sum_squared_current / n - avg_current * avg_current).abs().sqrt();
    if rms_current.abs() < CURRENT_NOISE_FLOOR {
        rms_current = 0.0;
        real_power = 0.0;
    }

    let apparent_power = rms_voltage * rms_current;
    let mut power_factor = if apparent_power != 0.0 {
        real_power / apparent_power
    } else {
        0.0
    };

    if cutoff != 0.0 && real_power.abs() < cutoff {
        real_power = 0.0;
        power_factor = 0.0;
    }

    ChannelPower {
        rms_voltage,
        rms_current,
        watts: real_power,
        apparent_power,
        power_factor,
    }
}

impl PhaseMeasurementSet {
    /// Power results of every CT slot for the current samples; uninstalled CTs read 0.
    pub fn calculate_power(&mut self) -> &[ChannelPower; CT_CHANNELS] {
        for ct in 0..CT_CHANNELS {
            self.power[ct] = calculate_channel_power(
                &self.samples.vac,
                &self.samples.ct[ct],
                self.calibration.cutoff(ct),
            );
        }

        &self.power
    }
}
