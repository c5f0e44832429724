mod common;

use chrono::Utc;
use std::f64::consts::SQRT_2;

use energy_insight::generate_signal::sine_wave;
use energy_insight::{calculate_channel_power, AcquisitionDriver, ChannelBuffer, PhaseMeasurementSet, SignalProfile};

use common::{simulated, test_config};

const FS: f64 = 20_000.0;
const F: f64 = 50.0;
const CYCLE: usize = 400;

fn within_percent(value: f64, expected: f64, percent: f64) -> bool {
    (value - expected).abs() <= expected.abs() * percent / 100.0
}

#[test]
fn nominal_load_reads_230_v_8_a() {
    let v = sine_wave(230.0 * SQRT_2, F, FS, CYCLE, 0.0);
    let i = sine_wave(8.0 * SQRT_2, F, FS, CYCLE, 0.0);

    let p = calculate_channel_power(&v, &i, 0.0).rounded();

    assert!(within_percent(p.rms_voltage, 230.0, 0.5), "{:?}", p);
    assert!(within_percent(p.rms_current, 8.0, 0.5), "{:?}", p);
    assert!(within_percent(p.watts, 1840.0, 0.5), "{:?}", p);
    assert!(within_percent(p.power_factor, 1.0, 0.5), "{:?}", p);
}

#[test]
fn current_below_noise_floor_reads_zero_watts() {
    let v = sine_wave(230.0 * SQRT_2, F, FS, CYCLE, 0.0);
    let i = sine_wave(0.05 * SQRT_2, F, FS, CYCLE, 0.0);

    let p = calculate_channel_power(&v, &i, 0.0).rounded();

    assert_eq!(p.rms_current, 0.00);
    assert_eq!(p.watts, 0.00);
    assert!(within_percent(p.rms_voltage, 230.0, 0.5));
}

#[test]
fn raw_frames_through_the_whole_pipeline() {
    let config = test_config();
    let calibration = config.calibration_table().phases[0].clone();
    let profile = SignalProfile {
        currents_rms: [8.0, 0.05, 0.0, 0.0, 0.0, 0.0],
        current_phases: [0.0; 6],
        ..SignalProfile::default()
    };

    let mut driver = simulated(&config, 0, profile);
    let frames = driver.read(calibration.channel_mask(), CYCLE).unwrap();
    assert_eq!(frames.len(), CYCLE);

    let mut set = PhaseMeasurementSet::new(1, calibration, config.totals(0));
    set.load_cycle(&ChannelBuffer::new(frames, Utc::now(), FS));
    set.apply_phase_corrections().unwrap();
    let power = set.calculate_power();

    let ct1 = power[0].rounded();
    assert!(within_percent(ct1.rms_voltage, 230.0, 0.5), "{:?}", ct1);
    assert!(within_percent(ct1.rms_current, 8.0, 0.5), "{:?}", ct1);
    assert!(within_percent(ct1.watts, 1840.0, 0.5), "{:?}", ct1);
    assert!(within_percent(ct1.power_factor, 1.0, 0.5), "{:?}", ct1);

    let ct2 = power[1].rounded();
    assert_eq!(ct2.rms_current, 0.0);
    assert_eq!(ct2.watts, 0.0);

    // Slots without a CT stay silent
    assert_eq!(power[5].watts, 0.0);
}

#[test]
fn static_shift_is_applied_before_power() {
    let mut config = test_config();
    config.phases[0].cts[0].shift = 0.3;
    let calibration = config.calibration_table().phases[0].clone();

    // CT lags the voltage by exactly the configured shift
    let profile = SignalProfile {
        currents_rms: [8.0; 6],
        current_phases: [-0.3; 6],
        ..SignalProfile::default()
    };
    let mut driver = simulated(&config, 0, profile);
    let frames = driver.read(calibration.channel_mask(), CYCLE).unwrap();

    let mut set = PhaseMeasurementSet::new(1, calibration, [0.0; 6]);
    set.load_cycle(&ChannelBuffer::new(frames, Utc::now(), FS));

    let uncorrected = *set.calculate_power();
    assert!(within_percent(uncorrected[0].power_factor, 0.3f64.cos(), 0.5));

    set.apply_phase_corrections().unwrap();
    let corrected = set.calculate_power();
    assert!(within_percent(corrected[0].power_factor, 1.0, 0.5), "{:?}", corrected[0]);
    // CT 2 has no shift configured and keeps its lag
    assert!(within_percent(corrected[1].power_factor, 0.3f64.cos(), 0.5));
}
