use super::phase::PhaseDirection;
use super::report::CalibrationReport;
use super::round::RoundRecord;
use super::types::*;

fn row(label: &str, values: impl Iterator<Item = f64>) -> String {
    let cells: Vec<String> = values.map(|v| format!("{:>9.3}", v)).collect();
    format!("  {:<8}|{}", label, cells.join(" |"))
}

/*
* @brief Print the power table of one phase
* @param set Phase holding the latest cycle results
* @param bias_volts Bias channel level in volts
* @note One column per CT slot, uninstalled slots read 0.
*/
pub fn print_phase_results(set: &PhaseMeasurementSet, bias_volts: f64) {
    let header: Vec<String> = (1..=CT_CHANNELS).map(|ct| format!("{:>9}", format!("ct{}", ct))).collect();

    log::info!("Phase {}:", set.phase);
    log::info!("  {:<8}|{}", "", header.join(" |"));
    log::info!("{}", row("Watts", set.power.iter().map(|p| p.watts)));
    log::info!("{}", row("Current", set.power.iter().map(|p| p.rms_current)));
    log::info!("{}", row("P.F.", set.power.iter().map(|p| p.power_factor)));
    log::info!("  {:<8}|{:>9.3}", "Voltage", set.power[0].rms_voltage);
    log::info!("  {:<8}|{:>9.3}\n", "Bias_V", bias_volts);
}

/*
* @brief Print an averaged round
* @param record Round emitted by the aggregator
* @param totals Cumulative kWh per CT
*/
pub fn print_round(record: &RoundRecord, totals: &[f64; CT_CHANNELS]) {
    log::info!(
        "Phase {}: round of {} cycles over {:.2} s, {:.2} V",
        record.phase,
        record.cycles,
        record.elapsed_secs(),
        record.voltage
    );
    for (ct, avg) in record.channels.iter().enumerate() {
        log::debug!(
            "  CT{}: {:.2} A  {:.2} W  PF {:.2}  {:.3} kWh",
            ct + 1,
            avg.current,
            avg.power,
            avg.power_factor,
            totals[ct]
        );
    }
}

/*
* @brief Print the outcome of a calibration session
* @param report Before/after comparison of the calibrated CT
*/
pub fn print_calibration(report: &CalibrationReport) {
    log::info!("Calibration of CT{} on phase {}:", report.ct, report.phase);
    log::info!("  Power factor: {:.3}", report.power_factor);
    log::info!(
        "  Initial shift: {:.4} rad ({:.2}º, {})",
        report.initial_shift,
        report.initial_shift.to_degrees(),
        PhaseDirection::from_shift(report.initial_shift).as_str()
    );
    log::info!("  Applied shift: {:.4} rad in {} pass(es)", report.applied_shift, report.passes);
    log::info!(
        "  Residual shift: {:.4} rad ({})\n",
        report.residual_shift,
        if report.converged { "converged" } else { "not converged" }
    );
}
