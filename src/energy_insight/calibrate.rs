/* ----------------- Interactive CT Phase Calibration ------------------ */

use chrono::Utc;
use std::collections::VecDeque;

use super::acquisition::AcquisitionDriver;
use super::config::ConfigStore;
use super::error::{MeterError, MeterResult};
use super::print::print_calibration;
use super::report::{CalibrationReport, ReportRenderer};
use super::types::*;

/// Source of operator answers; a terminal in the binary, a script in tests.
pub trait OperatorInput {
    /// Show a question and return the answer line, None once input is closed.
    fn prompt(&mut self, message: &str) -> Option<String>;

    fn notify(&mut self, message: &str) {
        log::info!("{}", message);
    }
}

/// Replays canned answers and records everything shown to the operator.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    answers: VecDeque<String>,
    pub prompts: Vec<String>,
    pub notices: Vec<String>,
}

impl ScriptedInput {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl OperatorInput for ScriptedInput {
    fn prompt(&mut self, message: &str) -> Option<String> {
        self.prompts.push(message.to_string());
        self.answers.pop_front()
    }

    fn notify(&mut self, message: &str) {
        self.notices.push(message.to_string());
    }
}

/// Stage the session runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalibrationStep {
    SelectTarget,
    VerifyOrientation,
    Estimate,
    Apply,
    Report,
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    Completed(CalibrationReport),
    Aborted, // Operator declined to continue
}

const RESISTIVE_LOAD_NOTICE: &str = "IMPORTANT: make sure the current transformer is installed over a purely \
resistive load and that the load is turned on before continuing with the calibration.";
const REVERSED_NOTICE: &str = "Current transformer is installed backwards. Unclip it from the conductor and \
clip it on so the current flows the opposite direction from the CT's perspective.";

/// Selected target and intermediate results, discarded when the session ends.
#[derive(Debug, Default)]
struct SessionState {
    phase: usize, // 0-based
    ct: usize,    // 0-based
    power_factor: f64,
    previous_shift: f64,
    new_shift: f64,
    applied_shift: f64,
    passes: usize,
    snapshot: Vec<f64>,
    set: Option<PhaseMeasurementSet>,
}

/// Estimate and correct the phase error of one CT.
pub struct CalibrationSession<'a> {
    store: &'a mut ConfigStore,
    drivers: &'a mut [Box<dyn AcquisitionDriver>],
    step: CalibrationStep,
    state: SessionState,
}

impl<'a> CalibrationSession<'a> {
    /// `drivers` holds one acquisition driver per configured phase.
    pub fn new(store: &'a mut ConfigStore, drivers: &'a mut [Box<dyn AcquisitionDriver>]) -> Self {
        Self {
            store,
            drivers,
            step: CalibrationStep::SelectTarget,
            state: SessionState::default(),
        }
    }

    /*
    * @brief Drive the session until it completes, aborts or fails.
    * @param input Operator answers
    * @param renderer Destination of the before/after report
    * @return Completed with the report, or Aborted when the operator declines
    * @note A CT that still reads a negative PF after reversal ends the session
    *       with InstallationFault; closed input ends it with OperatorInputClosed.
    */
    pub fn run(&mut self, input: &mut dyn OperatorInput, renderer: &mut dyn ReportRenderer) -> MeterResult<SessionEnd> {
        loop {
            log::debug!("Calibration step {:?}", self.step);
            self.step = match self.step {
                CalibrationStep::SelectTarget => {
                    if !self.select_target(input)? {
                        continue;
                    }
                    input.notify(RESISTIVE_LOAD_NOTICE);
                    if !confirm(input, "Continue? [Y/n]: ")? {
                        input.notify("Calibration aborted.");
                        return Ok(SessionEnd::Aborted);
                    }
                    CalibrationStep::VerifyOrientation
                }
                CalibrationStep::VerifyOrientation => {
                    self.verify_orientation(input)?;
                    CalibrationStep::Estimate
                }
                CalibrationStep::Estimate => {
                    self.estimate()?;
                    CalibrationStep::Apply
                }
                CalibrationStep::Apply => {
                    self.apply()?;
                    CalibrationStep::Report
                }
                CalibrationStep::Report => {
                    let report = self.report(input, renderer)?;
                    return Ok(SessionEnd::Completed(report));
                }
            };
        }
    }

    /// True once a valid phase and installed CT were chosen.
    fn select_target(&mut self, input: &mut dyn OperatorInput) -> MeterResult<bool> {
        let phase_count = self.store.config().phase_count();

        let phase = ask_number(
            input,
            &format!("Which PHASE are you calibrating on? Enter the number Phase [1 - {}]: ", phase_count),
        )?;
        let phase = match phase {
            Some(p) if (1..=phase_count).contains(&p) => p - 1,
            _ => {
                input.notify(&format!("Please choose a PHASE from 1 to {}.", phase_count));
                return Ok(false);
            }
        };

        let ct = ask_number(
            input,
            &format!(
                "Which CT number are you calibrating? Enter the number of the CT label [1 - {}]: ",
                CT_CHANNELS
            ),
        )?;
        let installed = self.store.config().phases[phase].cts.len();
        let ct = match ct {
            Some(c) if (1..=CT_CHANNELS).contains(&c) && c <= installed => c - 1,
            Some(c) if (1..=CT_CHANNELS).contains(&c) => {
                input.notify(&format!("CT {} is not installed on phase {}.", c, phase + 1));
                return Ok(false);
            }
            _ => {
                input.notify(&format!("Please choose a CT number from 1 to {}.", CT_CHANNELS));
                return Ok(false);
            }
        };

        self.state = SessionState {
            phase,
            ct,
            ..SessionState::default()
        };
        log::info!("Calibrating CT {} on phase {}", ct + 1, phase + 1);
        Ok(true)
    }

    fn verify_orientation(&mut self, input: &mut dyn OperatorInput) -> MeterResult<()> {
        let (phase, ct) = (self.state.phase, self.state.ct);

        let mut set = self.measure(phase)?;
        let mut pf = set.power[ct].power_factor;

        if pf < 0.0 {
            input.notify(REVERSED_NOTICE);
            if input.prompt("Press ENTER to continue when you've reversed your CT.").is_none() {
                return Err(MeterError::OperatorInputClosed);
            }

            set = self.measure(phase)?;
            pf = set.power[ct].power_factor;
            if pf < 0.0 {
                input.notify(
                    "It still looks like the current transformer is installed backwards. \
                     Are you sure this is a resistive load?",
                );
                return Err(MeterError::InstallationFault {
                    phase: phase + 1,
                    channel: ct + 1,
                });
            }
        }

        log::info!("Phase {} CT {}: power factor {:.3}", phase + 1, ct + 1, pf);
        self.state.power_factor = pf;
        self.state.set = Some(set);
        Ok(())
    }

    fn estimate(&mut self) -> MeterResult<()> {
        let ct = self.state.ct;
        let set = self.current_set()?;

        let shift = set.estimate_phase_shift(ct)?;
        let snapshot = set.samples.ct[ct].clone();

        log::info!("Estimated phase shift: {:.6} rad", shift);
        self.state.snapshot = snapshot;
        self.state.previous_shift = shift;
        self.state.new_shift = shift;
        Ok(())
    }

    /// Rotate by the residual until it is within tolerance or the pass budget is spent.
    fn apply(&mut self) -> MeterResult<()> {
        let calibration = &self.store.config().calibration;
        let (tolerance, max_passes) = (calibration.tolerance, calibration.max_passes.max(1));
        let ct = self.state.ct;

        let mut residual = self.state.new_shift;
        let mut applied = 0.0;
        let mut passes = 0;

        let set = self.state.set.as_mut().ok_or_else(missing_cycle)?;
        while passes < max_passes {
            set.shift_phase(ct, residual)?;
            applied += residual;
            passes += 1;

            residual = set.estimate_phase_shift(ct)?;
            log::info!("Pass {}: residual phase shift {:.6} rad", passes, residual);

            if residual.abs() <= tolerance {
                break;
            }
        }

        self.state.new_shift = residual;
        self.state.applied_shift = applied;
        self.state.passes = passes;
        Ok(())
    }

    fn report(&mut self, input: &mut dyn OperatorInput, renderer: &mut dyn ReportRenderer) -> MeterResult<CalibrationReport> {
        let tolerance = self.store.config().calibration.tolerance;
        let (phase, ct) = (self.state.phase, self.state.ct);
        let set = self.current_set()?;

        let report = CalibrationReport {
            phase: phase + 1,
            ct: ct + 1,
            power_factor: self.state.power_factor,
            initial_shift: self.state.previous_shift,
            residual_shift: self.state.new_shift,
            applied_shift: self.state.applied_shift,
            passes: self.state.passes,
            converged: self.state.new_shift.abs() <= tolerance,
            original: self.state.snapshot.clone(),
            corrected: set.samples.ct[ct].clone(),
            voltage: set.samples.vac.clone(),
        };

        print_calibration(&report);
        let location = renderer.render(&report)?;
        input.notify(&format!("Calibration report written to {}", location));

        if confirm(
            input,
            &format!("Store shift {:.6} for CT {} of phase {}? [Y/n]: ", report.applied_shift, report.ct, report.phase),
        )? {
            self.store.set_shift(phase, ct, report.applied_shift);
            self.store.flush()?;
            log::info!("Shift of CT {} on phase {} stored", report.ct, report.phase);
        }

        Ok(report)
    }

    fn current_set(&self) -> MeterResult<&PhaseMeasurementSet> {
        self.state.set.as_ref().ok_or_else(missing_cycle)
    }

    /// One uncorrected cycle of a phase with its power computed.
    fn measure(&mut self, phase: usize) -> MeterResult<PhaseMeasurementSet> {
        let config = self.store.config();
        let mut calibration = config
            .calibration_table()
            .phase(phase)
            .cloned()
            .ok_or_else(|| MeterError::Config(format!("phase {} is not configured", phase + 1)))?;
        for ct in calibration.cts.iter_mut() {
            ct.shift = 0.0;
        }

        let (samples, sample_rate) = (config.general.adc_samples, config.general.sample_rate);
        let mut set = PhaseMeasurementSet::new(phase + 1, calibration, config.totals(phase));

        let driver = self
            .drivers
            .get_mut(phase)
            .ok_or_else(|| MeterError::Acquisition(format!("no driver for phase {}", phase + 1)))?;
        let acquired_at = Utc::now();
        let frames = driver.read(set.calibration.channel_mask(), samples)?;

        set.load_cycle(&ChannelBuffer::new(frames, acquired_at, sample_rate));
        set.calculate_power();
        Ok(set)
    }
}

fn missing_cycle() -> MeterError {
    MeterError::Acquisition("no calibration cycle acquired".into())
}

/// Parsed number, None for anything that is not a positive integer.
fn ask_number(input: &mut dyn OperatorInput, message: &str) -> MeterResult<Option<usize>> {
    let answer = input.prompt(message).ok_or(MeterError::OperatorInputClosed)?;
    Ok(answer.trim().parse::<usize>().ok())
}

/// Yes/no question, an empty answer means yes.
fn confirm(input: &mut dyn OperatorInput, message: &str) -> MeterResult<bool> {
    loop {
        let answer = input.prompt(message).ok_or(MeterError::OperatorInputClosed)?;
        match answer.trim().to_lowercase().as_str() {
            "" | "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            other => input.notify(&format!("Please answer yes or no (got {:?}).", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_defaults_to_yes_and_reprompts() {
        let mut input = ScriptedInput::new(&["maybe", ""]);
        assert!(confirm(&mut input, "Continue? ").unwrap());
        assert_eq!(input.prompts.len(), 2);
        assert_eq!(input.notices.len(), 1);

        let mut input = ScriptedInput::new(&["No"]);
        assert!(!confirm(&mut input, "Continue? ").unwrap());
    }

    #[test]
    fn closed_input_is_reported() {
        let mut input = ScriptedInput::new(&[]);
        assert!(matches!(
            confirm(&mut input, "Continue? "),
            Err(MeterError::OperatorInputClosed)
        ));
        assert!(matches!(
            ask_number(&mut input, "Phase? "),
            Err(MeterError::OperatorInputClosed)
        ));
    }

    #[test]
    fn non_numeric_answer_is_not_a_number() {
        let mut input = ScriptedInput::new(&["two", " 2 "]);
        assert_eq!(ask_number(&mut input, "Phase? ").unwrap(), None);
        assert_eq!(ask_number(&mut input, "Phase? ").unwrap(), Some(2));
    }
}
