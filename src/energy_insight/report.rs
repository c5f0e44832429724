use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::error::MeterResult;
use super::types::*;

/// Before/after comparison produced by a calibration session.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub phase: usize,          // 1-based
    pub ct: usize,             // 1-based
    pub power_factor: f64,     // PF measured after orientation check
    pub initial_shift: f64,    // Estimate before any correction, radians
    pub residual_shift: f64,   // Estimate after the last correction
    pub applied_shift: f64,    // Sum of all rotations applied
    pub passes: usize,
    pub converged: bool,
    pub original: Vec<f64>,    // CT waveform before correction
    pub corrected: Vec<f64>,   // CT waveform after correction
    pub voltage: Vec<f64>,
}

impl CalibrationReport {
    pub fn artifact_name(&self) -> String {
        format!("CT{}-phase-{}-correction-result.csv", self.ct, self.phase)
    }
}

/// Renders a calibration report to some artefact.
pub trait ReportRenderer {
    /// Returns a description of where the report went.
    fn render(&mut self, report: &CalibrationReport) -> MeterResult<String>;
}

/// Writes the waveform comparison as CSV into a directory.
#[derive(Debug, Clone)]
pub struct CsvReportRenderer {
    dir: PathBuf,
}

impl CsvReportRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ReportRenderer for CsvReportRenderer {
    fn render(&mut self, report: &CalibrationReport) -> MeterResult<String> {
        let path = self.dir.join(report.artifact_name());
        let mut out = BufWriter::new(File::create(&path)?);

        writeln!(
            out,
            "# phase={} ct={} initial_shift={:.6} residual_shift={:.6} applied_shift={:.6} passes={} converged={}",
            report.phase,
            report.ct,
            report.initial_shift,
            report.residual_shift,
            report.applied_shift,
            report.passes,
            report.converged
        )?;
        writeln!(out, "Sample#,original,corrected,voltage")?;
        for (i, ((orig, corr), v)) in report
            .original
            .iter()
            .zip(&report.corrected)
            .zip(&report.voltage)
            .enumerate()
        {
            writeln!(out, "{},{},{},{}", i, orig, corr, v)?;
        }
        out.flush()?;

        log::info!("Calibration report written to {}", path.display());
        Ok(path.display().to_string())
    }
}

/*
* @brief Dump the conditioned samples of one phase to CSV.
* @param dir Output directory
* @param set Phase holding the last cycle
* @param now Timestamp used in the file name
* @return Path of the written file
*/
pub fn dump_samples(dir: &Path, set: &PhaseMeasurementSet, now: DateTime<Utc>) -> MeterResult<PathBuf> {
    let path = dir.join(format!(
        "data-dump-phase{}-{}.csv",
        set.phase,
        now.format("%m-%d-%Y-%H-%M")
    ));
    let mut out = BufWriter::new(File::create(&path)?);

    writeln!(out, "Sample#,ct1,ct2,ct3,ct4,ct5,ct6,voltage")?;
    for (i, v) in set.samples.vac.iter().enumerate() {
        write!(out, "{}", i)?;
        for ct in &set.samples.ct {
            write!(out, ",{}", ct.get(i).copied().unwrap_or(0.0))?;
        }
        writeln!(out, ",{}", v)?;
    }
    out.flush()?;

    Ok(path)
}
