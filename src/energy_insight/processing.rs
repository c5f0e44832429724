use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::acquisition::{capture_path, write_capture, AcquisitionDriver};
use super::config::{ConfigStore, GeneralConfig};
use super::energy::EnergyLedger;
use super::error::{MeterError, MeterResult};
use super::print::{print_phase_results, print_round};
use super::report::dump_samples;
use super::round::{RoundAggregator, RoundRecord, SuperRound};
use super::signal::bias_voltage;
use super::sink::{round_points, total_points, TimeSeriesSink};
use super::types::*;

/// Wall clock used for round timing and reset timestamps.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Continuous metering loop: owns every phase, its aggregator and the energy ledger.
pub struct MeterEngine<S: TimeSeriesSink> {
    sets: Vec<PhaseMeasurementSet>,
    aggregators: Vec<RoundAggregator>,
    super_round: SuperRound,
    ledger: EnergyLedger,
    store: ConfigStore,
    drivers: Vec<Box<dyn AcquisitionDriver>>,
    sink: S,
    clock: Box<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    host: String,
    general: GeneralConfig,
    failures: Vec<usize>, // Consecutive failed cycles per phase
}

impl<S: TimeSeriesSink> MeterEngine<S> {
    /*
    * @brief Build the engine from the configuration store.
    * @param store Validated configuration, also the persistence target
    * @param drivers One acquisition driver per configured phase
    * @param sink Destination of the emitted rounds
    * @param clock Wall clock
    * @param shutdown Cooperative cancellation flag, checked between cycles
    * @param host Host tag of the emitted points
    * @note Loaded totals go through reset detection before they are accepted.
    */
    pub fn new(
        mut store: ConfigStore,
        drivers: Vec<Box<dyn AcquisitionDriver>>,
        sink: S,
        clock: Box<dyn Clock>,
        shutdown: Arc<AtomicBool>,
        host: impl Into<String>,
    ) -> MeterResult<Self> {
        let config = store.config().clone();
        if drivers.len() != config.phase_count() {
            return Err(MeterError::Config(format!(
                "{} phases configured but {} acquisition drivers given",
                config.phase_count(),
                drivers.len()
            )));
        }

        let table = config.calibration_table();
        let sets: Vec<PhaseMeasurementSet> = table
            .phases
            .iter()
            .enumerate()
            .map(|(p, cal)| PhaseMeasurementSet::new(p + 1, cal.clone(), config.totals(p)))
            .collect();
        let aggregators = sets
            .iter()
            .map(|set| RoundAggregator::new(set.phase, set.ct_count(), config.general.batch_size))
            .collect();

        let mut ledger = EnergyLedger::from_config(&config);
        let now = clock.now();
        if ledger.accept_loaded(&sets, now) > 0 {
            ledger.persist(&sets, &mut store, now)?;
        }

        Ok(Self {
            super_round: SuperRound::new(sets.len()),
            sets,
            aggregators,
            ledger,
            store,
            drivers,
            sink,
            clock,
            shutdown,
            host: host.into(),
            failures: vec![0; config.phase_count()],
            general: config.general,
        })
    }

    pub fn sets(&self) -> &[PhaseMeasurementSet] {
        &self.sets
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn aggregator(&self, phase: usize) -> Option<&RoundAggregator> {
        self.aggregators.get(phase)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Read one cycle of a phase (0-based) and log the achieved sample rate.
    fn acquire(&mut self, phase: usize) -> MeterResult<ChannelBuffer> {
        let mask = self.sets[phase].calibration.channel_mask();
        let acquired_at = self.clock.now();

        let start = Instant::now();
        let frames = self.drivers[phase].read(mask, self.general.adc_samples)?;
        let duration = start.elapsed().as_secs_f64();

        if duration > 0.0 {
            log::debug!(
                "Phase {}: {} samples in {:.3} s ({:.2} KSPS)",
                phase + 1,
                frames.len(),
                duration,
                frames.len() as f64 / duration / 1000.0
            );
        }

        Ok(ChannelBuffer::new(frames, acquired_at, self.general.sample_rate))
    }

    /*
    * @brief Acquire, condition and compute one cycle of a phase.
    * @param phase 0-based phase index
    * @return The averaged round once the batch is complete, energy already applied
    */
    pub fn run_cycle(&mut self, phase: usize) -> MeterResult<Option<RoundRecord>> {
        self.aggregators[phase].begin_cycle(self.clock.now());

        let buffer = self.acquire(phase)?;
        let set = &mut self.sets[phase];
        set.load_cycle(&buffer);
        set.apply_phase_corrections()?;
        let power = *set.calculate_power();

        let now = self.clock.now();
        let aggregator = &mut self.aggregators[phase];
        aggregator.record_cycle(&power, now);

        match aggregator.flush(now) {
            Some(record) => {
                self.ledger.apply_round(&mut self.sets[phase], &record);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Emit a flushed round and persist the totals when the super-round completes.
    fn complete_round(&mut self, phase: usize, record: RoundRecord) -> MeterResult<RoundRecord> {
        let totals = self.sets[phase].energy;
        print_round(&record, &totals);

        let points = round_points(&record, &totals, &self.host);
        let written = self.sink.write(&points);
        if let Err(e) = &written {
            log::warn!("Phase {}: {} points dropped: {}", phase + 1, points.len(), e);
        }

        if self.super_round.mark_flushed(phase) {
            let now = self.clock.now();
            self.ledger.persist(&self.sets, &mut self.store, now)?;
        }

        written.map(|_| record)
    }

    fn record_failure(&mut self, phase: usize, error: MeterError) -> MeterResult<()> {
        self.failures[phase] += 1;
        log::error!(
            "Phase {}: cycle skipped ({} consecutive failures): {}",
            phase + 1,
            self.failures[phase],
            error
        );

        if self.failures[phase] > self.general.max_consecutive_failures {
            return Err(error);
        }
        Ok(())
    }

    /*
    * @brief One pass of the outer loop: one cycle of every phase in order.
    * @return Rounds flushed during this pass
    * @note Failed cycles are skipped; the run aborts once more than
    *       max_consecutive_failures cycles of the same phase failed in a row.
    */
    pub fn step(&mut self) -> MeterResult<Vec<RoundRecord>> {
        let mut flushed = Vec::new();

        if self.aggregators.first().map(|a| a.cycles() == 0).unwrap_or(false) {
            log::debug!("Starting new round");
        }

        for phase in 0..self.sets.len() {
            if self.is_shutdown() {
                break;
            }

            let outcome = match self.run_cycle(phase) {
                Ok(Some(record)) => self.complete_round(phase, record).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(record) => {
                    self.failures[phase] = 0;
                    flushed.extend(record);
                }
                Err(e) => self.record_failure(phase, e)?,
            }
        }

        Ok(flushed)
    }

    /// Run until the shutdown flag is raised or too many cycles failed.
    pub fn run(&mut self) -> MeterResult<()> {
        log::info!(
            "Starting energy meter: {} phase(s), {} samples per cycle, rounds of {} cycles",
            self.sets.len(),
            self.general.adc_samples,
            self.general.batch_size
        );

        let mut outcome = Ok(());
        while !self.is_shutdown() {
            if let Err(e) = self.step() {
                outcome = Err(e);
                break;
            }
        }

        let flushed = self.shutdown();
        outcome.and(flushed)
    }

    /*
    * @brief Graceful stop: drop partial rounds, persist the totals, write them once
    *        more and close the sink.
    * @return Result of the persistence, sink errors are only logged
    */
    pub fn shutdown(&mut self) -> MeterResult<()> {
        for aggregator in self.aggregators.iter_mut() {
            let dropped = aggregator.discard();
            if dropped > 0 {
                log::info!("Partial round of {} cycle(s) discarded", dropped);
            }
        }

        let now = self.clock.now();
        let persisted = self.ledger.persist(&self.sets, &mut self.store, now).map(|_| ());

        let totals = total_points(&self.sets, &self.host, now.timestamp_millis());
        if let Err(e) = self.sink.write(&totals) {
            log::warn!("Final write of {} totals failed: {}", totals.len(), e);
        }
        if let Err(e) = self.sink.close() {
            log::warn!("Closing the time-series sink failed: {}", e);
        }

        log::info!("Energy meter stopped");
        persisted
    }

    /*
    * @brief Debug mode: one cycle per phase, printed and dumped to CSV.
    * @param dump_dir Directory of the data-dump files and raw captures
    */
    pub fn debug_cycle(&mut self, dump_dir: &Path) -> MeterResult<()> {
        for phase in 0..self.sets.len() {
            let buffer = self.acquire(phase)?;
            let general = &self.general;
            let set = &mut self.sets[phase];

            set.load_cycle(&buffer);
            set.apply_phase_corrections()?;
            set.calculate_power();

            let bias = bias_voltage(
                &buffer.channel(set.calibration.bias_channel),
                general.adc_resolution,
                general.vref,
                set.calibration.bias_factor,
            );
            print_phase_results(set, bias);

            let path = dump_samples(dump_dir, set, buffer.acquired_at)?;
            log::info!("Samples of phase {} written to {}", set.phase, path.display());

            let capture = capture_path(dump_dir, phase);
            write_capture(&capture, &buffer.frames)?;
            log::debug!("Raw frames of phase {} written to {}", set.phase, capture.display());
        }
        Ok(())
    }

    /// Speedtest mode: acquire every phase until interrupted and log the sample rate.
    pub fn speedtest(&mut self) -> MeterResult<()> {
        log::info!("Measuring acquisition speed, press Ctrl-C to stop");

        while !self.is_shutdown() {
            for phase in 0..self.sets.len() {
                let start = Instant::now();
                let buffer = self.acquire(phase)?;
                let duration = start.elapsed().as_secs_f64();
                let ksps = if duration > 0.0 {
                    buffer.len() as f64 / duration / 1000.0
                } else {
                    f64::INFINITY
                };
                log::info!(
                    "Phase {}: {} samples in {:.2} ms, {:.2} KSPS",
                    phase + 1,
                    buffer.len(),
                    duration * 1000.0,
                    ksps
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy_insight::acquisition::{ReplayAdc, SimulatedAdc};
    use crate::energy_insight::config::tests::sample_config;
    use crate::energy_insight::generate_signal::SignalProfile;
    use crate::energy_insight::sink::MemorySink;
    use chrono::{Duration, TimeZone};
    use std::cell::Cell;

    struct SteppingClock {
        now: Cell<DateTime<Utc>>,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let now = self.now.get();
            self.now.set(now + Duration::milliseconds(100));
            now
        }
    }

    struct FailingAdc;

    impl AcquisitionDriver for FailingAdc {
        fn read(&mut self, _mask: ChannelMask, _sample_count: usize) -> MeterResult<Vec<AdcFrame>> {
            Err(MeterError::Acquisition("short read".into()))
        }
    }

    fn engine(driver: Box<dyn AcquisitionDriver>) -> MeterEngine<MemorySink> {
        let mut config = sample_config();
        config.general.max_consecutive_failures = 2;
        let store = ConfigStore::in_memory(config).unwrap();
        let clock = SteppingClock {
            now: Cell::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
        };

        MeterEngine::new(
            store,
            vec![driver],
            MemorySink::new(),
            Box::new(clock),
            Arc::new(AtomicBool::new(false)),
            "test",
        )
        .unwrap()
    }

    fn simulated() -> Box<dyn AcquisitionDriver> {
        let config = sample_config();
        let calibration = config.calibration_table().phases[0].clone();
        Box::new(SimulatedAdc::new(SignalProfile::default(), calibration, 512, 20_000.0))
    }

    #[test]
    fn startup_stamps_totals_without_reset_timestamp() {
        let engine = engine(simulated());
        let cts = &engine.store().config().phases[0].cts;
        assert!(cts[0].reset_utc.is_some());
        assert_eq!(cts[1].reset_utc, Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        assert_eq!(
            cts[0].reset_utc,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn batch_of_cycles_emits_one_round() {
        let mut engine = engine(simulated());

        for _ in 0..4 {
            assert!(engine.step().unwrap().is_empty());
        }
        let rounds = engine.step().unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].cycles, 5);
        assert_eq!(engine.sink().points.len(), 5); // voltage + 2 x (current, total)
        assert!(engine.sets()[0].energy[0] > 12.5);
        assert_eq!(engine.aggregator(0).unwrap().cycles(), 0);
    }

    #[test]
    fn consecutive_failures_abort_the_run() {
        let mut engine = engine(Box::new(FailingAdc));

        assert!(engine.step().is_ok());
        assert!(engine.step().is_ok());
        assert!(matches!(engine.step(), Err(MeterError::Acquisition(_))));
        assert!(engine.run().is_err());
        assert!(engine.sink().closed);
    }

    #[test]
    fn shutdown_discards_partial_round_and_persists() {
        let mut engine = engine(simulated());
        engine.step().unwrap();
        engine.step().unwrap();
        assert_eq!(engine.aggregator(0).unwrap().cycles(), 2);

        engine.shutdown().unwrap();
        assert_eq!(engine.aggregator(0).unwrap().cycles(), 0);
        assert_eq!(engine.store().config().phases[0].cts[0].kwh, 12.5);
        assert!(engine.sink().closed);

        // Only the final totals are written, no round
        let points = &engine.sink().points;
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.measurement == "total"));
        assert_eq!(points[0].fields["total"], 12.5);
        assert_eq!(points[1].tags["sensor"], "2");
    }

    #[test]
    fn debug_cycle_dumps_samples_and_a_replayable_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(simulated());
        engine.debug_cycle(dir.path()).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("data-dump-phase1-") && n.ends_with(".csv")));

        let replay = ReplayAdc::open(dir.path().join("capture-phase1.bin")).unwrap();
        assert_eq!(replay.frames(), 400);
        assert!(engine.sink().points.is_empty());
    }
}
