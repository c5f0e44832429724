use chrono::{DateTime, Utc};

use super::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Filling,
    Flush,
}

/// Per-cycle samples of one CT collected during a round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSamples {
    pub current: Vec<f64>,
    pub power: Vec<f64>,
    pub power_factor: Vec<f64>,
}

/// Everything collected for one phase since the round started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundAccumulator {
    pub voltage: Vec<f64>,
    pub channels: Vec<ChannelSamples>,
    pub count: usize,
}

impl RoundAccumulator {
    pub fn new(ct_count: usize) -> Self {
        Self {
            voltage: Vec::new(),
            channels: vec![ChannelSamples::default(); ct_count],
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelAverage {
    pub current: f64,
    pub power: f64,
    pub power_factor: f64,
}

/// Averaged results of one emitted round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub phase: usize,
    pub cycles: usize,
    pub voltage: f64,
    pub channels: Vec<ChannelAverage>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RoundRecord {
    pub fn elapsed_secs(&self) -> f64 {
        (self.ended_at - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
    }

    /// Timestamp the round is reported at: halfway between start and end.
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.started_at + (self.ended_at - self.started_at) / 2
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.midpoint().timestamp_millis()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Batches consecutive cycles of one phase into averaged rounds.
#[derive(Debug, Clone)]
pub struct RoundAggregator {
    phase: usize,
    batch_size: usize,
    accumulator: RoundAccumulator,
    started_at: Option<DateTime<Utc>>,
}

impl RoundAggregator {
    pub fn new(phase: usize, ct_count: usize, batch_size: usize) -> Self {
        Self {
            phase,
            batch_size: batch_size.max(1),
            accumulator: RoundAccumulator::new(ct_count),
            started_at: None,
        }
    }

    pub fn state(&self) -> RoundState {
        if self.accumulator.count >= self.batch_size {
            RoundState::Flush
        } else {
            RoundState::Filling
        }
    }

    pub fn cycles(&self) -> usize {
        self.accumulator.count
    }

    pub fn accumulator(&self) -> &RoundAccumulator {
        &self.accumulator
    }

    /// Mark the wall clock start of the round before its first cycle is acquired.
    pub fn begin_cycle(&mut self, now: DateTime<Utc>) {
        if self.accumulator.is_empty() && self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /*
    * @brief Append the results of one cycle to the round.
    * @param results Per-CT power of the cycle, at least one entry per installed CT
    * @param now Wall clock used when begin_cycle was not called
    * @return State after the cycle, Flush once the batch is complete
    */
    pub fn record_cycle(&mut self, results: &[ChannelPower], now: DateTime<Utc>) -> RoundState {
        if self.state() == RoundState::Flush {
            log::warn!("Phase {}: round already complete, cycle dropped", self.phase);
            return RoundState::Flush;
        }
        self.begin_cycle(now);

        let voltage = results.first().map(|p| p.rms_voltage).unwrap_or(0.0);
        self.accumulator.voltage.push(voltage);

        for (samples, power) in self.accumulator.channels.iter_mut().zip(results.iter()) {
            samples.current.push(power.rms_current);
            samples.power.push(power.watts);
            samples.power_factor.push(power.power_factor);
        }

        self.accumulator.count += 1;
        self.state()
    }

    /*
    * @brief Average the completed round and start a new one.
    * @param now Wall clock at the end of the round
    * @return The averaged round, None while the batch is still filling
    */
    pub fn flush(&mut self, now: DateTime<Utc>) -> Option<RoundRecord> {
        if self.state() != RoundState::Flush {
            return None;
        }

        let started_at = self.started_at.unwrap_or(now);
        let ct_count = self.accumulator.channels.len();
        let acc = std::mem::replace(&mut self.accumulator, RoundAccumulator::new(ct_count));
        self.started_at = None;

        let channels = acc
            .channels
            .iter()
            .map(|c| ChannelAverage {
                current: mean(&c.current),
                power: mean(&c.power),
                power_factor: mean(&c.power_factor),
            })
            .collect();

        Some(RoundRecord {
            phase: self.phase,
            cycles: acc.count,
            voltage: mean(&acc.voltage),
            channels,
            started_at,
            ended_at: now,
        })
    }

    /// Drop a partially filled round, it never reached a consistent boundary.
    pub fn discard(&mut self) -> usize {
        let dropped = self.accumulator.count;
        self.accumulator = RoundAccumulator::new(self.accumulator.channels.len());
        self.started_at = None;
        dropped
    }
}

/// Tracks which phases flushed since the last super-round.
#[derive(Debug, Clone)]
pub struct SuperRound {
    flushed: Vec<bool>,
}

impl SuperRound {
    pub fn new(phase_count: usize) -> Self {
        Self {
            flushed: vec![false; phase_count],
        }
    }

    /// Record a flush of one phase (0-based); true once every phase flushed.
    pub fn mark_flushed(&mut self, phase: usize) -> bool {
        if let Some(flag) = self.flushed.get_mut(phase) {
            *flag = true;
        }

        if self.flushed.iter().all(|&f| f) {
            self.flushed.iter_mut().for_each(|f| *f = false);
            true
        } else {
            false
        }
    }
}
