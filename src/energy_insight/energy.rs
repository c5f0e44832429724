use chrono::{DateTime, Utc};

use super::config::{ConfigStore, MeterConfig};
use super::error::MeterResult;
use super::round::RoundRecord;
use super::types::*;

/*
 * WATT_SECONDS_PER_KWH (3600 * 1000) converts watt-seconds (joules) to kWh:
 * 3600 seconds in an hour times 1000 watts in a kilowatt.
 * elapsed_secs is the wall clock length of the round the power was averaged over.
 */
pub fn integrate_energy(avg_watts: f64, elapsed_secs: f64) -> f64 {
    (avg_watts * elapsed_secs) / WATT_SECONDS_PER_KWH
}

/// Cumulative total of one CT as last written to the configuration store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersistedEnergy {
    pub kwh: f64,
    pub reset_utc: Option<DateTime<Utc>>, // None: never set
}

/*
* @brief Compare a freshly computed total against the persisted one.
* @param persisted Total and reset timestamp currently stored
* @param computed Cumulative total the engine holds now
* @param now Timestamp recorded when a reset is detected
* @return New persisted record and whether a reset was recorded
* @note A missing reset timestamp, or a total that moved backwards, means the
*       meter or its storage was reset: the new total is stored with a fresh
*       reset timestamp instead of being logged as a decrease.
*/
pub fn reconcile(persisted: &PersistedEnergy, computed: f64, now: DateTime<Utc>) -> (PersistedEnergy, bool) {
    let reset = persisted.reset_utc.is_none() || persisted.kwh > computed;
    let reset_utc = if reset { Some(now) } else { persisted.reset_utc };

    (
        PersistedEnergy {
            kwh: computed,
            reset_utc,
        },
        reset,
    )
}

/// Integrates round averages into cumulative kWh and keeps the persisted view in sync.
#[derive(Debug, Clone)]
pub struct EnergyLedger {
    persisted: Vec<Vec<PersistedEnergy>>, // [phase][ct]
}

impl EnergyLedger {
    pub fn from_config(config: &MeterConfig) -> Self {
        let persisted = config
            .phases
            .iter()
            .map(|phase| {
                phase
                    .cts
                    .iter()
                    .map(|ct| PersistedEnergy {
                        kwh: ct.kwh,
                        reset_utc: ct.reset_utc,
                    })
                    .collect()
            })
            .collect();

        Self { persisted }
    }

    /*
    * @brief Check the totals loaded at startup before the engine accepts them.
    * @param sets Phase sets holding the loaded totals
    * @param now Timestamp for totals that were never stamped
    * @return Number of channels that got a reset timestamp
    */
    pub fn accept_loaded(&mut self, sets: &[PhaseMeasurementSet], now: DateTime<Utc>) -> usize {
        self.reconcile_all(sets, now)
    }

    /*
    * @brief Add the energy of one averaged round to the phase totals.
    * @param set Phase whose totals are updated
    * @param record Averaged round of that phase
    * @return Energy added per CT in kWh
    */
    pub fn apply_round(&self, set: &mut PhaseMeasurementSet, record: &RoundRecord) -> Vec<f64> {
        let elapsed = record.elapsed_secs();

        record
            .channels
            .iter()
            .zip(set.energy.iter_mut())
            .map(|(avg, total)| {
                let energy = integrate_energy(avg.power, elapsed);
                *total += energy;
                energy
            })
            .collect()
    }

    /*
    * @brief Write the current totals to the configuration store.
    * @param sets Phase sets with the running totals
    * @param store Configuration store to update and flush
    * @param now Timestamp for detected resets
    * @return Number of channels where a reset was recorded
    */
    pub fn persist(
        &mut self,
        sets: &[PhaseMeasurementSet],
        store: &mut ConfigStore,
        now: DateTime<Utc>,
    ) -> MeterResult<usize> {
        let resets = self.reconcile_all(sets, now);

        for (p, phase) in self.persisted.iter().enumerate() {
            for (c, record) in phase.iter().enumerate() {
                store.set_energy(p, c, record.kwh, record.reset_utc);
            }
        }
        store.flush()?;

        log::info!("Energy totals persisted ({} reset(s) recorded)", resets);
        Ok(resets)
    }

    fn reconcile_all(&mut self, sets: &[PhaseMeasurementSet], now: DateTime<Utc>) -> usize {
        let mut resets = 0;

        for (phase, set) in self.persisted.iter_mut().zip(sets.iter()) {
            for (ct, record) in phase.iter_mut().enumerate() {
                let (updated, reset) = reconcile(record, set.energy[ct], now);
                if reset {
                    log::info!(
                        "Phase {} CT {}: counter reset recorded ({:.3} kWh stored, {:.3} kWh computed)",
                        set.phase,
                        ct + 1,
                        record.kwh,
                        set.energy[ct]
                    );
                    resets += 1;
                }
                *record = updated;
            }
        }

        resets
    }
}
