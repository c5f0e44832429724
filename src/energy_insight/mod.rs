pub mod types;
pub mod error;
pub mod config;
pub mod signal;
pub mod phase;
pub mod power;
pub mod round;
pub mod energy;
pub mod calibrate;
pub mod acquisition;
pub mod generate_signal;
pub mod sink;
pub mod report;
pub mod print;
pub mod processing;

pub use acquisition::{capture_path, AcquisitionDriver, ReplayAdc, SimulatedAdc, SpiHelperAdc};
pub use calibrate::{CalibrationSession, OperatorInput, ScriptedInput, SessionEnd};
pub use config::{CalibrationTable, ConfigStore, MeterConfig};
pub use energy::{integrate_energy, EnergyLedger, PersistedEnergy};
pub use error::{MeterError, MeterResult};
pub use generate_signal::SignalProfile;
pub use phase::{estimate_phase_shift, rotate_phase, PhaseDirection};
pub use power::calculate_channel_power;
pub use processing::{Clock, MeterEngine, SystemClock};
pub use report::{CalibrationReport, CsvReportRenderer, ReportRenderer};
pub use round::{RoundAggregator, RoundRecord, RoundState, SuperRound};
pub use sink::{host_identity, total_points, InfluxSink, MemorySink, Point, TimeSeriesSink};
pub use types::*;
