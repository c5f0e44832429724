pub mod energy_insight;

pub use energy_insight::*;
