use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("Degenerate signal: {0}")]
    DegenerateSignal(String),
    #[error("CT {channel} on phase {phase} still reads a negative power factor after reversal")]
    InstallationFault { phase: usize, channel: usize },
    #[error("Operator input closed")]
    OperatorInputClosed,
    #[error("FFT error: {0}")]
    Fft(String),
    #[error("Acquisition error: {0}")]
    Acquisition(String),
    #[error("Sink error: {0}")]
    Sink(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type MeterResult<T> = Result<T, MeterError>;
