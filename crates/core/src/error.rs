use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
