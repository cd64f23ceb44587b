pub mod config;
pub mod error;

pub use config::{
    load_dotenv, BatchConfig, GateConfig, QueueConfig, DEFAULT_QUEUE_CONCURRENCY,
};
pub use error::GateError;
