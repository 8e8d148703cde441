pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;

pub use error::{FlowError, FlowResult};
