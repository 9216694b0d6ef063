pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod panic_handler;
pub mod pkix;
pub mod policy;
pub mod request;
pub mod response;
pub mod revocation;
pub mod types;

pub use config::Config;
pub use engine::{EngineBuilder, ValidationEngine};
pub use error::{Result, VssError};
pub use request::ValidationRequest;
pub use response::ValidationResponse;
pub use types::{ReasonCode, Verdict};
