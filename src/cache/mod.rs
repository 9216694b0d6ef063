pub mod intermediate;
pub mod single_flight;

pub use intermediate::{IntermediateCache, IssuerKey, RefreshHandle};
pub use single_flight::SingleFlight;
