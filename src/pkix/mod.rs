pub mod builder;
pub mod codec;
pub mod policy_tree;
pub mod signature;
pub mod validator;

pub use builder::{CertificationPath, PathBuilder};
pub use codec::{decode_pem_bundle, decode_transport, Certificate, Fingerprint, Name};
pub use validator::{check_path, PathFailure, PathOutcome, PathValidator, PolicyOutcome, ValidatedPath};
