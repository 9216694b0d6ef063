use thiserror::Error;

pub type Result<T> = std::result::Result<T, VssError>;

#[derive(Error, Debug)]
pub enum VssError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("validationPolicy must be an Object Identifier: {0}")]
    InvalidPolicyOid(String),

    #[error("Unknown validation policy: {0}")]
    PolicyNotFound(String),

    #[error("Error decoding x509Certificate: {0}")]
    CertificateDecode(String),

    #[error("Size limit for {field} exceeded ({actual} >= {limit})")]
    PayloadTooLarge {
        field: &'static str,
        actual: usize,
        limit: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Trust anchor error: {0}")]
    TrustAnchor(String),

    #[error("Duplicate validation policy: {0}")]
    DuplicatePolicy(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Malformed revocation evidence: {0}")]
    Evidence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VssError {
    /// True for errors caused by the caller's request rather than by the
    /// service or its collaborators.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            VssError::InvalidRequest(_)
                | VssError::InvalidPolicyOid(_)
                | VssError::PolicyNotFound(_)
                | VssError::CertificateDecode(_)
                | VssError::PayloadTooLarge { .. }
        )
    }
}

impl From<der::Error> for VssError {
    fn from(e: der::Error) -> Self {
        VssError::Evidence(e.to_string())
    }
}
