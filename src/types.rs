use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall outcome of a validation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Valid,
    Invalid,
}

/// Machine-readable reason attached to an `invalid` verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    Expired,
    NotYetValid,
    SignatureInvalid,
    BasicConstraintsViolation,
    PolicyMismatch,
    PathTooLong,
    UnsupportedCriticalExtension,
    NoPathFound,
    Revoked,
    RevocationStatusUnavailable,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Expired => "expired",
            ReasonCode::NotYetValid => "not-yet-valid",
            ReasonCode::SignatureInvalid => "signature-invalid",
            ReasonCode::BasicConstraintsViolation => "basic-constraints-violation",
            ReasonCode::PolicyMismatch => "policy-mismatch",
            ReasonCode::PathTooLong => "path-too-long",
            ReasonCode::UnsupportedCriticalExtension => "unsupported-critical-extension",
            ReasonCode::NoPathFound => "no-path-found",
            ReasonCode::Revoked => "revoked",
            ReasonCode::RevocationStatusUnavailable => "revocation-status-unavailable",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known object identifiers used across the engine, in dotted form.
pub mod oids {
    pub const ANY_POLICY: &str = "2.5.29.32.0";

    pub const EXT_CRL_NUMBER: &str = "2.5.29.20";
    pub const EXT_DELTA_CRL_INDICATOR: &str = "2.5.29.27";
    pub const EXT_ISSUING_DISTRIBUTION_POINT: &str = "2.5.29.28";
    pub const EXT_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";

    pub const AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";
    pub const AD_CA_ISSUERS: &str = "1.3.6.1.5.5.7.48.2";
    pub const OCSP_BASIC: &str = "1.3.6.1.5.5.7.48.1.1";
    pub const OCSP_NOCHECK: &str = "1.3.6.1.5.5.7.48.1.5";

    pub const SHA1: &str = "1.3.14.3.2.26";
    pub const SHA256: &str = "2.16.840.1.101.3.4.2.1";
    pub const SHA384: &str = "2.16.840.1.101.3.4.2.2";
    pub const SHA512: &str = "2.16.840.1.101.3.4.2.3";

    pub const RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
    pub const EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
    pub const ED25519: &str = "1.3.101.112";
    pub const CURVE_P256: &str = "1.2.840.10045.3.1.7";
    pub const CURVE_P384: &str = "1.3.132.0.34";

    pub const SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";
    pub const SHA384_WITH_RSA: &str = "1.2.840.113549.1.1.12";
    pub const SHA512_WITH_RSA: &str = "1.2.840.113549.1.1.13";
    pub const RSASSA_PSS: &str = "1.2.840.113549.1.1.10";
    pub const ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
    pub const ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_wire_names_match_display() {
        for code in [
            ReasonCode::Expired,
            ReasonCode::NotYetValid,
            ReasonCode::SignatureInvalid,
            ReasonCode::BasicConstraintsViolation,
            ReasonCode::PolicyMismatch,
            ReasonCode::PathTooLong,
            ReasonCode::UnsupportedCriticalExtension,
            ReasonCode::NoPathFound,
            ReasonCode::Revoked,
            ReasonCode::RevocationStatusUnavailable,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }

    #[test]
    fn test_verdict_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Verdict::Valid).unwrap(), "\"valid\"");
        assert_eq!(serde_json::to_string(&Verdict::Invalid).unwrap(), "\"invalid\"");
    }
}
