//! Result Assembler
//!
//! Turns the engine's verdict into the response record, attaching the
//! want-back artifacts the caller asked for. Artifacts that only make sense
//! for an accepted path are never produced for an invalid result.

use crate::pkix::codec::Fingerprint;
use crate::pkix::validator::{CertificateStatus, ValidatedPath};
use crate::revocation::{EvidenceKind, RevocationState};
use crate::types::{ReasonCode, Verdict};

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const WANT_BACK_CERT_PATH: &str = "certPath";
pub const WANT_BACK_REVOCATION_INFO: &str = "revocationInfo";
pub const WANT_BACK_VALID_POLICIES: &str = "validPolicies";
pub const WANT_BACK_VALIDATION_TIME: &str = "validationTime";
pub const WANT_BACK_X5T_S256: &str = "x5t#S256";

/// Outcome of validating one certificate, before rendering.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub verdict: Verdict,
    pub reason: Option<ReasonCode>,
    pub detail: Option<String>,
    pub validated: Option<ValidatedPath>,
    /// Seconds since the epoch.
    pub validation_time: i64,
}

impl ValidationResult {
    pub fn valid(validated: ValidatedPath, validation_time: i64) -> Self {
        Self {
            verdict: Verdict::Valid,
            reason: None,
            detail: None,
            validated: Some(validated),
            validation_time,
        }
    }

    pub fn invalid(reason: ReasonCode, detail: impl Into<String>, validation_time: i64) -> Self {
        Self {
            verdict: Verdict::Invalid,
            reason: Some(reason),
            detail: Some(detail.into()),
            validated: None,
            validation_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultByCertificate {
    #[serde(rename = "x5t#S256")]
    pub x5t_s256: String,
    pub validation_result: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidity_reason_text: Option<String>,
    pub want_back_result: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub result: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    pub result_by_certificate: ResultByCertificate,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

impl ValidationResponse {
    pub fn want_back(&self, name: &str) -> Option<&Value> {
        self.result_by_certificate.want_back_result.get(name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RevocationInfo {
    #[serde(rename = "x5t#S256")]
    x5t_s256: String,
    status: RevocationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    evidence_type: Option<EvidenceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    evidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    this_update: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_update: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revocation_time: Option<String>,
}

impl From<&CertificateStatus> for RevocationInfo {
    fn from(entry: &CertificateStatus) -> Self {
        let status = &entry.status;
        Self {
            x5t_s256: entry.fingerprint.x5t_s256(),
            status: status.state,
            evidence_type: status.evidence.as_ref().map(|e| e.kind),
            source: status.evidence.as_ref().map(|e| e.source.clone()),
            evidence: status.evidence.as_ref().map(|e| general_purpose::STANDARD.encode(e.der.as_slice())),
            this_update: status.this_update.and_then(rfc3339),
            next_update: status.next_update.and_then(rfc3339),
            revocation_time: status.revocation_time.and_then(rfc3339),
        }
    }
}

pub fn rfc3339(seconds: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(seconds, 0).map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn cert_path(validated: &ValidatedPath) -> Value {
    let mut encoded: Vec<Value> = validated
        .path
        .certificates()
        .iter()
        .map(|c| Value::String(general_purpose::STANDARD.encode(c.der())))
        .collect();

    if let Some(anchor) = validated.path.anchor().certificate() {
        encoded.push(Value::String(general_purpose::STANDARD.encode(anchor.der())));
    }

    Value::Array(encoded)
}

fn artifact(name: &str, result: &ValidationResult, fingerprint: &Fingerprint) -> Option<Value> {
    match name {
        WANT_BACK_X5T_S256 => Some(Value::String(fingerprint.x5t_s256())),
        WANT_BACK_VALIDATION_TIME => rfc3339(result.validation_time).map(Value::String),
        WANT_BACK_CERT_PATH => result.validated.as_ref().map(cert_path),
        WANT_BACK_VALID_POLICIES => result.validated.as_ref().map(|v| {
            Value::Array(v.valid_policies.iter().cloned().map(Value::String).collect())
        }),
        WANT_BACK_REVOCATION_INFO => result.validated.as_ref().and_then(|v| {
            let info: Vec<RevocationInfo> = v.revocation.iter().map(RevocationInfo::from).collect();
            serde_json::to_value(info).ok()
        }),
        _ => {
            debug!(name = %name, "Ignoring unknown want-back item");
            None
        }
    }
}

/// Build the response for `result`, including each requested artifact that
/// applies.
pub fn assemble(result: &ValidationResult, want_back: &[String], fingerprint: &Fingerprint) -> ValidationResponse {
    let mut want_back_result = BTreeMap::new();

    for name in want_back {
        if want_back_result.contains_key(name) {
            continue;
        }
        if result.verdict == Verdict::Invalid
            && matches!(
                name.as_str(),
                WANT_BACK_CERT_PATH | WANT_BACK_REVOCATION_INFO | WANT_BACK_VALID_POLICIES
            )
        {
            continue;
        }
        if let Some(value) = artifact(name, result, fingerprint) {
            want_back_result.insert(name.clone(), value);
        }
    }

    ValidationResponse {
        result: result.verdict,
        reason_code: result.reason,
        result_by_certificate: ResultByCertificate {
            x5t_s256: fingerprint.x5t_s256(),
            validation_result: result.verdict,
            invalidity_reason_text: result.detail.clone(),
            want_back_result,
        },
        additional_properties: Map::new(),
    }
}
