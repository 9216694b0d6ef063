//! Path Validator
//!
//! RFC 5280 §6.1 processing of one candidate path, walked from the trust
//! anchor toward the end entity. `check_path` is the pure part; the
//! `PathValidator` adds revocation checks through the `RevocationChecker`
//! once everything else holds.

use crate::pkix::builder::CertificationPath;
use crate::pkix::codec::{Certificate, Fingerprint, Name, PublicKeyInfo};
use crate::pkix::policy_tree::PolicyProcessor;
use crate::pkix::signature::verify_signed_data;
use crate::policy::{FailMode, ValidationPolicy};
use crate::revocation::{Issuer, RevocationChecker, RevocationState, RevocationStatus};
use crate::types::ReasonCode;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a candidate path was rejected. `progress` counts the processing steps
/// that succeeded before the failure, so the engine can report the failure
/// of the most complete candidate.
#[derive(Debug, Clone)]
pub struct PathFailure {
    pub reason: ReasonCode,
    pub progress: usize,
    pub detail: String,
    /// Set when the failure is a revoked certificate.
    pub revoked: Option<Fingerprint>,
}

impl PathFailure {
    fn new(reason: ReasonCode, progress: usize, detail: impl Into<String>) -> Self {
        Self {
            reason,
            progress,
            detail: detail.into(),
            revoked: None,
        }
    }
}

impl fmt::Display for PathFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

/// Result of the pure validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    /// Certificate policies valid for the whole path, after intersection
    /// with the policy's required set.
    pub valid_policies: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct CertificateStatus {
    pub fingerprint: Fingerprint,
    pub status: RevocationStatus,
}

#[derive(Debug, Clone)]
pub struct ValidatedPath {
    pub path: CertificationPath,
    pub valid_policies: BTreeSet<String>,
    /// Leaf first. Certificates that were not checked are absent.
    pub revocation: Vec<CertificateStatus>,
}

#[derive(Debug, Clone)]
pub enum PathOutcome {
    Valid(ValidatedPath),
    Invalid(PathFailure),
}

fn check_validity(cert: &Certificate, at: i64, progress: usize, label: &str) -> Result<(), PathFailure> {
    if at < cert.not_before() {
        return Err(PathFailure::new(
            ReasonCode::NotYetValid,
            progress,
            format!("{} {} is not valid before {}", label, cert.subject(), cert.not_before()),
        ));
    }
    if at > cert.not_after() {
        return Err(PathFailure::new(
            ReasonCode::Expired,
            progress,
            format!("{} {} expired at {}", label, cert.subject(), cert.not_after()),
        ));
    }
    Ok(())
}

fn check_can_sign_certificates(cert: &Certificate, progress: usize, label: &str) -> Result<(), PathFailure> {
    if !cert.is_ca() {
        return Err(PathFailure::new(
            ReasonCode::BasicConstraintsViolation,
            progress,
            format!("{} {} is not a CA", label, cert.subject()),
        ));
    }
    if let Some(usage) = cert.extensions().key_usage {
        if !usage.key_cert_sign {
            return Err(PathFailure::new(
                ReasonCode::BasicConstraintsViolation,
                progress,
                format!("{} {} key usage does not permit certificate signing", label, cert.subject()),
            ));
        }
    }
    Ok(())
}

/// Run every non-revocation check of RFC 5280 §6.1 over `path` at `at`.
pub fn check_path(path: &CertificationPath, policy: &ValidationPolicy, at: i64) -> Result<PolicyOutcome, PathFailure> {
    let n = path.len();
    if n == 0 {
        return Err(PathFailure::new(ReasonCode::NoPathFound, 0, "empty path"));
    }

    if n > policy.max_path_length {
        return Err(PathFailure::new(
            ReasonCode::PathTooLong,
            0,
            format!("path of {} certificates exceeds policy maximum {}", n, policy.max_path_length),
        ));
    }

    let anchor = path.anchor();
    if let Some(anchor_cert) = anchor.certificate() {
        check_validity(anchor_cert, at, 0, "trust anchor")?;
        if !policy.trust_anchors_directly {
            check_can_sign_certificates(anchor_cert, 0, "trust anchor")?;
        }
    }

    let mut working_name: &Name = anchor.subject();
    let mut working_key: &PublicKeyInfo = anchor.public_key();
    let mut max_path_length = n;
    let mut policies = PolicyProcessor::new(n, policy.policy_inputs());

    for (i, cert) in path.certificates().iter().rev().enumerate() {
        let is_leaf = i + 1 == n;

        if cert.issuer() != working_name {
            return Err(PathFailure::new(
                ReasonCode::NoPathFound,
                i,
                format!("{} is not issued by {}", cert.subject(), working_name),
            ));
        }

        if !verify_signed_data(cert.signature_algorithm(), working_key, cert.tbs(), cert.signature()) {
            return Err(PathFailure::new(
                ReasonCode::SignatureInvalid,
                i,
                format!("signature on {} does not verify", cert.subject()),
            ));
        }

        check_validity(cert, at, i, "certificate")?;

        if let Some(oid) = cert.extensions().unsupported_critical.first() {
            return Err(PathFailure::new(
                ReasonCode::UnsupportedCriticalExtension,
                i,
                format!("{} carries unsupported critical extension {}", cert.subject(), oid),
            ));
        }

        policies
            .process(cert)
            .map_err(|v| PathFailure::new(ReasonCode::PolicyMismatch, i, format!("{}: {}", cert.subject(), v)))?;

        if !is_leaf {
            check_can_sign_certificates(cert, i, "intermediate")?;

            if !cert.is_self_issued() {
                if max_path_length == 0 {
                    return Err(PathFailure::new(
                        ReasonCode::PathTooLong,
                        i,
                        format!("path length constraint exceeded at {}", cert.subject()),
                    ));
                }
                max_path_length -= 1;
            }

            if let Some(limit) = cert.extensions().basic_constraints.and_then(|bc| bc.path_len_constraint) {
                max_path_length = max_path_length.min(limit as usize);
            }
        }

        working_name = cert.subject();
        working_key = cert.public_key();
    }

    let valid_policies = policies
        .finish(path.leaf(), &policy.required_policies)
        .map_err(|v| PathFailure::new(ReasonCode::PolicyMismatch, n, v.to_string()))?;

    Ok(PolicyOutcome { valid_policies })
}

/// Full path validation: the pure checks, then revocation.
pub struct PathValidator {
    revocation: Arc<RevocationChecker>,
}

impl PathValidator {
    pub fn new(revocation: Arc<RevocationChecker>) -> Self {
        Self { revocation }
    }

    pub async fn validate(&self, path: &CertificationPath, policy: &ValidationPolicy, at: i64) -> PathOutcome {
        let outcome = match check_path(path, policy, at) {
            Ok(outcome) => outcome,
            Err(failure) => return PathOutcome::Invalid(failure),
        };

        match self.check_revocation(path, policy, at).await {
            Ok(revocation) => PathOutcome::Valid(ValidatedPath {
                path: path.clone(),
                valid_policies: outcome.valid_policies,
                revocation,
            }),
            Err(failure) => PathOutcome::Invalid(failure),
        }
    }

    async fn check_revocation(
        &self,
        path: &CertificationPath,
        policy: &ValidationPolicy,
        at: i64,
    ) -> Result<Vec<CertificateStatus>, PathFailure> {
        let certificates = path.certificates();
        let n = certificates.len();
        let mut statuses = Vec::new();

        if policy.revocation.mechanisms.is_empty() {
            return Ok(statuses);
        }

        for index in (0..n).rev() {
            let cert = &certificates[index];
            let issuer = if index + 1 == n {
                Issuer::from_anchor(path.anchor())
            } else {
                Issuer::from_certificate(&certificates[index + 1])
            };

            let status = self.revocation.status(cert, &issuer, policy, at).await;
            let progress = n + 1 + (n - 1 - index);

            match status.state {
                RevocationState::Revoked => {
                    let mut failure = PathFailure::new(
                        ReasonCode::Revoked,
                        progress,
                        format!("{} is revoked", cert.subject()),
                    );
                    failure.revoked = Some(cert.fingerprint());
                    return Err(failure);
                }
                RevocationState::Good => {
                    debug!(fingerprint = %cert.fingerprint(), "Revocation status good");
                }
                RevocationState::Unknown | RevocationState::CheckFailed => match policy.revocation.fail_mode {
                    FailMode::Open => {
                        warn!(
                            fingerprint = %cert.fingerprint(),
                            policy = %policy.oid,
                            state = status.state.as_str(),
                            detail = status.detail.as_deref().unwrap_or(""),
                            "Revocation status unavailable, accepting under fail-open policy"
                        );
                    }
                    FailMode::Closed => {
                        return Err(PathFailure::new(
                            ReasonCode::RevocationStatusUnavailable,
                            progress,
                            format!(
                                "{}: {}",
                                cert.subject(),
                                status.detail.as_deref().unwrap_or(status.state.as_str())
                            ),
                        ));
                    }
                },
            }

            statuses.push(CertificateStatus {
                fingerprint: cert.fingerprint(),
                status,
            });
        }

        statuses.reverse();
        Ok(statuses)
    }
}
