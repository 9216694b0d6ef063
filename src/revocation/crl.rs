use crate::config::RevocationConfig;
use crate::pkix::codec::{unsigned_magnitude, Certificate};
use crate::pkix::signature::{verify_signed_data, SignatureAlgorithm};
use crate::revocation::{is_fresh, Evidence, EvidenceKind, Issuer, RevocationState, RevocationStatus};
use crate::types::oids;

use der::{Any, Decode, Tag, Tagged};
use std::sync::Arc;
use x509_parser::prelude::*;

/// Why a CRL cannot be read as a complete list for the certificate.
fn scope_problem(crl: &CertificateRevocationList<'_>, cert: &Certificate) -> Option<String> {
    for ext in crl.extensions() {
        let oid = ext.oid.to_id_string();
        match oid.as_str() {
            oids::EXT_CRL_NUMBER | oids::EXT_AUTHORITY_KEY_IDENTIFIER => {}
            oids::EXT_DELTA_CRL_INDICATOR => return Some("delta CRLs are not supported".to_string()),
            oids::EXT_ISSUING_DISTRIBUTION_POINT => {
                if let Some(problem) = issuing_distribution_point_problem(ext.value, cert) {
                    return Some(problem);
                }
            }
            _ if ext.critical => return Some(format!("unsupported critical extension {}", oid)),
            _ => {}
        }
    }
    None
}

/// IssuingDistributionPoint fields that narrow the CRL below "every
/// certificate from this issuer" in a way that may exclude `cert`.
fn issuing_distribution_point_problem(value: &[u8], cert: &Certificate) -> Option<String> {
    let fields = match <Vec<Any> as Decode>::from_der(value) {
        Ok(fields) => fields,
        Err(e) => return Some(format!("malformed issuing distribution point: {}", e)),
    };

    let is_ca = cert.extensions().basic_constraints.as_ref().map(|bc| bc.ca).unwrap_or(false);

    for field in &fields {
        let Tag::ContextSpecific { number, .. } = field.tag() else {
            return Some("malformed issuing distribution point".to_string());
        };
        let set = field.value().iter().any(|b| *b != 0);

        // [0] distributionPoint only names where the CRL was published.
        let problem = match u8::from(number) {
            1 if set && is_ca => Some("CRL covers end-entity certificates only"),
            2 if set && !is_ca => Some("CRL covers CA certificates only"),
            3 => Some("CRL covers only some revocation reasons"),
            4 if set => Some("indirect CRLs are not supported"),
            5 if set => Some("CRL covers attribute certificates only"),
            _ => None,
        };

        if let Some(problem) = problem {
            return Some(problem.to_string());
        }
    }
    None
}

/// Evaluate a fetched CRL for `cert`. Undecodable CRLs are `check-failed`.
/// CRLs from the wrong issuer, with a bad signature, of narrowed or unknown
/// scope, or stale are `unknown`.
pub fn evaluate_crl(
    bytes: Arc<Vec<u8>>,
    url: &str,
    cert: &Certificate,
    issuer: &Issuer,
    at: i64,
    config: &RevocationConfig,
) -> RevocationStatus {
    let crl = match CertificateRevocationList::from_der(&bytes) {
        Ok((_, crl)) => crl,
        Err(e) => return RevocationStatus::check_failed(format!("CRL {}: parsing failed: {}", url, e)),
    };

    if crl.issuer().as_raw() != cert.issuer().as_der() {
        return RevocationStatus::unknown(format!("CRL {}: issued by {}, not {}", url, crl.issuer(), cert.issuer()));
    }

    if let Some(usage) = issuer.key_usage {
        if !usage.crl_sign {
            return RevocationStatus::unknown(format!("CRL {}: issuer key usage does not permit CRL signing", url));
        }
    }

    let algorithm = SignatureAlgorithm::from_identifier(&crl.signature_algorithm);
    if !verify_signed_data(
        &algorithm,
        &issuer.public_key,
        crl.tbs_cert_list.as_ref(),
        &crl.signature_value.data,
    ) {
        return RevocationStatus::unknown(format!("CRL {}: signature does not verify", url));
    }

    if let Some(problem) = scope_problem(&crl, cert) {
        return RevocationStatus::unknown(format!("CRL {}: {}", url, problem));
    }

    let this_update = crl.last_update().timestamp();
    let next_update = crl.next_update().map(|t| t.timestamp());

    if !is_fresh(this_update, next_update, at, config) {
        return RevocationStatus::unknown(format!("CRL {}: not fresh", url));
    }

    let revoked = crl
        .iter_revoked_certificates()
        .find(|entry| unsigned_magnitude(entry.raw_serial()) == cert.serial_magnitude())
        .map(|entry| entry.revocation_date.timestamp());

    let mut status = match revoked {
        Some(revocation_time) => {
            let mut status = RevocationStatus::new(RevocationState::Revoked);
            status.revocation_time = Some(revocation_time);
            status
        }
        None => RevocationStatus::new(RevocationState::Good),
    };

    status.this_update = Some(this_update);
    status.next_update = next_update;
    status.evidence = Some(Evidence {
        kind: EvidenceKind::Crl,
        source: url.to_string(),
        der: Arc::clone(&bytes),
    });
    status
}

/// nextUpdate of a CRL, used to decide how long the raw bytes may be reused.
pub fn next_update_of(bytes: &[u8]) -> Option<i64> {
    CertificateRevocationList::from_der(bytes)
        .ok()
        .and_then(|(_, crl)| crl.next_update().map(|t| t.timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkix::codec::{Fingerprint, PublicKeyInfo};
    use crate::types::oids;

    fn end_entity() -> Certificate {
        let params = rcgen::CertificateParams::new(vec!["leaf.example.test".to_string()]);
        let der = rcgen::Certificate::from_params(params).unwrap().serialize_der().unwrap();
        Certificate::from_der(&der).unwrap()
    }

    #[test]
    fn test_issuing_distribution_point_scope() {
        let cert = end_entity();

        // distributionPoint [0] { fullName [0] { URI } }
        let named = [0x30, 0x08, 0xa0, 0x06, 0xa0, 0x04, 0x86, 0x02, b'h', b'x'];
        assert_eq!(issuing_distribution_point_problem(&named, &cert), None);

        // onlyContainsUserCerts TRUE
        assert_eq!(issuing_distribution_point_problem(&[0x30, 0x03, 0x81, 0x01, 0xff], &cert), None);

        // onlyContainsCACerts TRUE
        assert!(issuing_distribution_point_problem(&[0x30, 0x03, 0x82, 0x01, 0xff], &cert).is_some());

        // onlySomeReasons
        assert!(issuing_distribution_point_problem(&[0x30, 0x04, 0x83, 0x02, 0x06, 0x40], &cert).is_some());

        // indirectCRL TRUE
        assert!(issuing_distribution_point_problem(&[0x30, 0x03, 0x84, 0x01, 0xff], &cert).is_some());

        assert!(issuing_distribution_point_problem(&[0x04, 0x00], &cert).is_some());
    }

    #[test]
    fn test_undecodable_crl_is_check_failed() {
        let cert = end_entity();
        let issuer = Issuer {
            name: cert.issuer().clone(),
            public_key: PublicKeyInfo {
                algorithm: oids::EC_PUBLIC_KEY.to_string(),
                curve: None,
                key: vec![],
            },
            key_usage: None,
            fingerprint: Fingerprint::of(b"issuer"),
        };

        let status = evaluate_crl(
            Arc::new(vec![0x30, 0x00]),
            "http://crl.example.test/ca.crl",
            &cert,
            &issuer,
            0,
            &RevocationConfig::default(),
        );
        assert_eq!(status.state, RevocationState::CheckFailed);
        assert!(next_update_of(&[0x30, 0x00]).is_none());
    }
}
