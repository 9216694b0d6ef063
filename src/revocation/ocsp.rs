//! OCSP request construction and response evaluation (RFC 6960).

use crate::config::RevocationConfig;
use crate::error::{Result, VssError};
use crate::pkix::codec::{unsigned_magnitude, Certificate};
use crate::pkix::signature::{verify_signed_data, SignatureAlgorithm};
use crate::revocation::{is_fresh, Evidence, EvidenceKind, Issuer, RevocationState, RevocationStatus};
use crate::types::oids;

use der::asn1::{GeneralizedTime, ObjectIdentifier, OctetString};
use der::{Any, Decode, Encode, Tag};
use ring::digest;
use std::sync::Arc;
use tracing::debug;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, OcspResponseStatus, Request, SingleResponse,
    TbsRequest, Version,
};

fn hash(algorithm: &str, data: &[u8]) -> Option<Vec<u8>> {
    let alg = match algorithm {
        oids::SHA1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
        oids::SHA256 => &digest::SHA256,
        _ => return None,
    };
    Some(digest::digest(alg, data).as_ref().to_vec())
}

fn oid(value: &str) -> Result<ObjectIdentifier> {
    ObjectIdentifier::new(value).map_err(|e| VssError::Evidence(e.to_string()))
}

/// Seconds since the epoch for any DER time value encoded as GeneralizedTime.
fn unix_seconds<T: Encode>(time: &T) -> Result<i64> {
    let der = time.to_der()?;
    let generalized = GeneralizedTime::from_der(&der)?;
    Ok(generalized.to_unix_duration().as_secs() as i64)
}

/// CertID serial taken from the certificate's own INTEGER encoding. A
/// 20-octet serial with its high bit set is 21 octets on the wire, which
/// `SerialNumber::new` refuses but decoding accepts.
fn serial_number(cert: &Certificate) -> Result<SerialNumber> {
    let content = cert.serial();
    if content.is_empty() || content.len() > 127 {
        return Err(VssError::Evidence(format!("unusable serial number of {} octets", content.len())));
    }

    let mut der = Vec::with_capacity(content.len() + 2);
    der.push(0x02);
    der.push(content.len() as u8);
    der.extend_from_slice(content);
    Ok(SerialNumber::from_der(&der)?)
}

/// DER-encoded OCSP request for `cert` with a SHA-1 CertID.
pub fn build_request(cert: &Certificate, issuer: &Issuer) -> Result<Vec<u8>> {
    let name_hash = hash(oids::SHA1, issuer.name.as_der()).unwrap_or_default();
    let key_hash = hash(oids::SHA1, &issuer.public_key.key).unwrap_or_default();

    let cert_id = CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: oid(oids::SHA1)?,
            parameters: Some(Any::new(Tag::Null, Vec::<u8>::new())?),
        },
        issuer_name_hash: OctetString::new(name_hash)?,
        issuer_key_hash: OctetString::new(key_hash)?,
        serial_number: serial_number(cert)?,
    };

    let request = OcspRequest {
        tbs_request: TbsRequest {
            version: Version::V1,
            requestor_name: None,
            request_list: vec![Request {
                req_cert: cert_id,
                single_request_extensions: None,
            }],
            request_extensions: None,
        },
        optional_signature: None,
    };

    Ok(request.to_der()?)
}

fn cert_id_matches(cert_id: &CertId, cert: &Certificate, issuer: &Issuer) -> bool {
    if unsigned_magnitude(cert_id.serial_number.as_bytes()) != cert.serial_magnitude() {
        return false;
    }

    let algorithm = cert_id.hash_algorithm.oid.to_string();
    match (hash(&algorithm, issuer.name.as_der()), hash(&algorithm, &issuer.public_key.key)) {
        (Some(name_hash), Some(key_hash)) => {
            cert_id.issuer_name_hash.as_bytes() == name_hash.as_slice()
                && cert_id.issuer_key_hash.as_bytes() == key_hash.as_slice()
        }
        _ => false,
    }
}

fn parse_basic(bytes: &[u8]) -> Result<BasicOcspResponse> {
    let response = OcspResponse::from_der(bytes)?;

    if response.response_status != OcspResponseStatus::Successful {
        return Err(VssError::Evidence(format!(
            "responder returned status {:?}",
            response.response_status
        )));
    }

    let response_bytes = response
        .response_bytes
        .ok_or_else(|| VssError::Evidence("successful response without responseBytes".to_string()))?;

    if response_bytes.response_type.to_string() != oids::OCSP_BASIC {
        return Err(VssError::Evidence(format!(
            "unsupported response type {}",
            response_bytes.response_type
        )));
    }

    Ok(BasicOcspResponse::from_der(response_bytes.response.as_bytes())?)
}

/// Whether the response is signed by the issuer itself or by a delegate
/// the issuer certified for OCSP signing.
fn signature_is_authorized(basic: &BasicOcspResponse, issuer: &Issuer, at: i64) -> Result<bool> {
    let tbs = basic.tbs_response_data.to_der()?;
    let algorithm = SignatureAlgorithm::new(
        basic.signature_algorithm.oid.to_string(),
        basic
            .signature_algorithm
            .parameters
            .as_ref()
            .map(|p| p.value().to_vec())
            .unwrap_or_default(),
    );
    let signature = basic.signature.raw_bytes();

    if verify_signed_data(&algorithm, &issuer.public_key, &tbs, signature) {
        return Ok(true);
    }

    for embedded in basic.certs.iter().flatten() {
        let delegate = match Certificate::from_der(&embedded.to_der()?) {
            Ok(delegate) => delegate,
            Err(e) => {
                debug!(error = %e, "Skipping undecodable OCSP responder certificate");
                continue;
            }
        };

        let certified = delegate.issuer() == &issuer.name
            && delegate.extensions().ocsp_signing
            && delegate.is_valid_at(at)
            && verify_signed_data(
                delegate.signature_algorithm(),
                &issuer.public_key,
                delegate.tbs(),
                delegate.signature(),
            );

        if certified && verify_signed_data(&algorithm, delegate.public_key(), &tbs, signature) {
            debug!(responder = %delegate.subject(), "OCSP response signed by delegated responder");
            return Ok(true);
        }
    }

    Ok(false)
}

fn matching_response<'a>(
    basic: &'a BasicOcspResponse,
    cert: &Certificate,
    issuer: &Issuer,
) -> Option<&'a SingleResponse> {
    basic
        .tbs_response_data
        .responses
        .iter()
        .find(|single| cert_id_matches(&single.cert_id, cert, issuer))
}

/// Evaluate a raw responder answer for `cert`. Malformed responses are
/// `check-failed`; responses that parse but cannot be trusted are `unknown`.
pub fn evaluate_response(
    bytes: Vec<u8>,
    url: &str,
    cert: &Certificate,
    issuer: &Issuer,
    at: i64,
    config: &RevocationConfig,
) -> RevocationStatus {
    match evaluate(&bytes, cert, issuer, at, config) {
        Ok((state, this_update, next_update, revocation_time)) => {
            let mut status = RevocationStatus::new(state);
            status.this_update = Some(this_update);
            status.next_update = next_update;
            status.revocation_time = revocation_time;
            status.evidence = Some(Evidence {
                kind: EvidenceKind::Ocsp,
                source: url.to_string(),
                der: Arc::new(bytes),
            });
            if state == RevocationState::Unknown {
                status.detail = Some("responder does not know the certificate".to_string());
            }
            status
        }
        Err(Untrusted::Malformed(e)) => RevocationStatus::check_failed(format!("OCSP {}: {}", url, e)),
        Err(Untrusted::Rejected(reason)) => RevocationStatus::unknown(format!("OCSP {}: {}", url, reason)),
    }
}

enum Untrusted {
    Malformed(VssError),
    Rejected(&'static str),
}

impl From<VssError> for Untrusted {
    fn from(e: VssError) -> Self {
        Untrusted::Malformed(e)
    }
}

type Evaluated = (RevocationState, i64, Option<i64>, Option<i64>);

fn evaluate(
    bytes: &[u8],
    cert: &Certificate,
    issuer: &Issuer,
    at: i64,
    config: &RevocationConfig,
) -> std::result::Result<Evaluated, Untrusted> {
    let basic = parse_basic(bytes)?;

    if !signature_is_authorized(&basic, issuer, at)? {
        return Err(Untrusted::Rejected("response signature not verifiable by issuer or delegate"));
    }

    let single = matching_response(&basic, cert, issuer)
        .ok_or(Untrusted::Rejected("no response for the requested CertID"))?;

    let this_update = unix_seconds(&single.this_update)?;
    let next_update = single.next_update.as_ref().map(|t| unix_seconds(t)).transpose()?;

    if !is_fresh(this_update, next_update, at, config) {
        return Err(Untrusted::Rejected("response is not fresh"));
    }

    let (state, revocation_time) = match &single.cert_status {
        CertStatus::Good(_) => (RevocationState::Good, None),
        CertStatus::Revoked(info) => (RevocationState::Revoked, Some(unix_seconds(&info.revocation_time)?)),
        CertStatus::Unknown(_) => (RevocationState::Unknown, None),
    };

    Ok((state, this_update, next_update, revocation_time))
}
