use crate::pkix::codec::PublicKeyInfo;
use crate::types::oids;

use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};

/// Signature algorithm identifier as it appears on signed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAlgorithm {
    oid: String,
    /// Content octets of the parameters field, if any.
    parameters: Vec<u8>,
}

impl SignatureAlgorithm {
    pub fn new(oid: impl Into<String>, parameters: Vec<u8>) -> Self {
        Self {
            oid: oid.into(),
            parameters,
        }
    }

    pub fn from_identifier(alg: &x509_parser::x509::AlgorithmIdentifier<'_>) -> Self {
        Self::new(
            alg.algorithm.to_id_string(),
            alg.parameters.as_ref().map(|p| p.data.to_vec()).unwrap_or_default(),
        )
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    /// RSASSA-PSS digest. ring only verifies PSS where hashAlgorithm and the
    /// MGF1 digest agree, so both must name the same single hash.
    fn pss_hash(&self) -> Option<&'static str> {
        let candidates = [
            (oids::SHA256, [0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01]),
            (oids::SHA384, [0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02]),
            (oids::SHA512, [0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03]),
        ];

        let mut found = candidates
            .iter()
            .filter(|(_, encoded)| self.parameters.windows(encoded.len()).any(|w| w == encoded))
            .map(|(name, _)| *name);

        match (found.next(), found.next()) {
            (Some(hash), None) => Some(hash),
            _ => None,
        }
    }
}

fn curve_of(spki: &PublicKeyInfo) -> Option<&'static str> {
    match spki.curve.as_deref() {
        Some(oids::CURVE_P256) => Some(oids::CURVE_P256),
        Some(oids::CURVE_P384) => Some(oids::CURVE_P384),
        Some(_) => None,
        // Uncompressed point length when the curve is implicit
        None => match spki.key.len() {
            65 => Some(oids::CURVE_P256),
            97 => Some(oids::CURVE_P384),
            _ => None,
        },
    }
}

fn verification_algorithm(
    algorithm: &SignatureAlgorithm,
    spki: &PublicKeyInfo,
) -> Option<&'static dyn VerificationAlgorithm> {
    let key_alg = spki.algorithm.as_str();

    let alg: &'static dyn VerificationAlgorithm = match algorithm.oid() {
        oids::SHA256_WITH_RSA if key_alg == oids::RSA_ENCRYPTION => &signature::RSA_PKCS1_2048_8192_SHA256,
        oids::SHA384_WITH_RSA if key_alg == oids::RSA_ENCRYPTION => &signature::RSA_PKCS1_2048_8192_SHA384,
        oids::SHA512_WITH_RSA if key_alg == oids::RSA_ENCRYPTION => &signature::RSA_PKCS1_2048_8192_SHA512,
        oids::RSASSA_PSS if key_alg == oids::RSA_ENCRYPTION || key_alg == oids::RSASSA_PSS => {
            match algorithm.pss_hash()? {
                oids::SHA256 => &signature::RSA_PSS_2048_8192_SHA256,
                oids::SHA384 => &signature::RSA_PSS_2048_8192_SHA384,
                _ => &signature::RSA_PSS_2048_8192_SHA512,
            }
        }
        oids::ECDSA_WITH_SHA256 if key_alg == oids::EC_PUBLIC_KEY => match curve_of(spki)? {
            oids::CURVE_P256 => &signature::ECDSA_P256_SHA256_ASN1,
            _ => &signature::ECDSA_P384_SHA256_ASN1,
        },
        oids::ECDSA_WITH_SHA384 if key_alg == oids::EC_PUBLIC_KEY => match curve_of(spki)? {
            oids::CURVE_P256 => &signature::ECDSA_P256_SHA384_ASN1,
            _ => &signature::ECDSA_P384_SHA384_ASN1,
        },
        oids::ED25519 if key_alg == oids::ED25519 => &signature::ED25519,
        _ => return None,
    };

    Some(alg)
}

/// Verify `signature` over `message` with the subject public key `spki`.
/// Unsupported or mismatched algorithm/key combinations never verify.
pub fn verify_signed_data(
    algorithm: &SignatureAlgorithm,
    spki: &PublicKeyInfo,
    message: &[u8],
    signature: &[u8],
) -> bool {
    let Some(alg) = verification_algorithm(algorithm, spki) else {
        tracing::debug!(
            algorithm = %algorithm.oid(),
            key_algorithm = %spki.algorithm,
            "Unsupported signature algorithm"
        );
        return false;
    };

    UnparsedPublicKey::new(alg, &spki.key).verify(message, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};

    fn p256_key() -> (EcdsaKeyPair, PublicKeyInfo) {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        let spki = PublicKeyInfo {
            algorithm: oids::EC_PUBLIC_KEY.to_string(),
            curve: Some(oids::CURVE_P256.to_string()),
            key: key_pair.public_key().as_ref().to_vec(),
        };
        (key_pair, spki)
    }

    #[test]
    fn test_ecdsa_p256_signature_verifies() {
        let (key_pair, spki) = p256_key();
        let message = b"tbs bytes";
        let sig = key_pair.sign(&SystemRandom::new(), message).unwrap();
        let alg = SignatureAlgorithm::new(oids::ECDSA_WITH_SHA256, vec![]);

        assert!(verify_signed_data(&alg, &spki, message, sig.as_ref()));
        assert!(!verify_signed_data(&alg, &spki, b"other bytes", sig.as_ref()));
    }

    #[test]
    fn test_algorithm_key_mismatch_rejected() {
        let (key_pair, spki) = p256_key();
        let message = b"tbs bytes";
        let sig = key_pair.sign(&SystemRandom::new(), message).unwrap();

        // RSA signature algorithm against an EC key
        let rsa = SignatureAlgorithm::new(oids::SHA256_WITH_RSA, vec![]);
        assert!(!verify_signed_data(&rsa, &spki, message, sig.as_ref()));

        let unknown = SignatureAlgorithm::new("1.2.3.4", vec![]);
        assert!(!verify_signed_data(&unknown, &spki, message, sig.as_ref()));
    }

    #[test]
    fn test_implicit_curve_from_point_length() {
        let (key_pair, mut spki) = p256_key();
        spki.curve = None;
        let message = b"tbs bytes";
        let sig = key_pair.sign(&SystemRandom::new(), message).unwrap();
        let alg = SignatureAlgorithm::new(oids::ECDSA_WITH_SHA256, vec![]);
        assert!(verify_signed_data(&alg, &spki, message, sig.as_ref()));
    }

    #[test]
    fn test_pss_hash_requires_single_digest() {
        let sha256_oid = [0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
        let sha384_oid = [0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02];

        let mut params = sha256_oid.to_vec();
        params.extend_from_slice(&sha256_oid);
        assert_eq!(SignatureAlgorithm::new(oids::RSASSA_PSS, params).pss_hash(), Some(oids::SHA256));

        let mut mixed = sha256_oid.to_vec();
        mixed.extend_from_slice(&sha384_oid);
        assert_eq!(SignatureAlgorithm::new(oids::RSASSA_PSS, mixed).pss_hash(), None);

        // Absent parameters mean SHA-1, which is not accepted
        assert_eq!(SignatureAlgorithm::new(oids::RSASSA_PSS, vec![]).pss_hash(), None);
    }
}
