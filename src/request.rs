//! Request boundary record.
//!
//! The HTTP layer deserialises this from JSON and hands it to the engine.
//! Fields the engine does not know are kept in `additional_properties` so the
//! boundary can log or echo them; the engine never reads that map.

use crate::config::RequestLimits;
use crate::error::{Result, VssError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub validation_policy: Option<String>,
    pub x509_certificate: Option<String>,
    pub want_back_list: Option<Vec<String>>,
    #[serde(flatten)]
    pub additional_properties: Map<String, Value>,
}

impl ValidationRequest {
    pub fn new(validation_policy: impl Into<String>, x509_certificate: impl Into<String>, want_back_list: Vec<String>) -> Self {
        Self {
            validation_policy: Some(validation_policy.into()),
            x509_certificate: Some(x509_certificate.into()),
            want_back_list: Some(want_back_list),
            additional_properties: Map::new(),
        }
    }

    /// Presence and size checks performed before any decoding.
    pub fn pre_validate(&self, limits: &RequestLimits) -> Result<()> {
        let (policy, certificate) = match (&self.validation_policy, &self.x509_certificate, &self.want_back_list) {
            (Some(policy), Some(certificate), Some(_)) => (policy, certificate),
            _ => {
                return Err(VssError::InvalidRequest(
                    "Request must include validationPolicy, wantBackList, and x509Certificate".to_string(),
                ))
            }
        };

        if policy.len() >= limits.max_oid_length {
            return Err(VssError::PayloadTooLarge {
                field: "validationPolicy",
                actual: policy.len(),
                limit: limits.max_oid_length,
            });
        }

        if certificate.len() >= limits.max_certificate_length {
            return Err(VssError::PayloadTooLarge {
                field: "x509Certificate",
                actual: certificate.len(),
                limit: limits.max_certificate_length,
            });
        }

        Ok(())
    }

    pub fn policy_oid(&self) -> &str {
        self.validation_policy.as_deref().unwrap_or_default()
    }

    pub fn certificate(&self) -> &str {
        self.x509_certificate.as_deref().unwrap_or_default()
    }

    pub fn want_back(&self) -> &[String] {
        self.want_back_list.as_deref().unwrap_or_default()
    }
}
