//! Shared fixtures: an rcgen test PKI, DER builders for OCSP responses and
//! CRLs signed with ring, and an in-memory network double.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa};
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vss_engine::config::{
    Config, FailMode, PolicyConfig, RevocationMechanism, RevocationPolicy, TrustAnchorConfig,
};
use vss_engine::fetch::{CertificateSource, CrlFetcher, IssuerFetcher, OcspFetcher};
use vss_engine::pkix::codec::Certificate;
use vss_engine::{EngineBuilder, Result, ValidationEngine, VssError};

/// 2025-06-15T15:06:40Z
pub const NOW: i64 = 1_750_000_000;
pub const HOUR: i64 = 3600;
pub const DAY: i64 = 86_400;

pub const POLICY_OID: &str = "2.16.840.1.101.10.2.18.2.1";
pub const PIV_AUTH: &str = "2.16.840.1.101.3.2.1.3.7";
pub const ANY_POLICY: &str = "2.5.29.32.0";

pub const LEAF_OCSP_URL: &str = "http://ocsp.intermediate.test/";
pub const LEAF_CRL_URL: &str = "http://crl.intermediate.test/intermediate.crl";
pub const LEAF_CA_ISSUERS_URL: &str = "http://aia.intermediate.test/intermediate.cer";
pub const INTERMEDIATE_OCSP_URL: &str = "http://ocsp.root.test/";
pub const INTERMEDIATE_CRL_URL: &str = "http://crl.root.test/root.crl";

// ---- DER helpers ----------------------------------------------------------

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len.to_be_bytes().iter().copied().skip_while(|b| *b == 0).collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend(bytes);
    }
    out.extend_from_slice(content);
    out
}

pub fn sequence(items: &[Vec<u8>]) -> Vec<u8> {
    tlv(0x30, &items.concat())
}

pub fn oid(dotted: &str) -> Vec<u8> {
    let arcs: Vec<u64> = dotted.split('.').map(|a| a.parse().unwrap()).collect();
    let mut body = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        let mut chunk = vec![(arc & 0x7f) as u8];
        let mut rest = arc >> 7;
        while rest > 0 {
            chunk.insert(0, ((rest & 0x7f) as u8) | 0x80);
            rest >>= 7;
        }
        body.extend(chunk);
    }
    tlv(0x06, &body)
}

pub fn octet_string(bytes: &[u8]) -> Vec<u8> {
    tlv(0x04, bytes)
}

pub fn bit_string(bytes: &[u8]) -> Vec<u8> {
    let mut content = vec![0];
    content.extend_from_slice(bytes);
    tlv(0x03, &content)
}

pub fn generalized_time(seconds: i64) -> Vec<u8> {
    let time = DateTime::<Utc>::from_timestamp(seconds, 0).unwrap();
    tlv(0x18, time.format("%Y%m%d%H%M%SZ").to_string().as_bytes())
}

pub fn utc_time(seconds: i64) -> Vec<u8> {
    let time = DateTime::<Utc>::from_timestamp(seconds, 0).unwrap();
    tlv(0x17, time.format("%y%m%d%H%M%SZ").to_string().as_bytes())
}

fn ecdsa_with_sha256() -> Vec<u8> {
    sequence(&[oid("1.2.840.10045.4.3.2")])
}

fn sha1(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data).as_ref().to_vec()
}

pub fn pem(der: &[u8]) -> String {
    let body = general_purpose::STANDARD.encode(der);
    let lines: Vec<&str> = body
        .as_bytes()
        .chunks(64)
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .collect();
    format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", lines.join("\n"))
}

// ---- Extensions -------------------------------------------------------------

fn uri(url: &str) -> Vec<u8> {
    tlv(0x86, url.as_bytes())
}

pub fn aia_extension(ocsp: Option<&str>, ca_issuers: Option<&str>) -> CustomExtension {
    let mut descriptions = Vec::new();
    if let Some(url) = ocsp {
        descriptions.push(sequence(&[oid("1.3.6.1.5.5.7.48.1"), uri(url)]));
    }
    if let Some(url) = ca_issuers {
        descriptions.push(sequence(&[oid("1.3.6.1.5.5.7.48.2"), uri(url)]));
    }
    CustomExtension::from_oid_content(&[1, 3, 6, 1, 5, 5, 7, 1, 1], sequence(&descriptions))
}

pub fn crl_distribution_point(url: &str) -> CustomExtension {
    let point = sequence(&[tlv(0xa0, &tlv(0xa0, &uri(url)))]);
    CustomExtension::from_oid_content(&[2, 5, 29, 31], sequence(&[point]))
}

pub fn certificate_policies(policies: &[&str]) -> CustomExtension {
    let infos: Vec<Vec<u8>> = policies.iter().map(|p| sequence(&[oid(p)])).collect();
    CustomExtension::from_oid_content(&[2, 5, 29, 32], sequence(&infos))
}

// ---- Test PKI ---------------------------------------------------------------

/// A certificate together with the key that can sign with it.
pub struct TestCert {
    pub rcgen: rcgen::Certificate,
    pub der: Vec<u8>,
    pub cert: Certificate,
    key: EcdsaKeyPair,
}

impl TestCert {
    pub fn b64(&self) -> String {
        general_purpose::STANDARD.encode(&self.der)
    }

    pub fn x5t(&self) -> String {
        self.cert.fingerprint().x5t_s256()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key
            .sign(&SystemRandom::new(), message)
            .unwrap()
            .as_ref()
            .to_vec()
    }
}

pub fn params(cn: &str, ca: bool) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.is_ca = if ca {
        IsCa::Ca(rcgen::BasicConstraints::Unconstrained)
    } else {
        IsCa::NoCa
    };
    params
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0x1000);

/// Short positive serial so encodings never need a sign pad.
fn next_serial() -> rcgen::SerialNumber {
    let value = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    rcgen::SerialNumber::from_slice(&bytes[start..])
}

/// Issue a certificate from `params`, self-signed when `signer` is `None`.
/// Serials are assigned sequentially unless `params` already pins one.
pub fn issue(mut params: CertificateParams, signer: Option<&TestCert>) -> TestCert {
    if params.serial_number.is_none() {
        params.serial_number = Some(next_serial());
    }
    let rcgen = rcgen::Certificate::from_params(params).unwrap();
    let der = match signer {
        Some(signer) => rcgen.serialize_der_with_signer(&signer.rcgen).unwrap(),
        None => rcgen.serialize_der().unwrap(),
    };
    let pkcs8 = rcgen.serialize_private_key_der();
    let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8, &SystemRandom::new()).unwrap();
    let cert = Certificate::from_der(&der).unwrap();
    TestCert { rcgen, der, cert, key }
}

/// Root A, intermediate I1 and leaf C1. Both I1 and C1 assert the PIV
/// authentication policy and name OCSP and CRL locators.
pub struct Pki {
    pub root: TestCert,
    pub intermediate: TestCert,
    pub leaf: TestCert,
}

impl Pki {
    pub fn new() -> Self {
        Self::with_policies(&[PIV_AUTH])
    }

    pub fn with_policies(policies: &[&str]) -> Self {
        Self::build(policies, |_| {})
    }

    /// Build the standard chain, letting `customize_leaf` adjust the leaf.
    pub fn build(policies: &[&str], customize_leaf: impl FnOnce(&mut CertificateParams)) -> Self {
        let root = issue(params("Test Root CA", true), None);
        let intermediate = issue(intermediate_params(policies), Some(&root));

        let mut leaf = leaf_params("Test Leaf", policies);
        customize_leaf(&mut leaf);
        let leaf = issue(leaf, Some(&intermediate));

        Self { root, intermediate, leaf }
    }

    /// Another leaf under I1 with the same locators as C1.
    pub fn sibling_leaf(&self, cn: &str) -> TestCert {
        issue(leaf_params(cn, &[PIV_AUTH]), Some(&self.intermediate))
    }

    /// A copy of I1 under the same key and name that expired in 2021.
    pub fn expired_intermediate(&self) -> TestCert {
        let mut inter = intermediate_params(&[PIV_AUTH]);
        inter.not_before = rcgen::date_time_ymd(2019, 1, 1);
        inter.not_after = rcgen::date_time_ymd(2021, 1, 1);
        inter.key_pair = Some(rcgen::KeyPair::from_der(&self.intermediate.rcgen.serialize_private_key_der()).unwrap());
        issue(inter, Some(&self.root))
    }
}

pub fn intermediate_params(policies: &[&str]) -> CertificateParams {
    let mut inter = params("Test Intermediate CA", true);
    inter.custom_extensions.push(certificate_policies(policies));
    inter.custom_extensions.push(aia_extension(Some(INTERMEDIATE_OCSP_URL), None));
    inter.custom_extensions.push(crl_distribution_point(INTERMEDIATE_CRL_URL));
    inter
}

pub fn leaf_params(cn: &str, policies: &[&str]) -> CertificateParams {
    let mut leaf = params(cn, false);
    leaf.custom_extensions.push(certificate_policies(policies));
    leaf.custom_extensions.push(aia_extension(Some(LEAF_OCSP_URL), Some(LEAF_CA_ISSUERS_URL)));
    leaf.custom_extensions.push(crl_distribution_point(LEAF_CRL_URL));
    leaf
}

// ---- OCSP -------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum OcspAnswer {
    Good,
    Revoked(i64),
    Unknown,
}

pub struct OcspSpec<'a> {
    pub subject: &'a TestCert,
    pub issuer: &'a TestCert,
    pub answer: OcspAnswer,
    pub this_update: i64,
    pub next_update: Option<i64>,
    /// Signs the response; the issuer unless a delegate is being tested.
    pub signer: &'a TestCert,
    pub embed_signer: bool,
}

impl<'a> OcspSpec<'a> {
    pub fn new(subject: &'a TestCert, issuer: &'a TestCert, answer: OcspAnswer) -> Self {
        Self {
            subject,
            issuer,
            answer,
            this_update: NOW - HOUR,
            next_update: Some(NOW + DAY),
            signer: issuer,
            embed_signer: false,
        }
    }
}

pub fn cert_id(subject: &Certificate, issuer: &Certificate) -> Vec<u8> {
    sequence(&[
        sequence(&[oid("1.3.14.3.2.26"), vec![0x05, 0x00]]),
        octet_string(&sha1(issuer.subject().as_der())),
        octet_string(&sha1(&issuer.public_key().key)),
        tlv(0x02, subject.serial()),
    ])
}

pub fn ocsp_response(spec: &OcspSpec<'_>) -> Vec<u8> {
    let status = match spec.answer {
        OcspAnswer::Good => vec![0x80, 0x00],
        OcspAnswer::Revoked(at) => tlv(0xa1, &generalized_time(at)),
        OcspAnswer::Unknown => vec![0x82, 0x00],
    };

    let mut single = vec![cert_id(&spec.subject.cert, &spec.issuer.cert), status, generalized_time(spec.this_update)];
    if let Some(next) = spec.next_update {
        single.push(tlv(0xa0, &generalized_time(next)));
    }

    let responder_id = tlv(0xa2, &octet_string(&sha1(&spec.signer.cert.public_key().key)));
    let tbs = sequence(&[responder_id, generalized_time(spec.this_update), sequence(&[sequence(&single)])]);

    let mut basic = vec![tbs.clone(), ecdsa_with_sha256(), bit_string(&spec.signer.sign(&tbs))];
    if spec.embed_signer {
        basic.push(tlv(0xa0, &sequence(&[spec.signer.der.clone()])));
    }
    let basic = sequence(&basic);

    sequence(&[
        tlv(0x0a, &[0x00]),
        tlv(0xa0, &sequence(&[oid("1.3.6.1.5.5.7.48.1.1"), octet_string(&basic)])),
    ])
}

// ---- CRL --------------------------------------------------------------------

/// One DER `Extension`.
pub fn extension(dotted: &str, critical: bool, value: &[u8]) -> Vec<u8> {
    let mut fields = vec![oid(dotted)];
    if critical {
        fields.push(vec![0x01, 0x01, 0xff]);
    }
    fields.push(octet_string(value));
    sequence(&fields)
}

pub fn delta_crl_indicator(base_crl_number: u8) -> Vec<u8> {
    extension("2.5.29.27", true, &tlv(0x02, &[base_crl_number]))
}

/// IssuingDistributionPoint asserting onlyContainsCACerts.
pub fn ca_only_distribution_point() -> Vec<u8> {
    extension("2.5.29.28", true, &sequence(&[vec![0x82, 0x01, 0xff]]))
}

pub fn crl_number(number: u8) -> Vec<u8> {
    extension("2.5.29.20", false, &tlv(0x02, &[number]))
}

pub fn crl(issuer: &TestCert, revoked: &[(&Certificate, i64)], this_update: i64, next_update: i64) -> Vec<u8> {
    crl_with_extensions(issuer, revoked, this_update, next_update, &[])
}

pub fn crl_with_extensions(
    issuer: &TestCert,
    revoked: &[(&Certificate, i64)],
    this_update: i64,
    next_update: i64,
    extensions: &[Vec<u8>],
) -> Vec<u8> {
    let mut tbs = vec![
        tlv(0x02, &[0x01]),
        ecdsa_with_sha256(),
        issuer.cert.subject().as_der().to_vec(),
        utc_time(this_update),
        utc_time(next_update),
    ];

    if !revoked.is_empty() {
        let entries: Vec<Vec<u8>> = revoked
            .iter()
            .map(|(cert, at)| sequence(&[tlv(0x02, cert.serial()), utc_time(*at)]))
            .collect();
        tbs.push(sequence(&entries));
    }

    if !extensions.is_empty() {
        tbs.push(tlv(0xa0, &sequence(extensions)));
    }

    let tbs = sequence(&tbs);
    sequence(&[tbs.clone(), ecdsa_with_sha256(), bit_string(&issuer.sign(&tbs))])
}

// ---- Network double -----------------------------------------------------------

#[derive(Clone)]
pub enum Canned {
    Bytes(Vec<u8>),
    Unreachable,
    Hang,
}

/// In-memory stand-in for the HTTP fetcher. Answers by URL, counts calls,
/// and can delay every answer.
#[derive(Default)]
pub struct MockNetwork {
    responses: Mutex<HashMap<String, Canned>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.responses.lock().insert(url.to_string(), Canned::Bytes(bytes));
    }

    pub fn fail(&self, url: &str) {
        self.responses.lock().insert(url.to_string(), Canned::Unreachable);
    }

    pub fn hang(&self, url: &str) {
        self.responses.lock().insert(url.to_string(), Canned::Hang);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    async fn answer(&self, url: &str) -> Result<Vec<u8>> {
        *self.calls.lock().entry(url.to_string()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let canned = self.responses.lock().get(url).cloned();
        match canned {
            Some(Canned::Bytes(bytes)) => Ok(bytes),
            Some(Canned::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(VssError::Timeout(url.to_string()))
            }
            Some(Canned::Unreachable) | None => Err(VssError::Fetch(format!("{}: connection refused", url))),
        }
    }
}

#[async_trait]
impl IssuerFetcher for MockNetwork {
    async fn fetch_issuers(&self, url: &str) -> Result<Vec<u8>> {
        self.answer(url).await
    }
}

#[async_trait]
impl OcspFetcher for MockNetwork {
    async fn fetch_ocsp(&self, url: &str, _request: &[u8]) -> Result<Vec<u8>> {
        self.answer(url).await
    }
}

#[async_trait]
impl CrlFetcher for MockNetwork {
    async fn fetch_crl(&self, url: &str) -> Result<Vec<u8>> {
        self.answer(url).await
    }
}

pub struct StaticBundle(pub Vec<Vec<u8>>);

#[async_trait]
impl CertificateSource for StaticBundle {
    fn name(&self) -> &str {
        "static"
    }

    async fn load(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.0.clone())
    }
}

// ---- Engine wiring ------------------------------------------------------------

pub fn policy_config(fail_mode: FailMode) -> PolicyConfig {
    PolicyConfig {
        oid: POLICY_OID.to_string(),
        name: "PIV authentication".to_string(),
        trust_anchors: vec!["test-root".to_string()],
        required_policies: vec![PIV_AUTH.to_string()],
        max_path_length: 5,
        require_explicit_policy: false,
        inhibit_policy_mapping: false,
        inhibit_any_policy: false,
        trust_anchors_directly: false,
        revocation: RevocationPolicy {
            mechanisms: vec![RevocationMechanism::Ocsp, RevocationMechanism::Crl],
            fail_mode,
            crl_fallback: true,
        },
    }
}

pub fn config(root: &TestCert, policy: PolicyConfig) -> Config {
    let mut config = Config::default();
    config.trust_anchors.push(TrustAnchorConfig {
        name: "test-root".to_string(),
        certificate_pem: Some(pem(&root.der)),
        ..Default::default()
    });
    config.policies.push(policy);
    config.revocation.ocsp_timeout_ms = 200;
    config.revocation.crl_timeout_ms = 200;
    config.intermediate_cache.fetch_timeout_ms = 200;
    config
}

/// Engine over `net` with `bundle` as the curated intermediate set.
pub async fn engine(config: Config, bundle: Vec<Vec<u8>>, net: &Arc<MockNetwork>) -> ValidationEngine {
    EngineBuilder::new(config)
        .with_sources(vec![Arc::new(StaticBundle(bundle)) as Arc<dyn CertificateSource>])
        .with_issuer_fetcher(net.clone())
        .with_ocsp_fetcher(net.clone())
        .with_crl_fetcher(net.clone())
        .with_background_refresh(false)
        .build()
        .await
        .unwrap()
}

/// Serve `good` OCSP answers for both C1 and I1.
pub fn serve_all_good(pki: &Pki, net: &MockNetwork) {
    net.serve(
        LEAF_OCSP_URL,
        ocsp_response(&OcspSpec::new(&pki.leaf, &pki.intermediate, OcspAnswer::Good)),
    );
    net.serve(
        INTERMEDIATE_OCSP_URL,
        ocsp_response(&OcspSpec::new(&pki.intermediate, &pki.root, OcspAnswer::Good)),
    );
}
