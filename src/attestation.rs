//! Attestation issuing: a signed measurement over the finalized verdict.
//!
//! The issuer is invoked by the transport after the verdict is final, so the
//! measured value never references its own signature. Documents follow the
//! OML 1.0 layout: two measurement registers (PCR0 over the verdict, PCR1
//! over the configuration), caller-visible user data, and a detached RSA-PSS
//! signature verifiable against the embedded public key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use miette::Diagnostic;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::AuditConfig;
use crate::verdict::Verdict;

/// Document format tag.
const DOCUMENT_VERSION: &str = "OML_1.0";

/// Errors raised by the attestation issuer.
#[derive(Debug, Error, Diagnostic)]
pub enum AttestationError {
    #[error("failed to generate signing key: {message}")]
    #[diagnostic(code(txsentry::attestation::keygen))]
    KeyGeneration { message: String },

    #[error("failed to encode public key: {message}")]
    #[diagnostic(code(txsentry::attestation::public_key))]
    PublicKey { message: String },

    #[error("failed to serialize attestation payload: {0}")]
    #[diagnostic(code(txsentry::attestation::serialize))]
    Serialize(#[from] serde_json::Error),
}

/// The measured document carried inside a quote.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub version: String,
    pub tee_type: String,
    /// SHA-256 hex of the canonical verdict serialization.
    pub pcr0: String,
    /// SHA-256 hex of the canonical configuration serialization.
    pub pcr1: String,
    /// JSON string carrying the verdict risk level.
    pub user_data: String,
    pub tee_fingerprint: String,
    /// ISO-8601 issuance time.
    pub timestamp: String,
}

/// A complete attestation: base64 quote, detached signature, and the PEM
/// public key it verifies against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationBundle {
    pub quote: String,
    pub signature: String,
    pub public_key: String,
}

/// Issues and verifies attestation bundles with a per-process signing key.
pub struct AttestationIssuer {
    signing_key: BlindedSigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    public_key_pem: String,
    tee_fingerprint: String,
}

impl AttestationIssuer {
    /// Generate a fresh 2048-bit signing key.
    pub fn new(tee_fingerprint: impl Into<String>) -> Result<Self, AttestationError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| {
            AttestationError::KeyGeneration {
                message: e.to_string(),
            }
        })?;
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AttestationError::PublicKey {
                message: e.to_string(),
            })?;
        Ok(Self {
            signing_key: BlindedSigningKey::new(private_key),
            verifying_key: VerifyingKey::new(public_key),
            public_key_pem,
            tee_fingerprint: tee_fingerprint.into(),
        })
    }

    /// Issue a signed attestation over a finalized verdict.
    pub fn issue(
        &self,
        verdict: &Verdict,
        config: &AuditConfig,
    ) -> Result<AttestationBundle, AttestationError> {
        let document = AttestationDocument {
            version: DOCUMENT_VERSION.into(),
            tee_type: "SIMULATED_TEE".into(),
            pcr0: canonical_digest(&serde_json::to_value(verdict)?),
            pcr1: canonical_digest(&serde_json::to_value(config)?),
            user_data: serde_json::to_string(&json!({
                "risk_level": verdict.risk_level,
            }))?,
            tee_fingerprint: self.tee_fingerprint.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        // Quote and signature cover the same canonical (sort-keyed) bytes.
        let canonical = canonical_bytes(&serde_json::to_value(&document)?)?;
        let signature = self
            .signing_key
            .sign_with_rng(&mut rand::thread_rng(), &canonical);

        Ok(AttestationBundle {
            quote: BASE64.encode(&canonical),
            signature: BASE64.encode(signature.to_bytes()),
            public_key: self.public_key_pem.clone(),
        })
    }

    /// Verify a bundle against this issuer's key.
    #[must_use]
    pub fn verify(&self, quote_b64: &str, signature_b64: &str) -> bool {
        let Ok(quote) = BASE64.decode(quote_b64) else {
            return false;
        };
        let Ok(raw_signature) = BASE64.decode(signature_b64) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(raw_signature.as_slice()) else {
            return false;
        };
        self.verifying_key.verify(&quote, &signature).is_ok()
    }

    /// Response metadata block: quote, signature, and system fingerprint.
    pub fn response_metadata(
        &self,
        verdict: &Verdict,
        config: &AuditConfig,
        service: &str,
    ) -> Result<serde_json::Value, AttestationError> {
        let bundle = self.issue(verdict, config)?;
        Ok(json!({
            "oml_attestation": bundle.quote,
            "oml_signature": bundle.signature,
            "oml_public_key": bundle.public_key,
            "system_fingerprint": self.system_fingerprint(service),
        }))
    }

    /// `{service}@{fingerprint[:8]}_{hash8}` identity string.
    #[must_use]
    pub fn system_fingerprint(&self, service: &str) -> String {
        let tee_prefix: String = self.tee_fingerprint.chars().take(8).collect();
        let info = json!({ "service": service, "tee": tee_prefix });
        let digest = canonical_digest(&info);
        format!("{service}@{tee_prefix}_{}", &digest[..8])
    }
}

/// Canonical serialization of a JSON value: serde_json object maps are
/// key-sorted, so converting through `Value` yields sort-keyed bytes.
fn canonical_bytes(value: &serde_json::Value) -> Result<Vec<u8>, AttestationError> {
    Ok(serde_json::to_vec(value)?)
}

/// SHA-256 hex digest of the canonical serialization.
#[must_use]
pub fn canonical_digest(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskLevel;
    use crate::verdict::{Evidence, TransactionEcho};

    fn verdict(level: RiskLevel) -> Verdict {
        Verdict {
            risk_level: level,
            confidence: 0.8,
            risk_score: 0.1,
            summary: "ok".into(),
            findings: vec![],
            recommendations: vec![],
            evidence: Evidence::default(),
            transaction: TransactionEcho::default(),
            execution_history: vec!["perception".into()],
        }
    }

    #[test]
    fn issued_bundle_verifies() {
        let issuer = AttestationIssuer::new("mock_tee_fp_0x5d2a").unwrap();
        let config = AuditConfig::default();
        let bundle = issuer.issue(&verdict(RiskLevel::Safe), &config).unwrap();
        assert!(issuer.verify(&bundle.quote, &bundle.signature));
    }

    #[test]
    fn tampered_quote_fails_verification() {
        let issuer = AttestationIssuer::new("mock_tee_fp_0x5d2a").unwrap();
        let config = AuditConfig::default();
        let bundle = issuer.issue(&verdict(RiskLevel::Safe), &config).unwrap();

        let mut raw = BASE64.decode(&bundle.quote).unwrap();
        raw[0] ^= 0x01;
        let tampered = BASE64.encode(&raw);
        assert!(!issuer.verify(&tampered, &bundle.signature));
    }

    #[test]
    fn document_carries_risk_level_and_registers() {
        let issuer = AttestationIssuer::new("mock_tee_fp_0x5d2a").unwrap();
        let config = AuditConfig::default();
        let bundle = issuer.issue(&verdict(RiskLevel::Critical), &config).unwrap();

        let decoded = BASE64.decode(&bundle.quote).unwrap();
        let document: AttestationDocument = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(document.version, "OML_1.0");
        assert_eq!(document.pcr0.len(), 64);
        assert_eq!(document.pcr1.len(), 64);
        assert!(document.user_data.contains("CRITICAL"));
    }

    #[test]
    fn pcr0_tracks_the_verdict() {
        let issuer = AttestationIssuer::new("fp").unwrap();
        let config = AuditConfig::default();
        let a = issuer.issue(&verdict(RiskLevel::Safe), &config).unwrap();
        let b = issuer.issue(&verdict(RiskLevel::Critical), &config).unwrap();
        let doc_a: AttestationDocument =
            serde_json::from_slice(&BASE64.decode(&a.quote).unwrap()).unwrap();
        let doc_b: AttestationDocument =
            serde_json::from_slice(&BASE64.decode(&b.quote).unwrap()).unwrap();
        assert_ne!(doc_a.pcr0, doc_b.pcr0);
        assert_eq!(doc_a.pcr1, doc_b.pcr1);
    }

    #[test]
    fn fingerprint_shape() {
        let issuer = AttestationIssuer::new("mock_tee_fp_0x5d2a").unwrap();
        let fingerprint = issuer.system_fingerprint("txsentry");
        assert!(fingerprint.starts_with("txsentry@mock_tee_"));
        let hash_part = fingerprint.rsplit('_').next().unwrap();
        assert_eq!(hash_part.len(), 8);
    }

    #[test]
    fn public_key_is_pem_spki() {
        let issuer = AttestationIssuer::new("fp").unwrap();
        let config = AuditConfig::default();
        let bundle = issuer.issue(&verdict(RiskLevel::Safe), &config).unwrap();
        assert!(bundle.public_key.starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}
