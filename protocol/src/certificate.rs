use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CERTIFICATE_VERSION: &str = "1.0";
pub const CERTIFICATE_TYPE: &str = "generation_attestation";
pub const MODEL_ATTRIBUTION: &str = "Generated using Stability AI Stable Audio Open Small";
pub const PLATFORM: &str = "OBSIDIAN Neural Sound Engine by InnerMost47";

/// Facts about a completed generation, supplied by the caller at issuance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSummary {
    pub request_id: String,
    pub user_id: String,
    pub username: String,
    pub prompt: String,
    pub bpm: f64,
    #[serde(default)]
    pub key_signature: Option<String>,
    pub generation_duration: f64,
    pub sample_rate: u32,
    #[serde(default)]
    pub preferred_stems: Option<Vec<String>>,
    pub worker_id: String,
}

/// Everything a certificate records about a generation.
///
/// Only request id, user id, content hash, timestamp, prompt, bpm and sample
/// rate are covered by the signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateData {
    pub request_id: String,
    pub user_id: String,
    pub username: String,
    pub prompt: String,
    pub bpm: f64,
    pub key_signature: Option<String>,
    pub generation_duration: f64,
    pub sample_rate: u32,
    pub preferred_stems: Option<Vec<String>>,
    pub worker_id: String,
    /// RFC 3339 issuance time, signed verbatim
    pub timestamp: String,
    pub wav_sha256: String,
    pub model_attribution: String,
    pub platform: String,
}

/// Signed, immutable attestation of one generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: CertificateData,
    /// Base64 detached signature over the canonical payload
    pub signature: String,
    /// SHA-256 hex of the signing public key
    pub public_key_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verification {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub exists_in_ledger: bool,
    pub verified_at: DateTime<Utc>,
}

/// One row of the public ledger snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub request_id: String,
    pub username: String,
    pub prompt: String,
    pub timestamp: String,
    pub wav_sha256: String,
    pub signature: String,
    pub model_attribution: String,
}

impl From<&Certificate> for LedgerEntry {
    fn from(cert: &Certificate) -> Self {
        Self {
            request_id: cert.data.request_id.clone(),
            username: cert.data.username.clone(),
            prompt: cert.data.prompt.clone(),
            timestamp: cert.data.timestamp.clone(),
            wav_sha256: cert.data.wav_sha256.clone(),
            signature: cert.signature.clone(),
            model_attribution: cert.data.model_attribution.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerInfo {
    pub generated_at: DateTime<Utc>,
    pub total_entries: usize,
    pub platform: String,
    pub public_key_fingerprint: String,
    pub disclaimer: String,
}

/// Publicly servable snapshot of issued certificates, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicLedger {
    pub ledger_info: LedgerInfo,
    pub entries: Vec<LedgerEntry>,
}
