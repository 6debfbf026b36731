//! Generation attestation.
//!
//! Every completed generation gets an Ed25519-signed certificate binding the
//! audio hash to the request parameters. Certificates are appended to a JSON
//! lines ledger and mirrored into a public snapshot file.
//!
//! Key material is created only by [`initialize_keys`]; [`AttestationService::load`]
//! refuses to start without it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use fleet_protocol::{
    Certificate, CertificateData, GenerationSummary, LedgerEntry, LedgerInfo, PublicLedger,
    Verification, CERTIFICATE_TYPE, CERTIFICATE_VERSION, MODEL_ATTRIBUTION, PLATFORM,
};
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::config::AttestationConfig;
use crate::error::{FleetError, Result};

pub const PRIVATE_KEY_FILE: &str = "attestation_ed25519.key";
pub const PUBLIC_KEY_FILE: &str = "attestation_ed25519.pub";

const LEDGER_DISCLAIMER: &str = "This ledger provides generation attestation only. \
It does not constitute ownership claims or copyright assignment.";
const MAX_SEARCH_RESULTS: usize = 100;

/// Generate a key pair in `dir` unless one already exists.
///
/// Returns `true` when new keys were written. The private key is stored as a
/// hex seed readable only by the owner.
pub async fn initialize_keys(dir: &Path) -> Result<bool> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);
    if tokio::fs::try_exists(&private_path).await? && tokio::fs::try_exists(&public_path).await? {
        return Ok(false);
    }

    tokio::fs::create_dir_all(dir).await?;
    let signing_key = SigningKey::generate(&mut OsRng);
    tokio::fs::write(&private_path, hex::encode(signing_key.to_bytes())).await?;
    tokio::fs::write(&public_path, hex::encode(signing_key.verifying_key().to_bytes())).await?;
    set_mode(&private_path, 0o600).await?;
    set_mode(&public_path, 0o644).await?;

    tracing::info!(
        private_key = %private_path.display(),
        public_key = %public_path.display(),
        "Generated new attestation key pair"
    );
    Ok(true)
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Filters for [`AttestationService::search`]; all given filters must match
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub wav_hash: Option<String>,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
}

impl SearchCriteria {
    fn matches(&self, cert: &Certificate) -> bool {
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            if cert.data.username != username {
                return false;
            }
        }
        if let Some(hash) = self.wav_hash.as_deref().filter(|h| !h.is_empty()) {
            if !cert.data.wav_sha256.eq_ignore_ascii_case(hash) {
                return false;
            }
        }
        if self.date_from.is_some() || self.date_to.is_some() {
            let Ok(issued) = DateTime::parse_from_rfc3339(&cert.data.timestamp) else {
                return false;
            };
            let issued = issued.with_timezone(&Utc);
            if self.date_from.is_some_and(|from| issued < from) {
                return false;
            }
            if self.date_to.is_some_and(|to| issued > to) {
                return false;
            }
        }
        true
    }
}

/// Issued certificates in issuance order, indexed by request id
#[derive(Default)]
struct CertificateStore {
    certificates: Vec<Certificate>,
    by_request: HashMap<String, usize>,
}

impl CertificateStore {
    fn push(&mut self, cert: Certificate) {
        self.by_request.insert(cert.data.request_id.clone(), self.certificates.len());
        self.certificates.push(cert);
    }

    fn newest_first(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.iter().rev()
    }
}

pub struct AttestationService {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    fingerprint: String,
    ledger_path: PathBuf,
    public_ledger_path: PathBuf,
    store: RwLock<CertificateStore>,
}

impl AttestationService {
    /// Load the key pair and replay the certificate ledger.
    ///
    /// Missing or malformed keys are a [`FleetError::Signing`].
    pub async fn load(config: &AttestationConfig) -> Result<Self> {
        let signing_key = read_signing_key(&config.key_dir.join(PRIVATE_KEY_FILE)).await?;
        let verifying_key = read_verifying_key(&config.key_dir.join(PUBLIC_KEY_FILE)).await?;
        if signing_key.verifying_key() != verifying_key {
            return Err(FleetError::Signing(
                "public key does not match the private key".into(),
            ));
        }

        let mut store = CertificateStore::default();
        match tokio::fs::read_to_string(&config.ledger_path).await {
            Ok(data) => {
                for (n, line) in data.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                    match serde_json::from_str::<Certificate>(line) {
                        Ok(cert) => store.push(cert),
                        Err(e) => tracing::warn!(line = n + 1, error = %e, "Skipping malformed ledger line"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let fingerprint = hex::encode(Sha256::digest(verifying_key.as_bytes()));
        tracing::info!(
            fingerprint = %fingerprint,
            certificates = store.certificates.len(),
            "Attestation service ready"
        );
        Ok(Self {
            signing_key,
            verifying_key,
            fingerprint,
            ledger_path: config.ledger_path.clone(),
            public_ledger_path: config.public_ledger_path.clone(),
            store: RwLock::new(store),
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Sign a certificate for a finished generation and append it to the ledger.
    ///
    /// Each request id can be attested once; a second attempt is a `Conflict`.
    pub async fn issue(&self, summary: GenerationSummary, content_hash: &str) -> Result<Certificate> {
        let mut store = self.store.write().await;
        if store.by_request.contains_key(&summary.request_id) {
            return Err(FleetError::Conflict(format!(
                "certificate for request {} already exists",
                summary.request_id
            )));
        }

        let data = CertificateData {
            request_id: summary.request_id,
            user_id: summary.user_id,
            username: summary.username,
            prompt: summary.prompt,
            bpm: summary.bpm,
            key_signature: summary.key_signature,
            generation_duration: summary.generation_duration,
            sample_rate: summary.sample_rate,
            preferred_stems: summary.preferred_stems,
            worker_id: summary.worker_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            wav_sha256: content_hash.to_lowercase(),
            model_attribution: MODEL_ATTRIBUTION.to_string(),
            platform: PLATFORM.to_string(),
        };
        let payload = signature_payload(&data)?;
        let signature = self
            .signing_key
            .try_sign(payload.as_bytes())
            .map_err(|e| FleetError::Signing(e.to_string()))?;

        let cert = Certificate {
            version: CERTIFICATE_VERSION.to_string(),
            kind: CERTIFICATE_TYPE.to_string(),
            data,
            signature: BASE64.encode(signature.to_bytes()),
            public_key_fingerprint: self.fingerprint.clone(),
        };

        self.append_to_ledger(&cert).await?;
        store.push(cert.clone());

        if let Err(e) = self.write_public_snapshot(&store).await {
            tracing::error!(error = %e, path = %self.public_ledger_path.display(), "Failed to update public ledger");
        }

        tracing::info!(
            request_id = %cert.data.request_id,
            user_id = %cert.data.user_id,
            wav_hash = %cert.data.wav_sha256.chars().take(16).collect::<String>(),
            "Certificate issued"
        );
        Ok(cert)
    }

    /// Check a certificate's signature over its signed fields
    pub async fn verify(&self, cert: &Certificate) -> Verification {
        let exists_in_ledger = self.store.read().await.by_request.contains_key(&cert.data.request_id);
        let reason = match self.check_signature(cert) {
            Ok(()) => None,
            Err(reason) => Some(reason),
        };
        Verification {
            valid: reason.is_none(),
            reason,
            exists_in_ledger,
            verified_at: Utc::now(),
        }
    }

    fn check_signature(&self, cert: &Certificate) -> std::result::Result<(), String> {
        if cert.public_key_fingerprint != self.fingerprint {
            return Err("Certificate was signed with a different key".into());
        }
        let bytes = BASE64
            .decode(&cert.signature)
            .map_err(|_| "Signature is not valid base64".to_string())?;
        let signature =
            Signature::from_slice(&bytes).map_err(|_| "Malformed signature".to_string())?;
        let payload = signature_payload(&cert.data).map_err(|e| e.to_string())?;
        self.verifying_key
            .verify(payload.as_bytes(), &signature)
            .map_err(|_| "Invalid signature".to_string())
    }

    /// Ledger page, newest first
    pub async fn public_ledger(&self, limit: usize, offset: usize) -> PublicLedger {
        let store = self.store.read().await;
        self.render_ledger(&store, limit, offset)
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> Vec<Certificate> {
        self.store
            .read()
            .await
            .newest_first()
            .filter(|c| criteria.matches(c))
            .take(MAX_SEARCH_RESULTS)
            .cloned()
            .collect()
    }

    fn render_ledger(&self, store: &CertificateStore, limit: usize, offset: usize) -> PublicLedger {
        PublicLedger {
            ledger_info: LedgerInfo {
                generated_at: Utc::now(),
                total_entries: store.certificates.len(),
                platform: PLATFORM.to_string(),
                public_key_fingerprint: self.fingerprint.clone(),
                disclaimer: LEDGER_DISCLAIMER.to_string(),
            },
            entries: store
                .newest_first()
                .skip(offset)
                .take(limit)
                .map(LedgerEntry::from)
                .collect(),
        }
    }

    async fn append_to_ledger(&self, cert: &Certificate) -> Result<()> {
        if let Some(dir) = self.ledger_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut line = serde_json::to_string(cert)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn write_public_snapshot(&self, store: &CertificateStore) -> Result<()> {
        let ledger = self.render_ledger(store, usize::MAX, 0);
        if let Some(dir) = self.public_ledger_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.public_ledger_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&ledger)?).await?;
        tokio::fs::rename(&tmp, &self.public_ledger_path).await?;
        Ok(())
    }
}

/// Deterministic bytes covered by the signature: a fixed field subset with
/// keys in sorted order.
fn signature_payload(data: &CertificateData) -> Result<String> {
    let payload: BTreeMap<&str, Value> = BTreeMap::from([
        ("request_id", json!(data.request_id)),
        ("user_id", json!(data.user_id)),
        ("wav_sha256", json!(data.wav_sha256)),
        ("timestamp", json!(data.timestamp)),
        ("prompt", json!(data.prompt)),
        ("bpm", json!(data.bpm)),
        ("sample_rate", json!(data.sample_rate)),
    ]);
    Ok(serde_json::to_string(&payload)?)
}

async fn read_key_bytes(path: &Path) -> Result<[u8; 32]> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        FleetError::Signing(format!("cannot read key {}: {e}", path.display()))
    })?;
    let bytes = hex::decode(raw.trim())
        .map_err(|_| FleetError::Signing(format!("key {} is not valid hex", path.display())))?;
    bytes
        .try_into()
        .map_err(|_| FleetError::Signing(format!("key {} has the wrong length", path.display())))
}

async fn read_signing_key(path: &Path) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&read_key_bytes(path).await?))
}

async fn read_verifying_key(path: &Path) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(&read_key_bytes(path).await?)
        .map_err(|e| FleetError::Signing(format!("invalid public key {}: {e}", path.display())))
}

/// Lowercase hex SHA-256 of generated audio
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn service_in(dir: &TempDir) -> AttestationService {
        let config = AttestationConfig::under(&dir.path().to_string_lossy());
        initialize_keys(&config.key_dir).await.unwrap();
        AttestationService::load(&config).await.unwrap()
    }

    fn summary(request_id: &str) -> GenerationSummary {
        GenerationSummary {
            request_id: request_id.into(),
            user_id: "42".into(),
            username: "ada".into(),
            prompt: "dark techno loop".into(),
            bpm: 120.0,
            key_signature: Some("A minor".into()),
            generation_duration: 6.0,
            sample_rate: 48_000,
            preferred_stems: None,
            worker_id: "w1".into(),
        }
    }

    #[tokio::test]
    async fn test_initialize_keys_is_explicit_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = AttestationConfig::under(&dir.path().to_string_lossy());
        assert!(matches!(AttestationService::load(&config).await, Err(FleetError::Signing(_))));

        assert!(initialize_keys(&config.key_dir).await.unwrap());
        let first = AttestationService::load(&config).await.unwrap().public_key_hex();
        assert!(!initialize_keys(&config.key_dir).await.unwrap());
        let second = AttestationService::load(&config).await.unwrap().public_key_hex();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(config.key_dir.join(PRIVATE_KEY_FILE)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_key() {
        let dir = TempDir::new().unwrap();
        let config = AttestationConfig::under(&dir.path().to_string_lossy());
        initialize_keys(&config.key_dir).await.unwrap();
        std::fs::write(config.key_dir.join(PRIVATE_KEY_FILE), "not hex").unwrap();
        assert!(matches!(AttestationService::load(&config).await, Err(FleetError::Signing(_))));
    }

    #[tokio::test]
    async fn test_issue_then_verify() {
        let dir = TempDir::new().unwrap();
        let svc = service_in(&dir).await;
        let cert = svc.issue(summary("r1"), "ABCDEF").await.unwrap();

        assert_eq!(cert.kind, CERTIFICATE_TYPE);
        assert_eq!(cert.data.wav_sha256, "abcdef");
        assert_eq!(cert.data.model_attribution, MODEL_ATTRIBUTION);
        assert_eq!(cert.public_key_fingerprint, svc.fingerprint());

        let v = svc.verify(&cert).await;
        assert!(v.valid, "{:?}", v.reason);
        assert!(v.exists_in_ledger);
    }

    #[tokio::test]
    async fn test_issue_accepts_multibyte_content_hash() {
        let dir = TempDir::new().unwrap();
        let svc = service_in(&dir).await;
        let hash = "ééééééééééééééééé";
        let cert = svc.issue(summary("r1"), hash).await.unwrap();
        assert_eq!(cert.data.wav_sha256, hash);
        assert!(svc.verify(&cert).await.valid);
    }

    #[tokio::test]
    async fn test_changed_bpm_fails_verification() {
        let dir = TempDir::new().unwrap();
        let svc = service_in(&dir).await;
        let mut cert = svc.issue(summary("r1"), "abc").await.unwrap();
        cert.data.bpm = 121.0;
        let v = svc.verify(&cert).await;
        assert!(!v.valid);
        assert_eq!(v.reason.as_deref(), Some("Invalid signature"));
    }

    #[tokio::test]
    async fn test_any_signed_field_mutation_invalidates() {
        let dir = TempDir::new().unwrap();
        let svc = service_in(&dir).await;
        let cert = svc.issue(summary("r1"), "abc").await.unwrap();

        let mutations: Vec<fn(&mut CertificateData)> = vec![
            |d| d.request_id.push('x'),
            |d| d.user_id.push('x'),
            |d| d.wav_sha256.push('0'),
            |d| d.timestamp.push('Z'),
            |d| d.prompt.push('!'),
            |d| d.bpm += 0.5,
            |d| d.sample_rate = 44_100,
        ];
        for mutate in mutations {
            let mut tampered = cert.clone();
            mutate(&mut tampered.data);
            assert!(!svc.verify(&tampered).await.valid);
        }

        let mut bad_sig = cert.clone();
        bad_sig.signature = "!!!".into();
        assert!(!svc.verify(&bad_sig).await.valid);
    }

    #[tokio::test]
    async fn test_duplicate_request_is_conflict() {
        let dir = TempDir::new().unwrap();
        let svc = service_in(&dir).await;
        svc.issue(summary("r1"), "abc").await.unwrap();
        assert!(matches!(svc.issue(summary("r1"), "def").await, Err(FleetError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_ledger_survives_reload() {
        let dir = TempDir::new().unwrap();
        let config = AttestationConfig::under(&dir.path().to_string_lossy());
        let svc = service_in(&dir).await;
        let cert = svc.issue(summary("r1"), "abc").await.unwrap();
        svc.issue(summary("r2"), "def").await.unwrap();
        drop(svc);

        let reloaded = AttestationService::load(&config).await.unwrap();
        assert!(reloaded.verify(&cert).await.exists_in_ledger);
        assert!(matches!(reloaded.issue(summary("r2"), "x").await, Err(FleetError::Conflict(_))));

        let snapshot: PublicLedger =
            serde_json::from_slice(&std::fs::read(&config.public_ledger_path).unwrap()).unwrap();
        assert_eq!(snapshot.ledger_info.total_entries, 2);
        assert_eq!(snapshot.entries[0].request_id, "r2");
    }

    #[tokio::test]
    async fn test_public_ledger_paging() {
        let dir = TempDir::new().unwrap();
        let svc = service_in(&dir).await;
        for i in 0..5 {
            svc.issue(summary(&format!("r{i}")), "abc").await.unwrap();
        }
        let page = svc.public_ledger(2, 1).await;
        assert_eq!(page.ledger_info.total_entries, 5);
        let ids: Vec<_> = page.entries.iter().map(|e| e.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
    }

    #[tokio::test]
    async fn test_search_filters() {
        let dir = TempDir::new().unwrap();
        let svc = service_in(&dir).await;
        svc.issue(summary("r1"), "aaa").await.unwrap();
        let mut other = summary("r2");
        other.username = "grace".into();
        svc.issue(other, "bbb").await.unwrap();

        let by_user = svc
            .search(&SearchCriteria { username: Some("grace".into()), ..Default::default() })
            .await;
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].data.request_id, "r2");

        let by_hash = svc
            .search(&SearchCriteria { wav_hash: Some("AAA".into()), ..Default::default() })
            .await;
        assert_eq!(by_hash[0].data.request_id, "r1");

        let future = svc
            .search(&SearchCriteria {
                date_from: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .await;
        assert!(future.is_empty());
        assert_eq!(svc.search(&SearchCriteria::default()).await.len(), 2);
    }

    #[test]
    fn test_signature_payload_is_sorted() {
        let data = CertificateData {
            request_id: "r".into(),
            user_id: "u".into(),
            username: "n".into(),
            prompt: "p".into(),
            bpm: 120.0,
            key_signature: None,
            generation_duration: 6.0,
            sample_rate: 48_000,
            preferred_stems: None,
            worker_id: "w".into(),
            timestamp: "2024-05-01T00:00:00Z".into(),
            wav_sha256: "h".into(),
            model_attribution: String::new(),
            platform: String::new(),
        };
        assert_eq!(
            signature_payload(&data).unwrap(),
            r#"{"bpm":120.0,"prompt":"p","request_id":"r","sample_rate":48000,"timestamp":"2024-05-01T00:00:00Z","user_id":"u","wav_sha256":"h"}"#
        );
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
