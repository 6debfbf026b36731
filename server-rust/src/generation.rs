//! End-to-end generation: validate, dispatch, call the worker, attest.

use fleet_protocol::{
    Certificate, DispatchRequirements, GenerationRequest, GenerationSummary, SelectionStrategy,
    WorkerAssignment, WorkerGenerateRequest,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;

use crate::attestation::{content_hash, AttestationService};
use crate::dispatcher::Dispatcher;
use crate::error::{FleetError, Result};
use crate::worker_client::WorkerClient;

const VALID_STEMS: [&str; 6] = ["drums", "bass", "other", "vocals", "guitar", "piano"];
const KEY_ROOTS: [&str; 17] = [
    "C", "C#", "Db", "D", "D#", "Eb", "E", "F", "F#", "Gb", "G", "G#", "Ab", "A", "A#", "Bb", "B",
];

/// Generation parameters after validation and defaulting
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub bpm: f64,
    pub key: Option<String>,
    pub measures: u32,
    pub generation_duration: f64,
    pub sample_rate: u32,
    pub preferred_stems: Option<Vec<String>>,
}

impl GenerationParams {
    pub fn validate(req: &GenerationRequest) -> Result<Self> {
        let invalid = |msg: &str| FleetError::Validation(msg.to_string());

        let prompt = req.prompt.trim();
        if prompt.chars().count() < 3 {
            return Err(invalid("prompt must be at least 3 characters long"));
        }
        if !(60.0..=200.0).contains(&req.bpm) {
            return Err(invalid("bpm must be between 60 and 200"));
        }
        let generation_duration = req.generation_duration.unwrap_or(6.0);
        if !(1.0..=30.0).contains(&generation_duration) {
            return Err(invalid("generation duration must be between 1 and 30 seconds"));
        }
        let sample_rate = req.sample_rate.unwrap_or(48_000);
        if sample_rate != 44_100 && sample_rate != 48_000 {
            return Err(invalid("sample rate must be 44100 or 48000 Hz"));
        }
        let measures = req.measures.unwrap_or(4);
        if !(1..=16).contains(&measures) {
            return Err(invalid("measures must be between 1 and 16"));
        }

        let preferred_stems = match req.preferred_stems.as_deref() {
            None | Some([]) => None,
            Some(stems) => {
                let unknown: Vec<&str> = stems
                    .iter()
                    .map(String::as_str)
                    .filter(|s| !VALID_STEMS.contains(s))
                    .collect();
                if !unknown.is_empty() {
                    return Err(FleetError::Validation(format!("invalid stems: {}", unknown.join(", "))));
                }
                Some(stems.to_vec())
            }
        };

        let key = match req.key.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(k) if is_valid_key(k) => Some(k.to_string()),
            Some(k) => return Err(FleetError::Validation(format!("invalid key '{k}'"))),
        };

        Ok(Self {
            prompt: prompt.to_string(),
            bpm: req.bpm,
            key,
            measures,
            generation_duration,
            sample_rate,
            preferred_stems,
        })
    }

    pub fn requirements(&self) -> DispatchRequirements {
        DispatchRequirements {
            generation_duration: self.generation_duration,
            sample_rate: self.sample_rate,
            preferred_stems: self.preferred_stems.clone().unwrap_or_default(),
        }
    }
}

fn is_valid_key(key: &str) -> bool {
    match key.split_once(' ') {
        Some((root, mode)) => KEY_ROOTS.contains(&root) && (mode == "major" || mode == "minor"),
        None => false,
    }
}

/// A finished, attested generation
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub request_id: String,
    pub worker_id: String,
    pub audio: Vec<u8>,
    pub content_hash: String,
    pub certificate: Certificate,
    pub processing_time_ms: u64,
}

#[derive(Clone)]
pub struct GenerationService {
    dispatcher: Dispatcher,
    client: WorkerClient,
    attestation: Arc<AttestationService>,
}

impl GenerationService {
    pub fn new(dispatcher: Dispatcher, client: WorkerClient, attestation: Arc<AttestationService>) -> Self {
        Self { dispatcher, client, attestation }
    }

    /// Run one generation for an already authenticated user.
    ///
    /// Once a worker is reserved, the remote call and all bookkeeping run on
    /// their own task: dropping this future does not leave the worker busy.
    pub async fn generate(&self, req: GenerationRequest) -> Result<GenerationOutcome> {
        let started = Instant::now();
        let params = GenerationParams::validate(&req)?;
        let strategy = req
            .strategy
            .as_deref()
            .map(SelectionStrategy::parse_lenient)
            .unwrap_or_default();

        let assignment = self.dispatcher.dispatch(&params.requirements(), strategy).await?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let worker_id = assignment.worker_id.clone();

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.run_on_worker(request_id, req.user_id, req.username, params, assignment).await
        });
        let mut outcome = task.await.map_err(|e| FleetError::TransientWorker {
            worker_id,
            reason: format!("generation task aborted: {e}"),
        })??;
        outcome.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn run_on_worker(
        &self,
        request_id: String,
        user_id: String,
        username: String,
        params: GenerationParams,
        assignment: WorkerAssignment,
    ) -> Result<GenerationOutcome> {
        let worker_id = assignment.worker_id.clone();
        let registry = self.dispatcher.registry();
        let job = WorkerGenerateRequest {
            request_id: request_id.clone(),
            prompt: params.prompt.clone(),
            bpm: params.bpm,
            key: params.key.clone(),
            measures: params.measures,
            preferred_stems: params.preferred_stems.clone(),
            generation_duration: params.generation_duration,
            sample_rate: params.sample_rate,
            anonymized_user_id: hex::encode(Sha256::digest(format!("{user_id}{request_id}"))),
        };

        let call_started = Instant::now();
        let result = self.client.generate(&assignment, &job).await;
        let elapsed_ms = call_started.elapsed().as_millis() as u64;

        let audio = match result {
            Ok(audio) => audio,
            Err(e) => {
                tracing::error!(worker_id = %worker_id, request_id = %request_id, error = %e, "Worker request failed");
                if let Err(err) = registry.record_outcome(&worker_id, false, elapsed_ms).await {
                    tracing::warn!(worker_id = %worker_id, error = %err, "Failed to record outcome");
                }
                if let Err(err) = registry.mark_error(&worker_id).await {
                    tracing::warn!(worker_id = %worker_id, error = %err, "Failed to mark worker as errored");
                }
                return Err(e);
            }
        };

        if let Err(err) = registry.record_outcome(&worker_id, true, elapsed_ms).await {
            tracing::warn!(worker_id = %worker_id, error = %err, "Failed to record outcome");
        }

        let hash = content_hash(&audio);
        let summary = GenerationSummary {
            request_id: request_id.clone(),
            user_id,
            username,
            prompt: params.prompt,
            bpm: params.bpm,
            key_signature: params.key,
            generation_duration: params.generation_duration,
            sample_rate: params.sample_rate,
            preferred_stems: params.preferred_stems,
            worker_id: worker_id.clone(),
        };
        let issued = self.attestation.issue(summary, &hash).await;
        self.release(&worker_id).await;
        let certificate = issued?;

        tracing::info!(
            request_id = %request_id,
            worker_id = %worker_id,
            bytes = audio.len(),
            response_time_ms = elapsed_ms,
            "Generation completed"
        );
        Ok(GenerationOutcome {
            request_id,
            worker_id,
            audio,
            content_hash: hash,
            certificate,
            processing_time_ms: elapsed_ms,
        })
    }

    async fn release(&self, worker_id: &str) {
        if let Err(e) = self.dispatcher.release_worker(worker_id).await {
            tracing::warn!(worker_id = %worker_id, error = %e, "Failed to release worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::tests::service_in;
    use crate::config::DispatchConfig;
    use crate::registry::{tests::register_request, WorkerRegistry};
    use axum::{http::StatusCode, routing::post, Router};
    use fleet_protocol::WorkerStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request() -> GenerationRequest {
        GenerationRequest {
            user_id: "42".into(),
            username: "ada".into(),
            prompt: "warm lofi chords".into(),
            bpm: 90.0,
            key: Some("C minor".into()),
            measures: None,
            generation_duration: None,
            sample_rate: None,
            preferred_stems: None,
            strategy: None,
        }
    }

    /// Serve `/generate` on an ephemeral port and return that port
    async fn fake_worker(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    async fn service(dir: &TempDir, port: u16) -> GenerationService {
        let registry = WorkerRegistry::new(300);
        let mut req = register_request("w1", 24.0, 4.0);
        req.ip_address = Some("127.0.0.1".into());
        req.port = Some(port);
        registry.register(req).await.unwrap();
        let dispatcher = Dispatcher::new(registry, DispatchConfig::default());
        GenerationService::new(
            dispatcher,
            WorkerClient::new(Duration::from_secs(5)),
            Arc::new(service_in(dir).await),
        )
    }

    #[test]
    fn test_validation_defaults() {
        let params = GenerationParams::validate(&request()).unwrap();
        assert_eq!(params.measures, 4);
        assert_eq!(params.generation_duration, 6.0);
        assert_eq!(params.sample_rate, 48_000);
        assert_eq!(params.preferred_stems, None);
        assert!(!params.requirements().wants_stems());
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        let cases: Vec<fn(&mut GenerationRequest)> = vec![
            |r| r.prompt = " ab ".into(),
            |r| r.bpm = 59.0,
            |r| r.bpm = 201.0,
            |r| r.generation_duration = Some(31.0),
            |r| r.sample_rate = Some(22_050),
            |r| r.measures = Some(0),
            |r| r.preferred_stems = Some(vec!["drums".into(), "kazoo".into()]),
            |r| r.key = Some("H major".into()),
            |r| r.key = Some("C dorian".into()),
        ];
        for mutate in cases {
            let mut req = request();
            mutate(&mut req);
            assert!(matches!(GenerationParams::validate(&req), Err(FleetError::Validation(_))));
        }
    }

    #[test]
    fn test_stems_become_requirements() {
        let mut req = request();
        req.preferred_stems = Some(vec!["drums".into(), "bass".into()]);
        let params = GenerationParams::validate(&req).unwrap();
        assert_eq!(params.requirements().preferred_stems, vec!["drums", "bass"]);
    }

    #[tokio::test]
    async fn test_successful_generation_is_attested() {
        let port = fake_worker(Router::new().route("/generate", post(|| async { b"RIFF-audio".to_vec() }))).await;
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, port).await;

        let outcome = svc.generate(request()).await.unwrap();
        assert_eq!(outcome.audio, b"RIFF-audio");
        assert_eq!(outcome.content_hash, content_hash(b"RIFF-audio"));
        assert_eq!(outcome.certificate.data.wav_sha256, outcome.content_hash);
        assert!(svc.attestation.verify(&outcome.certificate).await.valid);

        let w = svc.dispatcher.registry().get("w1").await.unwrap();
        assert_eq!(w.status, WorkerStatus::Idle);
        assert_eq!(w.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_worker_failure_marks_error() {
        let port = fake_worker(Router::new().route(
            "/generate",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, port).await;

        let err = svc.generate(request()).await.unwrap_err();
        assert!(matches!(err, FleetError::TransientWorker { .. }));

        let w = svc.dispatcher.registry().get("w1").await.unwrap();
        assert_eq!(w.status, WorkerStatus::Error);
        assert_eq!(w.failed_requests, 1);
        assert!(svc.attestation.search(&Default::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_capacity_is_distinct_from_invalid_input() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 1).await;
        svc.dispatcher.registry().mark_error("w1").await.unwrap();

        assert!(matches!(svc.generate(request()).await, Err(FleetError::CapacityExhausted)));
        let mut bad = request();
        bad.bpm = 10.0;
        assert!(matches!(svc.generate(bad).await, Err(FleetError::Validation(_))));
    }

    #[tokio::test]
    async fn test_abandoned_caller_still_releases_worker() {
        let port = fake_worker(Router::new().route(
            "/generate",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                b"late-audio".to_vec()
            }),
        ))
        .await;
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, port).await;

        let abandoned = tokio::time::timeout(Duration::from_millis(50), svc.generate(request())).await;
        assert!(abandoned.is_err());
        assert_eq!(svc.dispatcher.registry().get("w1").await.unwrap().status, WorkerStatus::Busy);

        let mut released = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let w = svc.dispatcher.registry().get("w1").await.unwrap();
            if w.status == WorkerStatus::Idle && w.successful_requests == 1 {
                released = true;
                break;
            }
        }
        assert!(released, "worker was left busy after the caller went away");
        assert_eq!(svc.attestation.search(&Default::default()).await.len(), 1);
    }
}
