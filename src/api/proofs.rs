//! Proof ingestion: multipart upload, validation and content-addressed storage.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, Extension, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::error::{internal_error, market_error};
use super::routes::AppState;
use super::types::ClaimResponse;
use crate::marketplace::artifact::{self, MAX_PROOF_BYTES};
use crate::marketplace::{Caller, MarketError, ProofArtifact, ProofSlot};

/// Prefix of every artifact reference handed to the marketplace.
const REFERENCE_PREFIX: &str = "proofs/";

/// Writes proof images under a directory, named by the SHA-256 of their bytes.
#[derive(Debug, Clone)]
pub struct ProofStorage {
    root: PathBuf,
}

impl ProofStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    /// Store `bytes` and return the reference (`proofs/<sha256>.<ext>`).
    /// Identical content maps to the same file.
    pub async fn store(&self, bytes: &[u8], ext: &str) -> std::io::Result<String> {
        let hash = hex::encode(Sha256::digest(bytes));
        let file_name = format!("{}.{}", hash, ext);
        let target = self.root.join(&file_name);

        tokio::fs::create_dir_all(&self.root).await?;
        if !tokio::fs::try_exists(&target).await? {
            let tmp = self.root.join(format!(".upload_{}", Uuid::new_v4()));
            let mut f = tokio::fs::File::create(&tmp).await?;
            f.write_all(bytes).await?;
            f.flush().await?;
            drop(f);
            tokio::fs::rename(&tmp, &target).await?;
            tracing::debug!(file = %file_name, size = bytes.len(), "Stored proof");
        }
        Ok(format!("{}{}", REFERENCE_PREFIX, file_name))
    }

    /// Resolve a reference back to a path inside the storage root.
    pub fn path_for(&self, reference: &str) -> Option<PathBuf> {
        let name = reference.strip_prefix(REFERENCE_PREFIX).unwrap_or(reference);
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.');
        valid.then(|| self.root.join(name))
    }
}

struct UploadedFile {
    file_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
    size: u64,
}

/// Multipart failures are bad requests, except a body past the size limit,
/// which is an oversized proof.
fn multipart_error(err: MultipartError) -> (StatusCode, String) {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        market_error(artifact::oversized())
    } else {
        (StatusCode::BAD_REQUEST, err.body_text())
    }
}

/// POST /api/my-tasks/:task_id/proof
/// Multipart fields: `type` (`proof1` | `proof2`) and exactly one `file`.
pub async fn upload_proof(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(task_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<ClaimResponse>, (StatusCode, String)> {
    let view = state
        .market
        .claim_for_task(&caller, task_id)
        .await
        .map_err(market_error)?;
    if view.expired {
        return Err(market_error(MarketError::ClaimExpired));
    }

    let mut slot: Option<ProofSlot> = None;
    let mut upload: Option<UploadedFile> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("type") => {
                let raw = field.text().await.map_err(multipart_error)?;
                slot = Some(ProofSlot::parse(raw.trim()).ok_or_else(|| {
                    (StatusCode::BAD_REQUEST, format!("Unknown proof type: {}", raw.trim()))
                })?);
            }
            Some("file") => {
                if upload.is_some() {
                    return Err(market_error(MarketError::InvalidArtifact(
                        "exactly one file is accepted".to_string(),
                    )));
                }
                let file_name = field.file_name().unwrap_or("upload.bin").to_string();
                let content_type = field.content_type().map(|s| s.to_string());
                let mut bytes = Vec::new();
                let mut size: u64 = 0;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    size += chunk.len() as u64;
                    if size > MAX_PROOF_BYTES {
                        return Err(market_error(artifact::oversized()));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                upload = Some(UploadedFile {
                    file_name,
                    content_type,
                    bytes,
                    size,
                });
            }
            _ => {}
        }
    }

    let slot = slot.ok_or((StatusCode::BAD_REQUEST, "Missing proof type".to_string()))?;
    let upload = upload.ok_or_else(|| {
        market_error(MarketError::InvalidArtifact("no file uploaded".to_string()))
    })?;

    // Same order as the marketplace: artifact, then slot, before touching disk.
    let ext = artifact::validate(&upload.file_name, upload.content_type.as_deref(), upload.size)
        .map_err(market_error)?;
    if view.claim.status != slot.expected_status() {
        return Err(market_error(MarketError::WrongProofSlot {
            status: view.claim.status,
        }));
    }

    let reference = state
        .proofs
        .store(&upload.bytes, &ext)
        .await
        .map_err(internal_error)?;

    let claim = state
        .market
        .submit_proof(
            &caller,
            view.claim.id,
            slot,
            ProofArtifact {
                reference,
                file_name: upload.file_name,
                content_type: upload.content_type,
                size_bytes: upload.size,
            },
        )
        .await
        .map_err(market_error)?;

    Ok(Json(ClaimResponse::from(&claim)))
}

/// GET /api/admin/proofs/:name
/// Serve a stored proof image for verification.
pub async fn get_proof(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let path = state
        .proofs
        .path_for(&name)
        .ok_or((StatusCode::BAD_REQUEST, "Invalid proof name".to_string()))?;
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err((StatusCode::NOT_FOUND, "Proof not found".to_string()));
        }
        Err(e) => return Err(internal_error(e)),
    };
    let content_type = match artifact::extension_of(&name).as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::config::Config;
    use crate::marketplace::{
        expiry, ClaimStatus, Clock, Difficulty, InMemoryMarketStore, ManualClock, Marketplace, NewCategory,
        NewTask, Role,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{Duration, TimeZone, Utc};
    use tower::ServiceExt;

    const BOUNDARY: &str = "grabber-proof-boundary";

    struct Part<'a> {
        name: &'a str,
        file_name: Option<&'a str>,
        data: &'a [u8],
    }

    fn text(name: &'static str, value: &'static str) -> Part<'static> {
        Part {
            name,
            file_name: None,
            data: value.as_bytes(),
        }
    }

    fn png<'a>(file_name: &'a str, data: &'a [u8]) -> Part<'a> {
        Part {
            name: "file",
            file_name: Some(file_name),
            data,
        }
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part.file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
                        part.name, file_name
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name).as_bytes(),
                ),
            }
            body.extend_from_slice(part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
        clock: ManualClock,
        user: Caller,
        task_id: Uuid,
    }

    /// A user holding a fresh claim on one published task.
    async fn claimed_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap());
        let market = Arc::new(Marketplace::new(
            Arc::new(InMemoryMarketStore::new()),
            Arc::new(clock.clone()),
            expiry::default_claim_window(),
        ));
        let admin = market
            .ensure_user(Uuid::new_v4(), "admin", Role::Admin)
            .await
            .unwrap()
            .caller();
        let category = market
            .create_category(
                &admin,
                NewCategory {
                    name: "Groups".to_string(),
                    description: None,
                    is_premium: false,
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        let task = market
            .publish_task(
                &admin,
                NewTask {
                    category_id: category.id,
                    title: "Join".to_string(),
                    description: "Join and screenshot".to_string(),
                    difficulty: Difficulty::Easy,
                    reward_cents: 50,
                    external_link: "https://chat.example/g".to_string(),
                    auxiliary_text: None,
                    expires_at: clock.now() + Duration::hours(1),
                },
            )
            .await
            .unwrap();
        let user = market
            .ensure_user(Uuid::new_v4(), "alice", Role::User)
            .await
            .unwrap()
            .caller();
        market.claim(&user, task.id).await.unwrap();

        let config = Config::new(dir.path().to_path_buf());
        let proofs = ProofStorage::new(config.upload_dir.clone());
        Fixture {
            _dir: dir,
            state: Arc::new(AppState {
                config,
                market,
                proofs,
            }),
            clock,
            user,
            task_id: task.id,
        }
    }

    async fn post_proof(fx: &Fixture, parts: &[Part<'_>]) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/my-tasks/{}/proof", fx.task_id))
            .header("x-user-id", fx.user.user_id.to_string())
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        let response = router(Arc::clone(&fx.state)).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    async fn claim_status(fx: &Fixture) -> ClaimStatus {
        fx.state
            .market
            .claim_for_task(&fx.user, fx.task_id)
            .await
            .unwrap()
            .claim
            .status
    }

    #[tokio::test]
    async fn test_upload_first_proof() {
        let fx = claimed_fixture().await;
        let image = b"\x89PNG first screenshot";

        let (status, body) = post_proof(&fx, &[text("type", "proof1"), png("shot.png", image)]).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "proof1_uploaded");
        let reference = json["proof1_ref"].as_str().unwrap();
        assert!(reference.starts_with("proofs/"));

        let path = fx.state.proofs.path_for(reference).unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), image);

        // The slot is used up until an admin asks for proof 2.
        let (status, body) = post_proof(&fx, &[text("type", "proof1"), png("again.png", image)]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body, "Proof 1 is waiting for admin verification.");
    }

    #[tokio::test]
    async fn test_second_proof_needs_request() {
        let fx = claimed_fixture().await;
        let (status, body) = post_proof(&fx, &[text("type", "proof2"), png("shot.png", b"png")]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body, "Upload proof 1 first.");
        assert_eq!(claim_status(&fx).await, ClaimStatus::Taken);
    }

    #[tokio::test]
    async fn test_oversized_proof_is_invalid_artifact() {
        let fx = claimed_fixture().await;

        // Over the proof ceiling but inside the request body limit.
        let just_over = vec![7u8; MAX_PROOF_BYTES as usize + 1];
        let (status, body) = post_proof(&fx, &[text("type", "proof1"), png("big.png", &just_over)]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("exceeds"), "{}", body);

        // Past the request body limit as well.
        let huge = vec![7u8; 3 * 1024 * 1024];
        let (status, body) = post_proof(&fx, &[text("type", "proof1"), png("huge.png", &huge)]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("exceeds"), "{}", body);

        // A rejected artifact outranks a wrong slot.
        let (status, body) = post_proof(&fx, &[text("type", "proof2"), png("big.png", &just_over)]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("exceeds"), "{}", body);

        assert_eq!(claim_status(&fx).await, ClaimStatus::Taken);
        assert!(!tokio::fs::try_exists(fx.state.proofs.root()).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_forms() {
        let fx = claimed_fixture().await;

        let (status, _) = post_proof(&fx, &[png("shot.png", b"png")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_proof(&fx, &[text("type", "proof3"), png("shot.png", b"png")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post_proof(&fx, &[text("type", "proof1")]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("no file uploaded"));

        let (status, body) = post_proof(
            &fx,
            &[
                text("type", "proof1"),
                png("one.png", b"first"),
                png("two.png", b"second"),
            ],
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("exactly one file"));

        assert_eq!(claim_status(&fx).await, ClaimStatus::Taken);
    }

    #[tokio::test]
    async fn test_upload_after_expiry() {
        let fx = claimed_fixture().await;
        fx.clock.advance(Duration::minutes(11));

        let (status, body) = post_proof(&fx, &[text("type", "proof1"), png("shot.png", b"png")]).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body, "This task has expired.");

        // Expiry is reported before the body is looked at.
        let huge = vec![7u8; 3 * 1024 * 1024];
        let (status, _) = post_proof(&fx, &[text("type", "proof1"), png("huge.png", &huge)]).await;
        assert_eq!(status, StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_upload_without_claim() {
        let fx = claimed_fixture().await;
        let bob = fx
            .state
            .market
            .ensure_user(Uuid::new_v4(), "bob", Role::User)
            .await
            .unwrap()
            .caller();
        let other = Fixture {
            _dir: tempfile::tempdir().unwrap(),
            state: Arc::clone(&fx.state),
            clock: fx.clock.clone(),
            user: bob,
            task_id: fx.task_id,
        };
        let (status, _) = post_proof(&other, &[text("type", "proof1"), png("shot.png", b"png")]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_store_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ProofStorage::new(dir.path().join("proofs"));

        let a = storage.store(b"first image", "png").await.unwrap();
        let again = storage.store(b"first image", "png").await.unwrap();
        let b = storage.store(b"second image", "png").await.unwrap();

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert!(a.starts_with("proofs/"));
        assert!(a.ends_with(".png"));

        let path = storage.path_for(&a).unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first image");
    }

    #[test]
    fn test_path_for_rejects_traversal() {
        let storage = ProofStorage::new(PathBuf::from("/srv/proofs"));
        assert!(storage.path_for("proofs/../secret").is_none());
        assert!(storage.path_for("proofs/.hidden").is_none());
        assert!(storage.path_for("a/b.png").is_none());
        assert_eq!(
            storage.path_for("proofs/abc123.png"),
            Some(PathBuf::from("/srv/proofs/abc123.png"))
        );
    }
}
