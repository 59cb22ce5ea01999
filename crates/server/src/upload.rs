// crates/server/src/upload.rs
//! Multipart upload handling for the job-creation routes.

use std::path::{Path, PathBuf};

use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use copyrem_core::{safe_download_filename, split_upload_name, UploadConfig};
use rand::RngCore;
use tokio::io::AsyncWriteExt;

use crate::error::{ApiError, ApiResult};

/// Multipart field carrying the audio file.
pub const FILE_FIELD: &str = "file";

/// An upload written to the scratch directory.
#[derive(Debug)]
pub struct SavedUpload {
    pub path: PathBuf,
    /// Sanitised base name (no extension) for download filenames.
    pub display_name: String,
}

/// Random hex string for scratch file names.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Stream the `file` field to `<scratch>/copyrem-<hex>.<ext>`.
///
/// Rejects a missing field or a disallowed extension with 400 and an
/// oversized body with 413. Other fields are skipped.
pub async fn save_upload(
    mut multipart: Multipart,
    upload: &UploadConfig,
    scratch: &Path,
) -> ApiResult<SavedUpload> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| form_error(e, upload))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let (stem, ext) = split_upload_name(&file_name);
        if !upload.is_allowed(&ext) {
            return Err(ApiError::BadRequest(format!(
                "unsupported format. Allowed: {}",
                upload.allowed_extensions.join(", ")
            )));
        }

        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to create scratch dir: {e}")))?;
        let path = scratch.join(format!("copyrem-{}{ext}", random_hex(8)));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to create upload file: {e}")))?;

        let written = async {
            let mut total = 0u64;
            while let Some(chunk) = field.chunk().await.map_err(|e| form_error(e, upload))? {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| ApiError::Internal(format!("failed to save upload: {e}")))?;
                total += chunk.len() as u64;
            }
            file.flush()
                .await
                .map_err(|e| ApiError::Internal(format!("failed to save upload: {e}")))?;
            Ok::<_, ApiError>(total)
        }
        .await;

        return match written {
            Ok(bytes) => {
                tracing::debug!(path = %path.display(), bytes, "upload saved");
                Ok(SavedUpload {
                    path,
                    display_name: safe_download_filename(&stem),
                })
            }
            Err(e) => {
                drop(file);
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %rm, "failed to remove partial upload");
                }
                Err(e)
            }
        };
    }

    Err(ApiError::BadRequest("missing file".to_string()))
}

fn form_error(err: MultipartError, upload: &UploadConfig) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(format!(
            "file too large (max {} MB)",
            upload.max_upload_mb
        ))
    } else {
        tracing::debug!(error = %err, "malformed multipart body");
        ApiError::BadRequest("invalid form".to_string())
    }
}
