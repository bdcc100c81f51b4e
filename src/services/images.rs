//! Image preparation for job submission.
//!
//! The synchronizer only accepts base64 data URIs. Incoming images may carry
//! either a data URI already or a plain URL; URLs are downloaded and
//! re-encoded before submission.

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const SUPPORTED_SUBTYPES: [&str; 4] = ["png", "jpeg", "gif", "webp"];

/// One image as received from the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInput {
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub platforms: Option<Vec<String>>,
}

/// One image ready for the synchronizer: always a data URI.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedImage {
    pub base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image at position {0} has an invalid base64 payload; expected 'data:image/<type>;base64,...'")]
    InvalidDataUri(usize),
    #[error("image at position {index} could not be fetched: {reason}")]
    Download { index: usize, reason: String },
    #[error("image at position {index} is not a supported image type ({content_type})")]
    UnsupportedType { index: usize, content_type: String },
}

/// Check that a string is a well-formed `data:image/...;base64,` URI of a
/// supported subtype.
fn is_valid_data_uri(value: &str) -> bool {
    let Some(rest) = value.strip_prefix("data:image/") else {
        return false;
    };
    let Some((subtype, payload)) = rest.split_once(";base64,") else {
        return false;
    };
    SUPPORTED_SUBTYPES.contains(&subtype) && !payload.is_empty()
}

/// Turn each input image into a data URI, downloading URL-only images.
/// Images with neither field are skipped with a warning, matching the
/// lenient intake on the submission path.
pub async fn prepare_for_upload(
    http: &Client,
    images: &[ImageInput],
) -> Result<Vec<PreparedImage>, ImageError> {
    let mut prepared = Vec::with_capacity(images.len());

    for (index, image) in images.iter().enumerate() {
        let data_uri = match (&image.base64, &image.url) {
            (Some(b64), _) => {
                if !is_valid_data_uri(b64) {
                    return Err(ImageError::InvalidDataUri(index));
                }
                b64.clone()
            }
            (None, Some(url)) => download_as_data_uri(http, url, index).await?,
            (None, None) => {
                tracing::warn!("image at position {} has neither base64 nor url; skipping", index);
                continue;
            }
        };

        prepared.push(PreparedImage {
            base64: data_uri,
            platforms: image.platforms.clone(),
        });
    }

    Ok(prepared)
}

async fn download_as_data_uri(
    http: &Client,
    url: &str,
    index: usize,
) -> Result<String, ImageError> {
    tracing::info!(url, "downloading image for base64 re-encoding");

    let resp = http.get(url).send().await.map_err(|e| ImageError::Download {
        index,
        reason: e.to_string(),
    })?;

    if !resp.status().is_success() {
        return Err(ImageError::Download {
            index,
            reason: format!("status {}", resp.status()),
        });
    }

    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let subtype = content_type.strip_prefix("image/").unwrap_or("");
    if !SUPPORTED_SUBTYPES.contains(&subtype) {
        return Err(ImageError::UnsupportedType {
            index,
            content_type,
        });
    }

    let bytes = resp.bytes().await.map_err(|e| ImageError::Download {
        index,
        reason: e.to_string(),
    })?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", content_type, encoded))
}
