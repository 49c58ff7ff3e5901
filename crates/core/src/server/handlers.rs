use super::error::ApiError;
use super::{AppState, LOG_TARGET};
use crate::analytics::AnalyticsSummary;
use crate::decode::AudioClip;
use crate::emotion::{ClassificationResult, EmotionLabel, LabelScore};
use axum::extract::{Multipart, State};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const FILE_FIELD: &str = "file";
pub const USER_FIELD: &str = "user";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalyzeResponse {
    pub emotion: EmotionLabel,
    pub confidence: f32,
    pub scores: Vec<LabelScore>,
}

impl From<&ClassificationResult> for AnalyzeResponse {
    fn from(r: &ClassificationResult) -> Self {
        Self {
            emotion: r.label(),
            confidence: r.confidence(),
            scores: r.scores().to_vec(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub labels: Vec<EmotionLabel>,
}

struct Upload {
    filename: Option<String>,
    bytes: Bytes,
}

pub async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let mut upload = None;
    let mut user = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(FILE_FIELD) => {
                let filename = field.file_name().map(str::to_owned);
                let bytes = field.bytes().await?;
                upload = Some(Upload { filename, bytes });
            }
            Some(USER_FIELD) => {
                let text = field.text().await?;
                let text = text.trim();
                if !text.is_empty() {
                    user = Some(text.to_owned());
                }
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| ApiError::BadRequest("no audio file uploaded".to_owned()))?;
    let clip = AudioClip::from_upload(upload.filename.as_deref(), upload.bytes)?;
    let result = state.service.analyze(clip).await?;

    if let Some(store) = &state.analytics {
        if let Err(e) = store.record(&result, user.as_deref()).await {
            tracing::warn!(target: LOG_TARGET, error = %e, "failed to record analytics");
        }
    }

    Ok(Json(AnalyzeResponse::from(&result)))
}

pub async fn analytics(State(state): State<AppState>) -> Result<Json<AnalyticsSummary>, ApiError> {
    let store = state
        .analytics
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("analytics are not enabled".to_owned()))?;
    Ok(Json(store.summary().await?))
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_owned(),
        labels: EmotionLabel::ALL.to_vec(),
    })
}
