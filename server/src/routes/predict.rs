//! Prediction endpoints

use std::path::PathBuf;
use std::time::Instant;

use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        Multipart, State,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use leafscan::inference::{BatchItemResult, Prediction};

use super::ApiError;
use crate::state::SharedState;

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub predictions: Vec<Prediction>,
    /// Seconds spent handling the request
    pub processing_time: f64,
}

#[derive(Debug, Deserialize)]
pub struct BatchPredictRequest {
    pub image_paths: Vec<PathBuf>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct BatchPredictResponse {
    pub results: Vec<BatchItemResult>,
}

/// POST /predict - classify the image in multipart field `file`
pub async fn predict(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let start = Instant::now();
    let mut multipart = multipart.map_err(|_| ApiError::bad_request("No file part"))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("No file part"))?
    {
        if field.name() != Some("file") {
            continue;
        }
        // A plain form value named `file` is not an upload
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;
        upload = Some((file_name, bytes));
        break;
    }

    let (file_name, bytes) = upload.ok_or_else(|| ApiError::bad_request("No file part"))?;
    if file_name.is_empty() {
        return Err(ApiError::bad_request("No selected file"));
    }

    let top_k = state.service.config().top_k;
    let predictions = state
        .service
        .predict_bytes(bytes.to_vec(), top_k)
        .await
        .map_err(|e| {
            error!("Prediction failed for {}: {}", file_name, e);
            ApiError::internal(e.to_string())
        })?;

    let processing_time = start.elapsed().as_secs_f64();
    info!("Predicted {} in {:.3}s", file_name, processing_time);

    Ok(Json(PredictResponse {
        predictions,
        processing_time,
    }))
}

/// POST /batch_predict - classify images already on the server's disk
pub async fn batch_predict(
    State(state): State<SharedState>,
    body: Result<Json<BatchPredictRequest>, JsonRejection>,
) -> Result<Json<BatchPredictResponse>, ApiError> {
    let Json(request) = body.map_err(|_| ApiError::bad_request("No image paths provided"))?;
    let top_k = request.top_k.unwrap_or(state.service.config().top_k);

    let results = state
        .service
        .batch_predict(request.image_paths, top_k)
        .await
        .map_err(|e| {
            error!("Batch prediction failed: {}", e);
            ApiError::internal(e.to_string())
        })?;

    Ok(Json(BatchPredictResponse { results }))
}
