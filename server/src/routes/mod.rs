//! HTTP routes

pub mod health;
pub mod predict;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

/// Largest accepted upload
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// `{"error": message}` with a status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/predict", post(predict::predict))
        .route("/batch_predict", post(predict::batch_predict))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
    use leafscan::backend::{default_device, InferenceBackend};
    use leafscan::dataset::EvalTransform;
    use leafscan::inference::Predictor;
    use leafscan::model::ClassifierConfig;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::state::{AppState, ClassifierService, ServerConfig};

    const BOUNDARY: &str = "leafscan-test-boundary";

    fn server_config(checkpoint_dir: PathBuf) -> ServerConfig {
        ServerConfig {
            checkpoint_dir,
            resize_margin: 4,
            top_k: 5,
        }
    }

    fn loaded_app() -> Router {
        let device = default_device();
        let model = ClassifierConfig::new(3)
            .with_base_filters(2)
            .with_hidden_size(8)
            .init::<InferenceBackend>(&device);
        let names = vec!["healthy".to_string(), "rust".to_string(), "scab".to_string()];
        let predictor = Predictor::from_model(model, names, EvalTransform::new(16, 4), device).unwrap();

        let service = ClassifierService::with_predictor(server_config(PathBuf::from("unused")), predictor);
        router(Arc::new(AppState::new(service)))
    }

    fn unloaded_app(dir: &TempDir) -> Router {
        let service = ClassifierService::new(server_config(dir.path().join("missing")));
        router(Arc::new(AppState::new(service)))
    }

    fn png_bytes() -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(20, 20, |x, y| Rgb([x as u8 * 10, 90, y as u8 * 10]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn multipart_request(field: &str, file_name: Option<&str>, content: &[u8]) -> Request<Body> {
        let disposition = match file_name {
            Some(file_name) => format!("form-data; name=\"{field}\"; filename=\"{file_name}\""),
            None => format!("form-data; name=\"{field}\""),
        };
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_model_state() {
        let (status, body) = send(
            loaded_app(),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_loaded"], true);

        let dir = TempDir::new().unwrap();
        let (_, body) = send(
            unloaded_app(&dir),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body["model_loaded"], false);
    }

    #[tokio::test]
    async fn test_predict_success() {
        let (status, body) = send(loaded_app(), multipart_request("file", Some("leaf.png"), &png_bytes())).await;
        assert_eq!(status, StatusCode::OK);

        let predictions = body["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 3);
        assert!(predictions[0]["class_name"].is_string());
        assert!(predictions[0]["probability"].as_f64().unwrap() >= predictions[1]["probability"].as_f64().unwrap());
        assert!(body["processing_time"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_predict_missing_file_part() {
        let (status, body) = send(loaded_app(), multipart_request("image", Some("leaf.png"), &png_bytes())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file part");
    }

    #[tokio::test]
    async fn test_predict_field_without_file_name_is_missing() {
        let (status, body) = send(loaded_app(), multipart_request("file", None, &png_bytes())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file part");
    }

    #[tokio::test]
    async fn test_predict_empty_file_name() {
        let (status, body) = send(loaded_app(), multipart_request("file", Some(""), &png_bytes())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No selected file");
    }

    #[tokio::test]
    async fn test_predict_undecodable_upload_is_server_error() {
        let (status, body) = send(loaded_app(), multipart_request("file", Some("leaf.png"), b"not a png")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("decode"));
    }

    #[tokio::test]
    async fn test_predict_without_model_is_server_error() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(unloaded_app(&dir), multipart_request("file", Some("leaf.png"), &png_bytes())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_batch_predict_mixed_paths() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("leaf.png");
        std::fs::write(&good, png_bytes()).unwrap();
        let missing = dir.path().join("missing.png");

        let body = json!({ "image_paths": [good, missing], "top_k": 2 }).to_string();
        let (status, body) = send(loaded_app(), json_request("/batch_predict", &body)).await;
        assert_eq!(status, StatusCode::OK);

        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["predictions"].as_array().unwrap().len(), 2);
        assert!(results[1]["error"].is_string());
    }

    #[tokio::test]
    async fn test_batch_predict_requires_paths() {
        for body in ["{}", "not json", "{\"image_paths\": 3}"] {
            let (status, json) = send(loaded_app(), json_request("/batch_predict", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "No image paths provided");
        }
    }
}
