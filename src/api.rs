// 🌐 REST API - payment requests and reference validation (axum)

use crate::db;
use crate::epc::{Creditor, EpcPayload};
use crate::reference::{self, PaymentReference, ReferenceError};
use crate::request::{NewPaymentRequest, PaymentRequest, PaymentStatus, RequestError};
use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    creditor: Arc<Creditor>,
}

impl AppState {
    pub fn new(conn: Connection, creditor: Creditor) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            creditor: Arc::new(creditor),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn not_found(id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("payment request not found: {}", id))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(request_err) = err.downcast_ref::<RequestError>() {
            return request_err.clone().into();
        }
        error!(error = %format!("{:#}", err), "request failed");
        ApiError::internal("internal error")
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        let status = match err {
            RequestError::Validation(_)
            | RequestError::UnknownStatus(_)
            | RequestError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            RequestError::InvalidTransition { .. } => StatusCode::CONFLICT,
            RequestError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<ReferenceError> for ApiError {
    fn from(err: ReferenceError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

// Extractor rejections answer with the same envelope as handler errors
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Deserialize)]
struct StatusUpdate {
    status: String,
}

#[derive(Deserialize)]
struct ValidateQuery {
    reference: String,
}

#[derive(Serialize)]
struct ValidationResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<PaymentReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ReferenceResponse {
    sequence_number: u64,
    reference: PaymentReference,
    digits: String,
}

impl From<PaymentReference> for ReferenceResponse {
    fn from(reference: PaymentReference) -> Self {
        Self {
            sequence_number: reference.sequence_number(),
            digits: reference.digits(),
            reference,
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/payment-requests
async fn create_request(
    State(state): State<AppState>,
    body: Result<Json<NewPaymentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let conn = state.conn()?;
    let created = db::create_payment_request(&conn, &body)?;

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(created))))
}

/// GET /api/payment-requests
async fn list_requests(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<PaymentRequest>>>> {
    let conn = state.conn()?;
    let requests = db::list_payment_requests(&conn)?;

    Ok(Json(ApiResponse::ok(requests)))
}

/// GET /api/payment-requests/:id
async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<PaymentRequest>>> {
    let conn = state.conn()?;
    let request = db::get_payment_request(&conn, &id)?
        .ok_or_else(|| ApiError::not_found(&id))?;

    Ok(Json(ApiResponse::ok(request)))
}

/// PATCH /api/payment-requests/:id/status
async fn update_request_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<StatusUpdate>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<PaymentRequest>>> {
    let Json(body) = body?;
    let status: PaymentStatus = body.status.parse()?;

    let conn = state.conn()?;
    let updated = db::update_status(&conn, &id, status, "api")?;

    Ok(Json(ApiResponse::ok(updated)))
}

/// GET /api/payment-requests/:id/qr - EPC QR payload text
async fn request_qr_payload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let conn = state.conn()?;
    let request = db::get_payment_request(&conn, &id)?
        .ok_or_else(|| ApiError::not_found(&id))?;

    let payload = EpcPayload::for_request(&state.creditor, &request)
        .encode()
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        payload,
    )
        .into_response())
}

/// GET /api/references/validate?reference=...
async fn validate_reference(
    query: Result<Query<ValidateQuery>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<ValidationResponse>>> {
    let Query(query) = query?;
    let response = match reference::parse(&query.reference) {
        Ok(parsed) => ValidationResponse {
            valid: true,
            sequence_number: Some(parsed.sequence_number()),
            reference: Some(parsed),
            error: None,
        },
        Err(err) => ValidationResponse {
            valid: false,
            sequence_number: None,
            reference: None,
            error: Some(err.to_string()),
        },
    };

    Ok(Json(ApiResponse::ok(response)))
}

/// GET /api/references/:sequence
async fn generate_reference(
    sequence: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<ApiResponse<ReferenceResponse>>> {
    let Path(sequence) = sequence?;
    // Negative numbers are out of range, not malformed
    let generated = PaymentReference::try_from(sequence)?;

    Ok(Json(ApiResponse::ok(generated.into())))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/payment-requests", get(list_requests).post(create_request))
        .route("/payment-requests/:id", get(get_request))
        .route("/payment-requests/:id/status", patch(update_request_status))
        .route("/payment-requests/:id/qr", get(request_qr_payload))
        .route("/references/validate", get(validate_reference))
        .route("/references/:sequence", get(generate_reference))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let creditor = Creditor {
            name: "Landmeters Peeters BV".to_string(),
            iban: "BE68539007547034".to_string(),
            bic: Some("GKCCBEBB".to_string()),
        };
        router(AppState::new(conn, creditor))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>) {
        send_raw(app, method, uri, body.map(|json| json.to_string())).await
    }

    async fn send_raw(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<String>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(text) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(text)
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (status, bytes) = send(app, method, uri, body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn is_reference_shaped(value: &str) -> bool {
        let bytes = value.as_bytes();
        value.len() == 20
            && value.starts_with("+++")
            && value.ends_with("+++")
            && bytes[6] == b'/'
            && bytes[11] == b'/'
            && value[3..17].chars().filter(|c| c.is_ascii_digit()).count() == 12
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();

        let (status, body) = send_json(&app, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn test_create_payment_request() {
        let app = test_app();

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/payment-requests",
            Some(serde_json::json!({
                "recipient": "Jan Peeters",
                "amount": 45000,
                "message": "Afpaling perceel 12"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        let reference = body["data"]["reference"].as_str().unwrap();
        assert!(is_reference_shaped(reference), "{}", reference);
        assert_eq!(reference, "+++000/0000/00101+++");
        assert_eq!(body["data"]["status"], "PENDING");
        assert_eq!(body["data"]["amount"], 45000);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_amount() {
        let app = test_app();

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/payment-requests",
            Some(serde_json::json!({ "recipient": "Jan", "amount": 0 })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("amount"));
    }

    #[tokio::test]
    async fn test_status_lifecycle() {
        let app = test_app();
        let (_, created) = send_json(
            &app,
            "POST",
            "/api/payment-requests",
            Some(serde_json::json!({ "recipient": "Jan", "amount": 1000 })),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/payment-requests/{}/status", id);

        let (status, body) =
            send_json(&app, "PATCH", &uri, Some(serde_json::json!({ "status": "PAID" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "PAID");
        assert!(body["data"]["paid_at"].is_string());

        let (status, _) =
            send_json(&app, "PATCH", &uri, Some(serde_json::json!({ "status": "PENDING" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) =
            send_json(&app, "PATCH", &uri, Some(serde_json::json!({ "status": "REFUNDED" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send_json(
            &app,
            "PATCH",
            "/api/payment-requests/missing/status",
            Some(serde_json::json!({ "status": "PAID" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let app = test_app();
        for amount in [1000, 2000] {
            send_json(
                &app,
                "POST",
                "/api/payment-requests",
                Some(serde_json::json!({ "recipient": "Jan", "amount": amount })),
            )
            .await;
        }

        let (status, body) = send_json(&app, "GET", "/api/payment-requests", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = body["data"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["reference"], "+++000/0000/00202+++");

        let id = list[0]["id"].as_str().unwrap();
        let (status, body) =
            send_json(&app, "GET", &format!("/api/payment-requests/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["amount"], 1000);

        let (status, _) = send_json(&app, "GET", "/api/payment-requests/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_qr_payload() {
        let app = test_app();
        let (_, created) = send_json(
            &app,
            "POST",
            "/api/payment-requests",
            Some(serde_json::json!({ "recipient": "Jan", "amount": 12550 })),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap();

        let (status, bytes) =
            send(&app, "GET", &format!("/api/payment-requests/{}/qr", id), None).await;
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(text.starts_with("BCD\n002\n1\nSCT\n"));
        assert!(text.contains("\nEUR125.50\n"));
        assert!(text.ends_with("000000000101"));
    }

    #[tokio::test]
    async fn test_validate_reference_endpoint() {
        let app = test_app();

        let (status, body) = send_json(
            &app,
            "GET",
            "/api/references/validate?reference=%2B%2B%2B000%2F0000%2F00101%2B%2B%2B",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], true);
        assert_eq!(body["data"]["sequence_number"], 1);

        let (_, body) = send_json(
            &app,
            "GET",
            "/api/references/validate?reference=000000000199",
            None,
        )
        .await;
        assert_eq!(body["data"]["valid"], false);
        assert!(body["data"]["error"].as_str().unwrap().contains("check digits"));
    }

    #[tokio::test]
    async fn test_generate_reference_endpoint() {
        let app = test_app();

        let (status, body) = send_json(&app, "GET", "/api/references/0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["reference"], "+++000/0000/00097+++");
        assert_eq!(body["data"]["digits"], "000000000097");

        let (status, body) = send_json(&app, "GET", "/api/references/10000000000", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn test_generate_reference_rejects_bad_sequences() {
        let app = test_app();

        let (status, body) = send_json(&app, "GET", "/api/references/-1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("out of range"));

        let (status, body) = send_json(&app, "GET", "/api/references/abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_malformed_input_uses_error_envelope() {
        let app = test_app();

        // Amount as a decimal string instead of integer cents
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/payment-requests",
            Some(serde_json::json!({ "recipient": "Jan", "amount": "12.50" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        let (status, bytes) =
            send_raw(&app, "POST", "/api/payment-requests", Some("{not json".to_string())).await;
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, bytes) = send_raw(
            &app,
            "PATCH",
            "/api/payment-requests/missing/status",
            Some("{\"status\":".to_string()),
        )
        .await;
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = send_json(&app, "GET", "/api/references/validate", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
    }
}
