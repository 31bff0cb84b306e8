use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use gateway::{AccessGate, AppState, build_router};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;
use tagger::{
    Interrogation, Interrogator, InterrogationService, ModelRegistry, PassThrough,
    SerializationMode,
};
use tower::ServiceExt;

const PREFIX: &str = "/tagger/v1";

struct Unloadable {
    loaded: bool,
}

impl Interrogator for Unloadable {
    fn interrogate(&mut self, _image: &DynamicImage) -> anyhow::Result<Interrogation> {
        self.loaded = true;
        Ok(Interrogation::default())
    }

    fn unload(&mut self) -> bool {
        std::mem::replace(&mut self.loaded, false)
    }
}

fn stub_registry() -> ModelRegistry {
    let registry = ModelRegistry::new();
    registry.register("stub", |_: &DynamicImage| -> anyhow::Result<Interrogation> {
        Ok(Interrogation::new(
            [("general".to_string(), 0.9)].into(),
            [("cat".to_string(), 0.8), ("dog".to_string(), 0.3)].into(),
        ))
    });
    registry.register("broken", |_: &DynamicImage| -> anyhow::Result<Interrogation> {
        anyhow::bail!("Failed to read labels /srv/models/wd/selected_tags.csv: Permission denied")
    });
    registry
}

fn app_with(registry: ModelRegistry, gate: AccessGate) -> Router {
    let service = InterrogationService::with_policy(
        Arc::new(registry),
        Arc::new(PassThrough),
        SerializationMode::Global,
    );
    build_router(AppState::new(service), gate, PREFIX, 4 * 1024 * 1024)
}

fn app(gate: AccessGate) -> Router {
    app_with(stub_registry(), gate)
}

fn png_base64() -> String {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::new(4, 4))
        .write_to(&mut bytes, ImageFormat::Png)
        .unwrap();
    STANDARD.encode(bytes.into_inner())
}

fn interrogate_request(body: Value) -> Request<Body> {
    Request::post(format!("{PREFIX}/interrogate"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_basic(mut request: Request<Body>, user: &str, pass: &str) -> Request<Body> {
    let value = format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")));
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, value.parse().unwrap());
    request
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

// ========== Interrogate ==========

#[tokio::test]
async fn interrogate_returns_merged_caption() {
    let request = interrogate_request(json!({ "model": "stub", "image": png_base64() }));

    let (status, body) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "caption": { "general": 0.9, "cat": 0.8, "dog": 0.3 } })
    );
}

#[tokio::test]
async fn interrogate_accepts_data_urls() {
    let image = format!("data:image/png;base64,{}", png_base64());
    let request = interrogate_request(json!({ "model": "stub", "image": image }));

    let (status, _) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_image_is_not_found() {
    for body in [
        json!({ "model": "stub" }),
        json!({ "model": "stub", "image": "" }),
        json!({ "model": "stub", "image": null }),
    ] {
        let (status, body) = send(app(AccessGate::Disabled), interrogate_request(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "detail": "Image not found" }));
    }
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let request = interrogate_request(json!({ "model": "nope", "image": png_base64() }));

    let (status, body) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "detail": "Model not found" }));
}

#[tokio::test]
async fn unknown_model_is_reported_before_image_decoding() {
    let request = interrogate_request(json!({ "model": "nope", "image": "%%%" }));

    let (status, body) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "detail": "Model not found" }));
}

#[tokio::test]
async fn missing_image_is_reported_before_unknown_model() {
    let request = interrogate_request(json!({ "model": "nope" }));

    let (status, body) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "detail": "Image not found" }));
}

#[tokio::test]
async fn undecodable_image_is_bad_request() {
    let request = interrogate_request(json!({ "model": "stub", "image": "%%%" }));

    let (status, body) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "detail": "Invalid encoded image" }));
}

#[tokio::test]
async fn engine_failure_is_internal_error() {
    let request = interrogate_request(json!({ "model": "broken", "image": png_base64() }));

    let (status, body) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "detail": "Internal server error" }));
    assert!(!body.to_string().contains("/srv/models"), "engine details stay server-side");
}

// ========== Discovery & unload ==========

#[tokio::test]
async fn interrogators_lists_models_in_order() {
    let app = app(AccessGate::Disabled);
    let request = || {
        Request::get(format!("{PREFIX}/interrogators"))
            .body(Body::empty())
            .unwrap()
    };

    let (status, first) = send(app.clone(), request()).await;
    let (_, second) = send(app, request()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, json!({ "models": ["stub", "broken"] }));
    assert_eq!(first, second);
}

#[tokio::test]
async fn unload_reports_freed_models() {
    let registry = ModelRegistry::new();
    registry.register("a", Unloadable { loaded: true });
    registry.register("b", Unloadable { loaded: false });
    registry.register("c", Unloadable { loaded: true });
    let request = Request::post(format!("{PREFIX}/unload-interrogators"))
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(app_with(registry, AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!("Successfully unload 2 model(s)"));
}

// ========== Auth ==========

fn alice_only() -> AccessGate {
    AccessGate::from_config(Some("alice:secret")).unwrap()
}

#[tokio::test]
async fn valid_credentials_pass() {
    let request = with_basic(
        interrogate_request(json!({ "model": "stub", "image": png_base64() })),
        "alice",
        "secret",
    );

    let (status, _) = send(app(alice_only()), request).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let request = with_basic(
        Request::get(format!("{PREFIX}/interrogators"))
            .body(Body::empty())
            .unwrap(),
        "alice",
        "wrong",
    );

    let response = app(alice_only()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "detail": "Incorrect username or password" }));
}

#[tokio::test]
async fn missing_credentials_are_rejected() {
    let request = Request::post(format!("{PREFIX}/unload-interrogators"))
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(app(alice_only()), request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "detail": "Not authenticated" }));
}

#[tokio::test]
async fn disabled_gate_needs_no_credentials() {
    for gate in [
        AccessGate::Disabled,
        AccessGate::from_config(Some("")).unwrap(),
    ] {
        let request = Request::get(format!("{PREFIX}/interrogators"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(gate), request).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn routes_live_under_the_prefix() {
    let request = Request::get("/interrogators").body(Body::empty()).unwrap();

    let (status, _) = send(app(AccessGate::Disabled), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
