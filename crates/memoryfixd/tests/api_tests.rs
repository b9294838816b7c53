use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::{
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use memoryfix_core::config::{InferenceStrategy, SynthesisMode};
use memoryfix_core::{Config, ImageData};
use memoryfixd::{router, Engine};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_config() -> Config {
    let mut config = Config::default();
    config.inference.strategy = InferenceStrategy::None;
    config.synthesis.simulated_delay = Duration::from_millis(10);
    config
}

fn app(config: Config) -> Router {
    router(Arc::new(Engine::new(config)))
}

fn png_bytes(rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

fn png_data_uri(rgb: [u8; 3]) -> String {
    ImageData::from_bytes(png_bytes(rgb)).unwrap().to_data_uri()
}

/// Serves `/person.png`; any other path is a 404.
async fn photo_host(rgb: [u8; 3]) -> String {
    let bytes = png_bytes(rgb);
    let host = Router::new().route(
        "/person.png",
        get(move || {
            let bytes = bytes.clone();
            async move { ([(header::CONTENT_TYPE, "image/png")], bytes) }
        }),
    );
    serve(host).await
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let response = call(app, method, uri, body).await;
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_stage(app: &Router, id: &str, stage: &str) -> Value {
    for _ in 0..300 {
        let (status, session) = send(app, Method::GET, &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if session["stage"] == stage {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never reached {stage}");
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_status_reports_configuration() {
    let (status, body) = send(&app(test_config()), Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appId"], "MemoryFix");
    assert_eq!(body["inference"], "none");
    assert_eq!(body["synthesis"], "simulated");
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_analyze_gender_rejects_missing_and_invalid_images() {
    let app = app(test_config());

    let (status, body) = send(&app, Method::POST, "/api/analyze-gender", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/analyze-gender",
        Some(json!({ "imageUrl": "data:image/png;base64,@@@" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_analyze_gender_without_credentials_is_server_error() {
    let mut config = test_config();
    config.inference.strategy = InferenceStrategy::Generative;

    let (status, body) = send(
        &app(config),
        Method::POST,
        "/api/analyze-gender",
        Some(json!({ "imageUrl": png_data_uri([1, 2, 3]) })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "configuration_error");
}

#[tokio::test]
async fn test_analyze_gender_disabled_returns_fallback() {
    let (status, body) = send(
        &app(test_config()),
        Method::POST,
        "/api/analyze-gender",
        Some(json!({ "imageUrl": png_data_uri([1, 2, 3]) })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gender"], "female");
    assert_eq!(body["confidence"], "low");
    assert_eq!(body["provenance"], "fallback");
}

#[tokio::test]
async fn test_analyze_gender_through_generative_provider() {
    let provider = Router::new().route(
        "/models/gemini-1.5-flash:generateContent",
        post(|| async {
            Json(json!({ "candidates": [{ "content": { "parts": [{
                "text": "{\"gender\":\"male\",\"confidence\":0.95,\"reasoning\":\"...\"}"
            }] } }] }))
        }),
    );
    let mut config = test_config();
    config.inference.strategy = InferenceStrategy::Generative;
    config.inference.gemini_api_key = Some("test-key".into());
    config.inference.gemini_base_url = serve(provider).await;

    let (status, body) = send(
        &app(config),
        Method::POST,
        "/api/analyze-gender",
        Some(json!({ "imageUrl": png_data_uri([1, 2, 3]) })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["gender"], "male");
    assert!((body["confidence"].as_f64().unwrap() - 0.95).abs() < 1e-6);
    assert_eq!(body["strategy"], "generative");
}

#[tokio::test]
async fn test_try_on_validates_input() {
    let app = app(test_config());

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/try-on",
        Some(json!({ "personImage": png_data_uri([1, 2, 3]) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/try-on",
        Some(json!({ "personImage": png_data_uri([1, 2, 3]), "garmentType": "kimono" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("kimono"));
}

#[tokio::test]
async fn test_try_on_simulated_returns_person_image() {
    let person = png_data_uri([40, 50, 60]);
    let (status, body) = send(
        &app(test_config()),
        Method::POST,
        "/api/try-on",
        Some(json!({ "personImage": person, "garmentType": "suit" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], person);
    assert_eq!(body["mock"], true);
    assert_eq!(body["degraded"], false);
    assert!(body.get("failure").is_none());
}

#[tokio::test]
async fn test_try_on_fetches_person_image_url() {
    let host = photo_host([40, 50, 60]).await;
    let (status, body) = send(
        &app(test_config()),
        Method::POST,
        "/api/try-on",
        Some(json!({ "personImage": format!("{host}/person.png"), "garmentType": "suit" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], png_data_uri([40, 50, 60]));
    assert_eq!(body["degraded"], false);
}

#[tokio::test]
async fn test_unreachable_image_url_is_bad_request() {
    let host = photo_host([40, 50, 60]).await;
    let app = app(test_config());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/try-on",
        Some(json!({ "personImage": format!("{host}/missing.png"), "garmentType": "suit" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("404"));

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/analyze-gender",
        Some(json!({ "imageUrl": "http://127.0.0.1:1/person.png" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let app = app(test_config());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/analyze-gender",
        Some(json!({ "imageUrl": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/try-on")
        .body(Body::from(r#"{"garmentType":"suit"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/restore")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_try_on_live_without_asset_host_is_server_error() {
    let mut config = test_config();
    config.synthesis.mode = SynthesisMode::Live;

    let (status, _) = send(
        &app(config),
        Method::POST,
        "/api/try-on",
        Some(json!({ "personImage": png_data_uri([1, 2, 3]), "garmentType": "suit" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_restore_echoes_image() {
    let app = app(test_config());
    let url = "https://cdn.example/photos/grandma.jpg";

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/restore",
        Some(json!({ "imageUrl": url, "clothing": "hanbok" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], url);
    assert_eq!(body["mock"], true);
    assert!(body["message"].is_string());

    let (status, _) = send(&app, Method::POST, "/api/restore", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_session_flow_to_download() {
    let app = app(test_config());
    let photo = png_data_uri([120, 80, 60]);

    let (status, created) = send(&app, Method::POST, "/api/sessions", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["stage"], "upload");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, analyzing) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{id}/image"),
        Some(json!({ "imageUrl": photo })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(analyzing["stage"], "analyzing");

    let selecting = wait_for_stage(&app, &id, "selecting").await;
    assert_eq!(selecting["detectedGender"], "female");
    assert_eq!(selecting["confidence"], "low");
    assert!(selecting["resultImage"].is_null());

    let (status, synthesizing) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{id}/garment"),
        Some(json!({ "garmentType": "hanbok" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(synthesizing["stage"], "synthesizing");
    assert_eq!(synthesizing["selectedGarment"], "hanbok");

    let completed = wait_for_stage(&app, &id, "completed").await;
    assert_eq!(completed["resultImage"], photo);

    let response = call(&app, Method::GET, &format!("/api/sessions/{id}/download?format=png"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
    assert!(disposition.contains("MemoryFix_hanbok_"));
    assert!(disposition.ends_with(".png\""));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Png);

    let response = call(&app, Method::GET, &format!("/api/sessions/{id}/download"), None).await;
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
}

#[tokio::test]
async fn test_session_upload_by_url() {
    let host = photo_host([7, 8, 9]).await;
    let app = app(test_config());
    let (_, created) = send(&app, Method::POST, "/api/sessions", None).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{id}/image"),
        Some(json!({ "imageUrl": format!("{host}/person.png") })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let selecting = wait_for_stage(&app, &id, "selecting").await;
    assert_eq!(selecting["hasSourceImage"], true);
}

#[tokio::test]
async fn test_session_rejects_out_of_order_requests() {
    let app = app(test_config());
    let (_, created) = send(&app, Method::POST, "/api/sessions", None).await;
    let id = created["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{id}/garment"),
        Some(json!({ "garmentType": "suit" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_transition");

    let (status, _) = send(&app, Method::GET, &format!("/api/sessions/{id}/download"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/api/sessions/{id}/download?format=gif"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_session_reset_and_delete() {
    let app = app(test_config());
    let (_, created) = send(&app, Method::POST, "/api/sessions", None).await;
    let id = created["id"].as_str().unwrap().to_string();

    send(
        &app,
        Method::POST,
        &format!("/api/sessions/{id}/image"),
        Some(json!({ "imageUrl": png_data_uri([9, 9, 9]) })),
    )
    .await;

    let (status, reset) = send(&app, Method::POST, &format!("/api/sessions/{id}/reset"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["stage"], "upload");
    assert_eq!(reset["generation"], 1);
    assert_eq!(reset["hasSourceImage"], false);

    // The abandoned analysis must not advance the fresh session.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_, current) = send(&app, Method::GET, &format!("/api/sessions/{id}"), None).await;
    assert_eq!(current["stage"], "upload");

    let (status, _) = send(&app, Method::DELETE, &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, Method::GET, &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}
