use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tempfile::TempDir;
use tower::ServiceExt;

use chaos::config::{AuthConfig, Config};
use chaos::server::{build_router, AppState};

const BOUNDARY: &str = "chaos-test-boundary";

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!(
                        "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                        BOUNDARY, name, value
                    )
                    .as_bytes(),
                );
            }
            Part::File(name, filename, bytes) => {
                body.extend_from_slice(
                    format!(
                        "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        BOUNDARY, name, filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn setup(auth: Option<AuthConfig>) -> (TempDir, Router) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path().join("data"));
    config.auth = auth;
    let state = AppState::load(config).await.unwrap();
    (tmp, build_router(state))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes.to_vec())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, _, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_multipart(app: &Router, uri: &str, parts: &[Part<'_>]) -> (StatusCode, String) {
    let req = Request::post(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    let (status, headers, _) = send(app, req).await;
    let location = headers
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    (status, location)
}

async fn post_form(app: &Router, uri: &str, body: &str) -> (StatusCode, String) {
    let req = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, headers, _) = send(app, req).await;
    let location = headers
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    (status, location)
}

/// Creates a note through the web form and returns its page path.
async fn create_note(app: &Router, title: &str, keywords: &str) -> String {
    let (status, location) = post_multipart(
        app,
        "/notes",
        &[
            Part::Text("title", title),
            Part::Text("keywords", keywords),
            Part::Text("body", "written in a test"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert!(location.starts_with("/notes/"), "location: {}", location);
    location
}

#[tokio::test]
async fn health_reports_ok() {
    let (_tmp, app) = setup(None).await;
    let (status, json) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn create_then_view_note() {
    let (_tmp, app) = setup(None).await;
    let page = create_note(&app, "Fermentation <notes>", "baking, Science").await;

    let (status, _, body) = get(&app, &page).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("Fermentation &lt;notes&gt;"));
    assert!(html.contains("/keywords/science"));

    let (status, json) = get_json(&app, &format!("/api/items{}", page)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["kind"], "note");
    assert_eq!(json["meta"]["title"], "Fermentation <notes>");
    assert_eq!(json["meta"]["keywords"], serde_json::json!(["baking", "science"]));

    let (status, _, body) = get(&app, "/notes").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("Fermentation"));
}

#[tokio::test]
async fn update_changes_relations() {
    let (_tmp, app) = setup(None).await;
    let a = create_note(&app, "Alpha", "rust, web").await;
    let b = create_note(&app, "Beta", "gardening").await;

    let (_, json) = get_json(&app, &format!("/api/items{}/related", a)).await;
    assert_eq!(json["related"].as_array().unwrap().len(), 0);

    let (status, location) = post_multipart(
        &app,
        &b,
        &[
            Part::Text("title", "Beta"),
            Part::Text("keywords", "web, gardening"),
            Part::Text("body", ""),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location, b);

    let (status, json) = get_json(&app, &format!("/api/items{}/related", a)).await;
    assert_eq!(status, StatusCode::OK);
    let related = json["related"].as_array().unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0]["item"], b.trim_start_matches('/'));
    assert_eq!(related[0]["title"], "Beta");
    assert_eq!(related[0]["shared"], serde_json::json!(["web"]));

    let (_, json) = get_json(&app, "/api/keywords").await;
    assert_eq!(json["keywords"][0]["keyword"], "web");
    assert_eq!(json["keywords"][0]["count"], 2);

    let (status, _, body) = get(&app, "/keywords/web").await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("Alpha") && html.contains("Beta"));
}

#[tokio::test]
async fn search_api_and_page() {
    let (_tmp, app) = setup(None).await;
    let page = create_note(&app, "Sourdough starter", "baking").await;

    let (status, json) = get_json(&app, "/api/search?q=sourdough").await;
    assert_eq!(status, StatusCode::OK);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["item"], page.trim_start_matches('/'));

    let (status, json) = get_json(&app, "/api/search?q=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "bad_request");

    let (status, _, body) = get(&app, "/search?q=sourdough&kind=notes").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("Sourdough starter"));
}

#[tokio::test]
async fn unknown_kind_and_missing_item_are_404() {
    let (_tmp, app) = setup(None).await;

    let (status, _, body) = get(&app, "/widgets").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(String::from_utf8(body).unwrap().contains("Error 404"));

    let (status, json) = get_json(&app, "/api/items/widgets/abc").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");

    let (status, json) = get_json(&app, "/api/items/notes/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"]["message"].as_str().unwrap().contains("notes/missing"));
}

#[tokio::test]
async fn image_upload_and_attachment_download() {
    let (_tmp, app) = setup(None).await;
    let png = [0x89u8, b'P', b'N', b'G', 0, 1, 2, 3];

    let (status, location) = post_multipart(
        &app,
        "/images",
        &[
            Part::Text("title", "Cat"),
            Part::Text("keywords", ""),
            Part::File("attachment", "../../cat photo.png", &png),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    let (status, headers, body) = get(&app, &format!("{}/attachment", location)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/png");
    assert_eq!(body, png);

    let (_, json) = get_json(&app, &format!("/api/items{}", location)).await;
    assert_eq!(json["meta"]["filename"], "cat_photo.png");
    assert_eq!(json["meta"]["size"], 8);

    let (status, _) = post_multipart(&app, "/images", &[Part::Text("title", "No file")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listset_members_and_delete_cascade() {
    let (_tmp, app) = setup(None).await;
    let first = create_note(&app, "First", "").await;
    let second = create_note(&app, "Second", "").await;

    let (status, set) = post_multipart(
        &app,
        "/listsets",
        &[Part::Text("title", "Reading"), Part::Text("members", "")],
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    for member in [&first, &second] {
        let (status, _) = post_form(
            &app,
            &format!("{}/members", set),
            &format!("member={}", member.trim_start_matches('/').replace('/', "%2F")),
        )
        .await;
        assert_eq!(status, StatusCode::SEE_OTHER);
    }

    let (status, _) = post_form(
        &app,
        &format!("{}/members", set),
        &format!("member={}", first.trim_start_matches('/').replace('/', "%2F")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "duplicates are rejected");

    let (status, _) = post_form(&app, &format!("{}/members/1/up", set), "").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let (_, json) = get_json(&app, &format!("/api/items{}", set)).await;
    assert_eq!(
        json["meta"]["members"],
        serde_json::json!([second.trim_start_matches('/'), first.trim_start_matches('/')])
    );

    let (status, _) = post_form(&app, &format!("{}/members/9/down", set), "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, location) = post_form(&app, &format!("{}/delete", second), "").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location, "/notes");

    let (_, json) = get_json(&app, &format!("/api/items{}", set)).await;
    assert_eq!(
        json["meta"]["members"],
        serde_json::json!([first.trim_start_matches('/')])
    );
    let (status, _, _) = get(&app, &second).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_member_adds_are_all_kept() {
    let (_tmp, app) = setup(None).await;
    let (_, set) = post_multipart(
        &app,
        "/listsets",
        &[Part::Text("title", "Parallel"), Part::Text("members", "")],
    )
    .await;

    let mut notes = Vec::new();
    for i in 0..8 {
        notes.push(create_note(&app, &format!("Note {}", i), "").await);
    }

    let mut handles = Vec::new();
    for note in &notes {
        let app = app.clone();
        let uri = format!("{}/members", set);
        let body = format!("member={}", note.trim_start_matches('/').replace('/', "%2F"));
        handles.push(tokio::spawn(async move { post_form(&app, &uri, &body).await }));
    }
    for handle in handles {
        let (status, _) = handle.await.unwrap();
        assert_eq!(status, StatusCode::SEE_OTHER);
    }

    let (_, json) = get_json(&app, &format!("/api/items{}", set)).await;
    let members: Vec<String> = json["meta"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect();
    assert_eq!(members.len(), notes.len());
    for note in &notes {
        assert!(members.contains(&note.trim_start_matches('/').to_string()));
    }
}

#[tokio::test]
async fn database_import_query_and_plot() {
    let (_tmp, app) = setup(None).await;
    let (status, db) = post_multipart(
        &app,
        "/databases",
        &[
            Part::Text("title", "Sales"),
            Part::Text("query", "SELECT month, amount FROM sales"),
            Part::Text("plot_kind", "bar"),
            Part::Text("plot_x", "month"),
            Part::Text("plot_y", "amount"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    let (status, location) = post_multipart(
        &app,
        &format!("{}/import", db),
        &[
            Part::Text("table", "sales"),
            Part::Text("csv_text", "month,amount\njan,10\nfeb,32\n"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location, db);

    let (status, _, body) = get(&app, &db).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("<strong>sales</strong>"));
    assert!(html.contains("<td>feb</td>"));
    assert!(html.contains("plot.svg"));

    let (status, headers, body) = get(&app, &format!("{}/plot.svg", db)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/svg+xml");
    assert!(String::from_utf8(body).unwrap().starts_with("<svg"));

    let (status, _) = post_form(&app, &format!("{}/query", db), "sql=SELECT+COUNT%28*%29+AS+n+FROM+sales").await;
    assert_eq!(status, StatusCode::OK);

    let (status, location) = post_form(
        &app,
        &format!("{}/query", db),
        "sql=SELECT+amount+FROM+sales&save=1",
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location, db);
    let (_, json) = get_json(&app, &format!("/api/items{}", db)).await;
    assert_eq!(json["meta"]["query"], "SELECT amount FROM sales");

    let first = create_note(&app, "Not a database", "").await;
    let (status, _, _) = get(&app, &format!("{}/plot.svg", first)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manifest_lists_items_with_hashes() {
    let (_tmp, app) = setup(None).await;
    let page = create_note(&app, "Mirrored", "").await;

    let (status, json) = get_json(&app, "/api/manifest").await;
    assert_eq!(status, StatusCode::OK);
    let items = json["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["item"], page.trim_start_matches('/'));
    assert_eq!(items[0]["hash"].as_str().unwrap().len(), 64);

    let (status, headers, body) = get(&app, &format!("/api/items{}/raw", page)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/markdown"));
    assert!(String::from_utf8(body).unwrap().starts_with("---\n"));
}

#[tokio::test]
async fn basic_auth_guards_everything_but_health() {
    let (_tmp, app) = setup(Some(AuthConfig {
        username: "me".to_string(),
        password: "secret".to_string(),
    }))
    .await;

    let (status, headers, _) = get(&app, "/").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers[header::WWW_AUTHENTICATE], "Basic realm=\"chaos\"");

    let (status, _, _) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let wrong = Request::get("/api/manifest")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("me:nope")),
        )
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let right = Request::get("/")
        .header(
            header::AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("me:secret")),
        )
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, right).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("Dashboard"));
}
