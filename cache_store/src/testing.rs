//! In-process stand-in for the parts of the GitHub release API the release
//! backend talks to.

use std::{
    net::SocketAddr,
    path::Path as FsPath,
    sync::{Arc, Mutex, MutexGuard},
};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::GithubReleasesConfig;

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_OWNER: &str = "acme";
pub const TEST_REPO: &str = "cache";
pub const TEST_TAG: &str = "nix-cache";

#[derive(Debug, Clone)]
pub struct FakeRelease {
    pub id: u64,
    pub tag: String,
    pub name: String,
    pub draft: bool,
    pub prerelease: bool,
}

#[derive(Debug, Clone)]
pub struct FakeAsset {
    pub id: u64,
    pub release_id: u64,
    pub name: String,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub name: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Default)]
pub struct FakeGithubState {
    next_id: u64,
    pub releases: Vec<FakeRelease>,
    pub assets: Vec<FakeAsset>,
    /// Every upload attempt, including rejected ones.
    pub uploads: Vec<UploadRecord>,
    pub listed_pages: Vec<usize>,
    pub lookup_calls: usize,
    pub create_calls: usize,
    pub delete_calls: usize,

    /// Answer tag lookups with this status instead of the release.
    pub lookup_status: Option<StatusCode>,
    /// Create the release but answer 422, as if another writer won the race.
    pub conflict_on_create: bool,
    pub fail_listing: bool,
    pub fail_delete: bool,
    pub fail_upload: bool,
    pub fail_download: bool,
}

impl FakeGithubState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_release(&mut self, tag: &str, name: &str, draft: bool, prerelease: bool) -> u64 {
        let id = self.next_id();
        self.releases.push(FakeRelease {
            id,
            tag: tag.to_string(),
            name: name.to_string(),
            draft,
            prerelease,
        });
        id
    }

    fn add_asset(&mut self, release_id: u64, name: &str, data: Bytes) -> u64 {
        let id = self.next_id();
        self.assets.push(FakeAsset {
            id,
            release_id,
            name: name.to_string(),
            data,
        });
        id
    }

    pub fn assets_named(&self, name: &str) -> usize {
        self.assets.iter().filter(|asset| asset.name == name).count()
    }
}

#[derive(Clone)]
struct AppState {
    state: Arc<Mutex<FakeGithubState>>,
    base: String,
}

pub struct FakeGithub {
    base: String,
    state: Arc<Mutex<FakeGithubState>>,
    server: JoinHandle<()>,
}

impl FakeGithub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(FakeGithubState::default()));
        let app = Router::new()
            .route("/repos/{owner}/{repo}/releases", post(create_release))
            .route(
                "/repos/{owner}/{repo}/releases/tags/{tag}",
                get(release_by_tag),
            )
            .route(
                "/repos/{owner}/{repo}/releases/assets/{asset_id}",
                get(download_asset).delete(delete_asset),
            )
            .route(
                "/repos/{owner}/{repo}/releases/{release_id}/assets",
                get(list_assets),
            )
            .route(
                "/uploads/repos/{owner}/{repo}/releases/{release_id}/assets",
                post(upload_asset),
            )
            .route("/blobs/{asset_id}", get(serve_blob))
            .with_state(AppState {
                state: state.clone(),
                base: base.clone(),
            });
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base,
            state,
            server,
        }
    }

    pub fn config(&self, local_path: &FsPath) -> GithubReleasesConfig {
        GithubReleasesConfig {
            owner: TEST_OWNER.to_string(),
            repo: TEST_REPO.to_string(),
            release_tag: TEST_TAG.to_string(),
            local_path: local_path.to_str().unwrap().to_string(),
            token: Some(TEST_TOKEN.to_string()),
            api_url: self.base.clone(),
            upload_url: format!("{}/uploads", self.base),
            web_url: "https://github.com".to_string(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeGithubState> {
        self.state.lock().unwrap()
    }

    pub fn seed_release(&self, tag: &str) -> u64 {
        self.state().add_release(tag, tag, false, false)
    }

    pub fn seed_asset(&self, release_id: u64, name: &str, data: &str) -> u64 {
        self.state()
            .add_asset(release_id, name, Bytes::from(data.to_string()))
    }
}

impl Drop for FakeGithub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn already_exists(resource: &str, field: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "message": "Validation Failed",
            "errors": [{ "resource": resource, "code": "already_exists", "field": field }],
        })),
    )
        .into_response()
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn check_auth(headers: &HeaderMap) -> Result<(), Response> {
    let expected = format!("Bearer {}", TEST_TOKEN);
    match header_str(headers, header::AUTHORIZATION) {
        Some(value) if value == expected => Ok(()),
        _ => Err(message(StatusCode::UNAUTHORIZED, "Bad credentials")),
    }
}

fn asset_json(base: &str, asset: &FakeAsset) -> Value {
    json!({
        "id": asset.id,
        "name": asset.name,
        "url": format!("{}/repos/{}/{}/releases/assets/{}", base, TEST_OWNER, TEST_REPO, asset.id),
        "size": asset.data.len(),
        "browser_download_url": format!(
            "https://github.com/{}/{}/releases/download/{}/{}",
            TEST_OWNER, TEST_REPO, TEST_TAG, asset.name
        ),
    })
}

async fn release_by_tag(
    State(app): State<AppState>,
    Path((_owner, _repo, tag)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers) {
        return response;
    }
    let mut state = app.state.lock().unwrap();
    state.lookup_calls += 1;
    if let Some(status) = state.lookup_status {
        return message(status, "Bad credentials");
    }
    match state.releases.iter().find(|release| release.tag == tag) {
        Some(release) => Json(json!({ "id": release.id, "tag_name": release.tag })).into_response(),
        None => message(StatusCode::NOT_FOUND, "Not Found"),
    }
}

#[derive(Deserialize)]
struct CreateRelease {
    tag_name: String,
    name: String,
    draft: bool,
    prerelease: bool,
}

async fn create_release(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRelease>,
) -> Response {
    if let Err(response) = check_auth(&headers) {
        return response;
    }
    let mut state = app.state.lock().unwrap();
    state.create_calls += 1;
    if state.conflict_on_create {
        state.add_release(&body.tag_name, &body.name, body.draft, body.prerelease);
        return already_exists("Release", "tag_name");
    }
    if state.releases.iter().any(|release| release.tag == body.tag_name) {
        return already_exists("Release", "tag_name");
    }
    let id = state.add_release(&body.tag_name, &body.name, body.draft, body.prerelease);
    (
        StatusCode::CREATED,
        Json(json!({ "id": id, "tag_name": body.tag_name })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ListParams {
    per_page: Option<usize>,
    page: Option<usize>,
}

async fn list_assets(
    State(app): State<AppState>,
    Path((_owner, _repo, release_id)): Path<(String, String, u64)>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers) {
        return response;
    }
    let mut state = app.state.lock().unwrap();
    if state.fail_listing {
        return message(StatusCode::INTERNAL_SERVER_ERROR, "listing unavailable");
    }
    let per_page = params.per_page.unwrap_or(30).min(100);
    let page = params.page.unwrap_or(1).max(1);
    state.listed_pages.push(page);
    let assets: Vec<Value> = state
        .assets
        .iter()
        .filter(|asset| asset.release_id == release_id)
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|asset| asset_json(&app.base, asset))
        .collect();
    Json(assets).into_response()
}

async fn download_asset(
    State(app): State<AppState>,
    Path((_owner, _repo, asset_id)): Path<(String, String, u64)>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers) {
        return response;
    }
    let state = app.state.lock().unwrap();
    let Some(asset) = state.assets.iter().find(|asset| asset.id == asset_id) else {
        return message(StatusCode::NOT_FOUND, "Not Found");
    };
    if header_str(&headers, header::ACCEPT).as_deref() != Some("application/octet-stream") {
        return Json(asset_json(&app.base, asset)).into_response();
    }
    if state.fail_download {
        return message(StatusCode::BAD_GATEWAY, "blob host unavailable");
    }
    let location = format!("{}/blobs/{}", app.base, asset.id);
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn serve_blob(State(app): State<AppState>, Path(asset_id): Path<u64>) -> Response {
    let state = app.state.lock().unwrap();
    match state.assets.iter().find(|asset| asset.id == asset_id) {
        Some(asset) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            asset.data.clone(),
        )
            .into_response(),
        None => message(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn delete_asset(
    State(app): State<AppState>,
    Path((_owner, _repo, asset_id)): Path<(String, String, u64)>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_auth(&headers) {
        return response;
    }
    let mut state = app.state.lock().unwrap();
    state.delete_calls += 1;
    if state.fail_delete {
        return message(StatusCode::INTERNAL_SERVER_ERROR, "delete failed");
    }
    let before = state.assets.len();
    state.assets.retain(|asset| asset.id != asset_id);
    if state.assets.len() == before {
        return message(StatusCode::NOT_FOUND, "Not Found");
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
struct UploadParams {
    name: String,
}

async fn upload_asset(
    State(app): State<AppState>,
    Path((_owner, _repo, release_id)): Path<(String, String, u64)>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = check_auth(&headers) {
        return response;
    }
    let mut state = app.state.lock().unwrap();
    state.uploads.push(UploadRecord {
        name: params.name.clone(),
        content_type: header_str(&headers, header::CONTENT_TYPE),
        content_length: header_str(&headers, header::CONTENT_LENGTH)
            .and_then(|value| value.parse().ok()),
    });
    if state.fail_upload {
        return message(StatusCode::INTERNAL_SERVER_ERROR, "upload exploded");
    }
    if !state.releases.iter().any(|release| release.id == release_id) {
        return message(StatusCode::NOT_FOUND, "Not Found");
    }
    if state
        .assets
        .iter()
        .any(|asset| asset.release_id == release_id && asset.name == params.name)
    {
        return already_exists("ReleaseAsset", "name");
    }
    let id = state.add_asset(release_id, &params.name, body);
    let asset = state
        .assets
        .iter()
        .find(|asset| asset.id == id)
        .map(|asset| asset_json(&app.base, asset))
        .unwrap_or_default();
    (StatusCode::CREATED, Json(asset)).into_response()
}
