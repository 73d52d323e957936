//! Web UI and JSON API.
//!
//! The HTML side is a small CRUD application over the item store. The JSON
//! side is read-only and is what `chaos sync` talks to on a remote instance.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Dashboard |
//! | `GET`  | `/search?q=&kind=` | Full-text search |
//! | `GET`  | `/keywords`, `/keywords/{keyword}` | Keyword cloud and per-keyword listing |
//! | `GET`/`POST` | `/{kind}` | List items / create (multipart) |
//! | `GET`  | `/{kind}/new`, `/{kind}/{id}/edit` | Forms |
//! | `GET`/`POST` | `/{kind}/{id}` | Item page / update (multipart) |
//! | `POST` | `/{kind}/{id}/delete` | Delete |
//! | `GET`  | `/{kind}/{id}/attachment` | Image, file or SQLite payload |
//! | `POST` | `/{kind}/{id}/query`, `/{kind}/{id}/import` | Database items |
//! | `GET`  | `/{kind}/{id}/plot.svg` | Database plot |
//! | `POST` | `/{kind}/{id}/members`, `/{kind}/{id}/members/{pos}/{action}` | Listset editing |
//! | `GET`  | `/health` | Health check, never behind auth |
//! | `GET`  | `/api/manifest` | Sync manifest |
//! | `GET`  | `/api/items/{kind}/{id}[/raw\|/attachment\|/related]` | Item data |
//! | `GET`  | `/api/search`, `/api/keywords` | Search and keyword counts |
//!
//! # Error Contract
//!
//! API errors are JSON:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "item not found: notes/abc" } }
//! ```
//!
//! HTML routes render an error page with the same status. Codes:
//! `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{self, Credentials};
use crate::config::Config;
use crate::database::DatabaseHandle;
use crate::db;
use crate::error::StoreError;
use crate::index;
use crate::listset::{self, ListsetError, MemberAction};
use crate::migrate;
use crate::models::{parse_keyword_list, Item, ItemDraft, ItemKind, ItemRef, Upload};
use crate::plot::{self, PlotError, PlotKind, PlotSpec};
use crate::relations::RelationGraph;
use crate::search::{self, SearchHit};
use crate::store::ItemStore;
use crate::sync::{self, Manifest};
use crate::views::{self, DatabaseView, ItemPage};

const DEFAULT_SEARCH_LIMIT: i64 = 50;
const RECENT_ITEMS: usize = 10;
const TOP_KEYWORDS: usize = 30;

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ItemStore>,
    pub relations: Arc<RwLock<RelationGraph>>,
    pub index: SqlitePool,
    /// Held across every read-modify-write of listset members.
    pub listset_edits: Arc<Mutex<()>>,
}

impl AppState {
    /// Opens the store and index, rebuilds the index from the files and
    /// computes the relation graph.
    pub async fn load(config: Config) -> anyhow::Result<Self> {
        let store = ItemStore::new(&config.storage.root);
        store.init()?;

        let pool = db::connect(&config).await?;
        migrate::ensure_schema(&pool).await?;
        index::rebuild(&pool, &store).await?;

        let items = store.list_all()?;
        let graph = RelationGraph::from_items(items.iter(), config.relations.min_shared);
        tracing::info!(
            items = items.len(),
            keyworded = graph.len(),
            pairs = graph.pair_count(),
            "computed relations"
        );

        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            relations: Arc::new(RwLock::new(graph)),
            index: pool,
            listset_edits: Arc::new(Mutex::new(())),
        })
    }

    /// Propagates a written item to the relation graph and the index.
    async fn item_written(&self, item: &Item) -> anyhow::Result<()> {
        self.relations
            .write()
            .await
            .set_keywords(item.item_ref(), item.meta.keywords.clone());
        index::upsert_item(&self.index, item).await
    }

    async fn item_removed(&self, item_ref: &ItemRef) -> anyhow::Result<()> {
        self.relations.write().await.remove(item_ref);
        index::remove_item(&self.index, item_ref).await
    }
}

pub fn build_router(state: AppState) -> Router {
    let credentials = Credentials::from_config(state.config.auth.as_ref()).map(Arc::new);
    let body_limit = state.config.server.max_upload_mb * 1024 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_dashboard))
        .route("/health", get(handle_health))
        .route("/search", get(handle_search_page))
        .route("/keywords", get(handle_keywords_page))
        .route("/keywords/{keyword}", get(handle_keyword_page))
        .route("/api/manifest", get(handle_manifest))
        .route("/api/search", get(handle_api_search))
        .route("/api/keywords", get(handle_api_keywords))
        .route("/api/items/{kind}/{id}", get(handle_api_item))
        .route("/api/items/{kind}/{id}/raw", get(handle_api_raw))
        .route("/api/items/{kind}/{id}/attachment", get(handle_api_attachment))
        .route("/api/items/{kind}/{id}/related", get(handle_api_related))
        .route("/{kind}", get(handle_list).post(handle_create))
        .route("/{kind}/new", get(handle_new_form))
        .route("/{kind}/{id}", get(handle_item).post(handle_update))
        .route("/{kind}/{id}/edit", get(handle_edit_form))
        .route("/{kind}/{id}/delete", post(handle_delete))
        .route("/{kind}/{id}/attachment", get(handle_attachment))
        .route("/{kind}/{id}/query", post(handle_query))
        .route("/{kind}/{id}/import", post(handle_import))
        .route("/{kind}/{id}/plot.svg", get(handle_plot))
        .route("/{kind}/{id}/members", post(handle_add_member))
        .route(
            "/{kind}/{id}/members/{pos}/{action}",
            post(handle_member_action),
        )
        .layer(middleware::from_fn_with_state(
            credentials,
            auth::require_basic_auth,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the server on `[server].bind` and runs until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    if config.auth.is_none() {
        tracing::warn!("no [auth] section configured: the server is open to anyone who can reach it");
    }

    let state = AppState::load(config.clone()).await?;
    let app = build_router(state);

    println!("chaos listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Errors ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Maps an error to its HTTP status and machine-readable code. Unknown
/// errors are logged and reported as 500.
fn classify(err: &anyhow::Error) -> (StatusCode, &'static str) {
    if let Some(e) = err.downcast_ref::<StoreError>() {
        return match e {
            StoreError::NotFound(_) | StoreError::UnknownKind(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            _ => (StatusCode::BAD_REQUEST, "bad_request"),
        };
    }
    if err.downcast_ref::<ListsetError>().is_some()
        || err.downcast_ref::<PlotError>().is_some()
        || err.downcast_ref::<MultipartError>().is_some()
    {
        return (StatusCode::BAD_REQUEST, "bad_request");
    }
    tracing::error!(error = ?err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
}

/// Error of a JSON API handler.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self.0);
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Error of an HTML handler, rendered as an error page.
pub struct PageError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for PageError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let (status, _) = classify(&self.0);
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Something went wrong. The details are in the server log.".to_string()
        } else {
            self.0.to_string()
        };
        (status, Html(views::error_page(status.as_u16(), &message))).into_response()
    }
}

type PageResult = Result<Response, PageError>;
type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_kind(kind: &str) -> Result<ItemKind, StoreError> {
    kind.parse()
}

fn parse_ref(kind: &str, id: &str) -> Result<ItemRef, StoreError> {
    ItemRef::from_parts(kind, id)
}

fn require_kind(item_ref: &ItemRef, kind: ItemKind) -> Result<(), StoreError> {
    if item_ref.kind == kind {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!(
            "{} has no {} actions",
            item_ref,
            kind.label()
        )))
    }
}

fn see_other(item_ref: &ItemRef) -> Response {
    Redirect::to(&format!("/{}/{}", item_ref.kind.plural(), item_ref.id)).into_response()
}

fn attachment_response(item: &Item, bytes: Vec<u8>, content_type: String) -> Response {
    let disposition = match (item.kind, item.meta.filename.as_deref()) {
        (ItemKind::File, Some(name)) => format!("attachment; filename=\"{}\"", name),
        (ItemKind::Database, _) => format!("attachment; filename=\"{}.sqlite\"", item.id),
        _ => "inline".to_string(),
    };
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

// ============ Multipart forms ============

/// Text fields and non-empty file parts of a multipart form.
#[derive(Debug, Default)]
struct FormData {
    fields: HashMap<String, String>,
    files: HashMap<String, Upload>,
}

impl FormData {
    async fn read(mut multipart: Multipart) -> Result<Self, MultipartError> {
        let mut form = FormData::default();
        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match field.file_name().map(str::to_string) {
                Some(filename) => {
                    let bytes = field.bytes().await?;
                    // Browsers send an empty part for an untouched file input.
                    if !filename.is_empty() || !bytes.is_empty() {
                        form.files.insert(
                            name,
                            Upload {
                                filename,
                                bytes: bytes.to_vec(),
                            },
                        );
                    }
                }
                None => {
                    form.fields.insert(name, field.text().await?);
                }
            }
        }
        Ok(form)
    }

    fn text(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        let value = self.text(name).trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    /// Builds the draft for `kind`. Fields that do not apply are ignored.
    fn into_draft(mut self, kind: ItemKind) -> anyhow::Result<ItemDraft> {
        let mut draft = ItemDraft {
            title: self.text("title").to_string(),
            body: self.text("body").replace("\r\n", "\n"),
            keywords: parse_keyword_list(self.text("keywords")),
            ..Default::default()
        };
        match kind {
            ItemKind::Link => draft.url = self.non_empty("url"),
            ItemKind::Database => {
                draft.query = self.non_empty("query");
                draft.plot = self.plot_spec()?;
            }
            ItemKind::Listset => draft.members = Some(parse_member_lines(self.text("members"))?),
            _ => {}
        }
        if kind.has_attachment() {
            draft.attachment = self.files.remove("attachment");
        }
        Ok(draft)
    }

    fn plot_spec(&self) -> anyhow::Result<Option<PlotSpec>> {
        let Some(kind) = self.non_empty("plot_kind") else {
            return Ok(None);
        };
        let kind: PlotKind = kind.parse()?;
        let x = self
            .non_empty("plot_x")
            .ok_or_else(|| StoreError::Invalid("a plot needs an x column".to_string()))?;
        let y: Vec<String> = self
            .text("plot_y")
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if y.is_empty() {
            return Err(PlotError::NoSeries.into());
        }
        Ok(Some(PlotSpec {
            kind,
            x,
            y,
            title: self.non_empty("plot_title"),
        }))
    }
}

fn parse_member_lines(text: &str) -> anyhow::Result<Vec<ItemRef>> {
    let mut members: Vec<ItemRef> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let member: ItemRef = line.parse()?;
        if members.contains(&member) {
            return Err(ListsetError::Duplicate(member).into());
        }
        members.push(member);
    }
    Ok(members)
}

// ============ HTML: browsing ============

async fn handle_dashboard(State(state): State<AppState>) -> PageResult {
    let mut counts = Vec::new();
    let mut all = Vec::new();
    for kind in ItemKind::ALL {
        let items = state.store.list(kind)?;
        counts.push((kind, items.len()));
        all.extend(items);
    }
    all.sort_by(|a, b| b.updated_ts().cmp(&a.updated_ts()).then_with(|| a.id.cmp(&b.id)));
    all.truncate(RECENT_ITEMS);

    let keywords: Vec<(String, usize)> = state
        .relations
        .read()
        .await
        .keyword_counts()
        .into_iter()
        .take(TOP_KEYWORDS)
        .collect();
    Ok(Html(views::dashboard(&counts, &all, &keywords)).into_response())
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

impl SearchParams {
    fn kind(&self) -> Result<Option<ItemKind>, StoreError> {
        match self.kind.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(k) => k.parse().map(Some),
        }
    }
}

async fn run_search(state: &AppState, params: &SearchParams) -> anyhow::Result<Vec<SearchHit>> {
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, 500);
    search::search_items(&state.index, &params.q, params.kind()?, limit).await
}

async fn handle_search_page(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> PageResult {
    let hits = run_search(&state, &params).await?;
    Ok(Html(views::search_page(&params.q, params.kind()?, &hits)).into_response())
}

async fn handle_keywords_page(State(state): State<AppState>) -> PageResult {
    let counts = state.relations.read().await.keyword_counts();
    Ok(Html(views::keywords_page(&counts)).into_response())
}

async fn handle_keyword_page(
    State(state): State<AppState>,
    Path(keyword): Path<String>,
) -> PageResult {
    let refs = state.relations.read().await.items_with_keyword(&keyword);
    let mut items: Vec<Item> = refs
        .iter()
        .filter_map(|r| state.store.get(r).ok())
        .collect();
    items.sort_by(|a, b| b.updated_ts().cmp(&a.updated_ts()).then_with(|| a.id.cmp(&b.id)));
    Ok(Html(views::keyword_page(&keyword, &items)).into_response())
}

async fn handle_list(State(state): State<AppState>, Path(kind): Path<String>) -> PageResult {
    let kind = parse_kind(&kind)?;
    let items = state.store.list(kind)?;
    Ok(Html(views::item_list(kind, &items)).into_response())
}

async fn handle_new_form(Path(kind): Path<String>) -> PageResult {
    let kind = parse_kind(&kind)?;
    Ok(Html(views::item_form(kind, None)).into_response())
}

async fn handle_edit_form(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> PageResult {
    let item = state.store.get(&parse_ref(&kind, &id)?)?;
    Ok(Html(views::item_form(item.kind, Some(&item))).into_response())
}

async fn handle_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> PageResult {
    let item = state.store.get(&parse_ref(&kind, &id)?)?;
    let page = build_item_page(&state, &item, None).await?;
    Ok(Html(views::item_page(&item, &page)).into_response())
}

/// Collects everything shown around an item. `query` overrides the saved
/// default query of a database item.
async fn build_item_page(
    state: &AppState,
    item: &Item,
    query: Option<&str>,
) -> anyhow::Result<ItemPage> {
    let item_ref = item.item_ref();

    let relations = state
        .relations
        .read()
        .await
        .related(&item_ref, state.config.relations.max_related);
    let related = relations
        .into_iter()
        .filter_map(|rel| {
            let shared = rel.shared.len();
            state.store.get(&rel.target).ok().map(|other| (other, shared))
        })
        .collect();

    let containing = listset::containing(&state.store, &item_ref)?;
    let members = listset::resolve(&state.store, &item.meta.members);

    let database = if item.kind == ItemKind::Database {
        Some(database_view(state, item, query).await?)
    } else {
        None
    };

    Ok(ItemPage {
        related,
        containing,
        members,
        database,
    })
}

async fn database_view(
    state: &AppState,
    item: &Item,
    query: Option<&str>,
) -> anyhow::Result<DatabaseView> {
    let handle = DatabaseHandle::open(&state.store.database_path(&item.id)).await?;
    let tables = handle.tables().await;

    let sql = query.or(item.meta.query.as_deref()).unwrap_or("").to_string();
    let (outcome, error) = if sql.trim().is_empty() {
        (None, None)
    } else {
        match handle.execute(&sql, state.config.database.max_rows).await {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => (None, Some(e.to_string())),
        }
    };
    handle.close().await;

    Ok(DatabaseView {
        tables: tables?,
        sql,
        outcome,
        error,
        has_plot: item.meta.query.is_some() && item.meta.plot.is_some(),
    })
}

async fn handle_attachment(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    let item = state.store.get(&item_ref)?;
    let (bytes, content_type) = state.store.read_attachment(&item_ref)?;
    Ok(attachment_response(&item, bytes, content_type))
}

// ============ HTML: mutations ============

async fn handle_create(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    multipart: Multipart,
) -> PageResult {
    let kind = parse_kind(&kind)?;
    let draft = FormData::read(multipart).await?.into_draft(kind)?;
    let item = state.store.create(kind, draft)?;
    state.item_written(&item).await?;
    Ok(see_other(&item.item_ref()))
}

async fn handle_update(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    multipart: Multipart,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    let draft = FormData::read(multipart).await?.into_draft(item_ref.kind)?;
    let _edits = state.listset_edits.lock().await;
    let item = state.store.update(&item_ref, draft)?;
    state.item_written(&item).await?;
    Ok(see_other(&item_ref))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    // The cascade rewrites every listset that held the item.
    let _edits = state.listset_edits.lock().await;
    let touched = state.store.delete(&item_ref)?;
    state.item_removed(&item_ref).await?;
    for listset in &touched {
        state.item_written(listset).await?;
    }
    Ok(Redirect::to(&format!("/{}", item_ref.kind.plural())).into_response())
}

#[derive(Debug, Deserialize)]
struct QueryForm {
    sql: String,
    #[serde(default)]
    save: Option<String>,
}

/// Runs ad-hoc SQL and shows the result on the item page. With `save`, a
/// successful query becomes the item's default query instead.
async fn handle_query(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Form(form): Form<QueryForm>,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    require_kind(&item_ref, ItemKind::Database)?;
    let mut item = state.store.get(&item_ref)?;
    let sql = form.sql.replace("\r\n", "\n");

    if form.save.is_some() && !sql.trim().is_empty() {
        let handle = DatabaseHandle::open(&state.store.database_path(&item.id)).await?;
        let result = handle.execute(&sql, state.config.database.max_rows).await;
        handle.close().await;
        if result.is_ok() {
            item.meta.query = Some(sql);
            item.meta.updated = Some(Utc::now());
            state.store.save(&item)?;
            state.item_written(&item).await?;
            return Ok(see_other(&item_ref));
        }
    }

    let page = build_item_page(&state, &item, Some(&sql)).await?;
    Ok(Html(views::item_page(&item, &page)).into_response())
}

async fn handle_import(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    multipart: Multipart,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    require_kind(&item_ref, ItemKind::Database)?;
    let mut item = state.store.get(&item_ref)?;

    let mut form = FormData::read(multipart).await?;
    let table = form
        .non_empty("table")
        .ok_or_else(|| StoreError::Invalid("table name is required".to_string()))?;
    let csv_text = match form.files.remove("csv") {
        Some(upload) => String::from_utf8(upload.bytes)
            .map_err(|_| StoreError::Invalid("CSV file must be UTF-8".to_string()))?,
        None => form.text("csv_text").to_string(),
    };

    let handle = DatabaseHandle::open(&state.store.database_path(&item.id)).await?;
    let imported = handle.import_csv(&table, &csv_text).await;
    handle.close().await;
    let rows = imported.map_err(|e| StoreError::Invalid(e.to_string()))?;
    tracing::info!(item = %item_ref, table = %table, rows, "imported CSV");

    item.meta.updated = Some(Utc::now());
    state.store.save(&item)?;
    state.item_written(&item).await?;
    Ok(see_other(&item_ref))
}

async fn handle_plot(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    require_kind(&item_ref, ItemKind::Database)?;
    let item = state.store.get(&item_ref)?;
    let (Some(query), Some(spec)) = (item.meta.query.as_deref(), item.meta.plot.as_ref()) else {
        return Err(StoreError::NotFound(format!("plot of {}", item_ref)).into());
    };

    let handle = DatabaseHandle::open(&state.store.database_path(&item.id)).await?;
    let outcome = handle.execute(query, state.config.database.max_rows).await;
    handle.close().await;
    let outcome = outcome.map_err(|e| StoreError::Invalid(e.to_string()))?;

    let svg = plot::render_svg(
        spec,
        &outcome,
        state.config.plot.width,
        state.config.plot.height,
    )?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response())
}

#[derive(Debug, Deserialize)]
struct MemberForm {
    member: String,
}

async fn handle_add_member(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Form(form): Form<MemberForm>,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    require_kind(&item_ref, ItemKind::Listset)?;
    let member: ItemRef = form.member.parse()?;
    if !state.store.exists(&member) {
        return Err(StoreError::NotFound(member.to_string()).into());
    }

    let _edits = state.listset_edits.lock().await;
    let mut members = state.store.get(&item_ref)?.meta.members;
    listset::add(&mut members, &item_ref, member)?;
    let item = state.store.set_members(&item_ref, members)?;
    state.item_written(&item).await?;
    Ok(see_other(&item_ref))
}

async fn handle_member_action(
    State(state): State<AppState>,
    Path((kind, id, pos, action)): Path<(String, String, usize, String)>,
) -> PageResult {
    let item_ref = parse_ref(&kind, &id)?;
    require_kind(&item_ref, ItemKind::Listset)?;
    let action: MemberAction = action.parse()?;

    let _edits = state.listset_edits.lock().await;
    let mut members = state.store.get(&item_ref)?.meta.members;
    listset::apply(&mut members, pos, action)?;
    let item = state.store.set_members(&item_ref, members)?;
    state.item_written(&item).await?;
    Ok(see_other(&item_ref))
}

// ============ JSON API ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_manifest(State(state): State<AppState>) -> ApiResult<Manifest> {
    Ok(Json(sync::local_manifest(&state.store)?))
}

async fn handle_api_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Item> {
    Ok(Json(state.store.get(&parse_ref(&kind, &id)?)?))
}

async fn handle_api_raw(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let raw = state.store.read_raw(&parse_ref(&kind, &id)?)?;
    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], raw).into_response())
}

async fn handle_api_attachment(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let item_ref = parse_ref(&kind, &id)?;
    let item = state.store.get(&item_ref)?;
    let (bytes, content_type) = state.store.read_attachment(&item_ref)?;
    Ok(attachment_response(&item, bytes, content_type))
}

#[derive(Serialize)]
struct RelatedEntry {
    item: ItemRef,
    title: String,
    shared: Vec<String>,
}

#[derive(Serialize)]
struct RelatedResponse {
    item: ItemRef,
    related: Vec<RelatedEntry>,
}

async fn handle_api_related(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<RelatedResponse> {
    let item_ref = parse_ref(&kind, &id)?;
    if !state.store.exists(&item_ref) {
        return Err(StoreError::NotFound(item_ref.to_string()).into());
    }
    let relations = state
        .relations
        .read()
        .await
        .related(&item_ref, state.config.relations.max_related);
    let related = relations
        .into_iter()
        .map(|rel| RelatedEntry {
            title: state
                .store
                .get(&rel.target)
                .map(|i| i.display_title().to_string())
                .unwrap_or_default(),
            item: rel.target,
            shared: rel.shared.into_iter().collect(),
        })
        .collect();
    Ok(Json(RelatedResponse {
        item: item_ref,
        related,
    }))
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchHit>,
}

async fn handle_api_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<SearchResponse> {
    if params.q.trim().is_empty() {
        return Err(StoreError::Invalid("query must not be empty".to_string()).into());
    }
    let results = run_search(&state, &params).await?;
    Ok(Json(SearchResponse {
        query: params.q,
        results,
    }))
}

#[derive(Serialize)]
struct KeywordCount {
    keyword: String,
    count: usize,
}

#[derive(Serialize)]
struct KeywordsResponse {
    keywords: Vec<KeywordCount>,
}

async fn handle_api_keywords(State(state): State<AppState>) -> ApiResult<KeywordsResponse> {
    let keywords = state
        .relations
        .read()
        .await
        .keyword_counts()
        .into_iter()
        .map(|(keyword, count)| KeywordCount { keyword, count })
        .collect();
    Ok(Json(KeywordsResponse { keywords }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_domain_errors() {
        let not_found: anyhow::Error = StoreError::NotFound("notes/x".to_string()).into();
        assert_eq!(classify(&not_found).0, StatusCode::NOT_FOUND);

        let unknown: anyhow::Error = StoreError::UnknownKind("widgets".to_string()).into();
        assert_eq!(classify(&unknown).0, StatusCode::NOT_FOUND);

        let invalid: anyhow::Error =
            StoreError::Invalid("attachment filename '../x' is not a plain file name".to_string())
                .into();
        assert_eq!(classify(&invalid), (StatusCode::BAD_REQUEST, "bad_request"));

        let listset: anyhow::Error = ListsetError::SelfReference.into();
        assert_eq!(classify(&listset).0, StatusCode::BAD_REQUEST);

        let wrapped = anyhow::Error::from(StoreError::InvalidId("..".to_string()))
            .context("while loading");
        assert_eq!(classify(&wrapped).0, StatusCode::BAD_REQUEST);

        let other = anyhow::anyhow!("disk on fire");
        assert_eq!(classify(&other).0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn member_lines_reject_duplicates() {
        let members = parse_member_lines("notes/a\n\n links/b \n").unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].to_string(), "links/b");

        let err = parse_member_lines("notes/a\nnote/a").unwrap_err();
        assert!(err.downcast_ref::<ListsetError>().is_some());
        assert!(parse_member_lines("nonsense").is_err());
    }

    #[test]
    fn plot_fields_build_spec() {
        let mut form = FormData::default();
        assert!(form.plot_spec().unwrap().is_none());

        form.fields.insert("plot_kind".into(), "bar".into());
        form.fields.insert("plot_x".into(), "month".into());
        form.fields.insert("plot_y".into(), "sales, costs,".into());
        let spec = form.plot_spec().unwrap().unwrap();
        assert_eq!(spec.kind, PlotKind::Bar);
        assert_eq!(spec.y, vec!["sales".to_string(), "costs".to_string()]);
        assert!(spec.title.is_none());

        form.fields.insert("plot_y".into(), " ".into());
        assert!(form.plot_spec().is_err());
    }
}
