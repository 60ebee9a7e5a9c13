//! Axum + Askama surface for Trellis: previews, publish triggers, and the
//! source-system webhook.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::warn;
use trellis_content::{ContentDeliveryClient, ContentManagementClient};
use trellis_core::{last_path_segment, ContentEntry, ContentKind};
use trellis_storefront::{MysqlSearchIndex, StorefrontClient};
use trellis_sync::{
    live_entry, load_category_tree, CategoryAggregator, CategoryTree, CategoryWithEntries,
    PublishReceipt, Reconciler, SyncConfig, SyncError,
};

pub const CRATE_NAME: &str = "trellis-web";

const WEBHOOK_TOPIC_HEADER: &str = "x-webhook-topic";
const PUBLISH_TOPIC: &str = "Entry.publish";

pub struct AppState {
    pub config: SyncConfig,
    pub delivery: ContentDeliveryClient,
    pub management: ContentManagementClient,
    pub storefront: StorefrontClient,
    pub search: MysqlSearchIndex,
    css_path: PathBuf,
    css: OnceCell<String>,
}

impl AppState {
    pub fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let content_api = config.content_api();
        let storefront_config = config.storefront();
        Ok(Self {
            delivery: ContentDeliveryClient::new(&content_api)?,
            management: ContentManagementClient::new(&content_api)?,
            storefront: StorefrontClient::new(&storefront_config)?,
            search: MysqlSearchIndex::new(config.search_database_url.clone()),
            config,
            css_path: PathBuf::from("assets/styles.css"),
            css: OnceCell::new(),
        })
    }

    /// Read-through cache for the one static stylesheet; a read failure
    /// degrades to empty CSS rather than failing the render.
    async fn site_css(&self) -> &str {
        self.css
            .get_or_init(|| async {
                match tokio::fs::read_to_string(&self.css_path).await {
                    Ok(css) => css,
                    Err(err) => {
                        warn!(path = %self.css_path.display(), error = %err, "could not read stylesheet");
                        String::new()
                    }
                }
            })
            .await
    }

    fn reconciler(
        &self,
    ) -> Reconciler<'_, StorefrontClient, ContentManagementClient, MysqlSearchIndex> {
        Reconciler::new(&self.storefront, &self.management, &self.search)
    }
}

#[derive(Debug)]
pub enum PublishError {
    Sync(SyncError),
    Render(askama::Error),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Sync(err) => err.fmt(f),
            PublishError::Render(err) => write!(f, "render failed: {err}"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<SyncError> for PublishError {
    fn from(err: SyncError) -> Self {
        PublishError::Sync(err)
    }
}

impl From<askama::Error> for PublishError {
    fn from(err: askama::Error) -> Self {
        PublishError::Render(err)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/preview/article/{id}", get(preview_article_handler))
        .route("/preview/category/{id}", get(preview_category_handler))
        .route("/preview/faq/{id}", get(preview_faq_handler))
        .route("/preview/home", get(preview_home_handler))
        .route("/publish/article/{id}", post(publish_article_handler))
        .route("/publish/category/{id}", post(publish_category_handler))
        .route("/publish/faq/{id}", post(publish_faq_handler))
        .route("/publish/home", post(publish_home_handler))
        .route("/webhook/publish", post(webhook_handler))
        .route("/assets/styles.css", get(styles_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()).await
}

pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let state = AppState::from_config(config)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Render an already-fetched entry and reconcile it into the destination.
pub async fn publish_rendered_entry(
    state: &AppState,
    entry: &ContentEntry,
) -> Result<PublishReceipt, PublishError> {
    let fragment = match entry.kind {
        ContentKind::Article | ContentKind::Recipe => render_article_fragment(entry)?,
        ContentKind::Faq => render_faq_fragment(entry)?,
        ContentKind::Category => {
            let aggregator = CategoryAggregator::new(&state.delivery);
            let result = aggregator.aggregate(&entry.id, ContentKind::Article).await;
            let tree = load_category_tree(&state.delivery).await;
            render_category_fragment(entry, &result.items, result.total, &tree)?
        }
        ContentKind::Homepage => return publish_homepage(state).await,
    };
    let html = destination_fragment(state.site_css().await, &fragment);
    Ok(state.reconciler().reconcile(entry, &html).await?)
}

/// Fetch a live entry by id and publish it, whatever its kind.
pub async fn publish_entry_by_id(
    state: &AppState,
    id: &str,
) -> Result<PublishReceipt, PublishError> {
    let entry = live_entry(&state.delivery, id).await?;
    publish_rendered_entry(state, &entry).await
}

/// Aggregate the top-level categories and publish the homepage document.
pub async fn publish_homepage(state: &AppState) -> Result<PublishReceipt, PublishError> {
    let aggregator = CategoryAggregator::new(&state.delivery);
    let sections = aggregator.top_level_categories_with_entries(3).await;
    let fragment = render_home_fragment(&sections)?;
    let html = destination_fragment(state.site_css().await, &fragment);
    Ok(state.reconciler().reconcile_homepage(&html).await?)
}

#[derive(Template)]
#[template(path = "article.html")]
struct ArticleTemplate {
    title: String,
    published: String,
    hero_image_url: String,
    hero_image_alt: String,
    paragraphs: Vec<String>,
}

#[derive(Template)]
#[template(path = "category.html")]
struct CategoryTemplate {
    title: String,
    total: usize,
    cards: Vec<ArticleCard>,
    sidebar: Vec<SidebarItem>,
}

#[derive(Template)]
#[template(path = "faq.html")]
struct FaqTemplate {
    title: String,
    category: String,
    paragraphs: Vec<String>,
}

#[derive(Template)]
#[template(path = "home.html")]
struct HomeTemplate {
    sections: Vec<HomeSection>,
}

struct ArticleCard {
    title: String,
    url: String,
    image_url: String,
    image_alt: String,
    description: String,
}

struct SidebarItem {
    title: String,
    url: String,
    current: bool,
}

struct HomeSection {
    title: String,
    url: String,
    cards: Vec<ArticleCard>,
}

/// Plain-paragraph extraction from a rich-text document. Full rich-text
/// rendering is deliberately out of scope; the destination receives readable
/// text content.
pub fn rich_text_paragraphs(document: &JsonValue) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let Some(blocks) = document.get("content").and_then(JsonValue::as_array) else {
        return paragraphs;
    };
    for block in blocks {
        let mut text = String::new();
        collect_text(block, &mut text);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            paragraphs.push(trimmed.to_string());
        }
    }
    paragraphs
}

fn collect_text(node: &JsonValue, out: &mut String) {
    if let Some(value) = node.get("value").and_then(JsonValue::as_str) {
        out.push_str(value);
    }
    if let Some(children) = node.get("content").and_then(JsonValue::as_array) {
        for child in children {
            collect_text(child, out);
        }
    }
}

/// Full HTML document around a rendered fragment, used by the preview routes.
pub fn render_document(title: &str, css: &str, fragment: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n\
         <meta charset=\"UTF-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <title>{title}</title>\n<style>{css}</style>\n</head>\n<body>\n{fragment}\n</body>\n</html>"
    )
}

/// What actually gets submitted: styles plus the fragment inside a scoped
/// container, so the destination page cannot leak CSS into the surrounding
/// storefront.
pub fn destination_fragment(css: &str, fragment: &str) -> String {
    format!("<style>{css}</style>\n<div class=\"trellis-content-page\">{fragment}</div>")
}

fn article_card(entry: &ContentEntry) -> ArticleCard {
    let title = entry.title().to_string();
    ArticleCard {
        url: entry.destination_identifier(),
        image_url: entry
            .fields
            .list_image_url
            .clone()
            .or_else(|| entry.fields.hero_image_url.clone())
            .unwrap_or_default(),
        image_alt: entry
            .fields
            .list_image_alt
            .clone()
            .or_else(|| entry.fields.hero_image_alt.clone())
            .unwrap_or_else(|| title.clone()),
        description: entry.fields.meta_description.clone().unwrap_or_default(),
        title,
    }
}

fn render_article_fragment(entry: &ContentEntry) -> Result<String, askama::Error> {
    ArticleTemplate {
        title: entry.title().to_string(),
        published: entry
            .fields
            .published_at
            .map(|at| at.format("%B %-d, %Y").to_string())
            .unwrap_or_default(),
        hero_image_url: entry.fields.hero_image_url.clone().unwrap_or_default(),
        hero_image_alt: entry
            .fields
            .hero_image_alt
            .clone()
            .unwrap_or_else(|| entry.title().to_string()),
        paragraphs: entry
            .fields
            .body
            .as_ref()
            .map(rich_text_paragraphs)
            .unwrap_or_default(),
    }
    .render()
}

fn sidebar_items(tree: &CategoryTree, current_id: &str) -> Vec<SidebarItem> {
    let mut items = Vec::new();
    for root in tree.roots() {
        items.push(SidebarItem {
            title: root.entry.title().to_string(),
            url: root.entry.destination_identifier(),
            current: root.entry.id == current_id,
        });
        for child in tree.children_of(&root.entry.id) {
            items.push(SidebarItem {
                title: last_path_segment(child.entry.title()).to_string(),
                url: child.entry.destination_identifier(),
                current: child.entry.id == current_id,
            });
        }
    }
    items
}

fn render_category_fragment(
    category: &ContentEntry,
    items: &[ContentEntry],
    total: usize,
    tree: &CategoryTree,
) -> Result<String, askama::Error> {
    CategoryTemplate {
        title: last_path_segment(category.title()).to_string(),
        total,
        cards: items.iter().map(article_card).collect(),
        sidebar: sidebar_items(tree, &category.id),
    }
    .render()
}

fn render_faq_fragment(entry: &ContentEntry) -> Result<String, askama::Error> {
    FaqTemplate {
        title: entry.title().to_string(),
        category: entry
            .fields
            .faq_category
            .clone()
            .unwrap_or_else(|| "General".to_string()),
        paragraphs: entry
            .fields
            .body
            .as_ref()
            .map(rich_text_paragraphs)
            .unwrap_or_default(),
    }
    .render()
}

fn render_home_fragment(sections: &[CategoryWithEntries]) -> Result<String, askama::Error> {
    HomeTemplate {
        sections: sections
            .iter()
            .map(|section| HomeSection {
                title: section.category.title().to_string(),
                url: section.category.destination_identifier(),
                cards: section.entries.iter().map(article_card).collect(),
            })
            .collect(),
    }
    .render()
}

fn sync_error_response(err: &SyncError) -> Response {
    match err {
        SyncError::NotFoundInSource(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Content {id} not found") })),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "action": other.action_label(),
                "error": other.to_string(),
            })),
        )
            .into_response(),
    }
}

fn publish_error_response(err: &PublishError) -> Response {
    match err {
        PublishError::Sync(err) => sync_error_response(err),
        PublishError::Render(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("render failed: {err}") })),
        )
            .into_response(),
    }
}

fn publish_response(kind_label: &str, receipt: &PublishReceipt) -> Response {
    Json(json!({
        "success": true,
        "message": format!("{kind_label} rendered and {} in destination", receipt.action),
        "page": {
            "action": receipt.action,
            "identifier": receipt.identifier,
            "page_id": receipt.page_id,
            "title": receipt.title,
        },
    }))
    .into_response()
}

fn wrong_kind_response(entry: &ContentEntry, expected: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": format!("Entry is not {expected}"),
            "contentType": entry.kind.as_str(),
        })),
    )
        .into_response()
}

async fn index_handler() -> Html<String> {
    Html(
        "<html><head><title>Trellis Content Sync</title></head><body>\
         <h1>Trellis Content Sync</h1>\
         <p>Renders source CMS entries and publishes them to the storefront CMS.</p>\
         <ul>\
         <li>GET /preview/article/[entryId]</li>\
         <li>GET /preview/category/[categoryId]</li>\
         <li>GET /preview/faq/[entryId]</li>\
         <li>GET /preview/home</li>\
         <li>POST /publish/article/[entryId]</li>\
         <li>POST /publish/category/[categoryId]</li>\
         <li>POST /publish/faq/[entryId]</li>\
         <li>POST /publish/home</li>\
         <li>POST /webhook/publish</li>\
         </ul></body></html>"
            .to_string(),
    )
}

async fn styles_handler(State(state): State<Arc<AppState>>) -> Response {
    let css = state.site_css().await;
    (
        [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
        css.to_string(),
    )
        .into_response()
}

async fn preview_article_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let entry = match live_entry(&state.delivery, &id).await {
        Ok(entry) => entry,
        Err(err) => return sync_error_response(&err),
    };
    if !matches!(entry.kind, ContentKind::Article | ContentKind::Recipe) {
        return wrong_kind_response(&entry, "an article");
    }
    match render_article_fragment(&entry) {
        Ok(fragment) => Html(render_document(
            entry.title(),
            state.site_css().await,
            &fragment,
        ))
        .into_response(),
        Err(err) => publish_error_response(&err.into()),
    }
}

async fn preview_category_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let category = match live_entry(&state.delivery, &id).await {
        Ok(entry) => entry,
        Err(err) => return sync_error_response(&err),
    };
    if category.kind != ContentKind::Category {
        return wrong_kind_response(&category, "a category");
    }
    let aggregator = CategoryAggregator::new(&state.delivery);
    let result = aggregator.aggregate(&category.id, ContentKind::Article).await;
    let tree = load_category_tree(&state.delivery).await;
    match render_category_fragment(&category, &result.items, result.total, &tree) {
        Ok(fragment) => Html(render_document(
            &format!("{} - Articles", category.title()),
            state.site_css().await,
            &fragment,
        ))
        .into_response(),
        Err(err) => publish_error_response(&err.into()),
    }
}

async fn preview_faq_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let entry = match live_entry(&state.delivery, &id).await {
        Ok(entry) => entry,
        Err(err) => return sync_error_response(&err),
    };
    if entry.kind != ContentKind::Faq {
        return wrong_kind_response(&entry, "an FAQ");
    }
    match render_faq_fragment(&entry) {
        Ok(fragment) => Html(render_document(
            entry.title(),
            state.site_css().await,
            &fragment,
        ))
        .into_response(),
        Err(err) => publish_error_response(&err.into()),
    }
}

async fn preview_home_handler(State(state): State<Arc<AppState>>) -> Response {
    let aggregator = CategoryAggregator::new(&state.delivery);
    let sections = aggregator.top_level_categories_with_entries(3).await;
    match render_home_fragment(&sections) {
        Ok(fragment) => Html(render_document(
            "Garden Guide",
            state.site_css().await,
            &fragment,
        ))
        .into_response(),
        Err(err) => publish_error_response(&err.into()),
    }
}

async fn publish_article_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let entry = match live_entry(&state.delivery, &id).await {
        Ok(entry) => entry,
        Err(err) => return sync_error_response(&err),
    };
    if !matches!(entry.kind, ContentKind::Article | ContentKind::Recipe) {
        return wrong_kind_response(&entry, "an article");
    }
    match publish_rendered_entry(&state, &entry).await {
        Ok(receipt) => publish_response("Entry", &receipt),
        Err(err) => publish_error_response(&err),
    }
}

async fn publish_category_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let entry = match live_entry(&state.delivery, &id).await {
        Ok(entry) => entry,
        Err(err) => return sync_error_response(&err),
    };
    if entry.kind != ContentKind::Category {
        return wrong_kind_response(&entry, "a category");
    }
    match publish_rendered_entry(&state, &entry).await {
        Ok(receipt) => publish_response("Category page", &receipt),
        Err(err) => publish_error_response(&err),
    }
}

async fn publish_faq_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let entry = match live_entry(&state.delivery, &id).await {
        Ok(entry) => entry,
        Err(err) => return sync_error_response(&err),
    };
    if entry.kind != ContentKind::Faq {
        return wrong_kind_response(&entry, "an FAQ");
    }
    match publish_rendered_entry(&state, &entry).await {
        Ok(receipt) => publish_response("FAQ", &receipt),
        Err(err) => publish_error_response(&err),
    }
}

async fn publish_home_handler(State(state): State<Arc<AppState>>) -> Response {
    match publish_homepage(&state).await {
        Ok(receipt) => publish_response("Homepage", &receipt),
        Err(err) => publish_error_response(&err),
    }
}

/// Reacts to a publish event from the source system and re-runs the matching
/// single-entry pipeline. Other topics are acknowledged and ignored.
async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<JsonValue>,
) -> Response {
    let topic = headers
        .get(WEBHOOK_TOPIC_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if topic != PUBLISH_TOPIC {
        return Json(json!({ "message": format!("Ignoring webhook topic: {topic}") }))
            .into_response();
    }

    let Some(entry_id) = payload
        .get("sys")
        .and_then(|sys| sys.get("id"))
        .and_then(JsonValue::as_str)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing entry id in webhook payload" })),
        )
            .into_response();
    };

    match publish_entry_by_id(&state, entry_id).await {
        Ok(receipt) => publish_response("Entry", &receipt),
        Err(err) => publish_error_response(&err),
    }
}
