//! Source CMS clients: read access for entries and the management write-back
//! used to record destination identifiers on published entries.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use trellis_core::{
    CategoryLink, ContentEntry, ContentKind, EntryFields, EntryMetadata, FieldPatch,
};

pub const CRATE_NAME: &str = "trellis-content";

const DEFAULT_LOCALE: &str = "en-US";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("source api status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("{0}")]
    Message(String),
}

/// Read side of the source CMS. Archival filtering happens above this layer;
/// implementations return entries exactly as stored.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn entry(&self, id: &str) -> Result<Option<ContentEntry>, SourceError>;
    async fn entries(&self, query: &EntryQuery) -> Result<EntryPage, SourceError>;
}

/// Write side of the source CMS, limited to the two cross-reference fields
/// this system owns.
#[async_trait]
pub trait SourceWriter: Send + Sync {
    async fn write_back(&self, entry_id: &str, patch: &FieldPatch) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPage {
    pub items: Vec<ContentEntry>,
    pub total: usize,
}

impl EntryPage {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryFilter {
    /// Category entries whose parent reference equals the id.
    ParentEq(String),
    /// Entries whose primary category reference equals the id.
    MainCategoryEq(String),
    /// Entries whose secondary-category list contains the id.
    SecondaryCategoryContains(String),
    /// Entries with (or without) a parent reference at all.
    ParentExists(bool),
    /// Excludes a single id from the result.
    IdNe(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryQuery {
    pub kind: ContentKind,
    pub limit: usize,
    pub skip: usize,
    pub filters: Vec<EntryFilter>,
}

impl EntryQuery {
    pub fn of_kind(kind: ContentKind) -> Self {
        Self {
            kind,
            limit: 100,
            skip: 0,
            filters: Vec::new(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_filter(mut self, filter: EntryFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Query-string pairs in the delivery API's filter syntax.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("content_type".to_string(), self.kind.as_str().to_string()),
            ("limit".to_string(), self.limit.to_string()),
            ("skip".to_string(), self.skip.to_string()),
            ("include".to_string(), "2".to_string()),
        ];
        for filter in &self.filters {
            let (key, value) = match filter {
                EntryFilter::ParentEq(id) => ("fields.parent.sys.id".to_string(), id.clone()),
                EntryFilter::MainCategoryEq(id) => {
                    ("fields.mainCategory.sys.id".to_string(), id.clone())
                }
                EntryFilter::SecondaryCategoryContains(id) => {
                    ("fields.secondaryCategories.sys.id[in]".to_string(), id.clone())
                }
                EntryFilter::ParentExists(exists) => {
                    ("fields.parent[exists]".to_string(), exists.to_string())
                }
                EntryFilter::IdNe(id) => ("sys.id[ne]".to_string(), id.clone()),
            };
            params.push((key, value));
        }
        params
    }
}

#[derive(Debug, Clone)]
pub struct ContentApiConfig {
    pub base_url: String,
    pub space: String,
    pub environment: String,
    pub delivery_token: String,
    pub management_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

fn build_http_client(config: &ContentApiConfig) -> Result<reqwest::Client, SourceError> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().map_err(SourceError::Request)
}

/// Read-only client against the delivery API.
#[derive(Debug, Clone)]
pub struct ContentDeliveryClient {
    http: reqwest::Client,
    base_url: String,
    space: String,
    environment: String,
    access_token: String,
}

impl ContentDeliveryClient {
    pub fn new(config: &ContentApiConfig) -> Result<Self, SourceError> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            space: config.space.clone(),
            environment: config.environment.clone(),
            access_token: config.delivery_token.clone(),
        })
    }

    fn entries_url(&self) -> String {
        format!(
            "{}/spaces/{}/environments/{}/entries",
            self.base_url, self.space, self.environment
        )
    }

    async fn fetch_collection(
        &self,
        params: &[(String, String)],
    ) -> Result<WireCollection, SourceError> {
        let url = self.entries_url();
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.json::<WireCollection>().await?)
    }
}

#[async_trait]
impl SourceStore for ContentDeliveryClient {
    async fn entry(&self, id: &str) -> Result<Option<ContentEntry>, SourceError> {
        // Single-entry reads go through the collection endpoint so linked
        // categories and assets arrive resolved in the same response.
        let params = vec![
            ("sys.id".to_string(), id.to_string()),
            ("include".to_string(), "2".to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let collection = self.fetch_collection(&params).await?;
        let resolver = LinkResolver::from_collection(&collection);
        Ok(collection
            .items
            .first()
            .and_then(|raw| convert_entry(raw, &resolver)))
    }

    async fn entries(&self, query: &EntryQuery) -> Result<EntryPage, SourceError> {
        let params = query.to_params();
        let collection = self.fetch_collection(&params).await?;
        let resolver = LinkResolver::from_collection(&collection);
        let items: Vec<ContentEntry> = collection
            .items
            .iter()
            .filter_map(|raw| convert_entry(raw, &resolver))
            .collect();
        debug!(
            kind = query.kind.as_str(),
            fetched = items.len(),
            total = collection.total,
            "fetched entry page"
        );
        Ok(EntryPage {
            items,
            total: collection.total,
        })
    }
}

/// Management-side client used only for the post-publish write-backs.
#[derive(Debug, Clone)]
pub struct ContentManagementClient {
    http: reqwest::Client,
    base_url: String,
    space: String,
    environment: String,
    management_token: String,
}

impl ContentManagementClient {
    pub fn new(config: &ContentApiConfig) -> Result<Self, SourceError> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            space: config.space.clone(),
            environment: config.environment.clone(),
            management_token: config.management_token.clone(),
        })
    }

    fn entry_url(&self, entry_id: &str) -> String {
        format!(
            "{}/spaces/{}/environments/{}/entries/{}",
            self.base_url, self.space, self.environment, entry_id
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }
}

// Management-side field values are wrapped per locale.
fn localized(value: &str) -> JsonValue {
    let mut wrapped = serde_json::Map::new();
    wrapped.insert(DEFAULT_LOCALE.to_string(), JsonValue::String(value.to_string()));
    JsonValue::Object(wrapped)
}

#[derive(Debug, Deserialize)]
struct ManagedEntry {
    sys: ManagedSys,
    #[serde(default)]
    fields: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ManagedSys {
    version: u64,
}

#[async_trait]
impl SourceWriter for ContentManagementClient {
    async fn write_back(&self, entry_id: &str, patch: &FieldPatch) -> Result<(), SourceError> {
        if patch.is_empty() {
            return Ok(());
        }
        let url = self.entry_url(entry_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.management_token)
            .send()
            .await?;
        let current: ManagedEntry = Self::check(response).await?.json().await?;

        let mut fields = match current.fields {
            JsonValue::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(page_id) = &patch.destination_page_id {
            fields.insert("destinationPageId".to_string(), localized(page_id));
        }
        if let Some(frontend_url) = &patch.frontend_url {
            fields.insert("frontendUrl".to_string(), localized(frontend_url));
        }

        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.management_token)
            .header("X-Entry-Version", current.sys.version)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        let updated: ManagedEntry = Self::check(response).await?.json().await?;

        // The edit only becomes visible to the delivery API once published.
        let response = self
            .http
            .put(format!("{url}/published"))
            .bearer_auth(&self.management_token)
            .header("X-Entry-Version", updated.sys.version)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(entry_id, "wrote back cross-reference fields");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireCollection {
    #[serde(default)]
    items: Vec<WireEntry>,
    #[serde(default)]
    total: usize,
    #[serde(default)]
    includes: Option<WireIncludes>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct WireIncludes {
    #[serde(rename = "Entry", default)]
    entries: Vec<WireEntry>,
    #[serde(rename = "Asset", default)]
    assets: Vec<WireAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireEntry {
    sys: WireSys,
    #[serde(default)]
    fields: JsonValue,
    #[serde(default)]
    metadata: Option<WireMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireSys {
    id: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
    #[serde(rename = "contentType")]
    content_type: Option<WireTypeLink>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireTypeLink {
    sys: WireLinkSys,
}

#[derive(Debug, Clone, Deserialize)]
struct WireLinkSys {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMetadata {
    #[serde(default)]
    tags: Vec<WireTag>,
}

/// Archival tags arrive either as link objects or as bare strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireTag {
    Link { sys: WireLinkSys },
    Name(String),
}

impl WireTag {
    fn id(&self) -> &str {
        match self {
            WireTag::Link { sys } => &sys.id,
            WireTag::Name(name) => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireAsset {
    sys: WireAssetSys,
    #[serde(default)]
    fields: JsonValue,
}

#[derive(Debug, Clone, Deserialize)]
struct WireAssetSys {
    id: String,
}

/// Lookup tables for resolving entry and asset links within one response.
struct LinkResolver {
    entry_titles: HashMap<String, String>,
    asset_urls: HashMap<String, String>,
}

impl LinkResolver {
    fn from_collection(collection: &WireCollection) -> Self {
        let mut entry_titles = HashMap::new();
        let mut asset_urls = HashMap::new();
        let included = collection.includes.as_ref();

        let linked_entries = included.map(|inc| inc.entries.as_slice()).unwrap_or(&[]);
        for raw in collection.items.iter().chain(linked_entries) {
            if let Some(title) = json_str(&raw.fields, &["title"]) {
                entry_titles.insert(raw.sys.id.clone(), title.to_string());
            }
        }
        for asset in included.map(|inc| inc.assets.as_slice()).unwrap_or(&[]) {
            if let Some(url) = json_str(&asset.fields, &["file", "url"]) {
                asset_urls.insert(asset.sys.id.clone(), ensure_https(url));
            }
        }
        Self {
            entry_titles,
            asset_urls,
        }
    }

    fn category_link(&self, value: &JsonValue) -> Option<CategoryLink> {
        let id = json_str(value, &["sys", "id"])?;
        Some(CategoryLink {
            id: id.to_string(),
            title: self.entry_titles.get(id).cloned(),
        })
    }

    fn asset_url(&self, value: &JsonValue) -> Option<String> {
        let id = json_str(value, &["sys", "id"])?;
        self.asset_urls.get(id).cloned()
    }
}

// Asset urls are frequently delivered protocol-relative.
fn ensure_https(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn field_str(fields: &JsonValue, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
}

fn field_string_vec(fields: &JsonValue, name: &str) -> Vec<String> {
    fields
        .get(name)
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn convert_entry(raw: &WireEntry, resolver: &LinkResolver) -> Option<ContentEntry> {
    let kind = raw
        .sys
        .content_type
        .as_ref()
        .and_then(|link| ContentKind::parse(&link.sys.id))?;

    let fields = &raw.fields;
    let published_at = field_str(fields, "publishedAt")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let secondary_categories = fields
        .get("secondaryCategories")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| resolver.category_link(v))
                .collect()
        })
        .unwrap_or_default();

    let entry_fields = EntryFields {
        title: field_str(fields, "title"),
        slug: field_str(fields, "slug"),
        new_slug: field_str(fields, "newSlug"),
        frontend_url: field_str(fields, "frontendUrl"),
        destination_page_id: field_str(fields, "destinationPageId"),
        published_at,
        main_category: fields
            .get("mainCategory")
            .and_then(|v| resolver.category_link(v)),
        secondary_categories,
        parent: fields.get("parent").and_then(|v| resolver.category_link(v)),
        faq_category: field_str(fields, "faqCategory"),
        meta_title: field_str(fields, "metaTitle"),
        meta_description: field_str(fields, "metaDescription"),
        meta_keywords: field_str(fields, "metaKeywords"),
        hero_image_url: fields
            .get("featuredImage")
            .and_then(|v| resolver.asset_url(v)),
        hero_image_alt: field_str(fields, "imageAlt"),
        list_image_url: fields.get("listImage").and_then(|v| resolver.asset_url(v)),
        list_image_alt: field_str(fields, "listImageAlt"),
        body: fields.get("body").cloned(),
        tags: field_string_vec(fields, "tags"),
    };

    let metadata = EntryMetadata {
        tags: raw
            .metadata
            .as_ref()
            .map(|m| m.tags.iter().map(|t| t.id().to_string()).collect())
            .unwrap_or_default(),
    };

    Some(ContentEntry {
        id: raw.sys.id.clone(),
        kind,
        created_at: raw.sys.created_at,
        updated_at: raw.sys.updated_at,
        fields: entry_fields,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(json: JsonValue) -> WireCollection {
        serde_json::from_value(json).expect("wire collection")
    }

    #[test]
    fn query_params_cover_every_filter_form() {
        let query = EntryQuery::of_kind(ContentKind::Article)
            .with_limit(50)
            .with_skip(10)
            .with_filter(EntryFilter::MainCategoryEq("CAT1".to_string()))
            .with_filter(EntryFilter::SecondaryCategoryContains("CAT1".to_string()))
            .with_filter(EntryFilter::IdNe("CAT1".to_string()));
        let params = query.to_params();
        assert!(params.contains(&("content_type".to_string(), "article".to_string())));
        assert!(params.contains(&("limit".to_string(), "50".to_string())));
        assert!(params.contains(&("skip".to_string(), "10".to_string())));
        assert!(params.contains(&("fields.mainCategory.sys.id".to_string(), "CAT1".to_string())));
        assert!(params.contains(&(
            "fields.secondaryCategories.sys.id[in]".to_string(),
            "CAT1".to_string()
        )));
        assert!(params.contains(&("sys.id[ne]".to_string(), "CAT1".to_string())));

        let query = EntryQuery::of_kind(ContentKind::Category)
            .with_filter(EntryFilter::ParentEq("CAT1".to_string()));
        assert!(query
            .to_params()
            .contains(&("fields.parent.sys.id".to_string(), "CAT1".to_string())));

        let query = EntryQuery::of_kind(ContentKind::Category)
            .with_filter(EntryFilter::ParentExists(false));
        assert!(query
            .to_params()
            .contains(&("fields.parent[exists]".to_string(), "false".to_string())));
    }

    #[test]
    fn converts_wire_entry_with_resolved_links() {
        let collection = collection(serde_json::json!({
            "total": 1,
            "items": [{
                "sys": {
                    "id": "A1",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "updatedAt": "2024-01-02T00:00:00Z",
                    "contentType": { "sys": { "id": "article" } }
                },
                "fields": {
                    "title": "How to Grow Kale",
                    "slug": "how-to-grow-kale",
                    "publishedAt": "2024-02-01T12:00:00Z",
                    "mainCategory": { "sys": { "id": "CAT1" } },
                    "secondaryCategories": [{ "sys": { "id": "CAT2" } }],
                    "featuredImage": { "sys": { "id": "IMG1" } },
                    "imageAlt": "Kale leaves"
                }
            }],
            "includes": {
                "Entry": [{
                    "sys": {
                        "id": "CAT1",
                        "createdAt": "2023-01-01T00:00:00Z",
                        "updatedAt": "2023-01-01T00:00:00Z",
                        "contentType": { "sys": { "id": "category" } }
                    },
                    "fields": { "title": "Vegetables" }
                }],
                "Asset": [{
                    "sys": { "id": "IMG1" },
                    "fields": { "file": { "url": "//images.example.com/kale.jpg" } }
                }]
            }
        }));
        let resolver = LinkResolver::from_collection(&collection);
        let entry = convert_entry(&collection.items[0], &resolver).expect("entry");

        assert_eq!(entry.kind, ContentKind::Article);
        assert_eq!(entry.fields.title.as_deref(), Some("How to Grow Kale"));
        let main = entry.fields.main_category.as_ref().expect("main category");
        assert_eq!(main.id, "CAT1");
        assert_eq!(main.title.as_deref(), Some("Vegetables"));
        // CAT2 is linked but not included, so the title stays unresolved.
        assert_eq!(entry.fields.secondary_categories[0].title, None);
        assert_eq!(
            entry.fields.hero_image_url.as_deref(),
            Some("https://images.example.com/kale.jpg")
        );
        assert_eq!(
            entry.fields.published_at.map(|dt| dt.to_rfc3339()),
            Some("2024-02-01T12:00:00+00:00".to_string())
        );
    }

    #[test]
    fn archival_tags_accept_both_wire_forms() {
        let collection = collection(serde_json::json!({
            "total": 2,
            "items": [
                {
                    "sys": {
                        "id": "A1",
                        "createdAt": "2024-01-01T00:00:00Z",
                        "updatedAt": "2024-01-01T00:00:00Z",
                        "contentType": { "sys": { "id": "article" } }
                    },
                    "fields": { "title": "Tagged by link" },
                    "metadata": { "tags": [{ "sys": { "id": "archived" } }] }
                },
                {
                    "sys": {
                        "id": "A2",
                        "createdAt": "2024-01-01T00:00:00Z",
                        "updatedAt": "2024-01-01T00:00:00Z",
                        "contentType": { "sys": { "id": "article" } }
                    },
                    "fields": { "title": "Tagged by name" },
                    "metadata": { "tags": ["Archived"] }
                }
            ]
        }));
        let resolver = LinkResolver::from_collection(&collection);
        for raw in &collection.items {
            let entry = convert_entry(raw, &resolver).expect("entry");
            assert!(entry.is_archived(), "{} should be archived", entry.id);
        }
    }

    #[test]
    fn unknown_content_types_are_skipped() {
        let collection = collection(serde_json::json!({
            "total": 1,
            "items": [{
                "sys": {
                    "id": "X1",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "updatedAt": "2024-01-01T00:00:00Z",
                    "contentType": { "sys": { "id": "promoBanner" } }
                },
                "fields": { "title": "Not ours" }
            }]
        }));
        let resolver = LinkResolver::from_collection(&collection);
        assert!(convert_entry(&collection.items[0], &resolver).is_none());
    }
}
