//! Destination-platform clients: signed page writes and the searchability
//! flag in the platform database.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::{Connection, MySql, MySqlConnection, QueryBuilder};
use thiserror::Error;
use tracing::debug;
use trellis_core::{DestinationPage, PageDraft};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trellis-storefront";

#[derive(Debug, Error)]
pub enum StorefrontError {
    #[error("destination request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("destination api status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("search index: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Page CRUD against the destination CMS.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Exact-identifier search; `None` when no page carries the identifier.
    async fn page_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<DestinationPage>, StorefrontError>;
    /// Direct lookup by the destination-assigned id; `None` when the page was
    /// deleted out-of-band.
    async fn page_by_id(&self, id: &str) -> Result<Option<DestinationPage>, StorefrontError>;
    async fn create_page(&self, draft: &PageDraft) -> Result<DestinationPage, StorefrontError>;
    async fn update_page(
        &self,
        id: i64,
        draft: &PageDraft,
    ) -> Result<DestinationPage, StorefrontError>;
}

/// Secondary store holding the per-page searchable flag.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn set_searchable(
        &self,
        identifiers: &[String],
        searchable: bool,
    ) -> Result<u64, StorefrontError>;
}

/// Credentials for the destination's OAuth 1.0 request signing.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub token_secret: String,
}

impl RequestSigner {
    /// Authorization header for one request. The body never participates in
    /// the signature; only OAuth parameters and URL query parameters do.
    pub fn authorization_header(&self, method: &str, url: &str) -> Result<String, StorefrontError> {
        let timestamp = Utc::now().timestamp().to_string();
        let nonce = format!("{}{}", Uuid::new_v4().simple(), timestamp);
        self.sign_with(method, url, &nonce, &timestamp)
    }

    /// Deterministic signing core; nonce and timestamp are injected so the
    /// output is reproducible.
    pub fn sign_with(
        &self,
        method: &str,
        url: &str,
        nonce: &str,
        timestamp: &str,
    ) -> Result<String, StorefrontError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| StorefrontError::Message(format!("invalid destination url {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| StorefrontError::Message(format!("destination url {url} has no host")))?;
        let mut base_url = format!("{}://{}", parsed.scheme(), host);
        if let Some(port) = parsed.port() {
            base_url.push_str(&format!(":{port}"));
        }
        base_url.push_str(parsed.path());

        let oauth_params = [
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_token", self.access_token.as_str()),
            ("oauth_signature_method", "HMAC-SHA256"),
            ("oauth_timestamp", timestamp),
            ("oauth_nonce", nonce),
            ("oauth_version", "1.0"),
        ];

        let mut signature_params: Vec<(String, String)> = oauth_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, value) in parsed.query_pairs() {
            signature_params.push((key.into_owned(), value.into_owned()));
        }
        signature_params.sort();

        let sorted = signature_params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let base_string = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            percent_encode(&base_url),
            percent_encode(&sorted)
        );
        let signing_key = format!(
            "{}&{}",
            percent_encode(&self.consumer_secret),
            percent_encode(&self.token_secret)
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes())
            .map_err(|e| StorefrontError::Message(format!("hmac key: {e}")))?;
        mac.update(base_string.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let mut header_params: Vec<(String, String)> = oauth_params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        header_params.push(("oauth_signature".to_string(), signature));

        let header = header_params
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth {header}"))
    }
}

/// `encodeURIComponent`-compatible percent encoding, which is what the
/// destination verifies signatures against.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    pub base_url: String,
    pub signer: RequestSigner,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorefrontClient {
    http: reqwest::Client,
    base_url: String,
    signer: RequestSigner,
}

impl StorefrontClient {
    pub fn new(config: &StorefrontConfig) -> Result<Self, StorefrontError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signer: config.signer.clone(),
        })
    }

    fn pages_url(&self) -> String {
        format!("{}/rest/default/V1/cmsPage", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StorefrontError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorefrontError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

pub fn search_by_identifier_url(base_url: &str, identifier: &str) -> String {
    format!(
        "{}/rest/default/V1/cmsPage/search\
         ?searchCriteria[filterGroups][0][filters][0][field]=identifier\
         &searchCriteria[filterGroups][0][filters][0][value]={}\
         &searchCriteria[filterGroups][0][filters][0][conditionType]=eq",
        base_url.trim_end_matches('/'),
        percent_encode(identifier)
    )
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(default)]
    items: Vec<WirePage>,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    id: i64,
    identifier: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl From<WirePage> for DestinationPage {
    fn from(wire: WirePage) -> Self {
        DestinationPage {
            id: wire.id,
            identifier: wire.identifier,
            title: wire.title,
            content: wire.content,
            active: wire.active,
        }
    }
}

#[derive(Debug, Serialize)]
struct PageEnvelope {
    page: PagePayload,
}

#[derive(Debug, Serialize)]
struct PagePayload {
    identifier: String,
    title: String,
    page_layout: String,
    meta_title: String,
    meta_keywords: String,
    meta_description: String,
    content_heading: String,
    content: String,
    creation_time: String,
    update_time: String,
    sort_order: String,
    custom_theme: String,
    active: u8,
    #[serde(rename = "type")]
    kind: String,
}

fn destination_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn page_payload(draft: &PageDraft) -> PagePayload {
    PagePayload {
        identifier: draft.identifier.clone(),
        title: draft.title.clone(),
        page_layout: "cms-full-width".to_string(),
        meta_title: draft.meta_title.clone(),
        meta_keywords: draft.meta_keywords.clone(),
        meta_description: draft.meta_description.clone(),
        // The destination shows the meta title as the content heading.
        content_heading: draft.meta_title.clone(),
        content: draft.content.clone(),
        creation_time: destination_timestamp(draft.creation_time),
        update_time: destination_timestamp(Utc::now()),
        sort_order: draft.sort_order.clone(),
        custom_theme: String::new(),
        active: u8::from(draft.active),
        kind: draft.kind.as_str().to_string(),
    }
}

#[async_trait]
impl PageStore for StorefrontClient {
    async fn page_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<DestinationPage>, StorefrontError> {
        let url = search_by_identifier_url(&self.base_url, identifier);
        let auth = self.signer.authorization_header("GET", &url)?;
        let response = self
            .http
            .get(&url)
            .header("Authorization", auth)
            .send()
            .await?;
        let results: SearchResults = Self::check(response).await?.json().await?;
        debug!(identifier, found = !results.items.is_empty(), "identifier search");
        Ok(results.items.into_iter().next().map(DestinationPage::from))
    }

    async fn page_by_id(&self, id: &str) -> Result<Option<DestinationPage>, StorefrontError> {
        let url = format!("{}/{}", self.pages_url(), id);
        let auth = self.signer.authorization_header("GET", &url)?;
        let response = self
            .http
            .get(&url)
            .header("Authorization", auth)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let page: WirePage = Self::check(response).await?.json().await?;
        Ok(Some(page.into()))
    }

    async fn create_page(&self, draft: &PageDraft) -> Result<DestinationPage, StorefrontError> {
        let url = self.pages_url();
        let auth = self.signer.authorization_header("POST", &url)?;
        let envelope = PageEnvelope {
            page: page_payload(draft),
        };
        let response = self
            .http
            .post(&url)
            .header("Authorization", auth)
            .json(&envelope)
            .send()
            .await?;
        // Identifier collisions come back as an API error and surface to the
        // caller untouched; the uniqueness constraint is the backstop against
        // duplicate pages.
        let page: WirePage = Self::check(response).await?.json().await?;
        debug!(identifier = %draft.identifier, page_id = page.id, "created page");
        Ok(page.into())
    }

    async fn update_page(
        &self,
        id: i64,
        draft: &PageDraft,
    ) -> Result<DestinationPage, StorefrontError> {
        let url = format!("{}/{}", self.pages_url(), id);
        let auth = self.signer.authorization_header("PUT", &url)?;
        let envelope = PageEnvelope {
            page: page_payload(draft),
        };
        let response = self
            .http
            .put(&url)
            .header("Authorization", auth)
            .json(&envelope)
            .send()
            .await?;
        let page: WirePage = Self::check(response).await?.json().await?;
        debug!(identifier = %draft.identifier, page_id = page.id, "updated page");
        Ok(page.into())
    }
}

/// Searchability store backed by the destination platform's MySQL database.
/// One connection per call, closed when the update finishes.
#[derive(Debug, Clone)]
pub struct MysqlSearchIndex {
    database_url: String,
}

impl MysqlSearchIndex {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

fn searchable_update<'a>(
    identifiers: &'a [String],
    searchable: bool,
) -> QueryBuilder<'a, MySql> {
    let mut builder = QueryBuilder::new("UPDATE cms_page SET is_searchable = ");
    builder.push_bind(i32::from(searchable));
    builder.push(" WHERE identifier IN (");
    {
        let mut separated = builder.separated(", ");
        for identifier in identifiers {
            separated.push_bind(identifier);
        }
    }
    builder.push(")");
    builder
}

#[async_trait]
impl SearchIndex for MysqlSearchIndex {
    async fn set_searchable(
        &self,
        identifiers: &[String],
        searchable: bool,
    ) -> Result<u64, StorefrontError> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        let mut conn = MySqlConnection::connect(&self.database_url).await?;
        let mut update = searchable_update(identifiers, searchable);
        let result = update.build().execute(&mut conn).await?;
        conn.close().await?;
        debug!(
            affected = result.rows_affected(),
            searchable, "updated searchable flags"
        );
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trellis_core::ContentKind;

    fn signer() -> RequestSigner {
        RequestSigner {
            consumer_key: "ck".to_string(),
            consumer_secret: "cs".to_string(),
            access_token: "at".to_string(),
            token_secret: "ts".to_string(),
        }
    }

    #[test]
    fn percent_encoding_matches_destination_rules() {
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(percent_encode("safe-._~!*'()"), "safe-._~!*'()");
        assert_eq!(percent_encode("k=v&x"), "k%3Dv%26x");
    }

    #[test]
    fn signing_is_deterministic_for_fixed_nonce_and_timestamp() {
        let url = "https://store.example.com/rest/default/V1/cmsPage/search?searchCriteria[pageSize]=20";
        let a = signer().sign_with("GET", url, "nonce1", "1700000000").unwrap();
        let b = signer().sign_with("GET", url, "nonce1", "1700000000").unwrap();
        assert_eq!(a, b);

        assert!(a.starts_with("OAuth "));
        assert!(a.contains("oauth_consumer_key=\"ck\""));
        assert!(a.contains("oauth_token=\"at\""));
        assert!(a.contains("oauth_signature_method=\"HMAC-SHA256\""));
        assert!(a.contains("oauth_signature=\""));
    }

    #[test]
    fn signature_depends_on_method_url_and_query() {
        let s = signer();
        let base = "https://store.example.com/rest/default/V1/cmsPage";
        let get = s.sign_with("GET", base, "n", "1").unwrap();
        let post = s.sign_with("POST", base, "n", "1").unwrap();
        let other = s
            .sign_with("GET", &format!("{base}?searchCriteria[pageSize]=1"), "n", "1")
            .unwrap();
        assert_ne!(get, post);
        assert_ne!(get, other);
    }

    #[test]
    fn search_url_embeds_the_exact_match_criteria() {
        let url = search_by_identifier_url(
            "https://store.example.com",
            "garden-guide/vegetables/kale",
        );
        assert!(url.contains("[filters][0][field]=identifier"));
        assert!(url.contains("[filters][0][value]=garden-guide%2Fvegetables%2Fkale"));
        assert!(url.contains("[filters][0][conditionType]=eq"));
    }

    #[test]
    fn page_payload_carries_draft_fields_and_kind_tag() {
        let draft = PageDraft {
            identifier: "garden-guide/vegetables/kale".to_string(),
            title: "How to Grow Kale".to_string(),
            content: "<p>kale</p>".to_string(),
            meta_title: "How to Grow Kale".to_string(),
            meta_description: String::new(),
            meta_keywords: String::new(),
            sort_order: "0".to_string(),
            active: true,
            kind: ContentKind::Article,
            creation_time: Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).single().unwrap(),
        };
        let payload = page_payload(&draft);
        assert_eq!(payload.identifier, draft.identifier);
        assert_eq!(payload.page_layout, "cms-full-width");
        assert_eq!(payload.content_heading, "How to Grow Kale");
        assert_eq!(payload.creation_time, "2024-01-15 09:30:00");
        assert_eq!(payload.active, 1);

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "article");
    }

    #[test]
    fn searchable_update_binds_one_placeholder_per_identifier() {
        let identifiers = vec![
            "garden-guide/vegetables/kale".to_string(),
            "garden-guide/vegetables/beets".to_string(),
        ];
        let builder = searchable_update(&identifiers, true);
        assert_eq!(
            builder.sql(),
            "UPDATE cms_page SET is_searchable = ? WHERE identifier IN (?, ?)"
        );
    }
}
