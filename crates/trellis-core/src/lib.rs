//! Core domain model for Trellis: source entries, destination pages, and the
//! identifier rules that link the two systems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "trellis-core";

/// Fixed identifier of the single homepage document in the destination system.
pub const HOMEPAGE_IDENTIFIER: &str = "garden-guide";

/// Base path shared by article and category pages.
pub const GUIDE_BASE_PATH: &str = "garden-guide";

/// Base path for recipe pages.
pub const RECIPES_BASE_PATH: &str = "garden-guide/harvest-recipes";

/// Base path for FAQ pages.
pub const HELP_BASE_PATH: &str = "help";

/// Tag id that marks an entry as logically deleted.
pub const ARCHIVED_TAG: &str = "archived";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Article,
    Recipe,
    Faq,
    Category,
    Homepage,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Article => "article",
            ContentKind::Recipe => "recipe",
            ContentKind::Faq => "faq",
            ContentKind::Category => "category",
            ContentKind::Homepage => "homepage",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "article" => Some(ContentKind::Article),
            "recipe" => Some(ContentKind::Recipe),
            "faq" => Some(ContentKind::Faq),
            "category" => Some(ContentKind::Category),
            "homepage" => Some(ContentKind::Homepage),
            _ => None,
        }
    }
}

/// Reference to another entry, with the linked title when the link was
/// resolved by the fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLink {
    pub id: String,
    pub title: Option<String>,
}

impl CategoryLink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
        }
    }

    pub fn with_title(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: Some(title.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntryFields {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub new_slug: Option<String>,
    /// Explicit front-end URL override; written back after first publish.
    pub frontend_url: Option<String>,
    /// Destination page id recorded on a previous publish.
    pub destination_page_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub main_category: Option<CategoryLink>,
    pub secondary_categories: Vec<CategoryLink>,
    pub parent: Option<CategoryLink>,
    pub faq_category: Option<String>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub meta_keywords: Option<String>,
    pub hero_image_url: Option<String>,
    pub hero_image_alt: Option<String>,
    pub list_image_url: Option<String>,
    pub list_image_alt: Option<String>,
    /// Rich-text body document as delivered by the source API.
    pub body: Option<JsonValue>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntryMetadata {
    pub tags: Vec<String>,
}

/// Source-of-truth record. Read-only to this system except for the two
/// write-back fields in [`FieldPatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub id: String,
    pub kind: ContentKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: EntryFields,
    pub metadata: EntryMetadata,
}

impl ContentEntry {
    /// An entry carrying an archival tag is treated as deleted everywhere.
    pub fn is_archived(&self) -> bool {
        self.metadata
            .tags
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(ARCHIVED_TAG))
    }

    /// Publish date used for ordering, falling back to the creation stamp.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.fields.published_at.unwrap_or(self.created_at)
    }

    pub fn title(&self) -> &str {
        self.fields.title.as_deref().unwrap_or("Untitled")
    }

    fn url_slug(&self) -> String {
        self.fields
            .new_slug
            .clone()
            .or_else(|| self.fields.slug.clone())
            .unwrap_or_else(|| self.id.to_lowercase())
    }

    /// Canonical destination identifier for this entry. The explicit override
    /// wins for article-like kinds; otherwise the identifier is derived from
    /// category titles and the entry slug.
    pub fn destination_identifier(&self) -> String {
        match self.kind {
            ContentKind::Article => match &self.fields.frontend_url {
                Some(url) if !url.trim().is_empty() => normalize_frontend_url(url),
                _ => {
                    let category = self
                        .fields
                        .main_category
                        .as_ref()
                        .and_then(|link| link.title.as_deref())
                        .unwrap_or("uncategorized");
                    format!("{}/{}/{}", GUIDE_BASE_PATH, slugify(category), self.url_slug())
                }
            },
            ContentKind::Recipe => match &self.fields.frontend_url {
                Some(url) if !url.trim().is_empty() => normalize_frontend_url(url),
                _ => format!("{}/{}", RECIPES_BASE_PATH, self.url_slug()),
            },
            ContentKind::Category => {
                let title = self.fields.title.as_deref().unwrap_or("Untitled Category");
                format!("{}/{}", GUIDE_BASE_PATH, category_path(title))
            }
            ContentKind::Faq => match &self.fields.frontend_url {
                Some(url) if !url.trim().is_empty() => normalize_frontend_url(url),
                _ => {
                    let category = self
                        .fields
                        .faq_category
                        .as_deref()
                        .filter(|c| !c.trim().is_empty())
                        .unwrap_or("general");
                    let slug = self
                        .fields
                        .slug
                        .clone()
                        .unwrap_or_else(|| self.id.to_lowercase());
                    format!("{}/{}/{}", HELP_BASE_PATH, slugify(category), slug)
                }
            },
            ContentKind::Homepage => HOMEPAGE_IDENTIFIER.to_string(),
        }
    }

    /// Whether the entry already carries an explicit front-end URL. When it
    /// does not, a freshly computed identifier is written back after publish.
    pub fn has_frontend_url(&self) -> bool {
        self.fields
            .frontend_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }
}

/// Page record in the destination system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationPage {
    pub id: i64,
    pub identifier: String,
    pub title: String,
    pub content: String,
    pub active: bool,
}

/// Payload for a destination create or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDraft {
    pub identifier: String,
    pub title: String,
    pub content: String,
    pub meta_title: String,
    pub meta_description: String,
    pub meta_keywords: String,
    pub sort_order: String,
    pub active: bool,
    pub kind: ContentKind,
    pub creation_time: DateTime<Utc>,
}

impl PageDraft {
    /// Destination payload for an entry plus its rendered HTML fragment.
    pub fn for_entry(entry: &ContentEntry, html: &str) -> PageDraft {
        let identifier = entry.destination_identifier();
        let title = entry.title();
        match entry.kind {
            ContentKind::Article | ContentKind::Recipe => PageDraft {
                identifier,
                title: sanitize(title),
                content: html.to_string(),
                meta_title: sanitize(entry.fields.meta_title.as_deref().unwrap_or(title)),
                meta_description: sanitize(entry.fields.meta_description.as_deref().unwrap_or("")),
                meta_keywords: sanitize(entry.fields.meta_keywords.as_deref().unwrap_or("")),
                sort_order: "0".to_string(),
                active: true,
                kind: entry.kind,
                creation_time: entry.created_at,
            },
            ContentKind::Category => {
                let title = entry.fields.title.as_deref().unwrap_or("Untitled Category");
                PageDraft {
                    identifier,
                    title: format!("Garden Guide: {}", sanitize(last_path_segment(title))),
                    content: html.to_string(),
                    meta_title: sanitize(&format!("{title} - Articles")),
                    meta_description: sanitize(&format!(
                        "Browse all articles in the {title} category"
                    )),
                    meta_keywords: String::new(),
                    sort_order: "100".to_string(),
                    active: true,
                    kind: ContentKind::Category,
                    creation_time: entry.created_at,
                }
            }
            ContentKind::Faq => PageDraft {
                identifier,
                title: sanitize(&format!("FAQ: {title}")),
                content: html.to_string(),
                meta_title: sanitize(entry.fields.meta_title.as_deref().unwrap_or(title)),
                meta_description: sanitize(entry.fields.meta_description.as_deref().unwrap_or("")),
                meta_keywords: sanitize(&entry.fields.tags.join(", ")),
                sort_order: "200".to_string(),
                active: true,
                kind: ContentKind::Faq,
                creation_time: entry.created_at,
            },
            ContentKind::Homepage => Self::homepage(html),
        }
    }

    /// The homepage has no backing entry; its payload is fixed.
    pub fn homepage(html: &str) -> PageDraft {
        PageDraft {
            identifier: HOMEPAGE_IDENTIFIER.to_string(),
            title: "Garden Guide".to_string(),
            content: html.to_string(),
            meta_title: "Garden Guide - Gardening Tips, Plant Care & Growing Advice".to_string(),
            meta_description: "Dig in to find garden inspiration and advice. Get help with \
                               planting, growing, and caring for your garden."
                .to_string(),
            meta_keywords: "garden guide, gardening tips, plant care, growing advice".to_string(),
            sort_order: "0".to_string(),
            active: true,
            kind: ContentKind::Homepage,
            creation_time: Utc::now(),
        }
    }
}

/// Field patch written back to the source system after a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldPatch {
    pub destination_page_id: Option<String>,
    pub frontend_url: Option<String>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.destination_page_id.is_none() && self.frontend_url.is_none()
    }
}

/// Transient aggregation output, computed per request and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationResult {
    pub items: Vec<ContentEntry>,
    pub total: usize,
}

impl AggregationResult {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// URL-safe slug: lowercased, whitespace runs become single hyphens, path
/// separators survive as separators, everything else is stripped.
pub fn slugify(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut cleaned = String::with_capacity(lowered.len());

    // Whitespace adjacent to a separator disappears; elsewhere a run of
    // whitespace becomes a single hyphen.
    let mut pending_space = false;
    for ch in lowered.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if ch == '/' {
            pending_space = false;
            if !cleaned.ends_with('/') {
                cleaned.push('/');
            }
            continue;
        }
        if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '-') {
            continue;
        }
        if pending_space {
            pending_space = false;
            if !cleaned.is_empty() && !cleaned.ends_with('/') && !cleaned.ends_with('-') {
                cleaned.push('-');
            }
        }
        if ch == '-' && (cleaned.ends_with('-') || cleaned.ends_with('/') || cleaned.is_empty()) {
            continue;
        }
        cleaned.push(ch);
    }

    cleaned
        .trim_matches(|c| c == '-' || c == '/')
        .to_string()
}

/// Path form of a hierarchical category title: each `/`-separated segment is
/// lowercased and its inner whitespace hyphenated.
pub fn category_path(title: &str) -> String {
    title
        .to_lowercase()
        .split('/')
        .map(|part| part.trim().split_whitespace().collect::<Vec<_>>().join("-"))
        .collect::<Vec<_>>()
        .join("/")
}

/// Last segment of a hierarchical title, e.g. `"Vegetables/Tomatoes"` yields
/// `"Tomatoes"`.
pub fn last_path_segment(title: &str) -> &str {
    title.rsplit('/').next().unwrap_or(title).trim()
}

/// Normalize an explicit front-end URL override before using it as a page
/// identifier: identifiers never start with a slash, and the misspelled
/// legacy prefix still present on older entries is corrected.
pub fn normalize_frontend_url(url: &str) -> String {
    let trimmed = url.trim().trim_start_matches('/');
    trimmed.replace("garden-gudie/", "garden-guide/")
}

/// Strip markup-significant characters from titles and meta text and cap the
/// length the destination accepts.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '<' | '>' | '/' | '\\'))
        .take(255)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(kind: ContentKind) -> ContentEntry {
        ContentEntry {
            id: "ENTRY1".to_string(),
            kind,
            created_at: Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).single().unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).single().unwrap(),
            fields: EntryFields::default(),
            metadata: EntryMetadata::default(),
        }
    }

    #[test]
    fn slugify_hyphenates_and_strips() {
        assert_eq!(slugify("How to Grow Kale"), "how-to-grow-kale");
        assert_eq!(slugify("  Beans & Peas!  "), "beans-peas");
        assert_eq!(slugify("Vegetables / Tomatoes"), "vegetables/tomatoes");
        assert_eq!(slugify("a   b---c"), "a-b-c");
        assert_eq!(slugify("//edging//"), "edging");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn category_path_preserves_hierarchy() {
        assert_eq!(category_path("Vegetables/Tomatoes"), "vegetables/tomatoes");
        assert_eq!(
            category_path("Garden Care / Pest Control"),
            "garden-care/pest-control"
        );
        assert_eq!(last_path_segment("Vegetables/Tomatoes"), "Tomatoes");
        assert_eq!(last_path_segment("Roses"), "Roses");
    }

    #[test]
    fn frontend_url_normalization_strips_slashes_and_fixes_misspelling() {
        assert_eq!(
            normalize_frontend_url("/garden-guide/vegetables/kale"),
            "garden-guide/vegetables/kale"
        );
        assert_eq!(
            normalize_frontend_url("garden-gudie/vegetables/kale"),
            "garden-guide/vegetables/kale"
        );
        assert_eq!(normalize_frontend_url("help/general/faq-1"), "help/general/faq-1");
    }

    #[test]
    fn sanitize_strips_markup_characters_and_truncates() {
        assert_eq!(sanitize("A <b>bold</b> title"), "A bboldb title");
        let long = "x".repeat(400);
        assert_eq!(sanitize(&long).len(), 255);
    }

    #[test]
    fn archived_detection_is_case_insensitive_and_defaults_false() {
        let mut e = entry(ContentKind::Article);
        assert!(!e.is_archived());
        e.metadata.tags = vec!["seasonal".to_string(), "ARCHIVED".to_string()];
        assert!(e.is_archived());
    }

    #[test]
    fn effective_date_prefers_published_at() {
        let mut e = entry(ContentKind::Article);
        assert_eq!(e.effective_date(), e.created_at);
        let published = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().unwrap();
        e.fields.published_at = Some(published);
        assert_eq!(e.effective_date(), published);
    }

    #[test]
    fn article_identifier_uses_category_and_slug_chain() {
        let mut e = entry(ContentKind::Article);
        e.fields.title = Some("How to Grow Kale".to_string());
        e.fields.main_category = Some(CategoryLink::with_title("CAT1", "Vegetables"));
        e.fields.slug = Some("how-to-grow-kale".to_string());
        assert_eq!(
            e.destination_identifier(),
            "garden-guide/vegetables/how-to-grow-kale"
        );

        e.fields.new_slug = Some("grow-kale".to_string());
        assert_eq!(e.destination_identifier(), "garden-guide/vegetables/grow-kale");

        e.fields.main_category = None;
        e.fields.new_slug = None;
        e.fields.slug = None;
        assert_eq!(e.destination_identifier(), "garden-guide/uncategorized/entry1");
    }

    #[test]
    fn article_identifier_override_wins_after_normalization() {
        let mut e = entry(ContentKind::Article);
        e.fields.main_category = Some(CategoryLink::with_title("CAT1", "Vegetables"));
        e.fields.slug = Some("kale".to_string());
        e.fields.frontend_url = Some("/garden-gudie/greens/kale".to_string());
        assert_eq!(e.destination_identifier(), "garden-guide/greens/kale");
    }

    #[test]
    fn recipe_identifier_lands_under_recipes_base() {
        let mut e = entry(ContentKind::Recipe);
        e.fields.slug = Some("tomato-soup".to_string());
        assert_eq!(
            e.destination_identifier(),
            "garden-guide/harvest-recipes/tomato-soup"
        );
    }

    #[test]
    fn category_identifier_follows_hierarchical_title() {
        let mut e = entry(ContentKind::Category);
        e.fields.title = Some("Vegetables/Tomatoes".to_string());
        assert_eq!(e.destination_identifier(), "garden-guide/vegetables/tomatoes");
    }

    #[test]
    fn faq_identifier_uses_help_base_and_general_fallback() {
        let mut e = entry(ContentKind::Faq);
        e.fields.slug = Some("seed-depth".to_string());
        assert_eq!(e.destination_identifier(), "help/general/seed-depth");

        e.fields.faq_category = Some("Planting Basics".to_string());
        assert_eq!(e.destination_identifier(), "help/planting-basics/seed-depth");
    }

    #[test]
    fn homepage_identifier_is_fixed() {
        assert_eq!(entry(ContentKind::Homepage).destination_identifier(), HOMEPAGE_IDENTIFIER);
    }

    #[test]
    fn page_draft_maps_kind_specific_metadata() {
        let mut article = entry(ContentKind::Article);
        article.fields.title = Some("How to Grow Kale".to_string());
        article.fields.slug = Some("how-to-grow-kale".to_string());
        article.fields.main_category = Some(CategoryLink::with_title("CAT1", "Vegetables"));
        let draft = PageDraft::for_entry(&article, "<p>kale</p>");
        assert_eq!(draft.title, "How to Grow Kale");
        assert_eq!(draft.sort_order, "0");
        assert_eq!(draft.meta_title, "How to Grow Kale");
        assert!(draft.active);

        let mut category = entry(ContentKind::Category);
        category.fields.title = Some("Vegetables/Tomatoes".to_string());
        let draft = PageDraft::for_entry(&category, "<p>list</p>");
        assert_eq!(draft.title, "Garden Guide: Tomatoes");
        assert_eq!(draft.sort_order, "100");
        assert_eq!(draft.meta_title, "VegetablesTomatoes - Articles");

        let mut faq = entry(ContentKind::Faq);
        faq.fields.title = Some("How deep to plant?".to_string());
        faq.fields.tags = vec!["planting".to_string(), "seeds".to_string()];
        let draft = PageDraft::for_entry(&faq, "<p>faq</p>");
        assert_eq!(draft.title, "FAQ: How deep to plant?");
        assert_eq!(draft.sort_order, "200");
        assert_eq!(draft.meta_keywords, "planting, seeds");
    }
}
