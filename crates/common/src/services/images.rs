//! Product image location
//!
//! Finds a picture for a product before it is described. Sources are tried
//! in order: a saved lookup file, then an image search endpoint. When none
//! yields a usable URL a themed placeholder is generated instead, so
//! location itself never fails.

use crate::config::ImagesConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"];
const PLACEHOLDER_BASE: &str = "https://via.placeholder.com/400x300";
const PLACEHOLDER_SOURCE: &str = "smart_placeholder";

/// Located image for one product
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductImage {
    #[serde(alias = "product_name")]
    pub name: String,
    pub image_url: String,
    /// Where the URL came from (`lookup`, `image_search`, `smart_placeholder`)
    pub source: String,
    #[serde(default)]
    pub alt_text: String,
}

impl ProductImage {
    /// Themed placeholder for a product with no known photo
    pub fn placeholder(product_name: &str) -> Self {
        Self {
            name: product_name.to_string(),
            image_url: smart_placeholder(product_name),
            source: PLACEHOLDER_SOURCE.to_string(),
            alt_text: format!("Image of {}", product_name),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.source.contains("placeholder")
    }
}

/// Somewhere an image URL can be found
#[async_trait]
pub trait ImageSource: Send + Sync {
    fn name(&self) -> &str;

    async fn find(&self, product_name: &str) -> Result<Option<String>>;
}

/// Images located earlier and saved as JSON
pub struct StaticImageSource {
    images: HashMap<String, String>,
}

impl StaticImageSource {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Configuration {
            message: format!("cannot read image lookup {}: {}", path.display(), e),
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<ProductImage> = serde_json::from_str(raw)?;
        let images = entries
            .into_iter()
            .filter(|image| !image.is_placeholder())
            .map(|image| (image.name.to_lowercase(), image.image_url))
            .collect();
        Ok(Self { images })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[async_trait]
impl ImageSource for StaticImageSource {
    fn name(&self) -> &str {
        "lookup"
    }

    async fn find(&self, product_name: &str) -> Result<Option<String>> {
        Ok(self.images.get(&product_name.to_lowercase()).cloned())
    }
}

/// Image search service answering `GET ?q=` with `{"results": [{"image": url}]}`
pub struct HttpImageSearch {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    image: Option<String>,
}

impl HttpImageSearch {
    pub fn new(endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl ImageSource for HttpImageSearch {
    fn name(&self) -> &str {
        "image_search"
    }

    async fn find(&self, product_name: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", format!("{} product", product_name))])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::execution(
                "image_search",
                format!("search returned {}", response.status()),
            ));
        }

        let body: SearchResponse = response.json().await?;
        Ok(body
            .results
            .into_iter()
            .filter_map(|r| r.image)
            .find(|url| url.starts_with("http")))
    }
}

/// Tries each source in order and falls back to a placeholder
pub struct ProductImageLocator {
    sources: Vec<Arc<dyn ImageSource>>,
    client: reqwest::Client,
    validate: bool,
    prefixes: Regex,
    suffixes: Regex,
}

impl ProductImageLocator {
    pub fn new(sources: Vec<Arc<dyn ImageSource>>, client: reqwest::Client, validate: bool) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::Internal {
                message: format!("invalid product name pattern: {}", e),
            })
        };
        Ok(Self {
            sources,
            client,
            validate,
            prefixes: compile(r"(?i)^(set of \d+|large|medium|small)\s+")?,
            suffixes: compile(r"(?i)\s+(design|style|holder|metal|sign)$")?,
        })
    }

    pub fn from_config(config: &ImagesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let mut sources: Vec<Arc<dyn ImageSource>> = Vec::new();
        if let Some(path) = &config.lookup_path {
            let lookup = StaticImageSource::from_file(path)?;
            tracing::debug!(path = %path, images = lookup.len(), "Loaded image lookup");
            sources.push(Arc::new(lookup));
        }
        if let Some(endpoint) = &config.search_endpoint {
            sources.push(Arc::new(HttpImageSearch::new(endpoint, client.clone())));
        }

        Self::new(sources, client, config.validate)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Best image for a product; a placeholder when no source has one
    pub async fn locate(&self, product_name: &str) -> ProductImage {
        let cleaned = self.clean_product_name(product_name);
        let mut queries = vec![cleaned.as_str()];
        if !cleaned.eq_ignore_ascii_case(product_name.trim()) {
            queries.push(product_name.trim());
        }

        for source in &self.sources {
            for query in &queries {
                match source.find(query).await {
                    Ok(Some(url)) if self.is_image(&url).await => {
                        tracing::debug!(source = source.name(), product = product_name, "Image located");
                        return ProductImage {
                            name: product_name.to_string(),
                            image_url: url,
                            source: source.name().to_string(),
                            alt_text: format!("Image of {}", product_name),
                        };
                    }
                    Ok(Some(url)) => {
                        tracing::debug!(source = source.name(), url = %url, "Candidate image failed validation");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(source = source.name(), error = %e, "Image source failed");
                    }
                }
            }
        }

        tracing::debug!(product = product_name, "Using themed placeholder");
        ProductImage::placeholder(product_name)
    }

    /// Drop pack-size prefixes and generic suffixes that confuse searches
    pub fn clean_product_name(&self, name: &str) -> String {
        let trimmed = name.trim();
        let without_prefix = self.prefixes.replace(trimmed, "");
        self.suffixes.replace(&without_prefix, "").trim().to_string()
    }

    async fn is_image(&self, url: &str) -> bool {
        let by_extension = has_image_extension(url);
        if !self.validate {
            return by_extension;
        }

        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_lowercase();
                content_type.contains("image") || by_extension
            }
            _ => false,
        }
    }
}

fn has_image_extension(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Colour theme for a product, matched on keywords in its name
fn theme(product_name: &str) -> (&'static str, &'static str) {
    const THEMES: &[(&str, &[&str], &str, &str)] = &[
        ("kitchen", &["mug", "tea", "coffee", "sugar", "dispenser", "jar", "cake", "tin"], "2C3E50", "ECF0F1"),
        ("storage", &["box", "crate", "tin", "holder", "container"], "3498DB", "FFFFFF"),
        ("christmas", &["star", "stocking", "xmas"], "C0392B", "FFFFFF"),
        ("toy", &["dolly", "spaceboy", "bubbles", "children"], "F39C12", "FFFFFF"),
        ("bottle", &["water", "hot"], "8E44AD", "FFFFFF"),
        ("home", &["door", "wall", "clock", "sign", "hanger"], "27AE60", "FFFFFF"),
        ("metal", &["sign", "zinc", "wire"], "7F8C8D", "FFFFFF"),
    ];

    let lower = product_name.to_lowercase();
    THEMES
        .iter()
        .find(|(category, keywords, _, _)| {
            lower.contains(category) || keywords.iter().any(|k| lower.contains(k))
        })
        .map(|(_, _, bg, fg)| (*bg, *fg))
        .unwrap_or(("27AE60", "FFFFFF"))
}

/// Placeholder URL coloured by product theme and labelled with its name
pub fn smart_placeholder(product_name: &str) -> String {
    let label: String = product_name
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(25)
        .collect();
    let (bg, fg) = theme(product_name);
    let base = format!("{}/{}/{}", PLACEHOLDER_BASE, bg, fg);

    match reqwest::Url::parse_with_params(&base, &[("text", label.as_str())]) {
        Ok(url) => url.to_string(),
        Err(_) => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Option<&'static str>);

    #[async_trait]
    impl ImageSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn find(&self, _product_name: &str) -> Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    fn locator(sources: Vec<Arc<dyn ImageSource>>) -> ProductImageLocator {
        ProductImageLocator::new(sources, reqwest::Client::new(), false).unwrap()
    }

    #[test]
    fn test_clean_product_name() {
        let locator = locator(vec![]);
        assert_eq!(
            locator.clean_product_name("Set Of 3 Cake Tins Pantry Design"),
            "Cake Tins Pantry"
        );
        assert_eq!(
            locator.clean_product_name("WHITE HANGING HEART T-LIGHT HOLDER"),
            "WHITE HANGING HEART T-LIGHT"
        );
    }

    #[test]
    fn test_placeholder_is_themed() {
        let image = ProductImage::placeholder("Set Of 3 Cake Tins Pantry Design");
        assert!(image.is_placeholder());
        assert!(image.image_url.contains("/2C3E50/ECF0F1"));
        assert!(image.image_url.contains("text=Set+Of+3+Cake+Tins"));
    }

    #[tokio::test]
    async fn test_locate_prefers_first_valid_source() {
        let locator = locator(vec![
            Arc::new(FixedSource(Some("https://cdn.example.com/page.html"))),
            Arc::new(FixedSource(Some("https://cdn.example.com/tins.jpg"))),
        ]);
        let image = locator.locate("Set Of 3 Cake Tins Pantry Design").await;
        assert_eq!(image.image_url, "https://cdn.example.com/tins.jpg");
        assert!(!image.is_placeholder());
    }

    #[tokio::test]
    async fn test_locate_falls_back_to_placeholder() {
        let image = locator(vec![Arc::new(FixedSource(None))])
            .locate("Jumbo Bag Red Retrospot")
            .await;
        assert_eq!(image.source, "smart_placeholder");
    }

    #[tokio::test]
    async fn test_static_lookup_skips_placeholders() {
        let source = StaticImageSource::from_json(
            r#"[
                {"product_name": "Cake Tins Pantry", "image_url": "https://cdn.example.com/a.png", "source": "bing_images"},
                {"product_name": "Jumbo Bag", "image_url": "https://via.placeholder.com/x", "source": "smart_placeholder"}
            ]"#,
        )
        .unwrap();
        assert_eq!(source.len(), 1);
        assert_eq!(
            source.find("cake tins pantry").await.unwrap().as_deref(),
            Some("https://cdn.example.com/a.png")
        );
    }
}
