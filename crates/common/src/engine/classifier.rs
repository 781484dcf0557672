//! Intent Classifier - maps a question onto exactly one archetype
//!
//! Provides:
//! - Cue extraction (ids, quoted names, rankings, cluster mentions)
//! - Candidate archetypes with filled and missing slots
//! - Deterministic tie-break between eligible candidates
//! - Reasoning-service fallback with the same slot validation

use crate::catalog::SchemaCatalog;
use crate::errors::{AppError, Result};
use crate::services::PromptContext;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::intent::{
    missing_slots, slots, Archetype, EntityReference, Intent, SlotValue, SortSpec, COUNT_COLUMN,
};
use super::query_plan::ColumnRef;

/// Sort requested by the question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortCue {
    pub table: String,
    pub column: String,
    #[serde(default = "default_descending")]
    pub descending: bool,
}

fn default_descending() -> bool {
    true
}

/// Everything recognised in a question, before choosing an archetype
///
/// The reasoning fallback returns the same shape as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Cues {
    pub product_name: Option<String>,
    pub product_code: Option<String>,
    pub customer_id: Option<i64>,
    pub invoice_no: Option<String>,
    pub cluster_id: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<SortCue>,
    pub group_by: Option<ColumnRef>,
    pub attribute: Option<String>,
    pub want_image: bool,
    pub want_reviews: bool,
    /// Mentions clusters or segments at all
    pub mentions_model: bool,
    /// Asks which cluster something belongs to
    pub asks_cluster: bool,
    /// Uses ranking language (top, most, cheapest)
    pub ranking: bool,
}

/// Archetype with the slots the cues could fill
#[derive(Debug, Clone)]
pub struct Candidate {
    pub archetype: Archetype,
    pub slots: BTreeMap<String, SlotValue>,
    pub missing: Vec<&'static str>,
    /// Entity references that still need a resolution step
    pub unresolved: usize,
}

impl Candidate {
    pub fn is_eligible(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Reasoning-service reply for the fallback path
#[derive(Debug, Deserialize)]
struct FallbackReply {
    archetype: Option<Archetype>,
    #[serde(flatten)]
    cues: Cues,
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Ask the reasoning service when no archetype fits
    pub use_reasoning_fallback: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            use_reasoning_fallback: true,
        }
    }
}

struct Patterns {
    quoted: Regex,
    upper_name: Regex,
    product_code: Regex,
    customer: Regex,
    invoice: Regex,
    cluster: Regex,
    top_n: Regex,
    n_ranked: Regex,
    ranking: Regex,
    asks_cluster: Regex,
    model_words: Regex,
    image: Regex,
    reviews: Regex,
    price_desc: Regex,
    price_asc: Regex,
    best_selling: Regex,
    largest_quantity: Regex,
    countries: Regex,
    products: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        let re = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::Internal {
                message: format!("invalid classifier pattern {}: {}", pattern, e),
            })
        };

        Ok(Self {
            quoted: re(r#"(?:^|[\s(:])['"“‘]([^'"“”‘’]+?)['"”’](?:$|[\s.,;:?!)])"#)?,
            upper_name: re(r"\b([A-Z0-9][A-Z0-9&'/-]*(?:\s+[A-Z0-9][A-Z0-9&'/-]*){2,})\b")?,
            product_code: re(r"(?i)\b(?:product|item|stock\s*code)\s+(?:code\s+)?#?(\d{4,6}[A-Za-z]{0,2})\b")?,
            customer: re(r"(?i)\bcustomer\s*(?:id\s*)?#?(\d{3,})")?,
            invoice: re(r"(?i)\binvoice\s*(?:no\.?|number)?\s*#?([A-Za-z]?\d{5,})")?,
            cluster: re(r"(?i)\b(?:cluster|segment)\s*(?:id\s*)?#?(\d+)")?,
            top_n: re(r"(?i)\b(?:top|first)\s+(\d+|[a-z]+)\b")?,
            n_ranked: re(r"(?i)\b(\d+|[a-z]+)\s+(?:most|least|best|cheapest|highest|lowest|priciest|biggest|largest)\b")?,
            ranking: re(r"(?i)\b(?:top|most|least|highest|lowest|cheapest|priciest|best[- ]selling|biggest|largest)\b")?,
            asks_cluster: re(r"(?i)\b(?:which|what)\s+(?:cluster|segment)\b|\bbelongs?\s+to\b")?,
            model_words: re(r"(?i)\b(?:cluster|segment)s?\b")?,
            image: re(r"(?i)\b(?:image|images|picture|pictures|photo|photos|look\s+like)\b")?,
            reviews: re(r"(?i)\b(?:reviews?|feedback|ratings?)\b")?,
            price_desc: re(r"(?i)\b(?:most\s+expensive|priciest|highest[- ]priced|highest\s+price)\b")?,
            price_asc: re(r"(?i)\b(?:cheapest|least\s+expensive|lowest[- ]priced|lowest\s+price)\b")?,
            best_selling: re(r"(?i)\b(?:best[- ]selling|most\s+popular|most\s+purchased|most\s+ordered|most\s+sold)\b")?,
            largest_quantity: re(r"(?i)\b(?:largest|biggest)\s+(?:orders?|quantit(?:y|ies))\b")?,
            countries: re(r"(?i)\bcountr(?:y|ies)\b")?,
            products: re(r"(?i)\b(?:products?|items?)\b")?,
        })
    }
}

/// Rule-based classifier with a reasoning fallback
pub struct IntentClassifier {
    config: ClassifierConfig,
    patterns: Patterns,
}

impl IntentClassifier {
    /// Create a new classifier
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        Ok(Self {
            config,
            patterns: Patterns::compile()?,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a question into exactly one intent
    pub fn classify(&self, nl_text: &str, catalog: &SchemaCatalog) -> Result<Intent> {
        let text = nl_text.trim();
        if text.is_empty() {
            return Err(AppError::IntentUnresolved {
                reason: "the question is empty".to_string(),
            });
        }

        let cues = self.extract_cues(text);
        let candidates = self.candidates(&cues, catalog);
        select(text, candidates)
    }

    /// Recognise ids, names and ranking language in the question
    pub fn extract_cues(&self, text: &str) -> Cues {
        let p = &self.patterns;
        let capture = |re: &Regex| {
            re.captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        };

        let mut cues = Cues {
            product_name: capture(&p.quoted).or_else(|| capture(&p.upper_name)),
            product_code: capture(&p.product_code).map(|code| code.to_uppercase()),
            customer_id: capture(&p.customer).and_then(|id| id.parse().ok()),
            invoice_no: capture(&p.invoice).map(|no| no.to_uppercase()),
            cluster_id: capture(&p.cluster).and_then(|id| id.parse().ok()),
            limit: capture(&p.top_n)
                .or_else(|| capture(&p.n_ranked))
                .and_then(|n| parse_count(&n)),
            want_image: p.image.is_match(text),
            want_reviews: p.reviews.is_match(text),
            mentions_model: p.model_words.is_match(text),
            asks_cluster: p.asks_cluster.is_match(text),
            ranking: p.ranking.is_match(text),
            ..Cues::default()
        };

        if p.price_desc.is_match(text) {
            cues.sort = Some(sort_cue("products", "unit_price", true));
        } else if p.price_asc.is_match(text) {
            cues.sort = Some(sort_cue("products", "unit_price", false));
        } else if p.largest_quantity.is_match(text) {
            cues.sort = Some(sort_cue("transactions", "quantity", true));
        }

        if p.best_selling.is_match(text) {
            cues.group_by = Some(ColumnRef::new("transactions", "stock_code"));
        } else if p.countries.is_match(text) {
            cues.group_by = Some(ColumnRef::new("customers", "country"));
        } else if cues.cluster_id.is_some() && p.products.is_match(text) {
            cues.group_by = Some(ColumnRef::new("transactions", "stock_code"));
        }

        let lower = text.to_lowercase();
        if lower.contains("price") || lower.contains("cost") {
            cues.attribute = Some("unit_price".to_string());
        } else if lower.contains("country") || lower.contains("where") {
            cues.attribute = Some("country".to_string());
        } else if lower.contains("name") || lower.contains("description") {
            cues.attribute = Some("description".to_string());
        }

        cues
    }

    /// Build one candidate per archetype whose cue words appear
    pub fn candidates(&self, cues: &Cues, catalog: &SchemaCatalog) -> Vec<Candidate> {
        Archetype::ALL
            .iter()
            .filter_map(|&archetype| build_candidate(archetype, cues, catalog))
            .collect()
    }

    /// Prompt for the reasoning fallback
    pub fn fallback_prompt(&self, nl_text: &str, catalog: &SchemaCatalog) -> PromptContext {
        let mut schema = String::new();
        for table in catalog.tables() {
            let columns: Vec<&str> = table.column_names().collect();
            schema.push_str(&format!("- {}({})\n", table.name, columns.join(", ")));
        }
        let model = catalog.model();
        let clusters: Vec<String> = model.label_domain.iter().map(u32::to_string).collect();

        let system = "You classify retail analytics questions. Reply with one JSON object and nothing else.".to_string();
        let user = format!(
            "Archetypes: lookup_by_attribute, aggregate_top_n, model_predict_lookup, \
            cross_filter_by_model_output, multimodal_entity_report.\n\
            Tables:\n{}\
            Model '{}' assigns {}.{} to clusters {}.\n\n\
            Return {{\"archetype\": ..., \"product_name\", \"product_code\", \"customer_id\", \
            \"invoice_no\", \"cluster_id\", \"limit\", \
            \"sort\": {{\"table\", \"column\", \"descending\"}}, \"group_by\": {{\"table\", \"column\"}}, \
            \"attribute\", \"want_image\", \"want_reviews\", \"asks_cluster\"}}. \
            Omit fields the question does not state.\n\n\
            Question: {}",
            schema,
            model.model_id,
            model.entity_table,
            model.entity_key,
            clusters.join(", "),
            nl_text
        );

        PromptContext::new(system, user)
    }

    /// Turn a fallback reply into an intent, applying the same slot rules
    pub fn interpret_fallback(
        &self,
        nl_text: &str,
        reply: &str,
        catalog: &SchemaCatalog,
    ) -> Result<Intent> {
        let json = extract_json_object(reply).ok_or_else(|| AppError::IntentUnresolved {
            reason: "reasoning service returned no JSON object".to_string(),
        })?;
        let parsed: FallbackReply =
            serde_json::from_str(json).map_err(|e| AppError::IntentUnresolved {
                reason: format!("reasoning service reply was not understood: {}", e),
            })?;

        let mut cues = parsed.cues;
        match parsed.archetype {
            Some(Archetype::ModelPredictLookup) | Some(Archetype::CrossFilterByModelOutput) => {
                cues.mentions_model = true;
            }
            Some(Archetype::AggregateTopN) => cues.ranking = true,
            _ => {}
        }

        let candidates = match parsed.archetype {
            Some(archetype) => build_candidate(archetype, &cues, catalog).into_iter().collect(),
            None => self.candidates(&cues, catalog),
        };
        select(nl_text.trim(), candidates)
    }
}

/// Pick the eligible candidate with the fewest unresolved references
fn select(text: &str, candidates: Vec<Candidate>) -> Result<Intent> {
    let best = candidates
        .iter()
        .filter(|c| c.is_eligible())
        .min_by_key(|c| (c.unresolved, c.archetype.tie_break_rank()));

    match best {
        Some(candidate) => Intent::new(candidate.archetype, candidate.slots.clone(), text),
        None => {
            let reason = candidates
                .iter()
                .min_by_key(|c| (c.missing.len(), c.archetype.tie_break_rank()))
                .map(|c| format!("closest match {} is missing {}", c.archetype, c.missing.join(", ")))
                .unwrap_or_else(|| "no supported question shape matched".to_string());
            Err(AppError::IntentUnresolved { reason })
        }
    }
}

fn build_candidate(archetype: Archetype, cues: &Cues, catalog: &SchemaCatalog) -> Option<Candidate> {
    let mut filled: BTreeMap<String, SlotValue> = BTreeMap::new();
    let mut unresolved = 0;
    let mut put = |name: &str, value: SlotValue| {
        filled.insert(name.to_string(), value);
    };

    match archetype {
        Archetype::LookupByAttribute => {
            let (table, column, value) = if let Some(invoice) = &cues.invoice_no {
                ("transactions".to_string(), "invoice_no".to_string(), SlotValue::Text(invoice.clone()))
            } else if let Some(code) = &cues.product_code {
                ("products".to_string(), "stock_code".to_string(), SlotValue::Text(code.clone()))
            } else if let Some(id) = cues.customer_id {
                ("customers".to_string(), "customer_id".to_string(), SlotValue::Integer(id))
            } else if let Some(name) = &cues.product_name {
                // Name lookups match the display column and count as unresolved
                unresolved += 1;
                let display = catalog.table("products")?.display_column.clone()?;
                ("products".to_string(), display, SlotValue::Text(name.clone()))
            } else {
                return None;
            };
            catalog.column(&table, &column)?;

            if let Some(attribute) = &cues.attribute {
                if catalog.column(&table, attribute).is_some() {
                    put(slots::ATTRIBUTE, SlotValue::Text(attribute.clone()));
                }
            }
            if cues.want_image {
                put(slots::WANT_IMAGE, SlotValue::Flag(true));
            }
            if cues.want_reviews {
                put(slots::WANT_REVIEWS, SlotValue::Flag(true));
            }
            put(slots::TABLE, SlotValue::Text(table));
            put(slots::KEY_COLUMN, SlotValue::Text(column));
            put(slots::KEY_VALUE, value);
        }

        Archetype::AggregateTopN => {
            if !cues.ranking {
                return None;
            }
            if let Some(group) = &cues.group_by {
                catalog.column(&group.table, &group.column)?;
                let descending = cues.sort.as_ref().map_or(true, |s| s.descending);
                put(slots::TABLE, SlotValue::Text(group.table.clone()));
                put(slots::GROUP_BY, SlotValue::Text(group.column.clone()));
                put(
                    slots::SORT_KEY,
                    SlotValue::Sort(SortSpec {
                        column: COUNT_COLUMN.to_string(),
                        descending,
                    }),
                );
            } else if let Some(sort) = &cues.sort {
                catalog.column(&sort.table, &sort.column)?;
                put(slots::TABLE, SlotValue::Text(sort.table.clone()));
                put(
                    slots::SORT_KEY,
                    SlotValue::Sort(SortSpec {
                        column: sort.column.clone(),
                        descending: sort.descending,
                    }),
                );
            }
            if let Some(limit) = cues.limit {
                put(slots::LIMIT, SlotValue::Integer(limit));
            }
        }

        Archetype::ModelPredictLookup => {
            if !cues.mentions_model {
                return None;
            }
            let model = catalog.model();
            if let Some(id) = cues.customer_id {
                put(slots::ENTITY, SlotValue::Entity(EntityReference::numeric(&model.entity_table, id)));
            }
            if let Some(cluster) = cues.cluster_id {
                put(slots::CLUSTER_ID, SlotValue::Integer(cluster));
            }
            if cues.asks_cluster {
                put(slots::PRIMARY, SlotValue::Text(slots::ENTITY.to_string()));
            }
        }

        Archetype::CrossFilterByModelOutput => {
            if !cues.mentions_model {
                return None;
            }
            if let Some(cluster) = cues.cluster_id {
                put(slots::CLUSTER_ID, SlotValue::Integer(cluster));
            }
            if let Some(group) = &cues.group_by {
                catalog.column(&group.table, &group.column)?;
                put(slots::TABLE, SlotValue::Text(group.table.clone()));
                put(slots::GROUP_BY, SlotValue::Text(group.column.clone()));
            }
            if let Some(limit) = cues.limit {
                put(slots::LIMIT, SlotValue::Integer(limit));
            }
        }

        Archetype::MultimodalEntityReport => {
            if !(cues.want_image || cues.want_reviews) {
                return None;
            }
            if let Some(code) = &cues.product_code {
                put(slots::ENTITY, SlotValue::Entity(EntityReference::canonical("products", code)));
            } else if let Some(name) = &cues.product_name {
                unresolved += 1;
                put(slots::ENTITY, SlotValue::Entity(EntityReference::text("products", name)));
            }
            put(slots::WANT_IMAGE, SlotValue::Flag(cues.want_image));
            put(slots::WANT_REVIEWS, SlotValue::Flag(cues.want_reviews));
        }
    }

    let missing = missing_slots(archetype, &filled);
    Some(Candidate {
        archetype,
        slots: filled,
        missing,
        unresolved,
    })
}

fn sort_cue(table: &str, column: &str, descending: bool) -> SortCue {
    SortCue {
        table: table.to_string(),
        column: column.to_string(),
        descending,
    }
}

/// Parse "3" or "three"
fn parse_count(word: &str) -> Option<i64> {
    if let Ok(n) = word.parse::<i64>() {
        return Some(n);
    }
    const WORDS: [&str; 20] = [
        "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
        "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen",
        "eighteen", "nineteen", "twenty",
    ];
    let word = word.to_lowercase();
    WORDS
        .iter()
        .position(|w| *w == word)
        .map(|i| i as i64 + 1)
}

/// First `{...}` block of a reply that may be wrapped in prose or fences
fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(ClassifierConfig::default()).unwrap()
    }

    #[test]
    fn test_most_expensive_products() {
        let intent = classifier()
            .classify("Show me the 10 most expensive products in the store.", &SchemaCatalog::retail())
            .unwrap();

        assert_eq!(intent.archetype, Archetype::AggregateTopN);
        assert_eq!(intent.text(slots::TABLE), Some("products"));
        assert_eq!(intent.integer(slots::LIMIT), Some(10));
        let sort = intent.slot(slots::SORT_KEY).and_then(SlotValue::as_sort).unwrap();
        assert_eq!(sort.column, "unit_price");
        assert!(sort.descending);
    }

    #[test]
    fn test_customer_cluster_lookup() {
        let intent = classifier()
            .classify("Which cluster does customer 17490 belong to?", &SchemaCatalog::retail())
            .unwrap();

        assert_eq!(intent.archetype, Archetype::ModelPredictLookup);
        assert_eq!(intent.entity().unwrap().resolved_id(), Some("17490"));
        assert_eq!(intent.text(slots::PRIMARY), Some("entity"));
    }

    #[test]
    fn test_top_countries_in_cluster() {
        let intent = classifier()
            .classify(
                "What are the top 3 countries for customers who are in cluster 5?",
                &SchemaCatalog::retail(),
            )
            .unwrap();

        assert_eq!(intent.archetype, Archetype::CrossFilterByModelOutput);
        assert_eq!(intent.integer(slots::CLUSTER_ID), Some(5));
        assert_eq!(intent.integer(slots::LIMIT), Some(3));
        assert_eq!(intent.text(slots::GROUP_BY), Some("country"));
    }

    #[test]
    fn test_reviews_and_image_for_named_product() {
        let intent = classifier()
            .classify(
                "Show me the reviews and analyze the image for the 'SET OF 3 REGENCY CAKE TINS'.",
                &SchemaCatalog::retail(),
            )
            .unwrap();

        assert_eq!(intent.archetype, Archetype::MultimodalEntityReport);
        let entity = intent.entity().unwrap();
        assert!(entity.is_unresolved());
        assert_eq!(entity.display_name(), "SET OF 3 REGENCY CAKE TINS");
        assert_eq!(intent.flag(slots::WANT_IMAGE), Some(true));
        assert_eq!(intent.flag(slots::WANT_REVIEWS), Some(true));
    }

    #[test]
    fn test_multimodal_wins_exact_tie() {
        // Both lookup and multimodal fill every slot with no unresolved references
        let intent = classifier()
            .classify("Show me reviews for product 85123A", &SchemaCatalog::retail())
            .unwrap();
        assert_eq!(intent.archetype, Archetype::MultimodalEntityReport);
        assert_eq!(intent.entity().unwrap().resolved_id(), Some("85123A"));
    }

    #[test]
    fn test_attribute_lookup() {
        let intent = classifier()
            .classify("What is the price of product 85123A?", &SchemaCatalog::retail())
            .unwrap();
        assert_eq!(intent.archetype, Archetype::LookupByAttribute);
        assert_eq!(intent.text(slots::KEY_COLUMN), Some("stock_code"));
        assert_eq!(intent.text(slots::ATTRIBUTE), Some("unit_price"));
    }

    #[test]
    fn test_unmatched_question_is_unresolved() {
        let err = classifier()
            .classify("Tell me a joke about spreadsheets", &SchemaCatalog::retail())
            .unwrap_err();
        assert!(matches!(err, AppError::IntentUnresolved { .. }));
    }

    #[test]
    fn test_missing_slot_names_closest_match() {
        let err = classifier()
            .classify("Show me the top customers in cluster 2", &SchemaCatalog::retail())
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_word_limits() {
        let cues = classifier().extract_cues("top five best-selling products");
        assert_eq!(cues.limit, Some(5));
        assert_eq!(cues.group_by, Some(ColumnRef::new("transactions", "stock_code")));
    }

    #[test]
    fn test_apostrophe_is_not_a_quote() {
        let cues = classifier().extract_cues("What's the image for 'WHITE HANGING HEART'?");
        assert_eq!(cues.product_name.as_deref(), Some("WHITE HANGING HEART"));
    }

    #[test]
    fn test_fallback_reply_goes_through_slot_rules() {
        let c = classifier();
        let catalog = SchemaCatalog::retail();

        let reply = r#"Sure: {"archetype": "aggregate_top_n",
            "sort": {"table": "products", "column": "unit_price", "descending": false},
            "limit": 4}"#;
        let intent = c.interpret_fallback("cheap stuff please", reply, &catalog).unwrap();
        assert_eq!(intent.archetype, Archetype::AggregateTopN);
        assert_eq!(intent.integer(slots::LIMIT), Some(4));

        let incomplete = r#"{"archetype": "model_predict_lookup"}"#;
        let err = c.interpret_fallback("which segment?", incomplete, &catalog).unwrap_err();
        assert!(matches!(err, AppError::IntentUnresolved { .. }));

        let unknown_column = r#"{"archetype": "aggregate_top_n",
            "sort": {"table": "products", "column": "weight"}}"#;
        assert!(c.interpret_fallback("heaviest", unknown_column, &catalog).is_err());
    }
}
