//! Response Synthesizer - turns a result bundle into a cited answer
//!
//! Provides:
//! - Deterministic fact rendering with one citation per bundle entry
//! - Structured, then model, then descriptive ordering
//! - Partial-result notes naming the component that failed
//! - Optional narration by the reasoning service, accepted only when its
//!   citations all point at real entries

use crate::errors::{AppError, Result};
use crate::services::{cell_text, PromptContext, Row};
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bundle::{BundleEntry, Component, ComponentOutput, ResultBundle};
use super::intent::Archetype;
use super::state::TurnTrace;

/// Citation of one bundle entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Marker number used in the text (1-based)
    pub index: usize,

    /// Bundle entry the marker points at
    pub entry_id: usize,

    pub component: Component,
    pub label: String,
    pub entity_id: Option<String>,
}

/// Something the answer could not include
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissingPiece {
    pub component: Component,
    pub label: String,
    pub reason: String,
}

/// Final answer of a turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub turn_id: Uuid,
    pub question: String,
    pub archetype: Archetype,
    pub text: String,
    pub citations: Vec<Citation>,

    /// Some step failed and its data is absent
    pub partial: bool,
    pub missing: Vec<MissingPiece>,

    /// Text was phrased by the reasoning service
    pub narrated: bool,

    pub trace: TurnTrace,
    pub generated_at: DateTime<Utc>,
}

/// Synthesis options
#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    /// Reviews quoted per entity
    pub max_reviews: usize,

    /// Members listed for a cluster filter
    pub max_members: usize,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            max_reviews: 5,
            max_members: 10,
        }
    }
}

pub struct ResponseSynthesizer {
    options: SynthesisOptions,
    citation_pattern: Regex,
}

impl ResponseSynthesizer {
    pub fn new(options: SynthesisOptions) -> Result<Self> {
        let citation_pattern = Regex::new(r"\[(\d+)\]").map_err(|e| AppError::Internal {
            message: format!("invalid citation pattern: {}", e),
        })?;
        Ok(Self {
            options,
            citation_pattern,
        })
    }

    /// Render every bundle entry as a cited fact
    pub fn synthesize(
        &self,
        turn_id: Uuid,
        question: &str,
        archetype: Archetype,
        bundle: &ResultBundle,
    ) -> Answer {
        let mut ordered: Vec<&BundleEntry> = bundle.entries().iter().collect();
        ordered.sort_by_key(|e| (e.component.data_kind(), e.id));

        let mut paragraphs = Vec::with_capacity(ordered.len() + 1);
        let mut citations = Vec::with_capacity(ordered.len());
        for (position, entry) in ordered.into_iter().enumerate() {
            let index = position + 1;
            paragraphs.push(self.render(entry, index));
            citations.push(Citation {
                index,
                entry_id: entry.id,
                component: entry.component,
                label: entry.label.clone(),
                entity_id: entry.entity_id.clone(),
            });
        }

        if paragraphs.is_empty() {
            paragraphs.push("No data could be retrieved for this question.".to_string());
        }

        let missing: Vec<MissingPiece> = bundle
            .failures()
            .iter()
            .map(|f| MissingPiece {
                component: f.component,
                label: f.label.clone(),
                reason: f.message.clone(),
            })
            .collect();
        if let Some(note) = partial_note(&missing) {
            paragraphs.push(note);
        }

        Answer {
            turn_id,
            question: question.to_string(),
            archetype,
            text: paragraphs.join("\n\n"),
            citations,
            partial: !missing.is_empty(),
            missing,
            narrated: false,
            trace: TurnTrace::new(),
            generated_at: Utc::now(),
        }
    }

    /// Prompt asking the reasoning service to phrase a drafted answer
    pub fn narration_prompt(&self, answer: &Answer) -> PromptContext {
        PromptContext::new(
            "You are a retail analytics assistant. Rewrite the facts below into a short, \
            friendly answer. Use only these facts and add nothing. After every fact you use, \
            keep its citation marker exactly as written, e.g. [1].",
            format!("Question: {}\n\nFacts:\n{}\n\nAnswer:", answer.question, answer.text),
        )
    }

    /// Adopt narrated text when every marker cites a real entry
    pub fn accept_narration(&self, mut answer: Answer, narration: &str) -> Answer {
        let narration = narration.trim();
        let markers: Vec<usize> = self
            .citation_pattern
            .captures_iter(narration)
            .filter_map(|c| c.get(1)?.as_str().parse().ok())
            .collect();

        let valid = !markers.is_empty()
            && markers
                .iter()
                .all(|m| answer.citations.iter().any(|c| c.index == *m));
        if !valid {
            tracing::warn!(
                turn_id = %answer.turn_id,
                markers = markers.len(),
                "Discarding narration with missing or unknown citations"
            );
            return answer;
        }

        let mut text = narration.to_string();
        if let Some(note) = partial_note(&answer.missing) {
            text.push_str("\n\n");
            text.push_str(&note);
        }
        answer.text = text;
        answer.narrated = true;
        answer
    }

    /// Citation markers used in a text
    pub fn cited_indices(&self, text: &str) -> Vec<usize> {
        self.citation_pattern
            .captures_iter(text)
            .filter_map(|c| c.get(1)?.as_str().parse().ok())
            .collect()
    }

    fn render(&self, entry: &BundleEntry, index: usize) -> String {
        match &entry.output {
            ComponentOutput::Rows { columns, rows } => {
                if rows.is_empty() {
                    return format!("No rows matched {} [{}].", entry.label, index);
                }
                if entry.component == Component::EntityResolution || rows.len() == 1 {
                    return format!("{} [{}]: {}.", entry.label, index, render_row(columns, &rows[0]));
                }
                let lines: Vec<String> = rows
                    .iter()
                    .enumerate()
                    .map(|(i, row)| format!("{}. {}", i + 1, render_row(columns, row)))
                    .collect();
                format!("{} [{}]:\n{}", entry.label, index, lines.join("\n"))
            }

            ComponentOutput::Assignments {
                model_id,
                cluster_filter,
                predictions,
            } => match cluster_filter {
                None => {
                    let facts: Vec<String> = predictions
                        .iter()
                        .map(|(id, p)| {
                            let confidence = p
                                .confidence
                                .map(|c| format!(" (confidence {:.2})", c))
                                .unwrap_or_default();
                            format!("{} {} is in cluster {}{}", entry.label, id, p.cluster_id, confidence)
                        })
                        .collect();
                    format!("{} [{}].", facts.join("; "), index)
                }
                Some(cluster) => {
                    let mut members: Vec<&str> = predictions.keys().map(String::as_str).collect();
                    let total = members.len();
                    members.truncate(self.options.max_members);
                    let listed = if total > members.len() {
                        format!("{} and {} more", members.join(", "), total - members.len())
                    } else {
                        members.join(", ")
                    };
                    if total == 0 {
                        format!(
                            "Model {} assigns no {} to cluster {} [{}].",
                            model_id, entry.label, cluster, index
                        )
                    } else {
                        format!(
                            "Model {} assigns {} {} to cluster {} [{}]: {}.",
                            model_id, total, entry.label, cluster, index, listed
                        )
                    }
                }
            },

            ComponentOutput::Reviews { reviews } => {
                if reviews.is_empty() {
                    return format!("There are no reviews for {} [{}].", entry.label, index);
                }
                let mut lines: Vec<String> = reviews
                    .iter()
                    .take(self.options.max_reviews)
                    .map(|r| format!("- \"{}\"", r.trim()))
                    .collect();
                if reviews.len() > self.options.max_reviews {
                    lines.push(format!("({} more not shown)", reviews.len() - self.options.max_reviews));
                }
                format!(
                    "{} review(s) of {} [{}]:\n{}",
                    reviews.len(),
                    entry.label,
                    index,
                    lines.join("\n")
                )
            }

            ComponentOutput::ImageDescription { image, description } => {
                let source = if image.is_placeholder() {
                    format!("{}, no product photo found", image.source)
                } else {
                    image.source.clone()
                };
                format!(
                    "Image of {} [{}] (source: {}): {}",
                    entry.label,
                    index,
                    source,
                    description.trim()
                )
            }
        }
    }
}

fn render_row(columns: &[String], row: &Row) -> String {
    let keys: Vec<&String> = if columns.is_empty() {
        row.keys().collect()
    } else {
        columns.iter().collect()
    };
    keys.into_iter()
        .filter_map(|key| row.get(key).map(|v| format!("{}: {}", key, cell_text(v))))
        .collect::<Vec<_>>()
        .join(", ")
}

fn partial_note(missing: &[MissingPiece]) -> Option<String> {
    if missing.is_empty() {
        return None;
    }
    let parts: Vec<String> = missing
        .iter()
        .map(|m| format!("{} ({}): {}", m.component, m.label, m.reason))
        .collect();
    Some(format!("Partial answer. Could not retrieve {}.", parts.join("; ")))
}
