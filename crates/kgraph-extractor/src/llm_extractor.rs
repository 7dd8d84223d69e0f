//! LLM-backed extractor and schema advisor

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use kgraph_core::{ClassDefinition, KgError, LlmClient, PropertyValues, Result, System};
use regex::Regex;
use serde::Deserialize;

use crate::proposal::{ClassEnhancement, SchemaProposal};
use crate::{CandidateClass, CandidateEntity, CandidateRelationship, Extraction, Extractor, SchemaAdvisor};

const EXTRACT_PROMPT: &str = include_str!("prompts/extract.txt");
const ADVISE_PROMPT: &str = include_str!("prompts/advise.txt");
const CHECK_PROMPT: &str = include_str!("prompts/check.txt");

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)\s*```").ok())
        .as_ref()
}

/// Strip a surrounding markdown code fence, if any
pub fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    fence_pattern()
        .and_then(|re| re.captures(trimmed))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed)
}

fn render(template: &str, schema: &System, text: &str) -> Result<String> {
    let schema_json = serde_json::to_string_pretty(schema)
        .map_err(|e| KgError::Extraction(format!("Failed to serialize schema: {e}")))?;
    Ok(template.replace("{schema}", &schema_json).replace("{text}", text))
}

fn value_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

// ============================================================================
// Extractor
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<CandidateRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    classes: Vec<RawClass>,
}

#[derive(Debug, Deserialize)]
struct RawClass {
    #[serde(alias = "className", alias = "class")]
    class_name: String,
    #[serde(default)]
    properties: BTreeMap<String, serde_json::Value>,
}

impl From<RawEntity> for CandidateEntity {
    fn from(raw: RawEntity) -> Self {
        Self {
            name: raw.name.trim().to_string(),
            description: raw.description.unwrap_or_default(),
            classes: raw
                .classes
                .into_iter()
                .map(|c| CandidateClass {
                    class_name: c.class_name.trim().to_string(),
                    properties: c
                        .properties
                        .into_iter()
                        .map(|(k, v)| (k, value_to_string(v)))
                        .collect::<PropertyValues>(),
                })
                .collect(),
        }
    }
}

/// [`Extractor`] that prompts an LLM with the current schema
pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
    check: bool,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            check: false,
        }
    }

    /// Send the candidates back to the model for a confirm-or-correct pass
    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Build the extraction prompt
    pub fn build_prompt(&self, schema: &System, text: &str) -> Result<String> {
        render(EXTRACT_PROMPT, schema, text)
    }

    /// Build the check prompt for a first-pass extraction
    pub fn build_check_prompt(
        &self,
        schema: &System,
        text: &str,
        extraction: &Extraction,
    ) -> Result<String> {
        let candidates = serde_json::to_string_pretty(extraction)
            .map_err(|e| KgError::Extraction(format!("Failed to serialize candidates: {e}")))?;
        Ok(render(CHECK_PROMPT, schema, text)?.replace("{candidates}", &candidates))
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.client
            .generate(prompt)
            .await
            .map_err(|e| KgError::Extraction(format!("{} call failed: {e}", self.client.name())))
    }

    /// Ask the model to confirm or correct `extraction`. An unusable answer
    /// keeps the first-pass candidates.
    async fn recheck(
        &self,
        schema: &System,
        text: &str,
        extraction: Extraction,
    ) -> Result<Extraction> {
        let prompt = self.build_check_prompt(schema, text, &extraction)?;
        let response = self.generate(&prompt).await?;
        match self.parse_response(&response) {
            Ok(checked) => {
                tracing::debug!(
                    before = extraction.entities.len(),
                    after = checked.entities.len(),
                    "extraction checked"
                );
                Ok(checked)
            }
            Err(e) => {
                tracing::warn!(error = %e, "extraction check unusable, keeping first pass");
                Ok(extraction)
            }
        }
    }

    /// Parse an LLM response into candidates
    pub fn parse_response(&self, response: &str) -> Result<Extraction> {
        let raw: RawExtraction = serde_json::from_str(strip_code_fence(response))
            .map_err(|e| KgError::Extraction(format!("Invalid extraction response: {e}")))?;

        Ok(Extraction {
            entities: raw
                .entities
                .into_iter()
                .filter(|e| !e.name.trim().is_empty())
                .map(CandidateEntity::from)
                .collect(),
            relationships: raw.relationships,
        })
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, schema: &System, text: &str) -> Result<Extraction> {
        let prompt = self.build_prompt(schema, text)?;
        let response = self.generate(&prompt).await?;

        let mut extraction = self.parse_response(&response)?;
        if self.check {
            extraction = self.recheck(schema, text, extraction).await?;
        }
        tracing::debug!(
            entities = extraction.entities.len(),
            relationships = extraction.relationships.len(),
            "extraction parsed"
        );
        Ok(extraction)
    }
}

// ============================================================================
// Schema advisor
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawProposal {
    #[serde(default)]
    classes: Vec<ClassDefinition>,
    #[serde(default)]
    rationale: String,
}

/// [`SchemaAdvisor`] that asks an LLM whether the schema must grow
pub struct LlmSchemaAdvisor {
    client: Arc<dyn LlmClient>,
}

impl LlmSchemaAdvisor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Build the advice prompt
    pub fn build_prompt(&self, schema: &System, text: &str) -> Result<String> {
        render(ADVISE_PROMPT, schema, text)
    }

    /// Parse an LLM response into a proposal.
    ///
    /// Classes already in `schema` become enhancements carrying their listed
    /// properties; the rest are proposed as new classes. A reply that is not
    /// a JSON proposal proposes nothing, whether it says `SUFFICIENT` or is
    /// unreadable.
    pub fn parse_response(&self, schema: &System, response: &str) -> SchemaProposal {
        let raw: RawProposal = match serde_json::from_str(strip_code_fence(response)) {
            Ok(raw) => raw,
            Err(_) if response.to_uppercase().contains("SUFFICIENT") => {
                return SchemaProposal::unchanged("schema is sufficient");
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable schema advice, keeping schema");
                return SchemaProposal::unchanged(format!("unparseable advice: {e}"));
            }
        };

        let (existing, added): (Vec<ClassDefinition>, Vec<ClassDefinition>) = raw
            .classes
            .into_iter()
            .partition(|c| schema.has_class(&c.name));
        let enhanced = existing
            .into_iter()
            .map(|c| ClassEnhancement::new(c.name, c.properties))
            .collect::<Vec<_>>();

        if added.is_empty() && enhanced.iter().all(|e| e.properties.is_empty()) {
            return SchemaProposal::unchanged(raw.rationale);
        }
        SchemaProposal::extend(added, enhanced, raw.rationale)
    }
}

#[async_trait]
impl SchemaAdvisor for LlmSchemaAdvisor {
    async fn propose(&self, schema: &System, text: &str) -> Result<SchemaProposal> {
        let prompt = self.build_prompt(schema, text)?;
        let response = self
            .client
            .generate(&prompt)
            .await
            .map_err(|e| KgError::Extraction(format!("{} call failed: {e}", self.client.name())))?;
        Ok(self.parse_response(schema, &response))
    }
}
