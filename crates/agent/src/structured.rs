//! Structured output — turning a free-text answer into a validated object.
//!
//! Extraction runs once, after the execution loop produced its final text.
//! Each attempt asks the model for JSON matching the schema, parses the
//! streamed deltas as they arrive, and validates the result. A failed
//! attempt feeds its concrete validation error into the next prompt.

use mcpagent_core::{LanguageModel, StructuredRequest};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// A JSON Schema describing the expected result object.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
}

/// One property of an [`OutputSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub description: String,
    pub required: bool,
    /// The declared JSON type, if any
    pub kind: Option<String>,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Build from a schema document, named after its `title` when present.
    pub fn from_value(schema: Value) -> Self {
        let name = schema
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("output")
            .to_string();
        Self { name, schema }
    }

    pub fn fields(&self) -> Vec<SchemaField> {
        let required: Vec<&str> = self
            .schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let Some(properties) = self.schema.get("properties").and_then(Value::as_object) else {
            return Vec::new();
        };

        properties
            .iter()
            .map(|(name, property)| SchemaField {
                name: name.clone(),
                description: property
                    .get("description")
                    .and_then(Value::as_str)
                    .filter(|d| !d.is_empty())
                    .unwrap_or(name)
                    .to_string(),
                required: required.contains(&name.as_str()),
                kind: property
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect()
    }

    /// `- name: description (required|optional)` per field.
    pub fn describe(&self) -> String {
        let fields = self.fields();
        if fields.is_empty() {
            return format!("Schema: {}", self.name);
        }
        fields
            .iter()
            .map(|f| {
                format!(
                    "- {}: {} ({})",
                    f.name,
                    f.description,
                    if f.required { "required" } else { "optional" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The query as sent to the model when a structured result is wanted.
    pub fn enhance_query(&self, query: &str) -> String {
        format!(
            "{query}\n\n\
             IMPORTANT: Your response must include sufficient information to populate the following structured output:\n\n\
             {}\n\n\
             Make sure you gather ALL the required information during your task execution.\n\
             If any required information is missing, continue working to find it.",
            self.describe()
        )
    }
}

/// Record of one extraction attempt.
#[derive(Debug, Clone)]
pub struct OutputAttempt {
    pub attempt_index: usize,
    pub prompt_sent: String,
    pub raw_response: String,
    pub validation_error: Option<String>,
}

#[derive(Debug, Clone, Error)]
#[error("{last_error} (after {attempts} attempts)")]
pub struct ExtractionError {
    pub attempts: usize,
    pub last_error: String,
    pub history: Vec<OutputAttempt>,
}

/// Incremental parser over streamed JSON text.
///
/// Scan state (open containers, string and escape flags) carries across
/// deltas, so each delta is scanned once. A partial value is re-parsed only
/// when a top-level member completes, and the parser marks itself complete
/// as soon as the outermost object closes.
#[derive(Debug, Default)]
pub struct PartialJsonParser {
    buffer: String,
    /// Byte offset of the outermost `{` or `[`
    start: Option<usize>,
    /// Byte offset just past the outermost closer
    end: Option<usize>,
    closers: Vec<char>,
    in_string: bool,
    escaped: bool,
    latest: Option<Value>,
}

impl PartialJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta; returns the best partial value so far.
    pub fn push(&mut self, delta: &str) -> Option<&Value> {
        let offset = self.buffer.len();
        self.buffer.push_str(delta);
        if self.end.is_some() {
            return self.latest.as_ref();
        }

        let mut boundary = false;
        for (i, c) in delta.char_indices() {
            if self.start.is_none() {
                if c != '{' && c != '[' {
                    continue;
                }
                self.start = Some(offset + i);
            }

            if self.in_string {
                match c {
                    _ if self.escaped => self.escaped = false,
                    '\\' => self.escaped = true,
                    '"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }

            match c {
                '"' => self.in_string = true,
                '{' => self.closers.push('}'),
                '[' => self.closers.push(']'),
                '}' | ']' => {
                    self.closers.pop();
                    if self.closers.is_empty() {
                        self.end = Some(offset + i + 1);
                        break;
                    }
                    boundary |= self.closers.len() == 1;
                }
                ',' if self.closers.len() == 1 => boundary = true,
                _ => {}
            }
        }

        if boundary || self.end.is_some() {
            self.refresh();
        }
        self.latest.as_ref()
    }

    /// Whether the outermost value has closed; later deltas are ignored.
    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    pub fn latest(&self) -> Option<&Value> {
        self.latest.as_ref()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Parse the complete buffer.
    pub fn finish(&self) -> Result<Value, String> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            return serde_json::from_str(&self.buffer[start..end])
                .map_err(|e| format!("Invalid JSON: {e}"));
        }

        let text = self.buffer.trim();
        let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
            return Err("Response did not contain a JSON object".into());
        };
        if end < start {
            return Err("Response did not contain a JSON object".into());
        }
        serde_json::from_str(&text[start..=end]).map_err(|e| format!("Invalid JSON: {e}"))
    }

    fn refresh(&mut self) {
        let Some(start) = self.start else {
            return;
        };
        let candidate = match self.end {
            Some(end) => self.buffer[start..end].to_string(),
            None => self.closed_candidate(start),
        };
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            self.latest = Some(value);
        }
    }

    /// The buffer from `start` with whatever is open closed off.
    fn closed_candidate(&self, start: usize) -> String {
        let mut out = self.buffer[start..].to_string();
        if self.in_string {
            if self.escaped {
                out.pop();
            }
            out.push('"');
        }
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        if out.ends_with(',') {
            out.pop();
        } else if out.ends_with(':') {
            out.push_str("null");
        }
        out.extend(self.closers.iter().rev());
        out
    }
}

/// Check a parsed value against the schema.
///
/// Required fields must be present and non-null; empty strings and empty
/// arrays count as missing.
pub fn validate(value: &Value, schema: &OutputSchema) -> Result<(), String> {
    let Some(object) = value.as_object() else {
        return Err("Expected a JSON object".into());
    };

    for field in schema.fields() {
        let found = object.get(&field.name);
        if field.required {
            match found {
                None | Some(Value::Null) => {
                    return Err(format!("Required field '{}' is missing or empty", field.name));
                }
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return Err(format!("Required field '{}' is missing or empty", field.name));
                }
                Some(Value::Array(items)) if items.is_empty() => {
                    return Err(format!("Required field '{}' is an empty list", field.name));
                }
                _ => {}
            }
        }

        if let (Some(v), Some(kind)) = (found, field.kind.as_deref()) {
            if !v.is_null() && !type_matches(kind, v) {
                return Err(format!("Field '{}' should be of type {kind}", field.name));
            }
        }
    }
    Ok(())
}

fn type_matches(kind: &str, value: &Value) -> bool {
    match kind {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn format_prompt(raw: &str, description: &str, previous_error: Option<&str>) -> String {
    let mut prompt = format!(
        "Please format the following information according to the specified schema.\n\
         Extract and structure the relevant information from the content below.\n\n\
         Required schema fields:\n{description}\n\n\
         Content to format:\n{raw}\n\n\
         Please provide the information in the requested structured format.\n\
         If any required information is missing, you must indicate this clearly."
    );
    if let Some(error) = previous_error {
        prompt.push_str(&format!(
            "\n\nThe previous attempt failed validation: {error}\nCorrect this in your response."
        ));
    }
    prompt
}

/// Bounded, feedback-driven extraction of a structured result.
#[derive(Clone)]
pub struct StructuredOutputExtractor {
    model: Arc<dyn LanguageModel>,
    max_attempts: usize,
}

impl StructuredOutputExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, max_attempts: usize) -> Self {
        Self {
            model,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub async fn extract(&self, raw: &str, schema: &OutputSchema) -> Result<Value, ExtractionError> {
        let description = schema.describe();
        let mut history = Vec::new();
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            let prompt = format_prompt(raw, &description, last_error.as_deref());
            debug!(attempt, max = self.max_attempts, schema = %schema.name, "Structured output attempt");

            let (raw_response, outcome) = self.attempt(&prompt, schema).await;
            match outcome {
                Ok(value) => {
                    info!(attempt, "Structured output validated");
                    return Ok(value);
                }
                Err(error) => {
                    warn!(attempt, max = self.max_attempts, error = %error, "Structured output attempt failed");
                    history.push(OutputAttempt {
                        attempt_index: attempt,
                        prompt_sent: prompt,
                        raw_response,
                        validation_error: Some(error.clone()),
                    });
                    last_error = Some(error);
                }
            }
        }

        Err(ExtractionError {
            attempts: self.max_attempts,
            last_error: last_error.unwrap_or_default(),
            history,
        })
    }

    /// One request: stream and parse as it arrives; validate once the
    /// object closes (or the stream ends).
    async fn attempt(&self, prompt: &str, schema: &OutputSchema) -> (String, Result<Value, String>) {
        let request = StructuredRequest {
            prompt: prompt.to_string(),
            schema_name: schema.name.clone(),
            schema: schema.schema.clone(),
        };

        let mut rx = match self.model.respond_structured(request).await {
            Ok(rx) => rx,
            Err(e) => return (String::new(), Err(format!("Model error: {e}"))),
        };

        let mut parser = PartialJsonParser::new();
        while let Some(delta) = rx.recv().await {
            match delta {
                Ok(delta) => {
                    if let Some(partial) = parser.push(&delta) {
                        trace!(
                            fields = partial.as_object().map(|o| o.len()).unwrap_or(0),
                            "Partial structured output"
                        );
                    }
                    if parser.is_complete() {
                        debug!(bytes = parser.buffer().len(), "Structured object closed, validating");
                        break;
                    }
                }
                Err(e) => {
                    return (parser.buffer().to_string(), Err(format!("Model error: {e}")));
                }
            }
        }

        let result = parser
            .finish()
            .and_then(|value| validate(&value, schema).map(|()| value));
        (parser.buffer().to_string(), result)
    }
}
