//! Detects the structured career summary the assistant emits at the end of
//! the exercise.
//!
//! Candidates are found in two tiers: the whole reply (optionally inside a
//! ```` ```json ```` fence), then the widest `{ ... "resumen" ... }` span in
//! the reply. A candidate only counts once its marker value passes schema
//! validation. Any failure leaves the reply as ordinary prose.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const SUMMARY_MARKER_KEY: &str = "resumen";

pub const SUMMARY_TEXT_FIELDS: &[&str] = &[
    "proposito",
    "experiencia_destacada",
    "claridad_actual",
    "cambio_carrera",
    "vision_1_ano",
    "impacto_ejercicio",
    "roles_industrias",
    "rango_salarial",
    "ambiente_laboral",
    "comentarios_adicionales",
];

pub const SUMMARY_LIST_FIELDS: &[&str] = &[
    "talentos_clave",
    "motivaciones",
    "tareas_disfrutadas",
    "tareas_no_disfrutadas",
    "valores",
    "beneficios",
];

/// The validated value under the marker key, kept exactly as emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SummaryPayload {
    fields: Map<String, Value>,
}

impl SummaryPayload {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Summary(SummaryPayload),
    Prose,
}

impl Extraction {
    pub fn summary(&self) -> Option<&SummaryPayload> {
        match self {
            Self::Summary(payload) => Some(payload),
            Self::Prose => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("summary_not_object")]
    NotAnObject,
    #[error("summary_without_known_fields")]
    NoKnownFields,
    #[error("summary_field_{field}_expected_{expected}")]
    FieldType {
        field: String,
        expected: &'static str,
    },
}

pub fn extract_summary(content: &str) -> Extraction {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Extraction::Prose;
    }

    let candidate = match serde_json::from_str::<Value>(strip_code_fence(trimmed)) {
        Ok(value) => Some(value),
        Err(whole_error) => {
            debug!(error = %whole_error, "reply is not a JSON document");
            embedded_candidate(trimmed)
        }
    };

    let Some(marker) = candidate
        .as_ref()
        .and_then(Value::as_object)
        .and_then(|object| object.get(SUMMARY_MARKER_KEY))
    else {
        return Extraction::Prose;
    };

    match validate_summary(marker) {
        Ok(payload) => Extraction::Summary(payload),
        Err(error) => {
            debug!(%error, "summary candidate failed validation");
            Extraction::Prose
        }
    }
}

pub fn validate_summary(value: &Value) -> Result<SummaryPayload, SchemaError> {
    let Some(fields) = value.as_object() else {
        return Err(SchemaError::NotAnObject);
    };

    let mut known = 0usize;
    for (field, value) in fields {
        let field = field.as_str();
        if SUMMARY_TEXT_FIELDS.contains(&field) {
            if !(value.is_string() || value.is_object() || value.is_null()) {
                return Err(SchemaError::FieldType {
                    field: field.to_string(),
                    expected: "text",
                });
            }
        } else if SUMMARY_LIST_FIELDS.contains(&field) {
            let is_text_list = value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string));
            if !(is_text_list || value.is_null()) {
                return Err(SchemaError::FieldType {
                    field: field.to_string(),
                    expected: "text_list",
                });
            }
        } else {
            continue;
        }
        if !value.is_null() {
            known += 1;
        }
    }

    if known == 0 {
        return Err(SchemaError::NoKnownFields);
    }
    Ok(SummaryPayload {
        fields: fields.clone(),
    })
}

/// Unwraps a reply fenced as ```` ```json ... ``` ```` (or a bare fence).
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim()
}

fn embedded_candidate(content: &str) -> Option<Value> {
    let found = embedded_object_pattern()?.find(content)?;
    match serde_json::from_str::<Value>(found.as_str()) {
        Ok(value) => Some(value),
        Err(error) => {
            debug!(%error, "embedded summary span is not valid JSON");
            None
        }
    }
}

fn embedded_object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?s)\{.*"resumen".*\}"#).ok())
        .as_ref()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extraction_tiers() {
        struct Case {
            name: &'static str,
            input: &'static str,
            expected: Option<Value>,
        }

        let cases = vec![
            Case {
                name: "whole reply",
                input: r#"  {"resumen": {"proposito": "X"}}  "#,
                expected: Some(json!({"proposito": "X"})),
            },
            Case {
                name: "fenced reply",
                input: "```json\n{\"resumen\": {\"valores\": [\"honestidad\"]}}\n```",
                expected: Some(json!({"valores": ["honestidad"]})),
            },
            Case {
                name: "embedded in prose",
                input: "Aquí está tu resumen:\n{\"resumen\": {\"proposito\": \"Enseñar\", \"talentos_clave\": [\"escucha\"]}}\n¡Éxito!",
                expected: Some(json!({"proposito": "Enseñar", "talentos_clave": ["escucha"]})),
            },
            Case {
                name: "text field holding an object",
                input: r#"{"resumen": {"proposito": "Enseñar", "vision_1_ano": {"meta": "Liderar un equipo", "plazo": "12 meses"}}}"#,
                expected: Some(json!({
                    "proposito": "Enseñar",
                    "vision_1_ano": {"meta": "Liderar un equipo", "plazo": "12 meses"}
                })),
            },
            Case {
                name: "text field holding a list",
                input: r#"{"resumen": {"proposito": ["a", "b"]}}"#,
                expected: None,
            },
            Case {
                name: "plain prose",
                input: "Cuéntame más sobre tu experiencia.",
                expected: None,
            },
            Case {
                name: "json without marker",
                input: r#"{"proposito": "X"}"#,
                expected: None,
            },
            Case {
                name: "marker inside broken json",
                input: "Resumen: {\"resumen\": {\"proposito\": \"X\"} y luego {otra cosa}",
                expected: None,
            },
            Case {
                name: "marker with wrong type",
                input: r#"{"resumen": "solo texto"}"#,
                expected: None,
            },
            Case {
                name: "marker without known fields",
                input: r#"{"resumen": {"nota": "sin campos"}}"#,
                expected: None,
            },
            Case {
                name: "list field holding text",
                input: r#"{"resumen": {"valores": "honestidad"}}"#,
                expected: None,
            },
        ];

        for case in cases {
            let extracted = extract_summary(case.input)
                .summary()
                .cloned()
                .map(SummaryPayload::into_value);
            assert_eq!(extracted, case.expected, "{}", case.name);
        }
    }

    #[test]
    fn unknown_keys_are_forwarded_verbatim() {
        let payload = validate_summary(&json!({
            "proposito": "Construir",
            "extra": {"nivel": 3},
            "beneficios": null
        }))
        .expect("valid summary");

        assert_eq!(payload.get("extra"), Some(&json!({"nivel": 3})));
        assert_eq!(
            serde_json::to_value(&payload).expect("serialize"),
            json!({"proposito": "Construir", "extra": {"nivel": 3}, "beneficios": null})
        );
    }

    #[test]
    fn schema_errors_name_the_field() {
        let error = validate_summary(&json!({"proposito": 42})).expect_err("bad type");
        assert_eq!(
            error,
            SchemaError::FieldType {
                field: "proposito".to_string(),
                expected: "text",
            }
        );
        assert_eq!(
            validate_summary(&json!({"proposito": null})),
            Err(SchemaError::NoKnownFields)
        );
    }

    #[test]
    fn strip_code_fence_leaves_unfenced_text() {
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json {\"a\":1}"), "```json {\"a\":1}");
    }
}
