//! Declared connector config schemas (§4.1, §9 "Dynamic configuration bag").
//!
//! Each connector type declares the union of fields it recognizes,
//! including which leaves are ciphertext. [`crate::gateway`] walks a stored
//! `config` tree against the schema for its `type` and decrypts tagged
//! leaves; unrecognized fields pass through verbatim.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: &'static str,
    pub encrypted: bool,
    pub kind: FieldKind,
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    /// Recurses into `itemFields` for each array element, per §4.1.
    ObjectArray(&'static [FieldSchema]),
}

impl FieldSchema {
    pub const fn plain(name: &'static str, kind: FieldKind) -> Self {
        FieldSchema {
            name,
            encrypted: false,
            kind,
        }
    }

    pub const fn secret(name: &'static str) -> Self {
        FieldSchema {
            name,
            encrypted: true,
            kind: FieldKind::String,
        }
    }
}

pub type ConfigSchema = &'static [FieldSchema];

pub fn schema_for(connector_type: &str) -> Option<ConfigSchema> {
    match connector_type {
        "close" => Some(CLOSE_SCHEMA),
        "stripe" => Some(STRIPE_SCHEMA),
        "graphql" => Some(GRAPHQL_SCHEMA),
        "rest" => Some(REST_SCHEMA),
        "posthog" => Some(POSTHOG_SCHEMA),
        "bigquery" => Some(BIGQUERY_SCHEMA),
        _ => None,
    }
}

static CLOSE_SCHEMA: ConfigSchema = &[FieldSchema::secret("apiKey")];

static STRIPE_SCHEMA: ConfigSchema = &[FieldSchema::secret("secretKey"), FieldSchema::secret("webhookSecret")];

static GRAPHQL_SCHEMA: ConfigSchema = &[
    FieldSchema::plain("endpoint", FieldKind::String),
    FieldSchema::secret("authHeader"),
    FieldSchema::plain(
        "queries",
        FieldKind::ObjectArray(&[
            FieldSchema::plain("entity", FieldKind::String),
            FieldSchema::plain("query", FieldKind::String),
            FieldSchema::plain("dataPath", FieldKind::String),
        ]),
    ),
];

static REST_SCHEMA: ConfigSchema = &[
    FieldSchema::plain("baseUrl", FieldKind::String),
    FieldSchema::secret("authHeader"),
    FieldSchema::plain(
        "entities",
        FieldKind::ObjectArray(&[
            FieldSchema::plain("entity", FieldKind::String),
            FieldSchema::plain("method", FieldKind::String),
            FieldSchema::plain("path", FieldKind::String),
            FieldSchema::plain("dataPath", FieldKind::String),
        ]),
    ),
];

static POSTHOG_SCHEMA: ConfigSchema = &[
    FieldSchema::plain("projectId", FieldKind::String),
    FieldSchema::secret("apiKey"),
    FieldSchema::plain("host", FieldKind::String),
];

static BIGQUERY_SCHEMA: ConfigSchema = &[
    FieldSchema::plain("projectId", FieldKind::String),
    FieldSchema::plain("query", FieldKind::String),
    FieldSchema::secret("serviceAccountKey"),
];

#[derive(Debug, thiserror::Error)]
pub enum SchemaWalkError {
    #[error("decryption failed for field `{0}`")]
    DecryptFailed(String),
}

/// Walks `config` against `schema`, decrypting every tagged leaf in place.
/// Decryption failures are fatal for the whole read (§4.1): the engine
/// never silently substitutes ciphertext.
pub fn decrypt_config(
    config: &Value,
    schema: ConfigSchema,
    decrypt: &dyn Fn(&str) -> Option<String>,
) -> Result<Value, SchemaWalkError> {
    let mut out = config.clone();
    if let Value::Object(map) = &mut out {
        walk_object(map, schema, decrypt)?;
    }
    Ok(out)
}

fn walk_object(
    map: &mut serde_json::Map<String, Value>,
    schema: ConfigSchema,
    decrypt: &dyn Fn(&str) -> Option<String>,
) -> Result<(), SchemaWalkError> {
    for field in schema {
        let Some(value) = map.get_mut(field.name) else {
            continue;
        };
        if field.encrypted {
            if let Value::String(ct) = value {
                let plain = decrypt(ct).ok_or_else(|| SchemaWalkError::DecryptFailed(field.name.to_string()))?;
                *value = Value::String(plain);
            }
            continue;
        }
        if let FieldKind::ObjectArray(item_fields) = field.kind {
            if let Value::Array(items) = value {
                for item in items {
                    if let Value::Object(item_map) = item {
                        walk_object(item_map, item_fields, decrypt)?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decrypts_top_level_secret() {
        let config = json!({"apiKey": "ct:close"});
        let out = decrypt_config(&config, CLOSE_SCHEMA, &|ct| Some(format!("plain:{ct}"))).unwrap();
        assert_eq!(out["apiKey"], "plain:ct:close");
    }

    #[test]
    fn decrypts_nested_object_array_fields() {
        let config = json!({
            "endpoint": "https://example.com/graphql",
            "authHeader": "ct:header",
            "queries": [
                {"entity": "users", "query": "query { users }", "dataPath": "data.users"}
            ]
        });
        let out = decrypt_config(&config, GRAPHQL_SCHEMA, &|ct| Some(format!("plain:{ct}"))).unwrap();
        assert_eq!(out["authHeader"], "plain:ct:header");
        assert_eq!(out["queries"][0]["entity"], "users");
    }

    #[test]
    fn fails_fatally_on_decrypt_failure() {
        let config = json!({"apiKey": "broken"});
        let err = decrypt_config(&config, CLOSE_SCHEMA, &|_| None).unwrap_err();
        assert!(matches!(err, SchemaWalkError::DecryptFailed(_)));
    }

    #[test]
    fn passes_through_unknown_fields() {
        let config = json!({"apiKey": "ct:x", "extraField": "keep-me"});
        let out = decrypt_config(&config, CLOSE_SCHEMA, &|ct| Some(ct.to_string())).unwrap();
        assert_eq!(out["extraField"], "keep-me");
    }
}
