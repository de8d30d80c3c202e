//! # Message Taxonomy and Wire Validation
//!
//! Every ASMV interaction is one of the tagged message variants below,
//! serialized as a JSON object whose `type` field selects the variant. The
//! in-memory enum is the dispatch authority; the compiled per-variant
//! schemas are the wire-level authority. Inbound payloads pass
//! [`decode_wire_message`] before anything else looks at them, so dispatch
//! code never sees a structurally invalid message.
//!
//! Direction of travel:
//!
//! | agent → service | service → agent |
//! |---|---|
//! | `Invoke`, `ProvideInput`, `Cancel` | `RequestInput`, `Return` |
//! | `ProvideUserConfirmation` | `RequestUserConfirmation` |
//! | `AuthorizePayment`, `RejectPayment` | `RequestPayment` |

use std::collections::HashMap;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Error;
use crate::schema::CompiledSchema;

/// One provided input value, labelled with its declared type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEntry {
    pub input_type: String,
    pub value: Value,
}

/// Confirmation attached to an `Invoke` or sent in reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfirmation {
    pub confirmed_by: String,
}

/// Descriptor of one requested input type inside a `RequestInput`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    #[serde(default)]
    pub description: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
}

/// One entry of a `Return` batch: a produced output or a command error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReturnItem {
    #[serde(rename_all = "camelCase")]
    Output {
        output_type: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_name: String,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// The protocol message set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    Invoke {
        #[serde(default)]
        config_profiles: HashMap<String, Value>,
        #[serde(default)]
        inputs: Vec<InputEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_confirmation: Option<UserConfirmation>,
    },
    #[serde(rename_all = "camelCase")]
    RequestInput {
        inputs: IndexMap<String, InputRequest>,
    },
    #[serde(rename_all = "camelCase")]
    ProvideInput {
        inputs: Vec<InputEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Return {
        items: Vec<ReturnItem>,
        close: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    Cancel,
    #[serde(rename_all = "camelCase")]
    RequestUserConfirmation {
        req_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ProvideUserConfirmation {
        req_id: String,
        confirmed_by: String,
    },
    #[serde(rename_all = "camelCase")]
    RequestPayment {
        req_id: String,
        accepted_payment_schemas: Vec<String>,
        amount: f64,
        currency: String,
        description: String,
    },
    #[serde(rename_all = "camelCase")]
    AuthorizePayment {
        req_id: String,
        payment_id: String,
        payment_schema: String,
        amount: f64,
        currency: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payment_data: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    RejectPayment {
        req_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Message {
    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Invoke { .. } => "invoke",
            Message::RequestInput { .. } => "requestInput",
            Message::ProvideInput { .. } => "provideInput",
            Message::Return { .. } => "return",
            Message::Cancel => "cancel",
            Message::RequestUserConfirmation { .. } => "requestUserConfirmation",
            Message::ProvideUserConfirmation { .. } => "provideUserConfirmation",
            Message::RequestPayment { .. } => "requestPayment",
            Message::AuthorizePayment { .. } => "authorizePayment",
            Message::RejectPayment { .. } => "rejectPayment",
        }
    }
}

fn input_entry_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "inputType": { "type": "string" },
            "value": {}
        },
        "required": ["inputType", "value"]
    })
}

fn return_item_schema() -> Value {
    json!({
        "anyOf": [
            {
                "type": "object",
                "properties": {
                    "outputType": { "type": "string" },
                    "data": {},
                    "summary": { "type": "string" }
                },
                "required": ["outputType", "data"]
            },
            {
                "type": "object",
                "properties": {
                    "errorName": { "type": "string" },
                    "description": { "type": "string" },
                    "data": {}
                },
                "required": ["errorName", "description"]
            }
        ]
    })
}

fn variant_schemas() -> Vec<(&'static str, Value)> {
    vec![
        (
            "invoke",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "invoke" },
                    "configProfiles": { "type": "object" },
                    "inputs": { "type": "array", "items": input_entry_schema() },
                    "userConfirmation": {
                        "type": "object",
                        "properties": { "confirmedBy": { "type": "string" } },
                        "required": ["confirmedBy"]
                    }
                },
                "required": ["type"]
            }),
        ),
        (
            "requestInput",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "requestInput" },
                    "inputs": {
                        "type": "object",
                        "additionalProperties": {
                            "type": "object",
                            "properties": {
                                "description": { "type": "object" },
                                "schema": {},
                                "required": { "type": "boolean" },
                                "minCount": { "type": "integer", "minimum": 0 }
                            }
                        }
                    }
                },
                "required": ["type", "inputs"]
            }),
        ),
        (
            "provideInput",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "provideInput" },
                    "inputs": { "type": "array", "items": input_entry_schema() },
                    "seq": { "type": "integer", "minimum": 0 }
                },
                "required": ["type", "inputs"]
            }),
        ),
        (
            "return",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "return" },
                    "items": { "type": "array", "items": return_item_schema() },
                    "close": { "type": "boolean" },
                    "seq": { "type": "integer", "minimum": 0 }
                },
                "required": ["type", "items", "close"]
            }),
        ),
        (
            "cancel",
            json!({
                "type": "object",
                "properties": { "type": { "const": "cancel" } },
                "required": ["type"]
            }),
        ),
        (
            "requestUserConfirmation",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "requestUserConfirmation" },
                    "reqId": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["type", "reqId"]
            }),
        ),
        (
            "provideUserConfirmation",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "provideUserConfirmation" },
                    "reqId": { "type": "string" },
                    "confirmedBy": { "type": "string" }
                },
                "required": ["type", "reqId", "confirmedBy"]
            }),
        ),
        (
            "requestPayment",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "requestPayment" },
                    "reqId": { "type": "string" },
                    "acceptedPaymentSchemas": {
                        "type": "array",
                        "items": { "type": "string" }
                    },
                    "amount": { "type": "number" },
                    "currency": { "type": "string" },
                    "description": { "type": "string" }
                },
                "required": [
                    "type", "reqId", "acceptedPaymentSchemas",
                    "amount", "currency", "description"
                ]
            }),
        ),
        (
            "authorizePayment",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "authorizePayment" },
                    "reqId": { "type": "string" },
                    "paymentId": { "type": "string" },
                    "paymentSchema": { "type": "string" },
                    "amount": { "type": "number" },
                    "currency": { "type": "string" },
                    "token": { "type": "string" },
                    "paymentData": {}
                },
                "required": [
                    "type", "reqId", "paymentId", "paymentSchema",
                    "amount", "currency", "token"
                ]
            }),
        ),
        (
            "rejectPayment",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "rejectPayment" },
                    "reqId": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["type", "reqId"]
            }),
        ),
    ]
}

/// One compiled schema per message variant, keyed by wire tag.
static WIRE_SCHEMAS: Lazy<HashMap<&'static str, CompiledSchema>> = Lazy::new(|| {
    variant_schemas()
        .into_iter()
        .map(|(tag, schema)| {
            let compiled = match CompiledSchema::compile(schema) {
                Ok(compiled) => compiled,
                Err(error) => panic!("builtin wire schema for `{tag}` must compile: {error}"),
            };
            (tag, compiled)
        })
        .collect()
});

/// Validate a raw wire payload against the message union.
///
/// Unknown or missing `type` tags fail with "Invalid message type"; schema
/// violations fail with the structured violations as `childErrors`.
pub fn validate_wire_message(value: &Value) -> Result<(), Error> {
    let tag = match value.get("type").and_then(Value::as_str) {
        Some(tag) => tag,
        None => {
            return Err(Error::InvalidMessage {
                message: "Invalid message type".to_string(),
                child_errors: Vec::new(),
            })
        }
    };
    let schema = WIRE_SCHEMAS.get(tag).ok_or_else(|| Error::InvalidMessage {
        message: "Invalid message type".to_string(),
        child_errors: Vec::new(),
    })?;
    let violations = schema.validate(value);
    if violations.is_empty() {
        return Ok(());
    }
    Err(Error::invalid_message(
        format!("`{tag}` message failed validation"),
        violations
            .into_iter()
            .map(|v| Error::InvalidMessage {
                message: v.to_string(),
                child_errors: Vec::new(),
            })
            .collect(),
    ))
}

/// Validate and decode a raw wire payload into a [`Message`].
pub fn decode_wire_message(value: &Value) -> Result<Message, Error> {
    validate_wire_message(value)?;
    serde_json::from_value(value.clone()).map_err(|e| Error::InvalidMessage {
        message: format!("message does not decode: {e}"),
        child_errors: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_round_trip() {
        let message = Message::Invoke {
            config_profiles: HashMap::from([("account".to_string(), json!({ "id": "a1" }))]),
            inputs: vec![InputEntry {
                input_type: "name".into(),
                value: json!("John"),
            }],
            user_confirmation: Some(UserConfirmation {
                confirmed_by: "user@example.com".into(),
            }),
        };

        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["type"], "invoke");
        assert_eq!(wire["inputs"][0]["inputType"], "name");
        assert_eq!(wire["userConfirmation"]["confirmedBy"], "user@example.com");

        let decoded = decode_wire_message(&wire).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_return_items_serialize_untagged() {
        let message = Message::Return {
            items: vec![
                ReturnItem::Output {
                    output_type: "Greetings".into(),
                    data: json!("Hello, John!"),
                    summary: None,
                },
                ReturnItem::Error {
                    error_name: "Boom".into(),
                    description: "it broke".into(),
                    data: None,
                },
            ],
            close: true,
            seq: Some(0),
        };

        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["items"][0]["outputType"], "Greetings");
        assert_eq!(wire["items"][1]["errorName"], "Boom");

        let decoded = decode_wire_message(&wire).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unknown_variant_is_rejected() {
        let error = decode_wire_message(&json!({ "type": "teleport" })).unwrap_err();
        assert_eq!(error.to_string(), "invalid message: Invalid message type");

        let error = decode_wire_message(&json!({ "noType": true })).unwrap_err();
        assert_eq!(error.name(), "InvalidMessage");
    }

    #[test]
    fn test_schema_violations_become_child_errors() {
        // reqId missing entirely.
        let wire = json!({ "type": "provideUserConfirmation", "confirmedBy": "me" });
        let error = decode_wire_message(&wire).unwrap_err();
        match error {
            Error::InvalidMessage { child_errors, .. } => {
                assert!(!child_errors.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancel_is_bare() {
        let wire = serde_json::to_value(Message::Cancel).unwrap();
        assert_eq!(wire, json!({ "type": "cancel" }));
        assert_eq!(decode_wire_message(&wire).unwrap(), Message::Cancel);
    }

    #[test]
    fn test_request_input_preserves_declaration_order() {
        let mut inputs = IndexMap::new();
        for name in ["zeta", "alpha", "mid"] {
            inputs.insert(
                name.to_string(),
                InputRequest {
                    description: HashMap::new(),
                    schema: None,
                    required: Some(true),
                    min_count: Some(1),
                },
            );
        }
        let wire = serde_json::to_value(Message::RequestInput { inputs }).unwrap();
        let keys: Vec<&String> = match &wire["inputs"] {
            Value::Object(map) => map.keys().collect(),
            other => panic!("unexpected inputs encoding: {other}"),
        };
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
    }
}
