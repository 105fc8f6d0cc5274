//! Appearance payload handling for the `Preserve*` application kinds.
//!
//! Appearance payloads are base64-encoded JSON documents with a `Customize`
//! object holding one entry per customization field. Preserving traits means
//! copying the relevant `Customize` entries from the target's current payload
//! into the payload about to be applied.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

use crate::target::ApplicationKind;

const CUSTOMIZE_KEY: &str = "Customize";

const RACE_FIELDS: &[&str] = &["Race", "Clan"];
const GENDER_FIELDS: &[&str] = &["Gender", "BodyType", "BustSize"];

fn decode(payload: &str) -> Option<Value> {
    let bytes = STANDARD.decode(payload.trim()).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.is_object().then_some(value)
}

fn encode(value: &Value) -> Option<String> {
    serde_json::to_vec(value).ok().map(|bytes| STANDARD.encode(bytes))
}

/// Payload to apply for `kind`, given the archive payload and the target's current one.
///
/// Kinds that preserve nothing return `incoming` unchanged. When either
/// payload cannot be decoded the incoming payload is used as is.
pub fn derive_payload(kind: ApplicationKind, incoming: &str, current: Option<&str>) -> String {
    if !kind.preserves_traits() {
        return incoming.to_string();
    }
    let Some(current) = current else {
        return incoming.to_string();
    };

    match merge(kind, incoming, current) {
        Some(merged) => merged,
        None => {
            tracing::warn!(?kind, "Could not decode appearance payloads, applying unmodified");
            incoming.to_string()
        }
    }
}

fn merge(kind: ApplicationKind, incoming: &str, current: &str) -> Option<String> {
    let mut incoming = decode(incoming)?;
    let current = decode(current)?;
    let current_customize = current.get(CUSTOMIZE_KEY)?.as_object()?;

    let target = incoming
        .as_object_mut()?
        .entry(CUSTOMIZE_KEY)
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()?;

    match kind {
        ApplicationKind::PreservePhysicalTraits => {
            for (key, value) in current_customize {
                target.insert(key.clone(), value.clone());
            }
        }
        ApplicationKind::PreserveRace | ApplicationKind::PreserveGenderTraits => {
            let fields = if kind == ApplicationKind::PreserveRace {
                RACE_FIELDS
            } else {
                GENDER_FIELDS
            };
            for field in fields {
                if let Some(value) = current_customize.get(*field) {
                    target.insert((*field).to_string(), value.clone());
                }
            }
        }
        _ => {}
    }

    encode(&incoming)
}
