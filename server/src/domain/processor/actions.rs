//! Attribute actions shared by the `resource` and `attributes` processors

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::config::{AttributeAction, AttributeActionConfig, ConvertType};
use crate::domain::signal::{AttrValue, Attributes};

#[derive(Debug, Error, PartialEq)]
pub enum ActionError {
    #[error("cannot convert attribute '{key}' value '{value}' to {target:?}")]
    Convert {
        key: String,
        value: String,
        target: ConvertType,
    },
}

/// Apply every action in order.
///
/// On error `attrs` is left exactly as it was.
pub fn apply_actions(
    actions: &[AttributeActionConfig],
    attrs: &mut Attributes,
) -> Result<(), ActionError> {
    if actions.iter().any(|a| a.action == AttributeAction::Convert) {
        let mut staged = attrs.clone();
        for action in actions {
            apply_action(action, &mut staged)?;
        }
        *attrs = staged;
        return Ok(());
    }

    for action in actions {
        apply_action(action, attrs)?;
    }
    Ok(())
}

fn source_value(action: &AttributeActionConfig, attrs: &Attributes) -> Option<AttrValue> {
    match &action.from_attribute {
        Some(from) => attrs.get(from).cloned(),
        None => action.value.clone(),
    }
}

fn apply_action(action: &AttributeActionConfig, attrs: &mut Attributes) -> Result<(), ActionError> {
    match action.action {
        AttributeAction::Insert => {
            if !attrs.contains_key(&action.key)
                && let Some(value) = source_value(action, attrs)
            {
                attrs.insert(action.key.clone(), value);
            }
        }
        AttributeAction::Update => {
            if attrs.contains_key(&action.key)
                && let Some(value) = source_value(action, attrs)
            {
                attrs.insert(action.key.clone(), value);
            }
        }
        AttributeAction::Upsert => {
            if let Some(value) = source_value(action, attrs) {
                attrs.insert(action.key.clone(), value);
            }
        }
        AttributeAction::Delete => {
            attrs.remove(&action.key);
        }
        AttributeAction::Hash => {
            if let Some(value) = attrs.get_mut(&action.key)
                && !is_sha256_hex(value)
            {
                let digest = Sha256::digest(value.to_string().as_bytes());
                *value = AttrValue::String(hex::encode(digest));
            }
        }
        AttributeAction::Convert => {
            let Some(target) = action.converted_type else {
                return Ok(());
            };
            if let Some(value) = attrs.get_mut(&action.key) {
                *value = convert(&action.key, value, target)?;
            }
        }
    }
    Ok(())
}

/// Output of a previous `hash`: 64 lowercase hex digits
fn is_sha256_hex(value: &AttrValue) -> bool {
    matches!(value, AttrValue::String(s)
        if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
}

fn convert(key: &str, value: &AttrValue, target: ConvertType) -> Result<AttrValue, ActionError> {
    let failed = || ActionError::Convert {
        key: key.to_string(),
        value: value.to_string(),
        target,
    };
    let converted = match (target, value) {
        (ConvertType::String, v) => AttrValue::String(v.to_string()),
        (ConvertType::Int, AttrValue::Int(i)) => AttrValue::Int(*i),
        (ConvertType::Int, AttrValue::Double(d)) if d.is_finite() => AttrValue::Int(d.trunc() as i64),
        (ConvertType::Int, AttrValue::Bool(b)) => AttrValue::Int(i64::from(*b)),
        (ConvertType::Int, AttrValue::String(s)) => {
            AttrValue::Int(s.trim().parse().map_err(|_| failed())?)
        }
        (ConvertType::Double, AttrValue::Int(i)) => AttrValue::Double(*i as f64),
        (ConvertType::Double, AttrValue::Double(d)) => AttrValue::Double(*d),
        (ConvertType::Double, AttrValue::Bool(b)) => AttrValue::Double(if *b { 1.0 } else { 0.0 }),
        (ConvertType::Double, AttrValue::String(s)) => {
            AttrValue::Double(s.trim().parse().map_err(|_| failed())?)
        }
        (ConvertType::Bool, AttrValue::Bool(b)) => AttrValue::Bool(*b),
        (ConvertType::Bool, AttrValue::Int(i)) => AttrValue::Bool(*i != 0),
        (ConvertType::Bool, AttrValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => AttrValue::Bool(true),
            "false" | "0" => AttrValue::Bool(false),
            _ => return Err(failed()),
        },
        _ => return Err(failed()),
    };
    Ok(converted)
}
