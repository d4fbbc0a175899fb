//! Selection of a single field out of a [`ComputationResult`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CoalesceError, ComputationResult};

/// How a selector naming a field that does not exist is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorMode {
    /// Return the whole result.
    ///
    /// This is the historical behavior that existing callers depend on, even though it makes a
    /// typo in a selector indistinguishable from a request for the full result.
    #[default]
    Lenient,
    /// Fail with [`CoalesceError::FieldNotFound`].
    Strict,
}

/// Returns the field named by `selector`, or the whole result.
///
/// Without a selector the whole result is returned as a JSON object. With a selector naming an
/// existing field, only that field's value is returned. A selector naming a missing field is
/// handled according to `mode`.
pub fn select(
    result: ComputationResult,
    selector: Option<&str>,
    mode: SelectorMode,
) -> Result<Value, CoalesceError> {
    let Some(field) = selector else {
        return Ok(result.into_value());
    };

    if let Some(value) = result.get(field) {
        return Ok(value.clone());
    }

    match mode {
        SelectorMode::Lenient => {
            tracing::trace!(field, "Selected field missing, returning the full result");
            Ok(result.into_value())
        }
        SelectorMode::Strict => Err(CoalesceError::FieldNotFound(field.to_owned())),
    }
}
