//! Payload selectors.
//!
//! Every subscription names exactly one way of extracting its value from a
//! `data` payload. A payload that does not match is reported, never guessed.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

type SelectFn = dyn Fn(&Value) -> Option<Value> + Send + Sync;

/// How a subscription extracts its value from a `data` payload.
#[derive(Clone, Default)]
pub enum Selector {
    /// Deliver the payload unchanged.
    #[default]
    Identity,
    /// Follow object keys from the payload root.
    Path(Vec<String>),
    /// Pure function; `None` means "no match".
    Fn(Arc<SelectFn>),
}

impl Selector {
    /// Dotted path, e.g. `"data.onJobUpdated"`.
    pub fn path(dotted: &str) -> Self {
        Self::Path(
            dotted
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Wrap a function.
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self::Fn(Arc::new(f))
    }

    /// Extract the subscription value from `payload`.
    ///
    /// A path that ends on `null` counts as a miss.
    pub fn apply(&self, payload: &Value) -> Result<Value, String> {
        match self {
            Self::Identity => Ok(payload.clone()),
            Self::Path(segments) => {
                let mut current = payload;
                for (depth, segment) in segments.iter().enumerate() {
                    current = current.get(segment).ok_or_else(|| {
                        format!("missing key `{}`", segments[..=depth].join("."))
                    })?;
                }
                if current.is_null() {
                    return Err(format!("`{}` is null", segments.join(".")));
                }
                Ok(current.clone())
            }
            Self::Fn(f) => f(payload).ok_or_else(|| "selector function returned nothing".into()),
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("Identity"),
            Self::Path(segments) => write!(f, "Path({})", segments.join(".")),
            Self::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}
