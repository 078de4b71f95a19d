//! Script parameters given as `name=value` strings

use crate::error::{Error, Result};
use verity_core::{Value, ValueMap};

/// Parse one `name=value` parameter
///
/// The value is typed with [`Value::parse_literal`]. A missing `=` or an empty
/// name is a configuration error.
pub fn parse_parameter(text: &str) -> Result<(String, Value)> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| Error::MalformedParameter(text.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::MalformedParameter(text.to_string()));
    }
    Ok((name.to_string(), Value::parse_literal(value)))
}

/// Parse a list of parameters; later duplicates override earlier ones
pub fn parse_parameters<I, S>(params: I) -> Result<ValueMap>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut map = ValueMap::new();
    for param in params {
        let (name, value) = parse_parameter(param.as_ref())?;
        map.insert(name, value);
    }
    Ok(map)
}
