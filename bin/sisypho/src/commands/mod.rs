pub mod browser_cmd;
pub mod call_cmd;
pub mod encrypt_cmd;
pub mod record_cmd;
pub mod run_cmd;
pub mod tools_cmd;

use serde_json::{Map, Value};

/// Parse a `--params`/`--args` JSON object; an absent flag is an empty object.
pub(crate) fn parse_object(raw: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => anyhow::bail!("Expected a JSON object, got: {}", other),
        Err(e) => anyhow::bail!("Failed to parse JSON: {}\nInput: {}", e, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        assert!(parse_object(None).unwrap().is_empty());
        assert_eq!(parse_object(Some(r#"{"a":1}"#)).unwrap()["a"], 1);
        assert!(parse_object(Some("[1]")).is_err());
        assert!(parse_object(Some("{oops")).is_err());
    }
}
