//! Tagged-union headers and inline argument scanning.
//!
//! Tasks and triggers are addressed by a `kind:id` tag. In JSON they appear
//! either as a bare string (`"run:web node server.js"`) or as the single key
//! of an object whose value is the payload. Anything after the first space
//! is inline text: either variant-specific shorthand or `key=value` pairs
//! merged into the payload.

use serde_json::{Map, Value};

/// A parsed `kind[:id] [inline…]` header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tag {
    pub kind: String,
    pub id: String,
    pub inline: String,
}

impl Tag {
    pub fn parse(text: &str) -> Tag {
        let text = text.trim_start();
        let (head, inline) = match text.split_once(' ') {
            Some((head, rest)) => (head, rest.trim().to_string()),
            None => (text, String::new()),
        };
        let (kind, id) = match head.split_once(':') {
            Some((kind, id)) => (kind.to_string(), id.to_string()),
            None => (head.to_string(), String::new()),
        };
        Tag { kind, id, inline }
    }

    /// The display label: the id when set, else the kind.
    pub fn label(&self) -> &str {
        if self.id.is_empty() {
            &self.kind
        } else {
            &self.id
        }
    }

    /// The canonical `kind:id` header (no inline text).
    pub fn header(&self) -> String {
        if self.id.is_empty() {
            self.kind.clone()
        } else {
            format!("{}:{}", self.kind, self.id)
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '$' | '.')
}

/// Scan `key=value` pairs into a JSON object.
///
/// Keys tile `-` to `_` and may carry a `--` prefix; a key without a value
/// becomes `true`. Values are double/single-quoted strings, JSON arrays or
/// objects, numbers, booleans, or bare words.
pub fn scan_args(text: &str) -> Result<Map<String, Value>, String> {
    let mut out = Map::new();
    let mut chars = text.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(out);
        }
        while chars.peek() == Some(&'-') {
            chars.next();
        }

        let mut key = String::new();
        while matches!(chars.peek(), Some(c) if is_ident_char(*c)) {
            let c = chars.next().unwrap();
            key.push(if c == '-' { '_' } else { c });
        }
        if key.is_empty() {
            return Err(format!("unexpected character in arguments: {text:?}"));
        }

        if chars.peek() == Some(&'=') {
            chars.next();
            let value = scan_value(&mut chars)?;
            out.insert(key, value);
        } else {
            out.insert(key, Value::Bool(true));
        }
    }
}

fn scan_value(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Value, String> {
    match chars.peek() {
        Some('"') | Some('\'') => {
            let quote = chars.next().unwrap();
            let mut text = String::new();
            let mut escape = false;
            for c in chars.by_ref() {
                if escape {
                    text.push(c);
                    escape = false;
                } else if c == '\\' {
                    escape = true;
                } else if c == quote {
                    return Ok(Value::String(text));
                } else {
                    text.push(c);
                }
            }
            Err("unterminated quoted string".into())
        }
        Some('[') | Some('{') => {
            // Balanced JSON literal; quotes suspend bracket counting.
            let mut depth = 0usize;
            let mut text = String::new();
            let mut in_string = false;
            let mut escape = false;
            for c in chars.by_ref() {
                text.push(c);
                if escape {
                    escape = false;
                    continue;
                }
                match c {
                    '\\' if in_string => escape = true,
                    '"' => in_string = !in_string,
                    '[' | '{' if !in_string => depth += 1,
                    ']' | '}' if !in_string => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            serde_json::from_str(&text).map_err(|e| format!("invalid JSON literal: {e}"))
        }
        _ => {
            let mut word = String::new();
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                word.push(chars.next().unwrap());
            }
            if word.is_empty() {
                return Err("expected a value".into());
            }
            Ok(match word.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                _ => word
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| word.parse::<f64>().map(Value::from))
                    .unwrap_or(Value::String(word)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_headers() {
        let tag = Tag::parse("run:web node server.js");
        assert_eq!(tag.kind, "run");
        assert_eq!(tag.id, "web");
        assert_eq!(tag.inline, "node server.js");
        assert_eq!(tag.label(), "web");
        assert_eq!(tag.header(), "run:web");

        let tag = Tag::parse("noop");
        assert_eq!(tag.kind, "noop");
        assert!(tag.id.is_empty());
        assert_eq!(tag.label(), "noop");
    }

    #[test]
    fn scans_scalars() {
        let args = scan_args(r#"port=3000 name="hello world" debug ratio=0.5"#).unwrap();
        assert_eq!(args["port"], json!(3000));
        assert_eq!(args["name"], json!("hello world"));
        assert_eq!(args["debug"], json!(true));
        assert_eq!(args["ratio"], json!(0.5));
    }

    #[test]
    fn scans_json_literals() {
        let args = scan_args(r#"args=["-p","80"] env={"A":"1"}"#).unwrap();
        assert_eq!(args["args"], json!(["-p", "80"]));
        assert_eq!(args["env"], json!({"A": "1"}));
    }

    #[test]
    fn dashes_tile_to_underscores() {
        let args = scan_args("--retry-limit=3/10s --retry-disabled").unwrap();
        assert_eq!(args["retry_limit"], json!("3/10s"));
        assert_eq!(args["retry_disabled"], json!(true));
    }

    #[test]
    fn rejects_garbage() {
        assert!(scan_args("=nope").is_err());
    }
}
