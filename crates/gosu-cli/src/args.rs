//! Client argument parsing.
//!
//! After the verb, the first bare argument becomes the `body` (usually a
//! task or a pattern) and every `--flag` / `--flag=value` argument folds
//! into a JSON object through the shared key=value scanner.

use serde_json::{Map, Value};

pub struct Parsed {
    pub body: String,
    pub flags: Map<String, Value>,
}

pub fn parse(rest: &[String]) -> anyhow::Result<Parsed> {
    let mut body = String::new();
    let mut flag_text = String::new();

    for arg in rest {
        if !arg.starts_with('-') {
            if body.is_empty() {
                body = arg.clone();
            }
            continue;
        }
        // Re-quote values containing spaces so the scanner sees one token.
        if let Some(space) = arg.find(' ') {
            match arg.find('=') {
                Some(eq) if eq < space => {
                    flag_text.push_str(&arg[..=eq]);
                    flag_text.push('"');
                    flag_text.push_str(&arg[eq + 1..].replace('"', "\\\""));
                    flag_text.push('"');
                }
                _ => {
                    flag_text.push('"');
                    flag_text.push_str(&arg.replace('"', "\\\""));
                    flag_text.push('"');
                }
            }
        } else {
            flag_text.push_str(arg);
        }
        flag_text.push(' ');
    }

    let flags = gosu_core::tag::scan_args(flag_text.trim())
        .map_err(|err| anyhow::anyhow!("invalid arguments: {err}"))?;
    Ok(Parsed { body, flags })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn body_and_flags() {
        let parsed = parse(&argv(&["run node app.js", "--id=web", "--retry-limit=3/10s"])).unwrap();
        assert_eq!(parsed.body, "run node app.js");
        assert_eq!(parsed.flags["id"], json!("web"));
        assert_eq!(parsed.flags["retry_limit"], json!("3/10s"));
    }

    #[test]
    fn bare_flags_are_true() {
        let parsed = parse(&argv(&["x", "--retry-disabled"])).unwrap();
        assert_eq!(parsed.flags["retry_disabled"], json!(true));
    }

    #[test]
    fn values_with_spaces() {
        let parsed = parse(&argv(&["x", "--exec=node server.js"])).unwrap();
        assert_eq!(parsed.flags["exec"], json!("node server.js"));
    }

    #[test]
    fn only_first_positional_is_body() {
        let parsed = parse(&argv(&["first", "second"])).unwrap();
        assert_eq!(parsed.body, "first");
    }
}
