//! Foreign-language bridges and manifest unmarshalers.
//!
//! A bridge turns a script path into a runnable command; bridges are
//! registered under language kinds (`js`, `ts`, …) so a task tagged with
//! one becomes a subprocess of the matching runtime.
//!
//! The same table backs `@path` manifest loading: an extension-indexed set
//! of unmarshalers covering data formats (`json`, `yaml`, `toml`, `txt`),
//! script formats evaluated through their runtime, and `http(s)` URLs.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

/// The runtime command for a language kind, or None for unknown kinds.
pub fn language(kind: &str) -> Option<(&'static str, &'static [&'static str])> {
    match kind {
        "js" | "javascript" => Some(("node", &[])),
        "ts" | "typescript" => Some(("tsx", &[])),
        _ => None,
    }
}

/// Build the command running `script` under the bridge for `kind`.
pub fn run(kind: &str, script: &str, args: &[String]) -> Result<tokio::process::Command> {
    let (runtime, runtime_args) =
        language(kind).ok_or_else(|| anyhow!("no bridge for language: {kind}"))?;
    let mut cmd = tokio::process::Command::new(runtime);
    cmd.args(runtime_args);
    cmd.arg(script);
    cmd.args(args);
    Ok(cmd)
}

/// Load a JSON value from a path or URL, picking the unmarshaler by
/// extension (or scheme).
pub fn load_value(path: &str) -> Result<Value> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return fetch_url(path);
    }

    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;

    match ext.as_str() {
        "json" => serde_json::from_slice(&data).with_context(|| format!("parsing {path}")),
        "yaml" | "yml" => serde_yaml::from_slice(&data).with_context(|| format!("parsing {path}")),
        "toml" => {
            let text = String::from_utf8(data).with_context(|| format!("decoding {path}"))?;
            let value: toml::Value = toml::from_str(&text).with_context(|| format!("parsing {path}"))?;
            serde_json::to_value(value).map_err(Into::into)
        }
        "txt" => Ok(Value::String(
            String::from_utf8_lossy(&data).into_owned(),
        )),
        "js" | "cjs" | "mjs" | "ts" | "cts" | "mts" => eval_script(path),
        other => bail!("no unmarshaler for extension: .{other}"),
    }
}

/// Resolve a URL body as JSON. Runs on a dedicated thread so the blocking
/// HTTP client stays off the async runtime.
fn fetch_url(url: &str) -> Result<Value> {
    let url = url.to_string();
    std::thread::spawn(move || -> Result<Value> {
        let response = reqwest::blocking::get(&url)?;
        if !response.status().is_success() {
            bail!("http error: {}", response.status());
        }
        response.json().map_err(Into::into)
    })
    .join()
    .map_err(|_| anyhow!("fetch thread panicked"))?
}

/// Evaluate a script module through its runtime and parse its default
/// export (or `module.exports`) as JSON.
fn eval_script(path: &str) -> Result<Value> {
    let absolute = std::fs::canonicalize(path).with_context(|| format!("resolving {path}"))?;
    let ext = absolute
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let runtime = if matches!(ext.as_str(), "ts" | "cts" | "mts") {
        "tsx"
    } else {
        "node"
    };
    let wrapper = format!(
        "import({path:?}).then(m => console.log(JSON.stringify(m.default ?? m)))",
        path = absolute.to_string_lossy(),
    );
    let output = std::process::Command::new(runtime)
        .arg("-e")
        .arg(&wrapper)
        .output()
        .with_context(|| format!("running {runtime}"))?;
    if !output.status.success() {
        bail!(
            "script evaluation failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    serde_json::from_slice(&output.stdout).with_context(|| format!("parsing output of {path}"))
}
