//! The `fetch` task: one HTTP request whose outcome lands on the
//! whiteboard (`status`, and `body` for a 200 JSON response).

use std::sync::Arc;

use gosu_types::Cause;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{inline_args, overlay, TaskExit};
use crate::worker::MustWorker;

const VALID_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchTask {
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
}

impl FetchTask {
    pub(crate) fn from_parts(inline: &str, payload: Map<String, Value>) -> Result<FetchTask, String> {
        let base = if inline.is_empty() {
            Map::new()
        } else {
            match Self::parse_inline(inline) {
                Ok(map) => map,
                Err(_) => inline_args(inline)?,
            }
        };
        serde_json::from_value(Value::Object(overlay(base, payload))).map_err(|e| e.to_string())
    }

    /// `[METHOD] url [body…]` shorthand.
    fn parse_inline(text: &str) -> Result<Map<String, Value>, String> {
        let mut map = Map::new();
        let mut rest = text;
        if let Some((first, after)) = text.split_once(' ') {
            if !VALID_METHODS.contains(&first) {
                return Err(format!("invalid HTTP method: {first}"));
            }
            map.insert("method".into(), Value::String(first.into()));
            rest = after;
        }
        let (url, body) = match rest.split_once(' ') {
            Some((url, body)) => (url, Some(body)),
            None => (rest, None),
        };
        map.insert("url".into(), Value::String(url.into()));
        if let Some(body) = body {
            map.insert("body".into(), Value::String(body.into()));
        }
        Ok(map)
    }

    pub(crate) fn launch(&self, ctl: Arc<MustWorker>) -> TaskExit {
        let task = self.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(task.request(ctl).await);
        });
        rx
    }

    async fn request(&self, ctl: Arc<MustWorker>) -> gosu_types::TaskResult {
        let method = if self.method.is_empty() {
            reqwest::Method::GET
        } else {
            reqwest::Method::from_bytes(self.method.as_bytes())
                .map_err(|e| Cause::errored(e).non_retriable())?
        };
        let url: reqwest::Url = self
            .url
            .parse()
            .map_err(|e| Cause::errored(format!("invalid url: {e}")).non_retriable())?;

        let mut request = reqwest::Client::new().request(method, url);
        if !self.body.is_empty() {
            request = request.body(self.body.clone());
        }

        let response = tokio::select! {
            _ = ctl.scope().done() => return ctl.scope().result(),
            response = request.send() => response.map_err(Cause::errored)?,
        };

        let status = response.status().as_u16();
        ctl.board().set("status", status);
        ctl.logger().line(format!("Status code: {status}"));
        if status != 200 {
            return Ok(());
        }

        let body: Value = tokio::select! {
            _ = ctl.scope().done() => return ctl.scope().result(),
            body = response.json() => body.map_err(Cause::errored)?,
        };
        ctl.logger().line(format!("Body: {body}"));
        ctl.board().set("body", body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_with_method_and_body() {
        let task = FetchTask::from_parts("POST https://api.test/v1 {\"x\":1}", Map::new()).unwrap();
        assert_eq!(task.method, "POST");
        assert_eq!(task.url, "https://api.test/v1");
        assert_eq!(task.body, "{\"x\":1}");
    }

    #[test]
    fn inline_url_only() {
        let task = FetchTask::from_parts("https://api.test/health", Map::new()).unwrap();
        assert!(task.method.is_empty());
        assert_eq!(task.url, "https://api.test/health");
    }

    #[test]
    fn invalid_method_is_rejected() {
        assert!(FetchTask::from_parts("TELEPORT https://api.test", Map::new()).is_err());
    }
}
