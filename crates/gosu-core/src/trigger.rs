//! Trigger sources driving job launch and drop.
//!
//! A trigger is a tagged variant implementing `listen(callback) → guard`:
//!
//! - `boot` fires once on registration;
//! - `always` loops the callback while registered (a tight restart loop;
//!   callers are expected to block inside the callback);
//! - `never` is inert;
//! - `every <d>` fires on a fixed cadence;
//! - `on <name>` / `once <name>` subscribe to a process-wide named event,
//!   `once` detaching itself before the first delivery;
//! - `any [t…]` fans out to child triggers and combines their guards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::events::{self, EventFn, EventGuard};
use crate::tag::Tag;

/// Callback fired by a trigger.
pub type TriggerFn = EventFn;

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub kind: String,
    pub id: String,
    pub spec: TriggerSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerSpec {
    Boot,
    Always,
    Never,
    Every(Duration),
    On(String),
    Once(String),
    Any(Vec<Trigger>),
}

/// Detaches the listener(s) when cancelled or dropped.
pub struct TriggerGuard {
    cancels: Vec<CancelKind>,
}

enum CancelKind {
    Flag(Arc<AtomicBool>),
    Event(EventGuard),
    Slot(Arc<Mutex<Option<EventGuard>>>),
    None,
}

impl TriggerGuard {
    fn none() -> TriggerGuard {
        TriggerGuard {
            cancels: vec![CancelKind::None],
        }
    }

    fn take(mut self) -> Vec<CancelKind> {
        std::mem::take(&mut self.cancels)
    }

    pub fn cancel(self) {}
}

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        for cancel in &mut self.cancels {
            match cancel {
                CancelKind::Flag(flag) => flag.store(true, Ordering::SeqCst),
                CancelKind::Slot(slot) => {
                    if let Some(guard) = slot.lock().unwrap().take() {
                        guard.remove();
                    }
                }
                // EventGuard detaches on drop.
                CancelKind::Event(_) | CancelKind::None => {}
            }
        }
    }
}

impl Trigger {
    pub fn label(&self) -> &str {
        if self.id.is_empty() {
            &self.kind
        } else {
            &self.id
        }
    }

    /// Install `callback` on this trigger. The returned guard detaches it.
    pub fn listen(&self, callback: TriggerFn) -> TriggerGuard {
        match &self.spec {
            TriggerSpec::Never => TriggerGuard::none(),
            TriggerSpec::Boot => {
                tokio::spawn(callback());
                TriggerGuard::none()
            }
            TriggerSpec::Always => {
                let done = Arc::new(AtomicBool::new(false));
                let flag = done.clone();
                tokio::spawn(async move {
                    while !flag.load(Ordering::SeqCst) {
                        callback().await;
                    }
                });
                TriggerGuard {
                    cancels: vec![CancelKind::Flag(done)],
                }
            }
            TriggerSpec::Every(period) => {
                let done = Arc::new(AtomicBool::new(false));
                let flag = done.clone();
                let period = *period;
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(period).await;
                        if flag.load(Ordering::SeqCst) {
                            return;
                        }
                        callback().await;
                    }
                });
                TriggerGuard {
                    cancels: vec![CancelKind::Flag(done)],
                }
            }
            TriggerSpec::On(name) => TriggerGuard {
                cancels: vec![CancelKind::Event(events::listen(name, callback))],
            },
            TriggerSpec::Once(name) => {
                let slot: Arc<Mutex<Option<EventGuard>>> = Arc::new(Mutex::new(None));
                let taken = slot.clone();
                let once: EventFn = Arc::new(move || -> BoxFuture<'static, ()> {
                    // Detach before delivering so re-signals are dropped.
                    if let Some(guard) = taken.lock().unwrap().take() {
                        guard.remove();
                        callback()
                    } else {
                        Box::pin(async {})
                    }
                });
                let guard = events::listen(name, once);
                *slot.lock().unwrap() = Some(guard);
                TriggerGuard {
                    cancels: vec![CancelKind::Slot(slot)],
                }
            }
            TriggerSpec::Any(list) => {
                let mut cancels = Vec::with_capacity(list.len());
                for trigger in list {
                    cancels.extend(trigger.listen(callback.clone()).take());
                }
                TriggerGuard { cancels }
            }
        }
    }

    fn from_tag(tag: Tag, payload: Value) -> Result<Trigger, String> {
        let spec = match tag.kind.as_str() {
            "boot" => TriggerSpec::Boot,
            "always" => TriggerSpec::Always,
            "never" => TriggerSpec::Never,
            "every" => {
                let duration = if !tag.inline.is_empty() {
                    gosu_types::timespan::parse(&tag.inline).map_err(|e| e.to_string())?
                } else {
                    #[derive(Deserialize)]
                    struct Payload {
                        #[serde(with = "gosu_types::timespan", default)]
                        duration: Duration,
                    }
                    serde_json::from_value::<Payload>(payload)
                        .map_err(|e| e.to_string())?
                        .duration
                };
                TriggerSpec::Every(duration)
            }
            "on" | "once" => {
                let name = if !tag.inline.is_empty() {
                    tag.inline.clone()
                } else {
                    #[derive(Deserialize, Default)]
                    #[serde(default)]
                    struct Payload {
                        name: String,
                    }
                    let parsed: Payload =
                        serde_json::from_value(payload).map_err(|e| e.to_string())?;
                    if parsed.name.is_empty() {
                        tag.id.clone()
                    } else {
                        parsed.name
                    }
                };
                if tag.kind == "on" {
                    TriggerSpec::On(name)
                } else {
                    TriggerSpec::Once(name)
                }
            }
            "any" | "many" => {
                #[derive(Deserialize, Default)]
                #[serde(default)]
                struct Payload {
                    list: Vec<Trigger>,
                }
                let parsed: Payload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
                TriggerSpec::Any(parsed.list)
            }
            other => return Err(format!("unknown trigger kind: {other}")),
        };
        Ok(Trigger {
            kind: tag.kind,
            id: tag.id,
            spec,
        })
    }

    pub(crate) fn from_value(value: Value) -> Result<Trigger, String> {
        match value {
            Value::String(text) => Trigger::from_tag(Tag::parse(&text), Value::Object(Default::default())),
            Value::Array(items) => {
                let list = items
                    .into_iter()
                    .map(Trigger::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Trigger {
                    kind: "many".into(),
                    id: String::new(),
                    spec: TriggerSpec::Any(list),
                })
            }
            Value::Object(map) => {
                let (key, payload) = map
                    .into_iter()
                    .next()
                    .ok_or_else(|| "empty trigger object".to_string())?;
                Trigger::from_tag(Tag::parse(&key), payload)
            }
            other => Err(format!("cannot parse trigger from {other}")),
        }
    }
}

impl Serialize for Trigger {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let header = if self.id.is_empty() {
            self.kind.clone()
        } else {
            format!("{}:{}", self.kind, self.id)
        };
        let payload = match &self.spec {
            TriggerSpec::Boot | TriggerSpec::Always | TriggerSpec::Never => {
                serde_json::json!({})
            }
            TriggerSpec::Every(d) => {
                serde_json::json!({ "duration": gosu_types::timespan::format(*d) })
            }
            TriggerSpec::On(name) | TriggerSpec::Once(name) => serde_json::json!({ "name": name }),
            TriggerSpec::Any(list) => serde_json::json!({ "list": list }),
        };
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&header, &payload)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Trigger {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Trigger::from_value(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicUsize>) -> TriggerFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn boot_fires_once() {
        let trigger: Trigger = serde_json::from_str("\"boot\"").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = trigger.listen(counting(hits.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_is_inert() {
        let trigger: Trigger = serde_json::from_str("\"never\"").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = trigger.listen(counting(hits.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_fires_on_cadence() {
        let trigger: Trigger = serde_json::from_str("\"every 10s\"").unwrap();
        assert_eq!(trigger.spec, TriggerSpec::Every(Duration::from_secs(10)));
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = trigger.listen(counting(hits.clone()));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        drop(guard);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn on_fires_per_signal() {
        let trigger: Trigger = serde_json::from_str("\"on trig-on\"").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = trigger.listen(counting(hits.clone()));
        events::signal("trig-on");
        events::signal("trig-on");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn once_detaches_after_first_delivery() {
        let trigger: Trigger = serde_json::from_str("\"once trig-once\"").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = trigger.listen(counting(hits.clone()));
        events::signal("trig-once");
        tokio::time::sleep(Duration::from_millis(50)).await;
        events::signal("trig-once");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_name_defaults_to_id() {
        let trigger: Trigger = serde_json::from_str("{\"once:trig-named\": {}}").unwrap();
        assert_eq!(trigger.spec, TriggerSpec::Once("trig-named".into()));
    }

    #[tokio::test]
    async fn array_desugars_to_any() {
        let trigger: Trigger = serde_json::from_str("[\"boot\", \"on trig-any\"]").unwrap();
        assert!(matches!(&trigger.spec, TriggerSpec::Any(list) if list.len() == 2));

        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = trigger.listen(counting(hits.clone()));
        events::signal("trig-any");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn serialize_round_trip() {
        let trigger: Trigger = serde_json::from_str("\"every 30s\"").unwrap();
        let json = serde_json::to_value(&trigger).unwrap();
        let back: Trigger = serde_json::from_value(json).unwrap();
        assert_eq!(back.spec, trigger.spec);
    }
}
