use serde_json::Value;
use tracing::debug;

/// Change notification delivered by a live feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Update { path: String, doc: Value },
    Delete { path: String },
}

impl FeedEvent {
    pub fn path(&self) -> &str {
        match self {
            FeedEvent::Update { path, .. } | FeedEvent::Delete { path } => path,
        }
    }
}

/// Incremental parser for a `text/event-stream` body, fed one line at a time.
#[derive(Debug, Default)]
pub struct EventParser {
    event_name: Option<String>,
    data: String,
    last_event_id: Option<String>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Consumes one line; returns an event once a blank line completes it.
    pub fn push_line(&mut self, line: &str) -> Option<FeedEvent> {
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if let Some(value) = trimmed.strip_prefix("event:") {
            self.event_name = Some(value.trim().to_string());
        } else if let Some(value) = trimmed.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = trimmed.strip_prefix("id:") {
            self.last_event_id = Some(value.trim().to_string());
        } else if trimmed.is_empty() {
            return self.dispatch();
        }
        None
    }

    fn dispatch(&mut self) -> Option<FeedEvent> {
        let name = self.event_name.take();
        let data = std::mem::take(&mut self.data);
        let name = name?;
        if data.is_empty() {
            return None;
        }
        match name.as_str() {
            "delete" => Some(FeedEvent::Delete {
                path: data.trim().to_string(),
            }),
            "update" => match serde_json::from_str::<Value>(&data) {
                Ok(value) => {
                    let path = value
                        .get("path")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Some(FeedEvent::Update { path, doc: value })
                }
                Err(err) => {
                    debug!(error = %err, "ignoring malformed update event");
                    None
                }
            },
            other => {
                debug!(event = other, "ignoring unknown feed event");
                None
            }
        }
    }
}
