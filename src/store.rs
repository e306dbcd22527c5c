use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::feed::FeedEvent;
use crate::model::{DocumentRef, Meta, PatchOp};

/// Remote document database. Collection paths end with `/`.
pub trait DocumentStore: Send + Sync {
    fn fetch_collection(&self, path: &str, cancel: &CancelToken) -> Result<Vec<Value>, StoreError>;
    fn fetch_document(&self, path: &str) -> Result<Value, StoreError>;
    /// Fails with [`StoreError::Conflict`] when `path` already exists.
    fn create_document(&self, path: &str, body: &Value) -> Result<DocumentRef, StoreError>;
    fn create_collection(&self, path: &str) -> Result<DocumentRef, StoreError>;
    /// Stores `body` under a store-assigned name inside `collection`.
    fn append_document(&self, collection: &str, body: &Value) -> Result<DocumentRef, StoreError>;
    fn patch_document(&self, path: &str, ops: &[PatchOp]) -> Result<(), StoreError>;
    fn delete_document(&self, path: &str) -> Result<(), StoreError>;
}

pub trait LiveFeed: Send + Sync {
    /// Blocks, forwarding change notifications for `path`, until `cancel` fires
    /// or the feed ends. The server-side subscription is released on return.
    fn subscribe(
        &self,
        path: &str,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(FeedEvent),
    ) -> Result<(), StoreError>;
}

pub trait Session: Send + Sync {
    fn authenticate(&self, username: &str) -> Result<(), StoreError>;
    fn logout(&self) -> Result<(), StoreError>;
}

const FEED_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Stored {
    doc: Value,
    meta: Meta,
}

struct Subscriber {
    id: u64,
    prefix: String,
    tx: Sender<FeedEvent>,
}

#[derive(Default)]
struct MemoryState {
    docs: BTreeMap<String, Stored>,
    collections: BTreeSet<String>,
    clock: i64,
    next_name: u64,
    user: Option<String>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    #[cfg(test)]
    patch_log: Vec<(String, PatchOp)>,
}

impl MemoryState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn actor(&self) -> String {
        self.user.clone().unwrap_or_else(|| "anonymous".into())
    }

    fn envelope(path: &str, stored: &Stored) -> Value {
        json!({ "path": path, "doc": stored.doc, "meta": stored.meta })
    }

    fn collection_exists(&self, path: &str) -> bool {
        path == "/" || self.collections.contains(path)
    }

    fn insert(&mut self, path: &str, body: &Value) {
        let now = self.tick();
        let actor = self.actor();
        let stored = Stored {
            doc: body.clone(),
            meta: Meta {
                created_at: now,
                created_by: actor.clone(),
                last_modified_at: now,
                last_modified_by: actor,
            },
        };
        let event = FeedEvent::Update {
            path: path.to_string(),
            doc: Self::envelope(path, &stored),
        };
        self.docs.insert(path.to_string(), stored);
        self.notify(event);
    }

    fn notify(&mut self, event: FeedEvent) {
        self.subscribers.retain(|subscriber| {
            if !event.path().starts_with(&subscriber.prefix) {
                return true;
            }
            subscriber.tx.send(event.clone()).is_ok()
        });
    }
}

/// Owning collection of a document path, e.g. `/ws/channels/c` -> `/ws/channels/`.
fn parent_collection(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    }
}

/// In-process document store with the same semantics as the remote backend.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Every patch applied so far, oldest first.
    #[cfg(test)]
    pub fn patch_log(&self) -> Vec<(String, PatchOp)> {
        self.state.lock().patch_log.clone()
    }

    pub fn current_user(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    fn apply_patch(doc: &mut Value, patch: &PatchOp) -> Result<(), String> {
        let mut segments: Vec<&str> = patch
            .path
            .trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let last = segments.pop().ok_or("empty patch path")?;
        let mut target = doc;
        for segment in segments {
            target = target
                .get_mut(segment)
                .ok_or_else(|| format!("missing field {segment}"))?;
        }
        match patch.op.as_str() {
            "ObjectAdd" => {
                let object = target.as_object_mut().ok_or("target is not an object")?;
                object
                    .entry(last.to_string())
                    .or_insert_with(|| patch.value.clone());
            }
            "ArrayAdd" => {
                let array = target
                    .get_mut(last)
                    .and_then(Value::as_array_mut)
                    .ok_or_else(|| format!("{last} is not an array"))?;
                if !array.contains(&patch.value) {
                    array.push(patch.value.clone());
                }
            }
            "ArrayRemove" => {
                let array = target
                    .get_mut(last)
                    .and_then(Value::as_array_mut)
                    .ok_or_else(|| format!("{last} is not an array"))?;
                array.retain(|item| item != &patch.value);
            }
            other => return Err(format!("unsupported patch op {other}")),
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn fetch_collection(&self, path: &str, cancel: &CancelToken) -> Result<Vec<Value>, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Stale);
        }
        let state = self.state.lock();
        if !state.collection_exists(path) {
            return Err(StoreError::NotFound { path: path.into() });
        }
        Ok(state
            .docs
            .iter()
            .filter(|(doc_path, _)| {
                doc_path
                    .strip_prefix(path)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .map(|(doc_path, stored)| MemoryState::envelope(doc_path, stored))
            .collect())
    }

    fn fetch_document(&self, path: &str) -> Result<Value, StoreError> {
        let state = self.state.lock();
        state
            .docs
            .get(path)
            .map(|stored| MemoryState::envelope(path, stored))
            .ok_or_else(|| StoreError::NotFound { path: path.into() })
    }

    fn create_document(&self, path: &str, body: &Value) -> Result<DocumentRef, StoreError> {
        let mut state = self.state.lock();
        if !state.collection_exists(parent_collection(path)) {
            return Err(StoreError::NotFound { path: path.into() });
        }
        if state.docs.contains_key(path) {
            return Err(StoreError::Conflict { path: path.into() });
        }
        state.insert(path, body);
        Ok(DocumentRef { uri: path.into() })
    }

    fn create_collection(&self, path: &str) -> Result<DocumentRef, StoreError> {
        let mut state = self.state.lock();
        let collection = path.trim_end_matches('/');
        let owner = collection
            .rsplit_once('/')
            .map(|(doc, _)| doc)
            .unwrap_or_default();
        if !state.docs.contains_key(owner) {
            return Err(StoreError::NotFound { path: path.into() });
        }
        let uri = format!("{collection}/");
        if !state.collections.insert(uri.clone()) {
            return Err(StoreError::Conflict { path: path.into() });
        }
        Ok(DocumentRef { uri })
    }

    fn append_document(&self, collection: &str, body: &Value) -> Result<DocumentRef, StoreError> {
        let mut state = self.state.lock();
        if !state.collection_exists(collection) {
            return Err(StoreError::NotFound {
                path: collection.into(),
            });
        }
        state.next_name += 1;
        let path = format!("{collection}m{:06}", state.next_name);
        state.insert(&path, body);
        Ok(DocumentRef { uri: path })
    }

    fn patch_document(&self, path: &str, ops: &[PatchOp]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let stored = state
            .docs
            .get(path)
            .ok_or_else(|| StoreError::NotFound { path: path.into() })?;
        let mut doc = stored.doc.clone();
        for op in ops {
            Self::apply_patch(&mut doc, op).map_err(|reason| {
                debug!(path, reason = %reason, "patch rejected");
                StoreError::Conflict { path: path.into() }
            })?;
        }
        let now = state.tick();
        let actor = state.actor();
        #[cfg(test)]
        state
            .patch_log
            .extend(ops.iter().map(|op| (path.to_string(), op.clone())));
        let event = match state.docs.get_mut(path) {
            Some(stored) => {
                stored.doc = doc;
                stored.meta.last_modified_at = now;
                stored.meta.last_modified_by = actor;
                FeedEvent::Update {
                    path: path.to_string(),
                    doc: MemoryState::envelope(path, stored),
                }
            }
            None => return Err(StoreError::NotFound { path: path.into() }),
        };
        state.notify(event);
        Ok(())
    }

    fn delete_document(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.docs.remove(path).is_none() {
            return Err(StoreError::NotFound { path: path.into() });
        }
        let nested = format!("{path}/");
        state.docs.retain(|doc_path, _| !doc_path.starts_with(&nested));
        state
            .collections
            .retain(|collection| !collection.starts_with(&nested));
        state.notify(FeedEvent::Delete { path: path.into() });
        Ok(())
    }
}

impl LiveFeed for MemoryStore {
    fn subscribe(
        &self,
        path: &str,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(FeedEvent),
    ) -> Result<(), StoreError> {
        let (tx, rx) = unbounded();
        let id = {
            let mut state = self.state.lock();
            if !state.collection_exists(path) {
                return Err(StoreError::NotFound { path: path.into() });
            }
            state.next_subscriber += 1;
            let id = state.next_subscriber;
            state.subscribers.push(Subscriber {
                id,
                prefix: path.to_string(),
                tx,
            });
            id
        };

        while !cancel.is_cancelled() {
            match rx.recv_timeout(FEED_POLL_INTERVAL) {
                Ok(event) => on_event(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.state
            .lock()
            .subscribers
            .retain(|subscriber| subscriber.id != id);
        debug!(path, "memory feed released");
        Ok(())
    }
}

impl Session for MemoryStore {
    fn authenticate(&self, username: &str) -> Result<(), StoreError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::Unauthorized);
        }
        self.state.lock().user = Some(username.to_string());
        Ok(())
    }

    fn logout(&self) -> Result<(), StoreError> {
        match self.state.lock().user.take() {
            Some(_) => Ok(()),
            None => Err(StoreError::Unauthorized),
        }
    }
}
