use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub last_modified_at: i64,
    #[serde(default)]
    pub last_modified_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub path: String,
    pub doc: PostDoc,
    #[serde(default)]
    pub meta: Meta,
}

impl Post {
    pub fn parent(&self) -> Option<&str> {
        self.doc.parent.as_deref().filter(|parent| !parent.is_empty())
    }

    pub fn created_at(&self) -> i64 {
        self.meta.created_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PostDoc {
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
    #[serde(default)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Smile,
    Frown,
    Like,
    Celebrate,
}

impl ReactionKind {
    pub const ALL: [ReactionKind; 4] = [
        ReactionKind::Smile,
        ReactionKind::Frown,
        ReactionKind::Like,
        ReactionKind::Celebrate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionKind::Smile => "smile",
            ReactionKind::Frown => "frown",
            ReactionKind::Like => "like",
            ReactionKind::Celebrate => "celebrate",
        }
    }
}

/// Usernames that reacted to a post, one set per reaction kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Reactions {
    #[serde(default)]
    pub smile: BTreeSet<String>,
    #[serde(default)]
    pub frown: BTreeSet<String>,
    #[serde(default)]
    pub like: BTreeSet<String>,
    #[serde(default)]
    pub celebrate: BTreeSet<String>,
}

impl Reactions {
    pub fn users(&self, kind: ReactionKind) -> &BTreeSet<String> {
        match kind {
            ReactionKind::Smile => &self.smile,
            ReactionKind::Frown => &self.frown,
            ReactionKind::Like => &self.like,
            ReactionKind::Celebrate => &self.celebrate,
        }
    }

    pub fn contains(&self, kind: ReactionKind, user: &str) -> bool {
        self.users(kind).contains(user)
    }

    pub fn count(&self, kind: ReactionKind) -> usize {
        self.users(kind).len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOp {
    Add,
    Remove,
}

impl ReactionOp {
    pub fn patch_op(&self) -> &'static str {
        match self {
            ReactionOp::Add => "ArrayAdd",
            ReactionOp::Remove => "ArrayRemove",
        }
    }
}

/// One operation of a document PATCH request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    pub value: Value,
}

impl PatchOp {
    pub fn init_reactions() -> Self {
        Self {
            op: "ObjectAdd".into(),
            path: "/reactions".into(),
            value: json!({ "smile": [], "frown": [], "like": [], "celebrate": [] }),
        }
    }

    pub fn toggle(op: ReactionOp, kind: ReactionKind, user: &str) -> Self {
        Self {
            op: op.patch_op().into(),
            path: format!("/reactions/{}", kind.as_str()),
            value: Value::String(user.to_string()),
        }
    }
}

/// Workspace or channel entry as returned by a collection fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub path: String,
    #[serde(default)]
    pub doc: Value,
    #[serde(default)]
    pub meta: Meta,
}

impl Listing {
    pub fn name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRef {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub msg: String,
    pub parent: Option<String>,
}

impl NewPost {
    pub fn new(msg: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            msg: msg.into(),
            parent,
        }
    }

    /// Document body with empty reaction sets and no extensions.
    pub fn into_doc(self) -> Value {
        let mut doc = json!({
            "msg": self.msg,
            "reactions": { "smile": [], "frown": [], "like": [], "celebrate": [] },
            "extensions": {},
        });
        if let Some(parent) = self.parent.filter(|parent| !parent.is_empty()) {
            doc["parent"] = Value::String(parent);
        }
        doc
    }
}

pub mod paths {
    pub fn workspace(name: &str) -> String {
        format!("/{}", name.trim_matches('/'))
    }

    pub fn workspaces() -> String {
        "/".to_string()
    }

    pub fn channels(workspace: &str) -> String {
        format!("{}/channels/", workspace.trim_end_matches('/'))
    }

    pub fn channel(workspace: &str, name: &str) -> String {
        format!("{}{}", channels(workspace), name.trim_matches('/'))
    }

    pub fn posts(channel: &str) -> String {
        format!("{}/posts/", channel.trim_end_matches('/'))
    }

    fn segments(path: &str) -> Vec<&str> {
        path.trim_matches('/').split('/').collect()
    }

    /// Workspace path owning a channel path, e.g. `/ws/channels/c` -> `/ws`.
    pub fn workspace_of(channel: &str) -> Option<String> {
        match segments(channel)[..] {
            [workspace, "channels", name, ..] if !workspace.is_empty() && !name.is_empty() => {
                Some(format!("/{workspace}"))
            }
            _ => None,
        }
    }

    /// Channel path owning a post path, e.g. `/ws/channels/c/posts/p` -> `/ws/channels/c`.
    pub fn channel_of(post: &str) -> Option<String> {
        match segments(post)[..] {
            [workspace, "channels", name, "posts", id]
                if !workspace.is_empty() && !name.is_empty() && !id.is_empty() =>
            {
                Some(format!("/{workspace}/channels/{name}"))
            }
            _ => None,
        }
    }
}
