use std::fmt;

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::model::{Listing, Post};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Workspace,
    Channel,
    Post,
}

impl fmt::Display for DocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocKind::Workspace => "workspace",
            DocKind::Channel => "channel",
            DocKind::Post => "post",
        })
    }
}

static META_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "createdAt": { "type": "integer" },
            "createdBy": { "type": "string" },
            "lastModifiedAt": { "type": "integer" },
            "lastModifiedBy": { "type": "string" }
        },
        "required": ["createdAt", "createdBy", "lastModifiedAt", "lastModifiedBy"]
    })
});

static POST_SCHEMA: Lazy<Value> = Lazy::new(|| {
    let reaction_set = json!({ "type": "array", "items": { "type": "string" } });
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string" },
            "doc": {
                "type": "object",
                "properties": {
                    "msg": { "type": "string" },
                    "parent": { "type": "string" },
                    "reactions": {
                        "type": "object",
                        "properties": {
                            "smile": reaction_set,
                            "frown": reaction_set,
                            "like": reaction_set,
                            "celebrate": reaction_set
                        }
                    },
                    "extensions": { "type": "object" }
                },
                "required": ["msg"]
            },
            "meta": META_SCHEMA.clone()
        },
        "required": ["path", "doc", "meta"]
    })
});

static LISTING_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string" },
            "doc": { "type": "object" },
            "meta": META_SCHEMA.clone()
        },
        "required": ["path", "doc", "meta"]
    })
});

/// Checks remote documents against the shapes the client understands.
pub struct Validator {
    post: JSONSchema,
    listing: JSONSchema,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator").finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new() -> Result<Self, StoreError> {
        let post = JSONSchema::compile(&POST_SCHEMA)
            .map_err(|err| StoreError::validation(DocKind::Post, err))?;
        let listing = JSONSchema::compile(&LISTING_SCHEMA)
            .map_err(|err| StoreError::validation(DocKind::Workspace, err))?;
        Ok(Self { post, listing })
    }

    pub fn validate(&self, doc: &Value, kind: DocKind) -> Result<(), StoreError> {
        let schema = match kind {
            DocKind::Post => &self.post,
            DocKind::Workspace | DocKind::Channel => &self.listing,
        };
        if let Err(errors) = schema.validate(doc) {
            let reason = errors
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StoreError::validation(kind, reason));
        }
        Ok(())
    }

    pub fn decode_posts(&self, docs: Vec<Value>) -> Result<Vec<Post>, StoreError> {
        self.decode(docs, DocKind::Post)
    }

    pub fn decode_listings(
        &self,
        docs: Vec<Value>,
        kind: DocKind,
    ) -> Result<Vec<Listing>, StoreError> {
        self.decode(docs, kind)
    }

    pub fn decode_post(&self, doc: Value) -> Result<Post, StoreError> {
        self.validate(&doc, DocKind::Post)?;
        serde_json::from_value(doc).map_err(|err| StoreError::validation(DocKind::Post, err))
    }

    fn decode<T: DeserializeOwned>(
        &self,
        docs: Vec<Value>,
        kind: DocKind,
    ) -> Result<Vec<T>, StoreError> {
        docs.into_iter()
            .map(|doc| {
                self.validate(&doc, kind)?;
                serde_json::from_value(doc).map_err(|err| StoreError::validation(kind, err))
            })
            .collect()
    }
}
