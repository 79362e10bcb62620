//! Filters, updates and aggregation stages over JSON documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::ChunkRange;
use crate::error::{ShardError, ShardResult};
use crate::key::{lookup_path, Document, KeyValue, ShardKey, ShardKeyPattern, ID_FIELD};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Filter {
    All,
    Eq { field: String, value: Value },
    ShardKey(ShardKey),
    ShardKeyRange(ChunkRange),
    And(Vec<Filter>),
}

/// Part of the keyspace a filter can match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Key(ShardKey),
    Range(ChunkRange),
    Nothing,
}

impl Target {
    fn intersect(self, other: Target) -> Target {
        match (self, other) {
            (Target::Nothing, _) | (_, Target::Nothing) => Target::Nothing,
            (Target::All, t) | (t, Target::All) => t,
            (Target::Key(a), Target::Key(b)) => {
                if a == b {
                    Target::Key(a)
                } else {
                    Target::Nothing
                }
            }
            (Target::Key(k), Target::Range(r)) | (Target::Range(r), Target::Key(k)) => {
                if r.contains(&k) {
                    Target::Key(k)
                } else {
                    Target::Nothing
                }
            }
            (Target::Range(a), Target::Range(b)) => {
                let min = a.min.max(b.min);
                let max = a.max.min(b.max);
                match ChunkRange::new(min, max) {
                    Ok(r) => Target::Range(r),
                    Err(_) => Target::Nothing,
                }
            }
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Target::Nothing)
    }

    /// Whether a document with shard key `key` can fall in the target.
    pub fn admits(&self, key: &ShardKey) -> bool {
        match self {
            Target::All => true,
            Target::Key(k) => k == key,
            Target::Range(r) => r.contains(key),
            Target::Nothing => false,
        }
    }
}

fn check_width(pattern: &ShardKeyPattern, key: &ShardKey) -> ShardResult<()> {
    if key.width() != pattern.width() {
        return Err(ShardError::InvalidOptions(format!(
            "key {key} does not match shard key {pattern}"
        )));
    }
    Ok(())
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &Document, pattern: &ShardKeyPattern) -> ShardResult<bool> {
        Ok(match self {
            Filter::All => true,
            Filter::Eq { field, value } => match lookup_path(doc, field) {
                Some(found) => found == value,
                None => value.is_null(),
            },
            Filter::ShardKey(key) => pattern.extract(doc)? == *key,
            Filter::ShardKeyRange(range) => range.contains(&pattern.extract(doc)?),
            Filter::And(filters) => {
                for filter in filters {
                    if !filter.matches(doc, pattern)? {
                        return Ok(false);
                    }
                }
                true
            }
        })
    }

    /// Narrowest part of the keyspace of `pattern` this filter can match.
    pub fn target(&self, pattern: &ShardKeyPattern) -> ShardResult<Target> {
        match self {
            Filter::All => Ok(Target::All),
            Filter::ShardKey(key) => {
                check_width(pattern, key)?;
                Ok(Target::Key(key.clone()))
            }
            Filter::ShardKeyRange(range) => {
                check_width(pattern, &range.min)?;
                Ok(Target::Range(range.clone()))
            }
            Filter::Eq { .. } => Ok(key_from_equalities(pattern, &[self])
                .map(Target::Key)
                .unwrap_or(Target::All)),
            Filter::And(filters) => {
                let eqs: Vec<&Filter> = filters
                    .iter()
                    .filter(|f| matches!(f, Filter::Eq { .. }))
                    .collect();
                let mut acc = match key_from_equalities(pattern, &eqs) {
                    Some(key) => Target::Key(key),
                    None => Target::All,
                };
                for filter in filters {
                    acc = acc.intersect(filter.target(pattern)?);
                }
                Ok(acc)
            }
        }
    }

    /// Equality constraints that an upsert seeds its new document with.
    fn seed(&self, pattern: &ShardKeyPattern, doc: &mut Document) -> ShardResult<()> {
        match self {
            Filter::Eq { field, value } => set_path(doc, field, value.clone()),
            Filter::ShardKey(key) => {
                check_width(pattern, key)?;
                for (field, value) in pattern.fields().iter().zip(key.values()) {
                    set_path(doc, field, value.to_json())?;
                }
                Ok(())
            }
            Filter::And(filters) => {
                for filter in filters {
                    filter.seed(pattern, doc)?;
                }
                Ok(())
            }
            Filter::All | Filter::ShardKeyRange(_) => Ok(()),
        }
    }
}

fn key_from_equalities(pattern: &ShardKeyPattern, eqs: &[&Filter]) -> Option<ShardKey> {
    let mut values = Vec::with_capacity(pattern.width());
    for field in pattern.fields() {
        let value = eqs.iter().find_map(|f| match f {
            Filter::Eq { field: f_field, value } if f_field == field => Some(value),
            _ => None,
        })?;
        values.push(KeyValue::from_json(value).ok()?);
    }
    Some(ShardKey(values))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateOp {
    /// Set (possibly dotted) fields.
    Set(Document),
    Unset(Vec<String>),
    /// Replace everything except `_id`.
    Replace(Document),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub filter: Filter,
    pub op: UpdateOp,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub upsert: bool,
}

/// New image of `doc` after `op`. Changing `_id` or the shard key is refused.
pub fn apply_update(doc: &Document, op: &UpdateOp, pattern: &ShardKeyPattern) -> ShardResult<Document> {
    let mut next = match op {
        UpdateOp::Set(fields) => {
            let mut next = doc.clone();
            for (path, value) in fields {
                if path == ID_FIELD {
                    return Err(ShardError::IllegalOperation("_id is immutable".to_string()));
                }
                set_path(&mut next, path, value.clone())?;
            }
            next
        }
        UpdateOp::Unset(paths) => {
            let mut next = doc.clone();
            for path in paths {
                if path == ID_FIELD {
                    return Err(ShardError::IllegalOperation("_id is immutable".to_string()));
                }
                remove_path(&mut next, path);
            }
            next
        }
        UpdateOp::Replace(replacement) => {
            if let Some(id) = replacement.get(ID_FIELD) {
                if Some(id) != doc.get(ID_FIELD) {
                    return Err(ShardError::IllegalOperation("_id is immutable".to_string()));
                }
            }
            let mut next = Document::new();
            if let Some(id) = doc.get(ID_FIELD) {
                next.insert(ID_FIELD.to_string(), id.clone());
            }
            for (k, v) in replacement {
                if k != ID_FIELD {
                    next.insert(k.clone(), v.clone());
                }
            }
            next
        }
    };
    if pattern.extract(doc)? != pattern.extract(&next)? {
        return Err(ShardError::IllegalOperation(format!(
            "update would change the shard key {pattern}"
        )));
    }
    if next.get(ID_FIELD).is_none() {
        if let Some(id) = doc.get(ID_FIELD) {
            next.insert(ID_FIELD.to_string(), id.clone());
        }
    }
    Ok(next)
}

/// Document an upsert inserts when nothing matched.
pub fn upsert_document(spec: &UpdateSpec, pattern: &ShardKeyPattern) -> ShardResult<Document> {
    let mut doc = Document::new();
    spec.filter.seed(pattern, &mut doc)?;
    match &spec.op {
        UpdateOp::Set(fields) => {
            for (path, value) in fields {
                set_path(&mut doc, path, value.clone())?;
            }
        }
        UpdateOp::Unset(paths) => {
            for path in paths {
                remove_path(&mut doc, path);
            }
        }
        UpdateOp::Replace(replacement) => {
            let seeded_key = pattern.extract(&doc)?;
            for (k, v) in replacement {
                doc.insert(k.clone(), v.clone());
            }
            if pattern.extract(&doc)? != seeded_key {
                return Err(ShardError::IllegalOperation(
                    "upsert replacement disagrees with the queried shard key".to_string(),
                ));
            }
        }
    }
    if !doc.contains_key(ID_FIELD) {
        doc.insert(ID_FIELD.to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
    }
    Ok(doc)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> ShardResult<()> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return Ok(());
    };
    let mut current = doc;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        current = match entry {
            Value::Object(obj) => obj,
            _ => {
                return Err(ShardError::InvalidOptions(format!(
                    "cannot set {path}: {part} is not an object"
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = doc;
    for part in parts {
        current = match current.get_mut(part) {
            Some(Value::Object(obj)) => obj,
            _ => return,
        };
    }
    current.remove(last);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Match(Filter),
    /// Keep only these fields (and `_id`).
    Project(Vec<String>),
    Limit(usize),
    /// Replace the stream by one document `{<field>: count}`.
    Count(String),
}

/// Run `stages` over documents already gathered from the shards.
pub fn run_pipeline(
    mut docs: Vec<Document>,
    stages: &[Stage],
    pattern: &ShardKeyPattern,
) -> ShardResult<Vec<Document>> {
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if filter.matches(&doc, pattern)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            Stage::Project(fields) => docs
                .into_iter()
                .map(|doc| {
                    let mut out = Document::new();
                    if let Some(id) = doc.get(ID_FIELD) {
                        out.insert(ID_FIELD.to_string(), id.clone());
                    }
                    for field in fields {
                        if let Some(value) = lookup_path(&doc, field) {
                            // Dotted projections come back flattened under their path.
                            out.insert(field.clone(), value.clone());
                        }
                    }
                    out
                })
                .collect(),
            Stage::Limit(n) => {
                docs.truncate(*n);
                docs
            }
            Stage::Count(field) => {
                let mut out = Document::new();
                out.insert(field.clone(), Value::from(docs.len() as u64));
                vec![out]
            }
        };
    }
    Ok(docs)
}
