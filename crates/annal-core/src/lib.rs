use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

/// Storage-layer version bookkeeping key stripped from every snapshot.
pub const VERSION_KEY: &str = "__v";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("metadata extractor `{key}` failed: {message}")]
    Metadata { key: String, message: String },
    #[error("history store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HistoryId(pub Ulid);

impl HistoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HistoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HistoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Remove,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// One immutable audit entry describing a single document mutation.
///
/// Serialized field names (`documentId`, `collectionName`, `modifiedBy`,
/// `additionalFields`) are a compatibility surface: downstream consumers read
/// the history collection directly, so they must never change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub history_id: HistoryId,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub operation: Operation,
    pub document: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_fields: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<Value>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Per-field diff outcome. `Removed` is the deletion sentinel; assembly
/// resolves it to JSON `null`, which keeps it distinct from "unchanged"
/// (the field is simply absent from the diff).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Set(Value),
    Removed,
}

pub type DiffFn =
    dyn Fn(&str, Option<&Value>, Option<&Value>) -> Option<FieldChange> + Send + Sync;

pub type MetadataFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
pub type SyncExtractorFn = dyn Fn(&Value, &Value) -> Value + Send + Sync;
pub type AsyncExtractorFn = dyn Fn(&Value, &Value) -> MetadataFuture + Send + Sync;

/// How one metadata key is produced. The variant is chosen at configuration
/// time; there is no runtime dispatch on function shape.
#[derive(Clone)]
pub enum MetadataSource {
    /// Copy a top-level field from the new document. Missing fields are
    /// omitted from the record rather than stored as null.
    Field(String),
    Sync(Arc<SyncExtractorFn>),
    Async(Arc<AsyncExtractorFn>),
}

#[derive(Clone)]
pub struct MetadataSpec {
    pub key: String,
    pub source: MetadataSource,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ActorTracking {
    /// Dotted path into the mutation context's value bag, e.g. `request.user`.
    pub context_path: String,
    /// Keys removed from a copy of the actor before it is embedded.
    pub blacklist: Vec<String>,
}

/// Index declaration forwarded verbatim to the history store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IndexSpec {
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Immutable per-collection tracking configuration.
#[derive(Clone)]
pub struct HistoryConfig {
    pub collection_name: String,
    pub custom_collection_name: Option<String>,
    pub include_collection_name: bool,
    pub diff_only: bool,
    pub custom_diff: Option<Arc<DiffFn>>,
    pub metadata: Vec<MetadataSpec>,
    pub modified_by: Option<ActorTracking>,
    pub indexes: Vec<IndexSpec>,
    pub id_field: String,
    pub timestamp_field: String,
}

impl HistoryConfig {
    #[must_use]
    pub fn new(collection_name: impl Into<String>) -> Self {
        Self {
            collection_name: collection_name.into(),
            custom_collection_name: None,
            include_collection_name: false,
            diff_only: false,
            custom_diff: None,
            metadata: Vec::new(),
            modified_by: None,
            indexes: Vec::new(),
            id_field: "_id".to_string(),
            timestamp_field: "updatedAt".to_string(),
        }
    }

    /// Resolved name of the history collection backing this configuration.
    #[must_use]
    pub fn history_collection_name(&self) -> String {
        self.custom_collection_name
            .clone()
            .unwrap_or_else(|| format!("{}_history", self.collection_name))
    }

    /// Validate the configuration against its structural invariants.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when a required name is blank.
    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.collection_name.trim().is_empty() {
            return Err(HistoryError::Configuration(
                "collection_name MUST be provided".to_string(),
            ));
        }
        if self.id_field.trim().is_empty() {
            return Err(HistoryError::Configuration("id_field MUST be provided".to_string()));
        }
        if self.timestamp_field.trim().is_empty() {
            return Err(HistoryError::Configuration(
                "timestamp_field MUST be provided".to_string(),
            ));
        }
        for spec in &self.metadata {
            if spec.key.trim().is_empty() {
                return Err(HistoryError::Configuration(
                    "metadata keys MUST be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Explicit request-scoped context threaded through every mutation call.
///
/// Replaces ambient per-request lookup state: the actor is found under a
/// configured path in `values`, with `fallback_actor` as the value captured
/// earlier on the document's read path.
#[derive(Debug, Clone, Default)]
pub struct MutationContext {
    values: Map<String, Value>,
    fallback_actor: Option<Value>,
    extra_fields: Option<Map<String, Value>>,
}

impl MutationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_fallback_actor(mut self, actor: Value) -> Self {
        self.fallback_actor = Some(actor);
        self
    }

    #[must_use]
    pub fn with_extra_fields(mut self, fields: Map<String, Value>) -> Self {
        self.extra_fields = Some(fields);
        self
    }

    /// Look up a value by dotted path, e.g. `request.user`.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = current.get(segment)?;
        }
        Some(current)
    }

    #[must_use]
    pub fn fallback_actor(&self) -> Option<&Value> {
        self.fallback_actor.as_ref()
    }

    #[must_use]
    pub fn extra_fields(&self) -> Option<&Map<String, Value>> {
        self.extra_fields.as_ref()
    }
}

/// Normalize a document for durable persistence.
///
/// Deep-copies through a JSON encode/decode round trip, drops the `__v`
/// bookkeeping key, and renames the first `$`-prefixed mapping key found in
/// a depth-first walk (leading `$` becomes `_`). Exactly one key is renamed
/// per call: a document carrying several reserved keys is only partially
/// sanitized. Callers relying on full `$` scrubbing must do it upstream.
///
/// # Errors
/// Returns [`HistoryError::Serialization`] when the value cannot round-trip
/// through its JSON encoding.
pub fn sanitize(value: &Value) -> Result<Value, HistoryError> {
    let encoded = serde_json::to_string(value)
        .map_err(|err| HistoryError::Serialization(err.to_string()))?;
    let mut copy: Value = serde_json::from_str(&encoded)
        .map_err(|err| HistoryError::Serialization(err.to_string()))?;

    if let Some(fields) = copy.as_object_mut() {
        fields.remove(VERSION_KEY);
    }
    rename_first_reserved_key(&mut copy);
    Ok(copy)
}

fn rename_first_reserved_key(value: &mut Value) -> bool {
    match value {
        Value::Object(fields) => {
            if fields.keys().any(|key| key.starts_with('$')) {
                let entries = std::mem::take(fields);
                let mut renamed = false;
                for (key, entry) in entries {
                    if !renamed && key.starts_with('$') {
                        let mut replacement = key;
                        replacement.replace_range(..1, "_");
                        fields.insert(replacement, entry);
                        renamed = true;
                    } else {
                        fields.insert(key, entry);
                    }
                }
                return true;
            }
            for entry in fields.values_mut() {
                if rename_first_reserved_key(entry) {
                    return true;
                }
            }
            false
        }
        Value::Array(items) => {
            for item in items {
                if rename_first_reserved_key(item) {
                    return true;
                }
            }
            false
        }
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_instant(value: &Value) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.as_str()?, &Rfc3339).ok()
}

/// Default per-field diff.
///
/// The designated auto-managed timestamp field is never reported. A field
/// that was truthy in the original and is absent or falsy in the new state
/// is reported as [`FieldChange::Removed`]. RFC 3339 strings compare as
/// instants, objects recurse into a structural diff of differing subfields,
/// and every other pair is reported only when unequal.
#[must_use]
pub fn default_field_diff(
    timestamp_field: &str,
    key: &str,
    new_value: Option<&Value>,
    original_value: Option<&Value>,
) -> Option<FieldChange> {
    if key == timestamp_field {
        return None;
    }

    if original_value.is_some_and(is_truthy) && !new_value.is_some_and(is_truthy) {
        return Some(FieldChange::Removed);
    }

    match (original_value, new_value) {
        (None, Some(value)) => Some(FieldChange::Set(value.clone())),
        (Some(original), Some(new)) => {
            if let (Some(original_at), Some(new_at)) = (as_instant(original), as_instant(new)) {
                if original_at == new_at {
                    None
                } else {
                    Some(FieldChange::Set(new.clone()))
                }
            } else if let (Some(original_fields), Some(new_fields)) =
                (original.as_object(), new.as_object())
            {
                let nested = structural_diff(timestamp_field, original_fields, new_fields);
                if nested.is_empty() {
                    None
                } else {
                    Some(FieldChange::Set(Value::Object(nested)))
                }
            } else if original == new {
                None
            } else {
                Some(FieldChange::Set(new.clone()))
            }
        }
        _ => None,
    }
}

fn union_keys<'a>(
    original: &'a Map<String, Value>,
    new: &'a Map<String, Value>,
) -> impl Iterator<Item = &'a String> {
    new.keys().chain(original.keys().filter(|key| !new.contains_key(key.as_str())))
}

fn structural_diff(
    timestamp_field: &str,
    original: &Map<String, Value>,
    new: &Map<String, Value>,
) -> Map<String, Value> {
    let mut changed = Map::new();
    for key in union_keys(original, new) {
        match default_field_diff(timestamp_field, key, new.get(key), original.get(key)) {
            Some(FieldChange::Set(value)) => {
                changed.insert(key.clone(), value);
            }
            Some(FieldChange::Removed) => {
                changed.insert(key.clone(), Value::Null);
            }
            None => {}
        }
    }
    changed
}

/// Assemble the diff object for a diff-only update.
///
/// The subject's identifier field is always present; every other entry is a
/// non-absent result of the configured per-field diff, with removals
/// resolved to JSON `null`. A configured `custom_diff` fully replaces the
/// default algorithm for all fields.
#[must_use]
pub fn diff_documents(config: &HistoryConfig, original: &Value, new: &Value) -> Value {
    let empty = Map::new();
    let original_fields = original.as_object().unwrap_or(&empty);
    let new_fields = new.as_object().unwrap_or(&empty);

    let mut diff = Map::new();
    if let Some(id) = new_fields
        .get(config.id_field.as_str())
        .or_else(|| original_fields.get(config.id_field.as_str()))
    {
        diff.insert(config.id_field.clone(), id.clone());
    }

    for key in union_keys(original_fields, new_fields) {
        if *key == config.id_field {
            continue;
        }
        let change = match &config.custom_diff {
            Some(field_diff) => field_diff(key, new_fields.get(key), original_fields.get(key)),
            None => default_field_diff(
                &config.timestamp_field,
                key,
                new_fields.get(key),
                original_fields.get(key),
            ),
        };
        match change {
            Some(FieldChange::Set(value)) => {
                diff.insert(key.clone(), value);
            }
            Some(FieldChange::Removed) => {
                diff.insert(key.clone(), Value::Null);
            }
            None => {}
        }
    }
    Value::Object(diff)
}

/// Resolve the acting identity for one mutation.
///
/// Reads the configured context path, falls back to the actor captured at
/// read time, and strips blacklisted keys from a copy. Returns `None` when
/// nothing resolves; a misconfigured path degrades to omission, never to an
/// error.
#[must_use]
pub fn resolve_actor(tracking: &ActorTracking, context: &MutationContext) -> Option<Value> {
    let mut actor = context
        .lookup(&tracking.context_path)
        .cloned()
        .or_else(|| context.fallback_actor().cloned())?;
    if let Some(fields) = actor.as_object_mut() {
        for key in &tracking.blacklist {
            fields.remove(key.as_str());
        }
    }
    Some(actor)
}

/// Run every configured metadata extractor against `(original, new)`.
///
/// Extractors are independent of each other: none observes another's output.
/// The first failing asynchronous extractor aborts resolution immediately;
/// extractors after it never run.
///
/// # Errors
/// Returns [`HistoryError::Metadata`] carrying the failing extractor's key.
pub async fn resolve_metadata(
    specs: &[MetadataSpec],
    original: &Value,
    new: &Value,
) -> Result<Map<String, Value>, HistoryError> {
    let mut resolved = Map::new();
    for spec in specs {
        let value = match &spec.source {
            MetadataSource::Field(field) => new.get(field.as_str()).cloned(),
            MetadataSource::Sync(extract) => Some(extract(original, new)),
            MetadataSource::Async(extract) => match extract(original, new).await {
                Ok(value) => Some(value),
                Err(message) => {
                    return Err(HistoryError::Metadata { key: spec.key.clone(), message })
                }
            },
        };
        if let Some(value) = value {
            resolved.insert(spec.key.clone(), value);
        }
    }
    Ok(resolved)
}

fn object_or_empty(value: &Value) -> Value {
    if value.is_object() {
        value.clone()
    } else {
        Value::Object(Map::new())
    }
}

fn object_is_empty(value: &Value) -> bool {
    !value.as_object().is_some_and(|fields| !fields.is_empty())
}

fn derive_document_id(config: &HistoryConfig, document: &Value, diff: Option<&Value>) -> Option<String> {
    let id = document
        .get(config.id_field.as_str())
        .filter(|value| !value.is_null())
        .or_else(|| {
            diff.and_then(|diff| diff.get(config.id_field.as_str()))
                .filter(|value| !value.is_null())
        })?;
    match id {
        Value::String(text) => Some(text.clone()),
        // A composite identifier (typically a query fragment used in place of
        // a scalar id) serializes to its canonical JSON text.
        other => serde_json::to_string(other).ok(),
    }
}

/// Build the canonical history record for one mutation.
///
/// `changed_or_new` is the computed diff for diff-only updates and the full
/// new state otherwise. Missing inputs default to empty mappings, both pass
/// through [`sanitize`], and the record's `document` holds the prior state
/// when one exists, falling back to the changed state (the insert path has
/// no prior state).
///
/// # Errors
/// Returns [`HistoryError::Configuration`] for invalid configuration,
/// [`HistoryError::Serialization`] when a snapshot cannot round-trip, or
/// [`HistoryError::Metadata`] when an extractor fails.
pub async fn build_record(
    config: &HistoryConfig,
    original: &Value,
    changed_or_new: &Value,
    operation: Operation,
    context: &MutationContext,
) -> Result<HistoryRecord, HistoryError> {
    config.validate()?;

    let original = sanitize(&object_or_empty(original))?;
    let changed = sanitize(&object_or_empty(changed_or_new))?;

    let document = if object_is_empty(&original) { changed.clone() } else { original.clone() };
    let diff = if object_is_empty(&changed) { None } else { Some(changed.clone()) };

    let document_id = derive_document_id(config, &document, diff.as_ref());
    let collection_name = config.include_collection_name.then(|| config.collection_name.clone());
    let modified_by =
        config.modified_by.as_ref().and_then(|tracking| resolve_actor(tracking, context));
    let metadata = resolve_metadata(&config.metadata, &original, &changed).await?;

    Ok(HistoryRecord {
        history_id: HistoryId::new(),
        date: OffsetDateTime::now_utc(),
        operation,
        document,
        diff,
        additional_fields: context.extra_fields().cloned(),
        document_id,
        collection_name,
        modified_by,
        metadata,
    })
}

/// Durable append-only destination for history records.
///
/// No update or upsert path exists: records are immutable once appended, and
/// `clear` is the only deletion, reserved for explicit maintenance.
pub trait HistoryStore {
    /// Append one record.
    ///
    /// # Errors
    /// Returns [`HistoryError::Store`] when the underlying write fails.
    fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError>;

    /// Delete every record in the target collection; returns the count.
    ///
    /// # Errors
    /// Returns [`HistoryError::Store`] when the underlying delete fails.
    fn clear(&self) -> Result<u64, HistoryError>;
}

impl<S: HistoryStore + ?Sized> HistoryStore for Arc<S> {
    fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        (**self).append(record)
    }

    fn clear(&self) -> Result<u64, HistoryError> {
        (**self).clear()
    }
}

/// The two shapes an update arrives in, normalized to one `(original, new)`
/// pair by shape-specific logic rather than generic field poking.
#[derive(Debug, Clone)]
pub enum UpdateSource {
    /// Update through an already-loaded instance: the pre-update snapshot
    /// and the instance's live state.
    Instance { original: Value, current: Value },
    /// Partial patch against a single matched document. `original` is the
    /// pre-update snapshot captured at read time (empty when none was
    /// captured), `filter` the matching query, `changes` the patch fields.
    Patch { original: Value, filter: Value, changes: Value },
}

impl UpdateSource {
    fn normalize(self, config: &HistoryConfig) -> (Value, Value) {
        match self {
            Self::Instance { original, current } => (original, current),
            Self::Patch { original, filter, changes } => {
                let mut merged = original.as_object().cloned().unwrap_or_default();
                if let Some(change_fields) = changes.as_object() {
                    for (key, value) in change_fields {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                if !merged.contains_key(config.id_field.as_str()) {
                    if let Some(id) = filter.get(config.id_field.as_str()) {
                        merged.insert(config.id_field.clone(), id.clone());
                    }
                }
                (original, Value::Object(merged))
            }
        }
    }
}

/// Lifecycle orchestration: derives one history record per mutation and
/// appends it before the mutation is allowed to complete. A failed append
/// fails the mutation; there is no best-effort mode.
pub struct HistoryTracker<S> {
    config: HistoryConfig,
    store: S,
}

impl<S: HistoryStore> HistoryTracker<S> {
    #[must_use]
    pub fn new(config: HistoryConfig, store: S) -> Self {
        Self { config, store }
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Store handle backing this tracker's history collection.
    #[must_use]
    pub fn history_model(&self) -> &S {
        &self.store
    }

    /// Record a newly created document. The full new state is stored
    /// verbatim; diff-only mode applies to updates alone.
    ///
    /// # Errors
    /// Propagates record construction and store failures; the insert must be
    /// treated as failed when this fails.
    pub async fn record_insert(
        &self,
        document: &Value,
        context: &MutationContext,
    ) -> Result<HistoryRecord, HistoryError> {
        let original = Value::Object(Map::new());
        self.record(&original, document, Operation::Insert, context).await
    }

    /// Record an update. Computes a per-field diff only when diff-only mode
    /// is configured; otherwise the full new state is stored as the diff.
    ///
    /// # Errors
    /// Propagates record construction and store failures; the update must be
    /// treated as failed when this fails.
    pub async fn record_update(
        &self,
        source: UpdateSource,
        context: &MutationContext,
    ) -> Result<HistoryRecord, HistoryError> {
        let (original, new) = source.normalize(&self.config);
        let changed = if self.config.diff_only {
            diff_documents(&self.config, &original, &new)
        } else {
            new
        };
        self.record(&original, &changed, Operation::Update, context).await
    }

    /// Record a removal. There is no post-state: the pre-deletion snapshot
    /// serves as both original and new.
    ///
    /// # Errors
    /// Propagates record construction and store failures; the removal must
    /// be treated as failed when this fails.
    pub async fn record_remove(
        &self,
        document: &Value,
        context: &MutationContext,
    ) -> Result<HistoryRecord, HistoryError> {
        self.record(document, document, Operation::Remove, context).await
    }

    /// Truncate this tracker's history collection.
    ///
    /// # Errors
    /// Returns [`HistoryError::Store`] when the underlying delete fails.
    pub fn clear_history(&self) -> Result<u64, HistoryError> {
        self.store.clear()
    }

    async fn record(
        &self,
        original: &Value,
        changed_or_new: &Value,
        operation: Operation,
        context: &MutationContext,
    ) -> Result<HistoryRecord, HistoryError> {
        let record = build_record(&self.config, original, changed_or_new, operation, context).await?;
        self.store.append(&record)?;
        Ok(record)
    }
}
