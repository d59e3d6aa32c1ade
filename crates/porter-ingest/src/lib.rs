//! Generic API-record-to-entity ingestion engine.
//!
//! Takes an arbitrary nested JSON record, a target entity kind, and a
//! page-fetch capability, and walks the record into persisted entities:
//! per-field type coercion against the declared schema, child-collection
//! recursion, cross-reference resolution scoped to the current run, and
//! token- or index-based pagination until the result set is exhausted.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use porter_core::{BlobValue, Entity, EntityKey, FieldValue, KeyId, Kind, PropertyKind, SchemaRegistry};
use porter_storage::{sha256_hex, EntityStore, FetchError, HttpFetcher, StoreError};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "porter-ingest";

/// API-level type/versioning fields that are never mapped onto entities.
const EXCLUDED_FIELDS: &[&str] = &["kind", "etag"];

/// Source field names that collide with reserved identifiers; they get a
/// trailing marker when mapped onto the schema.
const RESERVED_WORDS: &[&str] = &["parent"];

/// Fixed arguments passed to each page fetch; the pagination driver adds the
/// continuation token or start offset on top.
pub type PageArgs = JsonMap<String, JsonValue>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no property named `{field}` on kind {kind}")]
    UnknownField { kind: Kind, field: String },
    #[error("no decode rule for property kind `{tag}` (field `{field}`)")]
    UnsupportedKind { field: String, tag: &'static str },
    #[error("invalid value for field `{field}`: {detail}")]
    InvalidValue { field: String, detail: String },
    #[error("malformed page payload: {0}")]
    MalformedPage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Wire encoding of date-time property values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateEncoding {
    /// `"YYYY-MM-DDTHH:MM:SS.mmm..."`, fractional digits truncated to
    /// millisecond precision.
    #[default]
    Friendly,
    /// Unix epoch milliseconds as a decimal string.
    Timestamp,
}

impl FromStr for DateEncoding {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "friendly" => Ok(DateEncoding::Friendly),
            "timestamp" => Ok(DateEncoding::Timestamp),
            other => Err(IngestError::Config(format!(
                "not a valid date encoding: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
    /// Server returns a continuation token on every non-terminal page.
    #[default]
    Token,
    /// Client re-issues the fetch with the count of records consumed so far.
    Index,
}

/// Page-fetch capability supplied by the caller.
#[async_trait]
pub trait PageFetch: Send + Sync {
    async fn fetch(&self, args: &PageArgs) -> Result<JsonValue, FetchError>;
}

/// Byte-fetch capability used by the blob coercion rule. Coercing a blob
/// property performs a remote fetch as an explicit side effect; keeping the
/// capability behind this trait lets tests substitute canned bytes.
#[async_trait]
pub trait BlobFetch: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl BlobFetch for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.get_bytes(url).await
    }
}

/// Everything field coercion needs besides the raw value: the run root for
/// reference scoping, the owning kind and source field name for the schema
/// lookup tables, and the blob-fetch capability.
pub struct CoercionContext<'a> {
    pub run_root: &'a EntityKey,
    pub owner: Kind,
    pub source_field: &'a str,
    pub schema: &'a SchemaRegistry,
    pub date_encoding: DateEncoding,
    pub blobs: &'a dyn BlobFetch,
}

fn invalid(field: &str, detail: impl Into<String>) -> IngestError {
    IngestError::InvalidValue {
        field: field.to_string(),
        detail: detail.into(),
    }
}

fn reference_id(field: &str, raw: &JsonValue) -> Result<KeyId, IngestError> {
    match raw {
        JsonValue::String(s) => Ok(KeyId::Name(s.clone())),
        JsonValue::Number(n) => n
            .as_u64()
            .map(KeyId::Numeric)
            .ok_or_else(|| invalid(field, "reference id is not a string or unsigned integer")),
        _ => Err(invalid(field, "reference id is not a string or unsigned integer")),
    }
}

fn parse_friendly_datetime(field: &str, raw: &str) -> Result<DateTime<Utc>, IngestError> {
    let (whole, frac) = raw
        .split_once('.')
        .ok_or_else(|| invalid(field, "date-time lacks a fractional-seconds part"))?;
    let naive = NaiveDateTime::parse_from_str(whole, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| invalid(field, format!("unparseable date-time `{raw}`: {e}")))?;
    let millis: u32 = frac
        .get(..frac.len().min(3))
        .ok_or_else(|| invalid(field, format!("unparseable fractional seconds in `{raw}`")))?
        .parse()
        .map_err(|_| invalid(field, format!("unparseable fractional seconds in `{raw}`")))?;
    let naive = naive
        .with_nanosecond(millis * 1_000_000)
        .ok_or_else(|| invalid(field, "fractional seconds out of range"))?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn parse_timestamp_datetime(field: &str, raw: &JsonValue) -> Result<DateTime<Utc>, IngestError> {
    let text = match raw {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        _ => return Err(invalid(field, "timestamp is not a string or number")),
    };
    if text.len() <= 3 {
        return Err(invalid(field, format!("timestamp `{text}` is too short")));
    }
    let (secs_part, millis_part) = text.split_at(text.len() - 3);
    let secs: i64 = secs_part
        .parse()
        .map_err(|_| invalid(field, format!("unparseable timestamp `{text}`")))?;
    let millis: u32 = millis_part
        .parse()
        .map_err(|_| invalid(field, format!("unparseable timestamp `{text}`")))?;
    DateTime::from_timestamp(secs, millis * 1_000_000)
        .ok_or_else(|| invalid(field, format!("timestamp `{text}` out of range")))
}

/// Decodes one raw field value according to its declared property kind.
pub async fn coerce(
    kind: PropertyKind,
    field: &str,
    raw: &JsonValue,
    ctx: &CoercionContext<'_>,
) -> Result<FieldValue, IngestError> {
    match kind {
        PropertyKind::Text | PropertyKind::LongText => raw
            .as_str()
            .map(|s| FieldValue::Text(s.to_string()))
            .ok_or_else(|| invalid(field, "expected a string")),
        PropertyKind::Integer => raw
            .as_i64()
            .map(FieldValue::Integer)
            .ok_or_else(|| invalid(field, "expected an integer")),
        PropertyKind::Bool => raw
            .as_bool()
            .map(FieldValue::Bool)
            .ok_or_else(|| invalid(field, "expected a boolean")),
        PropertyKind::Float => match raw {
            JsonValue::Number(n) => n
                .as_f64()
                .map(FieldValue::Float)
                .ok_or_else(|| invalid(field, "expected a number")),
            JsonValue::String(s) => s
                .parse()
                .map(FieldValue::Float)
                .map_err(|_| invalid(field, format!("unparseable number `{s}`"))),
            _ => Err(invalid(field, "expected a number")),
        },
        PropertyKind::Link => {
            let url = raw.as_str().ok_or_else(|| invalid(field, "expected a URL string"))?;
            if url.starts_with("http://") || url.starts_with("https://") {
                Ok(FieldValue::Link(url.to_string()))
            } else {
                Err(invalid(field, format!("not an absolute http(s) URL: `{url}`")))
            }
        }
        PropertyKind::Blob => {
            let url = raw.as_str().ok_or_else(|| invalid(field, "expected a URL string"))?;
            let bytes = ctx.blobs.fetch_bytes(url).await?;
            let sha256 = sha256_hex(&bytes);
            Ok(FieldValue::Blob(BlobValue { bytes, sha256 }))
        }
        PropertyKind::Date => {
            let text = raw.as_str().ok_or_else(|| invalid(field, "expected a date string"))?;
            NaiveDate::parse_from_str(text, "%Y-%m-%dT00:00:00.000Z")
                .map(FieldValue::Date)
                .map_err(|e| invalid(field, format!("unparseable date `{text}`: {e}")))
        }
        PropertyKind::DateTime => match ctx.date_encoding {
            DateEncoding::Friendly => {
                let text = raw
                    .as_str()
                    .ok_or_else(|| invalid(field, "expected a date-time string"))?;
                parse_friendly_datetime(field, text).map(FieldValue::DateTime)
            }
            DateEncoding::Timestamp => parse_timestamp_datetime(field, raw).map(FieldValue::DateTime),
        },
        PropertyKind::Reference(referenced) => {
            let id = reference_id(field, raw)?;
            Ok(FieldValue::Key(ctx.run_root.child(referenced, id)))
        }
        PropertyKind::KeyList => {
            let referenced = ctx
                .schema
                .referenced_kind(ctx.owner, ctx.source_field)
                .ok_or_else(|| {
                    IngestError::Config(format!(
                        "no many-to-many mapping for ({}, {})",
                        ctx.owner, ctx.source_field
                    ))
                })?;
            let elements = raw.as_array().ok_or_else(|| invalid(field, "expected an array"))?;
            let mut keys = Vec::with_capacity(elements.len());
            for element in elements {
                let id = reference_id(field, element)?;
                keys.push(ctx.run_root.child(referenced, id));
            }
            Ok(FieldValue::KeyList(keys))
        }
        PropertyKind::TextList => {
            let elements = raw.as_array().ok_or_else(|| invalid(field, "expected an array"))?;
            let mut texts = Vec::with_capacity(elements.len());
            for element in elements {
                let text = element
                    .as_str()
                    .ok_or_else(|| invalid(field, "expected an array of strings"))?;
                texts.push(text.to_string());
            }
            Ok(FieldValue::TextList(texts))
        }
        PropertyKind::Duration => {
            let millis = match raw {
                JsonValue::Number(n) => n.as_i64(),
                JsonValue::String(s) => s.parse().ok(),
                _ => None,
            }
            .ok_or_else(|| invalid(field, "expected integer milliseconds"))?;
            if millis < 0 {
                return Err(invalid(field, "negative duration"));
            }
            let millis = millis as u64;
            Ok(FieldValue::Duration(std::time::Duration::new(
                millis / 1000,
                (millis % 1000) as u32 * 1_000_000,
            )))
        }
        PropertyKind::Map => raw
            .as_object()
            .map(|map| FieldValue::Map(map.clone()))
            .ok_or_else(|| invalid(field, "expected an object")),
        PropertyKind::Custom(tag) => Err(IngestError::UnsupportedKind {
            field: field.to_string(),
            tag,
        }),
    }
}

fn normalize_field_name(name: &str) -> String {
    if RESERVED_WORDS.contains(&name) {
        format!("{name}_")
    } else {
        name.to_string()
    }
}

fn json_id_string(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn payload_exhausted(page: &JsonValue) -> bool {
    match page {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !*b,
        JsonValue::Number(_) => false,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
    }
}

type BuildFuture<'s> = Pin<Box<dyn Future<Output = Result<Entity, IngestError>> + Send + 's>>;

/// Drives one ingestion: dispatches a decoded payload to the right paging
/// strategy and builds one persisted entity per record.
pub struct Ingestor<'a> {
    target: Kind,
    run_root: EntityKey,
    schema: &'a SchemaRegistry,
    store: &'a dyn EntityStore,
    fetch: &'a dyn PageFetch,
    blobs: &'a dyn BlobFetch,
    parent: Option<EntityKey>,
    date_encoding: DateEncoding,
    paging: PagingMode,
    base_args: PageArgs,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        target: Kind,
        run_root: EntityKey,
        schema: &'a SchemaRegistry,
        store: &'a dyn EntityStore,
        fetch: &'a dyn PageFetch,
        blobs: &'a dyn BlobFetch,
    ) -> Self {
        Self {
            target,
            run_root,
            schema,
            store,
            fetch,
            blobs,
            parent: None,
            date_encoding: DateEncoding::default(),
            paging: PagingMode::default(),
            base_args: PageArgs::new(),
        }
    }

    /// Weak parent reference recorded on every top-level entity built.
    pub fn with_parent(mut self, parent: EntityKey) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_date_encoding(mut self, encoding: DateEncoding) -> Self {
        self.date_encoding = encoding;
        self
    }

    pub fn with_paging(mut self, paging: PagingMode) -> Self {
        self.paging = paging;
        self
    }

    /// Fixed arguments repeated on every page fetch.
    pub fn with_base_args(mut self, args: PageArgs) -> Self {
        self.base_args = args;
        self
    }

    /// Entry point: builds every record reachable from `payload`, paging
    /// through the remote result set as needed, and returns the top-level
    /// entities in server order.
    pub async fn ingest(&self, payload: JsonValue) -> Result<Vec<Entity>, IngestError> {
        let single_record = !payload.is_array()
            && payload.get("items").is_none()
            && payload.get("entry").is_none();
        if single_record {
            let record = payload.as_object().ok_or_else(|| {
                IngestError::MalformedPage("top-level payload is neither an object nor an array".to_string())
            })?;
            let entity = self
                .build_record(record, self.target, self.parent.as_ref())
                .await?;
            return Ok(vec![entity]);
        }

        match self.paging {
            PagingMode::Token => self.ingest_token_paged(payload).await,
            PagingMode::Index => self.ingest_index_paged(payload).await,
        }
    }

    async fn ingest_token_paged(&self, mut page: JsonValue) -> Result<Vec<Entity>, IngestError> {
        let mut results = Vec::new();
        loop {
            let token = page
                .get("nextPageToken")
                .and_then(JsonValue::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            results.extend(self.ingest_page(&page).await?);
            let Some(token) = token else { break };
            let mut args = self.base_args.clone();
            args.insert("pageToken".to_string(), JsonValue::String(token));
            page = self.fetch.fetch(&args).await?;
        }
        Ok(results)
    }

    async fn ingest_index_paged(&self, mut page: JsonValue) -> Result<Vec<Entity>, IngestError> {
        let mut results = Vec::new();
        while !payload_exhausted(&page) {
            results.extend(self.ingest_page(&page).await?);
            let mut args = self.base_args.clone();
            args.insert("startIndex".to_string(), JsonValue::from(results.len() as u64));
            page = self.fetch.fetch(&args).await?;
        }
        Ok(results)
    }

    async fn ingest_page(&self, page: &JsonValue) -> Result<Vec<Entity>, IngestError> {
        let records = if let Some(items) = page.get("items") {
            items.as_array()
        } else if let Some(entry) = page.get("entry") {
            entry.as_array()
        } else {
            page.as_array()
        }
        .ok_or_else(|| {
            IngestError::MalformedPage("page exposes no items, entry, or array collection".to_string())
        })?;

        let mut built = Vec::with_capacity(records.len());
        for record in records {
            let object = record
                .as_object()
                .ok_or_else(|| IngestError::MalformedPage("page record is not an object".to_string()))?;
            built.push(
                self.build_record(object, self.target, self.parent.as_ref())
                    .await?,
            );
        }
        Ok(built)
    }

    /// Builds and persists one entity from a raw record, recursing into
    /// declared child collections.
    ///
    /// The entity is saved once right after key creation so that children and
    /// self-scoped references have a valid anchor, and again after all fields
    /// are applied.
    pub fn build_record<'s>(
        &'s self,
        record: &'s JsonMap<String, JsonValue>,
        target: Kind,
        parent: Option<&'s EntityKey>,
    ) -> BuildFuture<'s> {
        Box::pin(async move {
            let local_key = record.get("id").map(json_id_string);
            if local_key.is_none() {
                warn!(kind = %target, "record has no id field; allocating a generated key");
            }
            let mut entity = self.store.create(target, Some(&self.run_root), local_key)?;
            self.store.save(&entity)?;

            if let Some(parent) = parent {
                entity.parent_ref = Some(parent.clone());
            }

            for (name, value) in record {
                if EXCLUDED_FIELDS.contains(&name.as_str()) {
                    continue;
                }

                if let Some(child_kind) = self.schema.child_kind(target, name) {
                    let elements = value.as_array().ok_or_else(|| {
                        invalid(name, "child collection is not an array")
                    })?;
                    for element in elements {
                        let child = element.as_object().ok_or_else(|| {
                            invalid(name, "child record is not an object")
                        })?;
                        self.build_record(child, child_kind, Some(&entity.key)).await?;
                    }
                    continue;
                }

                let prop_name = normalize_field_name(name);
                let Some(prop_kind) = self.schema.property(target, &prop_name) else {
                    return Err(IngestError::UnknownField {
                        kind: target,
                        field: prop_name,
                    });
                };
                let ctx = CoercionContext {
                    run_root: &self.run_root,
                    owner: target,
                    source_field: name,
                    schema: self.schema,
                    date_encoding: self.date_encoding,
                    blobs: self.blobs,
                };
                let coerced = coerce(prop_kind, &prop_name, value, &ctx).await?;
                entity.fields.insert(prop_name, coerced);
            }

            self.store.save(&entity)?;
            Ok(entity)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_storage::MemoryStore;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct NoBlobs;

    #[async_trait]
    impl BlobFetch for NoBlobs {
        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::HttpStatus {
                status: 599,
                url: url.to_string(),
            })
        }
    }

    struct StaticBlobs(Vec<u8>);

    #[async_trait]
    impl BlobFetch for StaticBlobs {
        async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct ScriptedPages {
        responses: Mutex<VecDeque<JsonValue>>,
        calls: Mutex<Vec<PageArgs>>,
    }

    impl ScriptedPages {
        fn new(responses: Vec<JsonValue>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<PageArgs> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetch for ScriptedPages {
        async fn fetch(&self, args: &PageArgs) -> Result<JsonValue, FetchError> {
            self.calls.lock().unwrap().push(args.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(FetchError::HttpStatus {
                    status: 599,
                    url: "scripted".to_string(),
                })
        }
    }

    fn run_root() -> EntityKey {
        EntityKey::root(Kind::Snapshot, KeyId::Numeric(1))
    }

    fn ctx<'a>(
        root: &'a EntityKey,
        schema: &'a SchemaRegistry,
        blobs: &'a dyn BlobFetch,
        encoding: DateEncoding,
    ) -> CoercionContext<'a> {
        CoercionContext {
            run_root: root,
            owner: Kind::Task,
            source_field: "links",
            schema,
            date_encoding: encoding,
            blobs,
        }
    }

    #[tokio::test]
    async fn date_coercion_round_trips_the_wire_literal() {
        let root = run_root();
        let schema = SchemaRegistry::tasks();
        let ctx = ctx(&root, &schema, &NoBlobs, DateEncoding::Friendly);

        let value = coerce(PropertyKind::Date, "due", &json!("2012-03-04T00:00:00.000Z"), &ctx)
            .await
            .unwrap();
        let date = match value {
            FieldValue::Date(d) => d,
            other => panic!("expected a date, got {other:?}"),
        };
        assert_eq!(date, NaiveDate::from_ymd_opt(2012, 3, 4).unwrap());
        assert_eq!(
            date.format("%Y-%m-%dT00:00:00.000Z").to_string(),
            "2012-03-04T00:00:00.000Z"
        );
    }

    #[tokio::test]
    async fn friendly_datetime_truncates_to_milliseconds() {
        let root = run_root();
        let schema = SchemaRegistry::tasks();
        let ctx = ctx(&root, &schema, &NoBlobs, DateEncoding::Friendly);

        let value = coerce(
            PropertyKind::DateTime,
            "updated",
            &json!("2012-03-04T10:20:30.123456"),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(
            value,
            FieldValue::DateTime(Utc.with_ymd_and_hms(2012, 3, 4, 10, 20, 30).single().unwrap()
                + chrono::Duration::milliseconds(123))
        );
    }

    #[tokio::test]
    async fn timestamp_datetime_splits_whole_seconds_and_millis() {
        let root = run_root();
        let schema = SchemaRegistry::tasks();
        let ctx = ctx(&root, &schema, &NoBlobs, DateEncoding::Timestamp);

        let value = coerce(PropertyKind::DateTime, "updated", &json!("1330854030123"), &ctx)
            .await
            .unwrap();
        assert_eq!(
            value,
            FieldValue::DateTime(DateTime::from_timestamp(1_330_854_030, 123_000_000).unwrap())
        );
    }

    #[test]
    fn unknown_date_encoding_is_a_configuration_error() {
        assert!("friendly".parse::<DateEncoding>().is_ok());
        assert!("timestamp".parse::<DateEncoding>().is_ok());
        assert!(matches!(
            "iso8601".parse::<DateEncoding>(),
            Err(IngestError::Config(_))
        ));
    }

    #[tokio::test]
    async fn duration_is_seconds_plus_millisecond_remainder() {
        let root = run_root();
        let schema = SchemaRegistry::tasks();
        let ctx = ctx(&root, &schema, &NoBlobs, DateEncoding::Friendly);

        let value = coerce(PropertyKind::Duration, "elapsed", &json!(61_500), &ctx)
            .await
            .unwrap();
        assert_eq!(
            value,
            FieldValue::Duration(std::time::Duration::new(61, 500_000_000))
        );
    }

    #[tokio::test]
    async fn link_coercion_validates_the_scheme() {
        let root = run_root();
        let schema = SchemaRegistry::tasks();
        let ctx = ctx(&root, &schema, &NoBlobs, DateEncoding::Friendly);

        assert!(coerce(PropertyKind::Link, "selfLink", &json!("https://example.com/x"), &ctx)
            .await
            .is_ok());
        assert!(matches!(
            coerce(PropertyKind::Link, "selfLink", &json!("ftp://example.com/x"), &ctx).await,
            Err(IngestError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn blob_coercion_fetches_and_digests_remote_bytes() {
        let root = run_root();
        let schema = SchemaRegistry::tasks();
        let blobs = StaticBlobs(b"attachment-bytes".to_vec());
        let ctx = ctx(&root, &schema, &blobs, DateEncoding::Friendly);

        let value = coerce(PropertyKind::Blob, "icon", &json!("https://example.com/icon"), &ctx)
            .await
            .unwrap();
        match value {
            FieldValue::Blob(blob) => {
                assert_eq!(blob.bytes, b"attachment-bytes");
                assert_eq!(blob.sha256, sha256_hex(b"attachment-bytes"));
            }
            other => panic!("expected a blob, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn references_resolve_under_the_run_root() {
        let root = run_root();
        let schema = SchemaRegistry::tasks().with_many_many(Kind::Task, "links", Kind::TaskList);
        let ctx = ctx(&root, &schema, &NoBlobs, DateEncoding::Friendly);

        let single = coerce(PropertyKind::Reference(Kind::Task), "parent_", &json!("t-2"), &ctx)
            .await
            .unwrap();
        assert_eq!(
            single,
            FieldValue::Key(root.child(Kind::Task, KeyId::name("t-2")))
        );

        let list = coerce(PropertyKind::KeyList, "links", &json!(["a", "b"]), &ctx)
            .await
            .unwrap();
        assert_eq!(
            list,
            FieldValue::KeyList(vec![
                root.child(Kind::TaskList, KeyId::name("a")),
                root.child(Kind::TaskList, KeyId::name("b")),
            ])
        );
    }

    #[tokio::test]
    async fn unsupported_property_kind_is_a_structural_error() {
        let root = run_root();
        let schema = SchemaRegistry::tasks();
        let ctx = ctx(&root, &schema, &NoBlobs, DateEncoding::Friendly);

        assert!(matches!(
            coerce(PropertyKind::Custom("geo"), "location", &json!("x"), &ctx).await,
            Err(IngestError::UnsupportedKind { tag: "geo", .. })
        ));
    }

    #[tokio::test]
    async fn single_record_payload_skips_pagination() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks();
        let pages = ScriptedPages::new(Vec::new());
        let ingestor = Ingestor::new(Kind::TaskList, run_root(), &schema, &store, &pages, &NoBlobs);

        let built = ingestor
            .ingest(json!({"id": "list-1", "title": "Groceries"}))
            .await
            .unwrap();

        assert_eq!(built.len(), 1);
        assert_eq!(built[0].text("title"), Some("Groceries"));
        assert!(pages.calls().is_empty());
    }

    #[tokio::test]
    async fn token_paging_consumes_every_page_in_order() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks();
        let pages = ScriptedPages::new(vec![
            json!({"nextPageToken": "p3", "items": [
                {"id": "t3", "title": "c"},
                {"id": "t4", "title": "d"},
            ]}),
            json!({"items": [{"id": "t5", "title": "e"}]}),
        ]);
        let ingestor = Ingestor::new(Kind::Task, run_root(), &schema, &store, &pages, &NoBlobs);

        let built = ingestor
            .ingest(json!({"nextPageToken": "p2", "items": [
                {"id": "t1", "title": "a"},
                {"id": "t2", "title": "b"},
            ]}))
            .await
            .unwrap();

        let titles: Vec<_> = built.iter().map(|e| e.text("title").unwrap()).collect();
        assert_eq!(titles, ["a", "b", "c", "d", "e"]);

        let calls = pages.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].get("pageToken"), Some(&json!("p2")));
        assert_eq!(calls[1].get("pageToken"), Some(&json!("p3")));
    }

    #[tokio::test]
    async fn index_paging_terminates_on_the_first_empty_payload() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks();
        let pages = ScriptedPages::new(vec![
            json!({"items": [{"id": "t3", "title": "c"}]}),
            json!({}),
        ]);
        let ingestor = Ingestor::new(Kind::Task, run_root(), &schema, &store, &pages, &NoBlobs)
            .with_paging(PagingMode::Index);

        let built = ingestor
            .ingest(json!({"items": [
                {"id": "t1", "title": "a"},
                {"id": "t2", "title": "b"},
            ]}))
            .await
            .unwrap();

        assert_eq!(built.len(), 3);
        let calls = pages.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].get("startIndex"), Some(&json!(2)));
        assert_eq!(calls[1].get("startIndex"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn record_without_id_still_persists_one_entity() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks();
        let pages = ScriptedPages::new(Vec::new());
        let ingestor = Ingestor::new(Kind::TaskList, run_root(), &schema, &store, &pages, &NoBlobs);

        let built = ingestor.ingest(json!({"title": "untitled list"})).await.unwrap();

        assert_eq!(built.len(), 1);
        assert!(matches!(*built[0].key.id(), KeyId::Numeric(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn child_collections_recurse_instead_of_coercing() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks().with_child(Kind::TaskList, "tasks", Kind::Task);
        let pages = ScriptedPages::new(Vec::new());
        let ingestor = Ingestor::new(Kind::TaskList, run_root(), &schema, &store, &pages, &NoBlobs);

        let built = ingestor
            .ingest(json!({
                "id": "list-1",
                "title": "Groceries",
                "tasks": [
                    {"id": "t1", "title": "milk"},
                    {"id": "t2", "title": "eggs"},
                    {"id": "t3", "title": "bread"},
                ],
            }))
            .await
            .unwrap();

        assert_eq!(built.len(), 1);
        let list = &built[0];
        assert!(list.get("tasks").is_none());

        let children = store.children_of(&run_root(), Kind::Task).unwrap();
        assert_eq!(children.len(), 3);
        for child in &children {
            assert_eq!(child.parent_ref.as_ref(), Some(&list.key));
        }
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn reserved_field_names_are_renamed_before_lookup() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks();
        let pages = ScriptedPages::new(Vec::new());
        let ingestor = Ingestor::new(Kind::Task, run_root(), &schema, &store, &pages, &NoBlobs);

        let built = ingestor
            .ingest(json!({"id": "t9", "parent": "t1"}))
            .await
            .unwrap();

        assert_eq!(
            built[0].get("parent_"),
            Some(&FieldValue::Key(run_root().child(Kind::Task, KeyId::name("t1"))))
        );
    }

    #[tokio::test]
    async fn unmapped_fields_abort_the_build() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks();
        let pages = ScriptedPages::new(Vec::new());
        let ingestor = Ingestor::new(Kind::Task, run_root(), &schema, &store, &pages, &NoBlobs);

        let err = ingestor
            .ingest(json!({"id": "t1", "color": "red"}))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnknownField { field, .. } if field == "color"));
    }

    #[tokio::test]
    async fn excluded_metadata_fields_are_ignored() {
        let store = MemoryStore::new();
        let schema = SchemaRegistry::tasks();
        let pages = ScriptedPages::new(Vec::new());
        let ingestor = Ingestor::new(Kind::Task, run_root(), &schema, &store, &pages, &NoBlobs);

        let built = ingestor
            .ingest(json!({"id": "t1", "kind": "tasks#task", "etag": "abc", "title": "x"}))
            .await
            .unwrap();
        assert_eq!(built[0].text("title"), Some("x"));
        assert!(built[0].get("etag").is_none());
    }
}
