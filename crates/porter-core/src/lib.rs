//! Core domain model and schema registry for the task snapshot porter.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "porter-core";

/// Entity kinds known to the porter. The schema is compiled in; there is no
/// runtime kind registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Snapshot,
    TaskList,
    Task,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Snapshot => "Snapshot",
            Kind::TaskList => "TaskList",
            Kind::Task => "Task",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One identifier inside an ancestor path: either the stringified external id
/// of the source record, or a numeric id allocated by the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyId {
    Name(String),
    Numeric(u64),
}

impl KeyId {
    pub fn name(value: impl Into<String>) -> Self {
        KeyId::Name(value.into())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyId::Name(name) => f.write_str(name),
            KeyId::Numeric(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyElement {
    pub kind: Kind,
    pub id: KeyId,
}

/// Hierarchical storage key: the ancestor path from the owning Snapshot down
/// to the entity itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    path: Vec<KeyElement>,
}

impl EntityKey {
    pub fn root(kind: Kind, id: KeyId) -> Self {
        Self {
            path: vec![KeyElement { kind, id }],
        }
    }

    pub fn child(&self, kind: Kind, id: KeyId) -> Self {
        let mut path = self.path.clone();
        path.push(KeyElement { kind, id });
        Self { path }
    }

    /// Kind of the entity this key names (the last path element).
    pub fn kind(&self) -> Kind {
        self.path.last().expect("key path is never empty").kind
    }

    pub fn id(&self) -> &KeyId {
        &self.path.last().expect("key path is never empty").id
    }

    pub fn parent(&self) -> Option<EntityKey> {
        if self.path.len() < 2 {
            return None;
        }
        Some(Self {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// The Snapshot-level root of this key's ancestor chain.
    pub fn run_root(&self) -> EntityKey {
        Self {
            path: self.path[..1].to_vec(),
        }
    }

    pub fn elements(&self) -> &[KeyElement] {
        &self.path
    }

    pub fn is_descendant_of(&self, ancestor: &EntityKey) -> bool {
        self.path.len() > ancestor.path.len() && self.path.starts_with(&ancestor.path)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}:{}", element.kind, element.id)?;
        }
        Ok(())
    }
}

/// Fetched remote blob content plus its digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobValue {
    pub bytes: Vec<u8>,
    pub sha256: String,
}

/// A typed, persisted field value. Closed set: every declared property kind
/// decodes into exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Link(String),
    Blob(BlobValue),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Key(EntityKey),
    KeyList(Vec<EntityKey>),
    TextList(Vec<String>),
    Duration(std::time::Duration),
    Map(JsonMap<String, JsonValue>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Link(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_key(&self) -> Option<&EntityKey> {
        match self {
            FieldValue::Key(key) => Some(key),
            _ => None,
        }
    }
}

/// Generic persisted record. The ingestion engine is schema-agnostic and only
/// ever sees this shape; the typed views below are for the worker, the web
/// surface, and the download renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    /// Weak reference recorded at build time (a task's owning list, or a
    /// logical parent supplied by an adapter). Lookup only, never ownership.
    pub parent_ref: Option<EntityKey>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            parent_ref: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.key.kind()
    }

    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_text)
    }
}

/// Declared coercion kind of a schema property, assigned at schema-definition
/// time. `Custom` marks provider-specific kinds the decode table has no rule
/// for; coercing one is always a structural failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Text,
    LongText,
    Integer,
    Float,
    Bool,
    Link,
    Blob,
    Date,
    DateTime,
    Reference(Kind),
    KeyList,
    TextList,
    Duration,
    Map,
    Custom(&'static str),
}

/// Immutable schema value passed explicitly into the ingestion engine: per
/// kind the property table, plus the child-collection and many-to-many
/// lookup tables keyed by (owning kind, source field name).
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    properties: BTreeMap<Kind, BTreeMap<&'static str, PropertyKind>>,
    children: BTreeMap<Kind, BTreeMap<&'static str, Kind>>,
    many_many: BTreeMap<Kind, BTreeMap<&'static str, Kind>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, kind: Kind, field: &'static str, prop: PropertyKind) -> Self {
        self.properties.entry(kind).or_default().insert(field, prop);
        self
    }

    pub fn with_child(mut self, kind: Kind, field: &'static str, child: Kind) -> Self {
        self.children.entry(kind).or_default().insert(field, child);
        self
    }

    pub fn with_many_many(mut self, kind: Kind, field: &'static str, referenced: Kind) -> Self {
        self.many_many.entry(kind).or_default().insert(field, referenced);
        self
    }

    pub fn property(&self, kind: Kind, field: &str) -> Option<PropertyKind> {
        self.properties.get(&kind).and_then(|m| m.get(field)).copied()
    }

    pub fn child_kind(&self, kind: Kind, field: &str) -> Option<Kind> {
        self.children.get(&kind).and_then(|m| m.get(field)).copied()
    }

    pub fn referenced_kind(&self, kind: Kind, field: &str) -> Option<Kind> {
        self.many_many.get(&kind).and_then(|m| m.get(field)).copied()
    }

    /// The compiled-in schema for task data.
    pub fn tasks() -> Self {
        Self::new()
            .with_property(Kind::TaskList, "id", PropertyKind::Text)
            .with_property(Kind::TaskList, "title", PropertyKind::Text)
            .with_property(Kind::TaskList, "selfLink", PropertyKind::Link)
            .with_property(Kind::Task, "id", PropertyKind::Text)
            .with_property(Kind::Task, "selfLink", PropertyKind::Link)
            .with_property(Kind::Task, "title", PropertyKind::Text)
            .with_property(Kind::Task, "notes", PropertyKind::LongText)
            .with_property(Kind::Task, "parent_", PropertyKind::Reference(Kind::Task))
            .with_property(Kind::Task, "position", PropertyKind::Text)
            .with_property(Kind::Task, "updated", PropertyKind::DateTime)
            .with_property(Kind::Task, "due", PropertyKind::Date)
            .with_property(Kind::Task, "hidden", PropertyKind::Bool)
            .with_property(Kind::Task, "status", PropertyKind::Text)
            .with_property(Kind::Task, "deleted", PropertyKind::Bool)
            .with_property(Kind::Task, "completed", PropertyKind::DateTime)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Import,
    Export,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Import => "import",
            RunKind::Export => "export",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Building,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Building => "building",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Building)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "needsAction")]
    NeedsAction,
    #[serde(rename = "completed")]
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::NeedsAction => "needsAction",
            TaskStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("expected a {expected} entity, found {found}")]
    WrongKind { expected: Kind, found: Kind },
    #[error("field `{0}` has an unexpected value type")]
    WrongValueType(String),
    #[error("unrecognized {field} value `{value}`")]
    UnknownVariant { field: &'static str, value: String },
}

/// One export or import run. Created synchronously when the run is requested,
/// then owned and mutated exclusively by the worker that processes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: EntityKey,
    pub user: String,
    pub run_kind: RunKind,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl Snapshot {
    pub fn new(key: EntityKey, user: impl Into<String>, run_kind: RunKind, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            user: user.into(),
            run_kind,
            created_at,
            status: RunStatus::Building,
            error_message: None,
        }
    }

    /// Applies a terminal status. Status is monotonic: once the run has left
    /// `building` the transition is refused and `false` is returned.
    pub fn finish(&mut self, status: RunStatus, message: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error_message = message;
        true
    }

    pub fn to_entity(&self) -> Entity {
        let mut entity = Entity::new(self.key.clone());
        entity.set("user", FieldValue::Text(self.user.clone()));
        entity.set("type", FieldValue::Text(self.run_kind.as_str().to_string()));
        entity.set("timestamp", FieldValue::DateTime(self.created_at));
        entity.set("status", FieldValue::Text(self.status.as_str().to_string()));
        if let Some(message) = &self.error_message {
            entity.set("errorMessage", FieldValue::Text(message.clone()));
        }
        entity
    }

    pub fn from_entity(entity: &Entity) -> Result<Self, ModelError> {
        if entity.kind() != Kind::Snapshot {
            return Err(ModelError::WrongKind {
                expected: Kind::Snapshot,
                found: entity.kind(),
            });
        }
        let run_kind = match entity.text("type") {
            Some("import") => RunKind::Import,
            Some("export") => RunKind::Export,
            Some(other) => {
                return Err(ModelError::UnknownVariant {
                    field: "type",
                    value: other.to_string(),
                })
            }
            None => return Err(ModelError::WrongValueType("type".to_string())),
        };
        let status = match entity.text("status") {
            Some("building") => RunStatus::Building,
            Some("completed") => RunStatus::Completed,
            Some("error") => RunStatus::Error,
            Some(other) => {
                return Err(ModelError::UnknownVariant {
                    field: "status",
                    value: other.to_string(),
                })
            }
            None => return Err(ModelError::WrongValueType("status".to_string())),
        };
        let created_at = entity
            .get("timestamp")
            .and_then(FieldValue::as_datetime)
            .ok_or_else(|| ModelError::WrongValueType("timestamp".to_string()))?;
        Ok(Self {
            key: entity.key.clone(),
            user: entity.text("user").unwrap_or_default().to_string(),
            run_kind,
            created_at,
            status,
            error_message: entity.text("errorMessage").map(str::to_string),
        })
    }
}

/// Typed view over a persisted TaskList entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub key: EntityKey,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub self_link: Option<String>,
}

impl TaskList {
    pub fn from_entity(entity: &Entity) -> Result<Self, ModelError> {
        if entity.kind() != Kind::TaskList {
            return Err(ModelError::WrongKind {
                expected: Kind::TaskList,
                found: entity.kind(),
            });
        }
        Ok(Self {
            key: entity.key.clone(),
            external_id: entity.text("id").map(str::to_string),
            title: entity.text("title").map(str::to_string),
            self_link: entity.text("selfLink").map(str::to_string),
        })
    }
}

/// Typed view over a persisted Task entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub key: EntityKey,
    pub list: Option<EntityKey>,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub status: Option<TaskStatus>,
    pub position: Option<String>,
    pub due: Option<NaiveDate>,
    pub completed: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub hidden: Option<bool>,
    pub deleted: Option<bool>,
    pub self_link: Option<String>,
    /// Logical parent task for subtask hierarchies. Weak: lookup only.
    pub task_parent: Option<EntityKey>,
}

impl Task {
    pub fn from_entity(entity: &Entity) -> Result<Self, ModelError> {
        if entity.kind() != Kind::Task {
            return Err(ModelError::WrongKind {
                expected: Kind::Task,
                found: entity.kind(),
            });
        }
        let status = match entity.text("status") {
            None => None,
            Some("needsAction") => Some(TaskStatus::NeedsAction),
            Some("completed") => Some(TaskStatus::Completed),
            Some(other) => {
                return Err(ModelError::UnknownVariant {
                    field: "status",
                    value: other.to_string(),
                })
            }
        };
        Ok(Self {
            key: entity.key.clone(),
            list: entity.parent_ref.clone(),
            external_id: entity.text("id").map(str::to_string),
            title: entity.text("title").map(str::to_string),
            notes: entity.text("notes").map(str::to_string),
            status,
            position: entity.text("position").map(str::to_string),
            due: entity.get("due").and_then(FieldValue::as_date),
            completed: entity.get("completed").and_then(FieldValue::as_datetime),
            updated: entity.get("updated").and_then(FieldValue::as_datetime),
            hidden: entity.get("hidden").and_then(FieldValue::as_bool),
            deleted: entity.get("deleted").and_then(FieldValue::as_bool),
            self_link: entity.text("selfLink").map(str::to_string),
            task_parent: entity.get("parent_").and_then(FieldValue::as_key).cloned(),
        })
    }
}
