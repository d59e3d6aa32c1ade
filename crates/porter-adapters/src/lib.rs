//! Flat-format adapters: CSV and iCalendar task import, plus the download
//! renderers that serialize a stored snapshot back out.
//!
//! The importers share the engine's two-phase persist-then-populate entity
//! lifecycle but not its coercion table; their source formats are already
//! typed strings needing only a handful of fixed conversions.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use porter_core::{
    Entity, EntityKey, FieldValue, Kind, ModelError, Snapshot, Task, TaskList, TaskStatus,
};
use porter_storage::{EntityStore, StoreError};
use serde::Deserialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "porter-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    Csv,
    Ics,
}

impl std::str::FromStr for ImportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(ImportFormat::Csv),
            "ics" => Ok(ImportFormat::Ics),
            other => Err(format!("unknown import format: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed CSV input: {0}")]
    Csv(String),
    #[error("malformed iCalendar input: {0}")]
    Calendar(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::Csv(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Subject", default)]
    subject: Option<String>,
    #[serde(rename = "Notes", default)]
    notes: Option<String>,
    #[serde(rename = "Due Date", default)]
    due_date: Option<String>,
    #[serde(rename = "Date Completed", default)]
    date_completed: Option<String>,
    #[serde(rename = "Status", default)]
    status: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    Utc.from_utc_datetime(&naive)
}

/// Imports Outlook-style CSV rows as tasks under one destination list.
pub struct CsvImporter<'a> {
    store: &'a dyn EntityStore,
    run_root: EntityKey,
    list: EntityKey,
}

impl<'a> CsvImporter<'a> {
    pub fn new(store: &'a dyn EntityStore, run_root: EntityKey, list: EntityKey) -> Self {
        Self { store, run_root, list }
    }

    pub fn import(&self, data: &str) -> Result<Vec<Entity>, ImportError> {
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let mut results = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            results.push(self.import_row(row?)?);
        }
        Ok(results)
    }

    fn import_row(&self, row: CsvRow) -> Result<Entity, ImportError> {
        let mut task = self.store.create(Kind::Task, Some(&self.run_root), None)?;
        self.store.save(&task)?;
        task.parent_ref = Some(self.list.clone());

        // A title is required downstream, so an absent Subject becomes "".
        task.set(
            "title",
            FieldValue::Text(non_blank(row.subject).unwrap_or_default()),
        );
        if let Some(notes) = non_blank(row.notes) {
            task.set("notes", FieldValue::Text(notes));
        }
        if let Some(due) = non_blank(row.due_date) {
            let date = NaiveDate::parse_from_str(&due, "%m/%d/%Y")
                .map_err(|e| ImportError::Csv(format!("invalid Due Date `{due}`: {e}")))?;
            task.set("due", FieldValue::Date(date));
        }
        if let Some(completed) = non_blank(row.date_completed) {
            let date = NaiveDate::parse_from_str(&completed, "%m/%d/%Y")
                .map_err(|e| ImportError::Csv(format!("invalid Date Completed `{completed}`: {e}")))?;
            task.set("completed", FieldValue::DateTime(midnight_utc(date)));
        }
        if let Some(status) = non_blank(row.status) {
            let status = if status == "Complete" {
                TaskStatus::Completed
            } else {
                TaskStatus::NeedsAction
            };
            task.set("status", FieldValue::Text(status.as_str().to_string()));
        }

        self.store.save(&task)?;
        Ok(task)
    }
}

#[derive(Debug, Default)]
struct Vtodo {
    summary: Option<String>,
    description: Option<String>,
    due: Option<NaiveDate>,
    completed: Option<DateTime<Utc>>,
}

enum IcalTime {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

/// RFC 5545 long lines are folded with a leading space or tab; join them
/// back before property parsing.
fn unfold_lines(raw: &str) -> Vec<String> {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = Vec::new();
    for line in normalized.lines() {
        if let Some(last) = lines.last_mut() {
            if line.starts_with(' ') || line.starts_with('\t') {
                last.push_str(line.trim_start());
                continue;
            }
        }
        lines.push(line.to_string());
    }
    lines
}

fn split_property(line: &str) -> Option<(String, String)> {
    let (name_with_params, value) = line.split_once(':')?;
    let name = name_with_params
        .split(';')
        .next()
        .unwrap_or(name_with_params)
        .trim()
        .to_ascii_uppercase();
    Some((name, value.trim().to_string()))
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_ical_time(value: &str) -> Option<IcalTime> {
    let trimmed = value.trim();
    if trimmed.len() == 8 {
        return NaiveDate::parse_from_str(trimmed, "%Y%m%d")
            .ok()
            .map(IcalTime::Date);
    }
    let naive = if let Some(stripped) = trimmed.strip_suffix('Z') {
        NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?
    } else {
        NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S").ok()?
    };
    Some(IcalTime::DateTime(Utc.from_utc_datetime(&naive)))
}

fn parse_vtodos(raw: &str) -> Result<Vec<Vtodo>, ImportError> {
    let mut saw_calendar = false;
    let mut current: Option<Vtodo> = None;
    let mut todos = Vec::new();

    for line in unfold_lines(raw) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("BEGIN:VCALENDAR") {
            saw_calendar = true;
            continue;
        }
        if trimmed.eq_ignore_ascii_case("BEGIN:VTODO") {
            if current.is_some() {
                return Err(ImportError::Calendar("nested VTODO component".to_string()));
            }
            current = Some(Vtodo::default());
            continue;
        }
        if trimmed.eq_ignore_ascii_case("END:VTODO") {
            let todo = current
                .take()
                .ok_or_else(|| ImportError::Calendar("END:VTODO without a matching BEGIN".to_string()))?;
            todos.push(todo);
            continue;
        }

        let Some(todo) = current.as_mut() else { continue };
        let Some((name, value)) = split_property(trimmed) else { continue };
        match name.as_str() {
            "SUMMARY" => todo.summary = Some(unescape_text(&value)),
            "DESCRIPTION" => todo.description = Some(unescape_text(&value)),
            "DUE" => {
                let time = parse_ical_time(&value)
                    .ok_or_else(|| ImportError::Calendar(format!("unparseable DUE value `{value}`")))?;
                todo.due = Some(match time {
                    IcalTime::Date(date) => date,
                    IcalTime::DateTime(dt) => dt.date_naive(),
                });
            }
            "COMPLETED" => {
                let time = parse_ical_time(&value).ok_or_else(|| {
                    ImportError::Calendar(format!("unparseable COMPLETED value `{value}`"))
                })?;
                todo.completed = Some(match time {
                    IcalTime::Date(date) => midnight_utc(date),
                    IcalTime::DateTime(dt) => dt,
                });
            }
            // STATUS is ignored: the source format does not set it reliably
            // on completed items, so completion presence decides.
            _ => {}
        }
    }

    if !saw_calendar {
        return Err(ImportError::Calendar("missing VCALENDAR envelope".to_string()));
    }
    if current.is_some() {
        return Err(ImportError::Calendar("unterminated VTODO component".to_string()));
    }
    Ok(todos)
}

/// Imports iCalendar VTODO components as tasks under one destination list.
pub struct CalendarImporter<'a> {
    store: &'a dyn EntityStore,
    run_root: EntityKey,
    list: EntityKey,
}

impl<'a> CalendarImporter<'a> {
    pub fn new(store: &'a dyn EntityStore, run_root: EntityKey, list: EntityKey) -> Self {
        Self { store, run_root, list }
    }

    pub fn import(&self, data: &str) -> Result<Vec<Entity>, ImportError> {
        let todos = parse_vtodos(data)?;
        let mut results = Vec::with_capacity(todos.len());
        for todo in todos {
            results.push(self.import_todo(todo)?);
        }
        Ok(results)
    }

    fn import_todo(&self, todo: Vtodo) -> Result<Entity, ImportError> {
        let mut task = self.store.create(Kind::Task, Some(&self.run_root), None)?;
        self.store.save(&task)?;
        task.parent_ref = Some(self.list.clone());

        task.set(
            "title",
            FieldValue::Text(todo.summary.unwrap_or_default()),
        );
        if let Some(description) = todo.description {
            task.set("notes", FieldValue::Text(description));
        }
        if let Some(due) = todo.due {
            task.set("due", FieldValue::Date(due));
        }
        match todo.completed {
            Some(completed) => {
                task.set(
                    "status",
                    FieldValue::Text(TaskStatus::Completed.as_str().to_string()),
                );
                task.set("completed", FieldValue::DateTime(completed));
            }
            None => {
                task.set(
                    "status",
                    FieldValue::Text(TaskStatus::NeedsAction.as_str().to_string()),
                );
            }
        }

        self.store.save(&task)?;
        Ok(task)
    }
}

/// A snapshot's task lists with their tasks, assembled for rendering.
#[derive(Debug, Clone)]
pub struct SnapshotDocument {
    pub snapshot: Snapshot,
    pub lists: Vec<ListDocument>,
}

#[derive(Debug, Clone)]
pub struct ListDocument {
    pub list: TaskList,
    pub tasks: Vec<Task>,
}

pub fn collect_document(
    store: &dyn EntityStore,
    snapshot: &Snapshot,
) -> Result<SnapshotDocument, ImportError> {
    let mut lists = Vec::new();
    for entity in store.children_of(&snapshot.key, Kind::TaskList)? {
        lists.push(ListDocument {
            list: TaskList::from_entity(&entity)?,
            tasks: Vec::new(),
        });
    }
    for entity in store.children_of(&snapshot.key, Kind::Task)? {
        let task = Task::from_entity(&entity)?;
        if let Some(owner) = lists
            .iter_mut()
            .find(|doc| Some(&doc.list.key) == task.list.as_ref())
        {
            owner.tasks.push(task);
        }
    }
    Ok(SnapshotDocument {
        snapshot: snapshot.clone(),
        lists,
    })
}

fn csv_status(task: &Task) -> &'static str {
    match task.status {
        Some(TaskStatus::Completed) => "Complete",
        Some(TaskStatus::NeedsAction) => "Not Started",
        None => "",
    }
}

/// Renders every task of the snapshot back into the import CSV column set.
pub fn render_csv(document: &SnapshotDocument) -> Result<String, ImportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Subject", "Notes", "Due Date", "Date Completed", "Status"])?;
    for list in &document.lists {
        for task in &list.tasks {
            let due = task
                .due
                .map(|d| d.format("%m/%d/%Y").to_string())
                .unwrap_or_default();
            let completed = task
                .completed
                .map(|c| c.format("%m/%d/%Y").to_string())
                .unwrap_or_default();
            writer.write_record([
                task.title.as_deref().unwrap_or_default(),
                task.notes.as_deref().unwrap_or_default(),
                due.as_str(),
                completed.as_str(),
                csv_status(task),
            ])?;
        }
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ImportError::Csv(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ImportError::Csv(e.to_string()))
}

fn escape_ical_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Renders every task of the snapshot as VTODO components.
pub fn render_ical(document: &SnapshotDocument) -> String {
    let mut out = String::new();
    out.push_str("BEGIN:VCALENDAR\r\n");
    out.push_str("VERSION:2.0\r\n");
    out.push_str("PRODID:-//Task Snapshot Porter//EN\r\n");
    for list in &document.lists {
        for task in &list.tasks {
            out.push_str("BEGIN:VTODO\r\n");
            let uid = task
                .external_id
                .clone()
                .unwrap_or_else(|| task.key.id().to_string());
            out.push_str(&format!("UID:{}\r\n", escape_ical_text(&uid)));
            out.push_str(&format!(
                "SUMMARY:{}\r\n",
                escape_ical_text(task.title.as_deref().unwrap_or_default())
            ));
            if let Some(notes) = &task.notes {
                out.push_str(&format!("DESCRIPTION:{}\r\n", escape_ical_text(notes)));
            }
            if let Some(due) = task.due {
                out.push_str(&format!("DUE;VALUE=DATE:{}\r\n", due.format("%Y%m%d")));
            }
            if let Some(completed) = task.completed {
                out.push_str(&format!(
                    "COMPLETED:{}\r\n",
                    completed.format("%Y%m%dT%H%M%SZ")
                ));
            }
            match task.status {
                Some(TaskStatus::Completed) => out.push_str("STATUS:COMPLETED\r\n"),
                Some(TaskStatus::NeedsAction) => out.push_str("STATUS:NEEDS-ACTION\r\n"),
                None => {}
            }
            out.push_str("END:VTODO\r\n");
        }
    }
    out.push_str("END:VCALENDAR\r\n");
    out
}

/// Plain-text rendering used for the mail-a-snapshot body.
pub fn render_text(document: &SnapshotDocument) -> String {
    let mut out = String::new();
    for list in &document.lists {
        out.push_str(list.list.title.as_deref().unwrap_or("(untitled list)"));
        out.push('\n');
        for task in &list.tasks {
            let marker = match task.status {
                Some(TaskStatus::Completed) => "[x]",
                _ => "[ ]",
            };
            out.push_str(&format!(
                "{} {}",
                marker,
                task.title.as_deref().unwrap_or_default()
            ));
            if let Some(due) = task.due {
                out.push_str(&format!(" (due {})", due.format("%m/%d/%Y")));
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out
}
