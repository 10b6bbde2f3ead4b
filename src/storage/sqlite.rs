use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::debug;

use super::{check_edge_document, DocumentBackend, Filter, Patch};
use crate::error::{GraphError, Result};
use crate::types::{
    doc_i64_opt, fields, validate_collection_name, CollectionKind, Document, IndexSpec, Timestamp,
};

const CATALOG_TABLE: &str = "_ttgraph_collections";
const LOOKUP_CHUNK: usize = 500;

/// Fields promoted to real columns so they can participate in SQL indexes.
const INDEXABLE_COLUMNS: &[&str] = &[
    fields::ID,
    fields::CREATED,
    fields::EXPIRED,
    fields::RELEASE_CREATED,
    fields::RELEASE_EXPIRED,
    fields::FIRST_VERSION,
    fields::LAST_VERSION,
];

/// Durable backend storing each collection as a SQLite table.
///
/// Reserved fields are promoted to columns; the complete document is kept as
/// JSON text alongside them. Indexes are real SQLite indexes and are read back
/// from the schema, so a missing index is detected exactly as it exists on disk.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (creating if needed) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} (
                    name TEXT PRIMARY KEY,
                    kind TEXT NOT NULL
                )"
            ),
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn require_collection(conn: &Connection, name: &str) -> Result<CollectionKind> {
        lookup_kind(conn, name)?
            .ok_or_else(|| GraphError::Configuration(format!("collection {name} does not exist")))
    }
}

fn table(name: &str) -> String {
    format!("\"{name}\"")
}

fn kind_label(kind: CollectionKind) -> &'static str {
    match kind {
        CollectionKind::Vertex => "vertex",
        CollectionKind::Edge => "edge",
    }
}

fn lookup_kind(conn: &Connection, name: &str) -> Result<Option<CollectionKind>> {
    let kind: Option<String> = conn
        .query_row(
            &format!("SELECT kind FROM {CATALOG_TABLE} WHERE name = ?1"),
            [name],
            |row| row.get(0),
        )
        .optional()?;
    match kind.as_deref() {
        None => Ok(None),
        Some("vertex") => Ok(Some(CollectionKind::Vertex)),
        Some("edge") => Ok(Some(CollectionKind::Edge)),
        Some(other) => Err(GraphError::Corruption(format!(
            "collection {name} has unknown kind '{other}'"
        ))),
    }
}

fn decode(text: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(GraphError::Corruption(
            "stored document is not a JSON object".into(),
        )),
    }
}

fn text_field(doc: &Document, field: &str) -> Option<String> {
    doc.get(field).and_then(Value::as_str).map(str::to_string)
}

fn key_of(doc: &Document) -> Result<String> {
    text_field(doc, fields::KEY)
        .ok_or_else(|| GraphError::InvalidDocument("document has no string '_key'".into()))
}

fn write_row(tx: &Transaction<'_>, name: &str, key: &str, doc: &Document) -> Result<()> {
    let body = serde_json::to_string(doc)?;
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (_key, id, created, expired, release_created,
                release_expired, first_version, last_version, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            table(name)
        ),
        params![
            key,
            text_field(doc, fields::ID),
            doc_i64_opt(doc, fields::CREATED),
            doc_i64_opt(doc, fields::EXPIRED),
            doc_i64_opt(doc, fields::RELEASE_CREATED),
            doc_i64_opt(doc, fields::RELEASE_EXPIRED),
            text_field(doc, fields::FIRST_VERSION),
            text_field(doc, fields::LAST_VERSION),
            body,
        ],
    )?;
    Ok(())
}

fn read_row(conn: &Connection, name: &str, key: &str) -> Result<Option<Document>> {
    let body: Option<String> = conn
        .query_row(
            &format!("SELECT doc FROM {} WHERE _key = ?1", table(name)),
            [key],
            |row| row.get(0),
        )
        .optional()?;
    body.as_deref().map(decode).transpose()
}

/// Translates a filter into an index-friendly SQL predicate. Rows are always
/// re-checked with [`Filter::matches`], so the predicate may be wider.
fn predicate(filter: &Filter) -> (String, Vec<SqlValue>) {
    match filter {
        Filter::ValidWithoutLastVersion { timestamp, version } => (
            "expired >= ?1 AND created <= ?1 AND (last_version IS NULL OR last_version != ?2)"
                .into(),
            vec![
                SqlValue::Integer(*timestamp),
                SqlValue::Text(version.clone()),
            ],
        ),
        Filter::CreatedAt(ts) => ("created = ?1".into(), vec![SqlValue::Integer(*ts)]),
        Filter::ExpiredAt(ts) => ("expired = ?1".into(), vec![SqlValue::Integer(*ts)]),
        Filter::LastVersion(version) => (
            "last_version = ?1".into(),
            vec![SqlValue::Text(version.clone())],
        ),
        Filter::FieldEquals(field, Value::String(s)) => (
            "json_extract(doc, ?1) = ?2".into(),
            vec![
                SqlValue::Text(format!("$.\"{field}\"")),
                SqlValue::Text(s.clone()),
            ],
        ),
        Filter::FieldEquals(..) => ("1 = 1".into(), Vec::new()),
    }
}

fn select_matching(conn: &Connection, name: &str, filter: &Filter) -> Result<Vec<(String, Document)>> {
    let (clause, args) = predicate(filter);
    let mut stmt = conn.prepare(&format!(
        "SELECT _key, doc FROM {} WHERE {clause}",
        table(name)
    ))?;
    let rows = stmt.query_map(params_from_iter(args), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key, body) = row?;
        let doc = decode(&body)?;
        if filter.matches(&doc) {
            out.push((key, doc));
        }
    }
    Ok(out)
}

impl DocumentBackend for SqliteBackend {
    fn create_collection(&self, name: &str, kind: CollectionKind) -> Result<()> {
        validate_collection_name(name)?;
        let mut conn = self.conn.lock();
        match lookup_kind(&conn, name)? {
            Some(existing) if existing != kind => {
                return Err(GraphError::Configuration(format!(
                    "{name} already exists and is not {} collection",
                    kind.describe()
                )))
            }
            Some(_) => return Ok(()),
            None => {}
        }
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "CREATE TABLE {} (
                    _key TEXT PRIMARY KEY,
                    id TEXT,
                    created INTEGER,
                    expired INTEGER,
                    release_created INTEGER,
                    release_expired INTEGER,
                    first_version TEXT,
                    last_version TEXT,
                    doc TEXT NOT NULL
                )",
                table(name)
            ),
            [],
        )?;
        tx.execute(
            &format!("INSERT INTO {CATALOG_TABLE} (name, kind) VALUES (?1, ?2)"),
            params![name, kind_label(kind)],
        )?;
        tx.commit()?;
        debug!(collection = name, kind = kind_label(kind), "sqlite.collection.created");
        Ok(())
    }

    fn collection_kind(&self, name: &str) -> Result<Option<CollectionKind>> {
        let conn = self.conn.lock();
        lookup_kind(&conn, name)
    }

    fn ensure_index(&self, name: &str, spec: &IndexSpec) -> Result<()> {
        if let Some(field) = spec
            .fields
            .iter()
            .find(|f| !INDEXABLE_COLUMNS.contains(&f.as_str()))
        {
            return Err(GraphError::Configuration(format!(
                "field '{field}' cannot be indexed by the sqlite backend"
            )));
        }
        if self.indexes(name)?.contains(spec) {
            return Ok(());
        }
        let conn = self.conn.lock();
        let index_name = format!("idx_{name}_{}", spec.fields.join("_"));
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS \"{index_name}\" ON {} ({})",
                table(name),
                spec.fields.join(", ")
            ),
            [],
        )?;
        debug!(collection = name, index = %spec, "sqlite.index.created");
        Ok(())
    }

    fn indexes(&self, name: &str) -> Result<Vec<IndexSpec>> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        let mut list = conn.prepare(
            "SELECT name FROM pragma_index_list(?1) WHERE origin = 'c' AND \"unique\" = 0",
        )?;
        let names = list
            .query_map([name], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
        let mut out = Vec::with_capacity(names.len());
        for index in names {
            let cols = info
                .query_map([index.as_str()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            out.push(IndexSpec::new(cols));
        }
        Ok(out)
    }

    fn insert(&self, name: &str, doc: Document) -> Result<()> {
        let key = key_of(&doc)?;
        let mut conn = self.conn.lock();
        let kind = Self::require_collection(&conn, name)?;
        check_edge_document(kind, name, &doc)?;
        if read_row(&conn, name, &key)?.is_some() {
            return Err(GraphError::DuplicateKey {
                collection: name.to_string(),
                key,
            });
        }
        let tx = conn.transaction()?;
        write_row(&tx, name, &key, &doc)?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, name: &str, key: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        read_row(&conn, name, key)
    }

    fn update(&self, name: &str, key: &str, patch: &Patch) -> Result<bool> {
        let mut conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        let Some(mut doc) = read_row(&conn, name, key)? else {
            return Ok(false);
        };
        patch.apply(&mut doc);
        let tx = conn.transaction()?;
        write_row(&tx, name, key, &doc)?;
        tx.commit()?;
        Ok(true)
    }

    fn remove(&self, name: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE _key = ?1", table(name)),
            [key],
        )?;
        Ok(removed > 0)
    }

    fn import_bulk(&self, name: &str, docs: Vec<Document>) -> Result<()> {
        let mut conn = self.conn.lock();
        let kind = Self::require_collection(&conn, name)?;
        let tx = conn.transaction()?;
        for incoming in docs {
            let key = key_of(&incoming)?;
            let mut doc = read_row(&tx, name, &key)?.unwrap_or_default();
            for (field, value) in incoming {
                doc.insert(field, value);
            }
            check_edge_document(kind, name, &doc)?;
            write_row(&tx, name, &key, &doc)?;
        }
        // dropping an uncommitted transaction rolls the whole batch back
        tx.commit()?;
        Ok(())
    }

    fn find_valid(
        &self,
        name: &str,
        ids: &[String],
        timestamp: Timestamp,
    ) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        let mut out = Vec::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let placeholders = (0..chunk.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT doc FROM {} WHERE id IN ({placeholders}) AND expired >= ?1 AND created <= ?1",
                table(name)
            ))?;
            let mut args = Vec::with_capacity(chunk.len() + 1);
            args.push(SqlValue::Integer(timestamp));
            args.extend(chunk.iter().cloned().map(SqlValue::Text));
            let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
            for body in rows {
                out.push(decode(&body?)?);
            }
        }
        Ok(out)
    }

    fn find_where(&self, name: &str, filter: &Filter) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        Ok(select_matching(&conn, name, filter)?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect())
    }

    fn update_where(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<u64> {
        let mut conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        let tx = conn.transaction()?;
        let matched = select_matching(&tx, name, filter)?;
        for (key, mut doc) in matched.iter().cloned() {
            patch.apply(&mut doc);
            write_row(&tx, name, &key, &doc)?;
        }
        tx.commit()?;
        Ok(matched.len() as u64)
    }

    fn remove_where(&self, name: &str, filter: &Filter) -> Result<u64> {
        let mut conn = self.conn.lock();
        Self::require_collection(&conn, name)?;
        let tx = conn.transaction()?;
        let matched = select_matching(&tx, name, filter)?;
        {
            let mut stmt = tx.prepare(&format!("DELETE FROM {} WHERE _key = ?1", table(name)))?;
            for (key, _) in &matched {
                stmt.execute([key])?;
            }
        }
        tx.commit()?;
        Ok(matched.len() as u64)
    }
}
