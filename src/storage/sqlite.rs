use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::{rank_matches, FeatureStore, SearchIndex, SearchMatch, SearchRecord};
use crate::detect::FeatureComparator;
use crate::{now_ms, open_db_connection};

/// 1:1 verification features keyed by label.
pub struct SqliteFeatureStore {
    conn: Connection,
}

impl SqliteFeatureStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open feature store {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS verify_features (
              label TEXT PRIMARY KEY,
              feature TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl FeatureStore for SqliteFeatureStore {
    fn put(&mut self, label: &str, feature: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO verify_features(label, feature, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(label) DO UPDATE SET feature = excluded.feature,
                                             updated_at = excluded.updated_at
            "#,
            params![label, feature, now_ms()],
        )?;
        Ok(())
    }

    fn get(&self, label: &str) -> Result<Option<String>> {
        let feature = self
            .conn
            .query_row(
                "SELECT feature FROM verify_features WHERE label = ?1",
                params![label],
                |row| row.get(0),
            )
            .optional()?;
        Ok(feature)
    }

    fn delete(&mut self, label: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM verify_features WHERE label = ?1", params![label])?;
        Ok(removed > 0)
    }
}

/// 1:N search library.
pub struct SqliteSearchIndex {
    conn: Connection,
}

impl SqliteSearchIndex {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open search index {}", db_path))?;
        let mut index = Self { conn };
        index.ensure_schema()?;
        Ok(index)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS search_faces (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              label TEXT NOT NULL UNIQUE,
              feature TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              tag TEXT NOT NULL DEFAULT '',
              group_name TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_search_group ON search_faces(group_name);
            "#,
        )?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<SearchRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT label, feature, created_at, tag, group_name FROM search_faces ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(SearchRecord {
                label: row.get(0)?,
                feature: row.get(1)?,
                created_at_ms: row.get(2)?,
                tag: row.get(3)?,
                group: row.get(4)?,
            });
        }
        Ok(out)
    }
}

impl SearchIndex for SqliteSearchIndex {
    fn insert(&mut self, record: SearchRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO search_faces(label, feature, created_at, tag, group_name)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(label) DO UPDATE SET feature = excluded.feature,
                                             created_at = excluded.created_at,
                                             tag = excluded.tag,
                                             group_name = excluded.group_name
            "#,
            params![
                record.label,
                record.feature,
                record.created_at_ms,
                record.tag,
                record.group
            ],
        )?;
        Ok(())
    }

    fn delete_by_label(&mut self, label: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM search_faces WHERE label = ?1", params![label])?;
        Ok(removed > 0)
    }

    fn search(
        &self,
        feature: &str,
        comparator: &dyn FeatureComparator,
    ) -> Result<Vec<SearchMatch>> {
        rank_matches(self.records()?.iter(), feature, comparator)
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM search_faces", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn clear(&mut self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM search_faces", [])?;
        Ok(removed)
    }
}
