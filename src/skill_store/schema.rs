//! Schema definitions for the skill store database.

/// One version of the store schema.
pub struct StoreSchema {
    pub version: usize,
    pub up: &'static str,
}

pub const SKILL_STORE_VERSIONED_SCHEMAS: &[StoreSchema] = &[StoreSchema {
    version: 1,
    up: r#"
            CREATE TABLE IF NOT EXISTS skills (
                name TEXT PRIMARY KEY,
                latest_version INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS skill_versions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                parent_version INTEGER,
                content BLOB NOT NULL,
                content_hash TEXT NOT NULL,
                description TEXT NOT NULL,
                tags TEXT NOT NULL,
                author_id TEXT NOT NULL,
                tombstone INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(name, version)
            );

            CREATE INDEX IF NOT EXISTS idx_skill_versions_name ON skill_versions(name, version);
        "#,
}];
