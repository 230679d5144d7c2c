pub(crate) const MIGRATION: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        title TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_owner_updated_at ON sessions (owner, updated_at DESC);

    CREATE TABLE IF NOT EXISTS messages (
        session_id TEXT NOT NULL,
        message_idx INTEGER NOT NULL,
        content TEXT NOT NULL,
        model_id TEXT NOT NULL,
        answer TEXT,
        failed INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (session_id, message_idx),
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );
"#;
