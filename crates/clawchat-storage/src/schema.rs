// ============================================================================
// SQLite schema definitions
// ============================================================================

/// Gateways table. The id is the same string used across downstream APIs
/// and WebSocket paths; token and password never leave this table through
/// the public listing queries.
pub const CREATE_GATEWAYS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS gateways (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    token TEXT,
    password TEXT,
    created_at INTEGER NOT NULL
);
"#;

/// Sessions table. A session is uniquely identified by
/// (gateway_id, session_key); the integer id exists for message foreign
/// keys and cursors.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    gateway_id TEXT NOT NULL,
    session_key TEXT NOT NULL,
    title TEXT,
    agent_id TEXT,
    model TEXT,
    created_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,

    UNIQUE(gateway_id, session_key),
    FOREIGN KEY (gateway_id) REFERENCES gateways(id) ON DELETE CASCADE
);
"#;

/// Messages table. Append-only; content is a JSON array of typed blocks.
pub const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER,
    created_at INTEGER NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
"#;

/// Federated sessions table. The ordered target list is serialized as a
/// JSON array so target shape changes don't require a schema change.
pub const CREATE_FEDERATED_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS federated_sessions (
    id TEXT PRIMARY KEY,
    title TEXT,
    targets TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL
);
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_sessions_gateway_key ON sessions(gateway_id, session_key);
CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sessions(last_activity DESC);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
"#;

/// All migration statements to run, in order.
pub const ALL_MIGRATIONS: &[&str] = &[
    CREATE_GATEWAYS_TABLE,
    CREATE_SESSIONS_TABLE,
    CREATE_MESSAGES_TABLE,
    CREATE_FEDERATED_SESSIONS_TABLE,
    CREATE_INDEXES,
];
