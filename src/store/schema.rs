/// Schema for the local store tables.
pub const SCHEMA: &str = r#"
-- Per-owner records written locally and replayed to the server
CREATE TABLE IF NOT EXISTS health_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    remote_id TEXT UNIQUE,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_health_records_owner
    ON health_records(owner_id, created_at);

CREATE TABLE IF NOT EXISTS consultations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    remote_id TEXT UNIQUE,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_consultations_owner
    ON consultations(owner_id, created_at);

-- Full-replace snapshot of the server inventory
CREATE TABLE IF NOT EXISTS medicines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    category TEXT,
    stock_quantity INTEGER NOT NULL DEFAULT 0,
    price REAL,
    last_updated TEXT NOT NULL,
    extra TEXT NOT NULL DEFAULT '{}'
);

-- One row per user
CREATE TABLE IF NOT EXISTS user_profile (
    user_id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    last_updated TEXT NOT NULL
);

-- Pending mutations, replayed oldest first
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(timestamp, id);
"#;

/// Every table, in the order `clear_all` empties them.
pub const TABLES: [&str; 5] = [
  "health_records",
  "consultations",
  "medicines",
  "user_profile",
  "sync_queue",
];
