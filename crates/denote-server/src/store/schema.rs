use rusqlite_migration::{Migrations, M};

/// Schema migrations, tracked through SQLite's `user_version` pragma.
///
/// Column and index names are part of the on-disk format.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
CREATE TABLE IF NOT EXISTS "denote" (
    "key" BLOB NOT NULL PRIMARY KEY,
    "data" BLOB NOT NULL,
    "view_count" INT NOT NULL DEFAULT 0,
    "view_limit" INT NOT NULL DEFAULT 1,
    "dt_limit" DATETIME NOT NULL,
    "rm_key" BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS "key_dt_limit_index" ON "denote" ("key", "dt_limit");
CREATE INDEX IF NOT EXISTS "dt_limit_index" ON "denote" ("dt_limit");
CREATE UNIQUE INDEX IF NOT EXISTS "rm_key_index" ON "denote" ("rm_key");
"#,
    )])
}
