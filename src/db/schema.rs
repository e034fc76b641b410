//! Postgres DDL for the orcha schemas.
//!
//! `orcha` holds tasks, runs and service heartbeats. `orcha_logs` holds the
//! persistent application log. Tables are only created when missing; an
//! existing table must match [`EXPECTED_TABLES`] column for column.

pub const ORCHA_SCHEMA: &str = "orcha";
pub const LOGS_SCHEMA: &str = "orcha_logs";

pub const CREATE_SCHEMAS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS orcha",
    "CREATE SCHEMA IF NOT EXISTS orcha_logs",
];

/// Tasks are versioned: every status change writes a new `(task_idk, version)` row.
pub const CREATE_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS orcha.tasks (
    task_idk TEXT NOT NULL,
    version TIMESTAMPTZ NOT NULL,
    task_metadata JSONB,
    task_tags JSONB,
    name TEXT,
    description TEXT,
    schedule_sets JSONB,
    thread_group TEXT,
    last_active TIMESTAMPTZ,
    status TEXT,
    notes TEXT,
    PRIMARY KEY (task_idk, version)
)
"#;

pub const CREATE_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS orcha.runs (
    run_idk TEXT PRIMARY KEY,
    task_idf TEXT,
    set_idf TEXT,
    run_type TEXT,
    scheduled_time TIMESTAMPTZ,
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    last_active TIMESTAMPTZ,
    config JSONB,
    status TEXT,
    output JSONB
)
"#;

pub const CREATE_SERVICE_STATUS: &str = r#"
CREATE TABLE IF NOT EXISTS orcha.service_status (
    service_type TEXT NOT NULL,
    service_idf TEXT NOT NULL,
    status_time TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (service_type, service_idf, status_time)
)
"#;

pub const CREATE_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS orcha_logs.logs (
    created TIMESTAMPTZ,
    id UUID PRIMARY KEY,
    actor TEXT,
    source TEXT,
    category TEXT,
    text TEXT,
    json JSONB
)
"#;

/// Run lookups filter by task and scheduled time, and usually by set and type.
pub const CREATE_INDEXES: &[&str] = &[
    r#"CREATE INDEX IF NOT EXISTS idx_orcha_runs_task_scheduled
       ON orcha.runs (task_idf, scheduled_time, run_type)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_orcha_runs_task_set_scheduled
       ON orcha.runs (task_idf, scheduled_time, set_idf, run_type)"#,
];

/// A table and the `(column_name, data_type)` pairs `information_schema` must report for it.
pub struct TableDefinition {
    pub schema: &'static str,
    pub table: &'static str,
    pub create: &'static str,
    pub columns: &'static [(&'static str, &'static str)],
}

impl TableDefinition {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

const TEXT: &str = "text";
const TIMESTAMPTZ: &str = "timestamp with time zone";
const JSONB: &str = "jsonb";
const UUID: &str = "uuid";

pub const EXPECTED_TABLES: &[TableDefinition] = &[
    TableDefinition {
        schema: ORCHA_SCHEMA,
        table: "tasks",
        create: CREATE_TASKS,
        columns: &[
            ("task_idk", TEXT),
            ("version", TIMESTAMPTZ),
            ("task_metadata", JSONB),
            ("task_tags", JSONB),
            ("name", TEXT),
            ("description", TEXT),
            ("schedule_sets", JSONB),
            ("thread_group", TEXT),
            ("last_active", TIMESTAMPTZ),
            ("status", TEXT),
            ("notes", TEXT),
        ],
    },
    TableDefinition {
        schema: ORCHA_SCHEMA,
        table: "runs",
        create: CREATE_RUNS,
        columns: &[
            ("run_idk", TEXT),
            ("task_idf", TEXT),
            ("set_idf", TEXT),
            ("run_type", TEXT),
            ("scheduled_time", TIMESTAMPTZ),
            ("start_time", TIMESTAMPTZ),
            ("end_time", TIMESTAMPTZ),
            ("last_active", TIMESTAMPTZ),
            ("config", JSONB),
            ("status", TEXT),
            ("output", JSONB),
        ],
    },
    TableDefinition {
        schema: ORCHA_SCHEMA,
        table: "service_status",
        create: CREATE_SERVICE_STATUS,
        columns: &[
            ("service_type", TEXT),
            ("service_idf", TEXT),
            ("status_time", TIMESTAMPTZ),
        ],
    },
    TableDefinition {
        schema: LOGS_SCHEMA,
        table: "logs",
        create: CREATE_LOGS,
        columns: &[
            ("created", TIMESTAMPTZ),
            ("id", UUID),
            ("actor", TEXT),
            ("source", TEXT),
            ("category", TEXT),
            ("text", TEXT),
            ("json", JSONB),
        ],
    },
];

/// Compare what the database reports against a definition.
///
/// Returns a description of the first difference, or `None` when they match.
/// Column order is ignored.
pub fn column_mismatch(def: &TableDefinition, actual: &[(String, String)]) -> Option<String> {
    for (name, data_type) in def.columns {
        match actual.iter().find(|(n, _)| n == name) {
            None => return Some(format!("missing column {name}")),
            Some((_, t)) if t != data_type => {
                return Some(format!("column {name} is {t}, expected {data_type}"));
            }
            Some(_) => {}
        }
    }
    actual
        .iter()
        .find(|(n, _)| !def.columns.iter().any(|(name, _)| name == n))
        .map(|(n, _)| format!("unexpected column {n}"))
}
