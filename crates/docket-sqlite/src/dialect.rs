use docket_core::model::ColumnKind;
use docket_core::SqlDialect;

/// SQLite flavour of the standard rendering.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    // OFFSET without LIMIT is a syntax error in SQLite
    fn paging(&self, skip: Option<u64>, take: Option<u64>) -> String {
        match (skip, take) {
            (None, None) => String::new(),
            (None, Some(take)) => format!(" LIMIT {take}"),
            (Some(skip), None) => format!(" LIMIT -1 OFFSET {skip}"),
            (Some(skip), Some(take)) => format!(" LIMIT {take} OFFSET {skip}"),
        }
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }

    fn identity_column(&self, name: &str) -> String {
        format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote(name))
    }
}
