use crate::model::{ColumnKind, ID_COLUMN};
use crate::schema::{CreateIndex, CreateTable, SchemaCommand};

/// Backend-specific SQL rendering consumed by the predicate compiler, the
/// index engine and the schema builder.
///
/// Every method has an ANSI-flavoured default; backends override only what
/// differs.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn parameter(&self, ordinal: usize) -> String {
        format!("@p{ordinal}")
    }

    fn true_predicate(&self) -> &'static str {
        "1 = 1"
    }

    fn false_predicate(&self) -> &'static str {
        "1 = 0"
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("({})", parts.join(" || "))
    }

    fn in_list(&self, left: &str, items: &[String], negate: bool) -> String {
        let op = if negate { "NOT IN" } else { "IN" };
        format!("{left} {op} ({})", items.join(", "))
    }

    fn like(&self, left: &str, pattern: &str) -> String {
        format!("{left} LIKE {pattern}")
    }

    fn upper(&self, operand: &str) -> String {
        format!("UPPER({operand})")
    }

    fn lower(&self, operand: &str) -> String {
        format!("LOWER({operand})")
    }

    fn paging(&self, skip: Option<u64>, take: Option<u64>) -> String {
        match (skip, take) {
            (None, None) => String::new(),
            (None, Some(take)) => format!(" LIMIT {take}"),
            (Some(skip), None) => format!(" OFFSET {skip}"),
            (Some(skip), Some(take)) => format!(" LIMIT {take} OFFSET {skip}"),
        }
    }

    /// Turn an INSERT statement into one that yields the generated identity.
    fn insert_returning_id(&self, insert: &str) -> String {
        format!("{insert} RETURNING {}", self.quote(ID_COLUMN))
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Real => "DOUBLE PRECISION",
            ColumnKind::Text => "TEXT",
            ColumnKind::Boolean => "BOOLEAN",
        }
    }

    fn identity_column(&self, name: &str) -> String {
        format!(
            "{} BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
            self.quote(name)
        )
    }

    fn render_schema(&self, command: &SchemaCommand) -> String {
        match command {
            SchemaCommand::CreateTable(table) => self.create_table(table),
            SchemaCommand::DropTable(name) => format!("DROP TABLE IF EXISTS {}", self.quote(name)),
            SchemaCommand::CreateIndex(index) => self.create_index(index),
        }
    }

    fn create_table(&self, table: &CreateTable) -> String {
        let mut parts = Vec::new();
        for col in &table.columns {
            if col.identity {
                parts.push(self.identity_column(col.name.as_str()));
                continue;
            }
            let mut def = format!("{} {}", self.quote(&col.name), self.column_type(col.kind));
            if col.primary_key {
                def.push_str(" PRIMARY KEY");
            }
            if !col.nullable {
                def.push_str(" NOT NULL");
            }
            parts.push(def);
        }
        for fk in &table.foreign_keys {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                self.quote(&fk.column),
                self.quote(&fk.table),
                self.quote(&fk.references)
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(&table.name),
            parts.join(", ")
        )
    }

    fn create_index(&self, index: &CreateIndex) -> String {
        let cols: Vec<String> = index.columns.iter().map(|c| self.quote(c)).collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.quote(&index.name),
            self.quote(&index.table),
            cols.join(", ")
        )
    }
}

/// Dialect with every default rendering; used where no backend quirks apply.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDialect;

impl SqlDialect for StandardDialect {
    fn name(&self) -> &'static str {
        "standard"
    }
}
