use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::model::{
    ColumnKind, Index, TableNames, CONTENT_COLUMN, DOCUMENT_ID_COLUMN, ID_COLUMN, TYPE_COLUMN,
    VERSION_COLUMN,
};
use crate::storage::Connection;
use crate::value::Parameters;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub primary_key: bool,
    /// Backend-generated surrogate key.
    pub identity: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            primary_key: false,
            identity: false,
        }
    }

    pub fn identity(name: impl Into<String>) -> Self {
        Self {
            identity: true,
            primary_key: true,
            ..Self::new(name, ColumnKind::Integer)
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub table: String,
    pub references: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl CreateTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn references(
        mut self,
        column: impl Into<String>,
        table: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            table: table.into(),
            references: references.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndex {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaCommand {
    CreateTable(CreateTable),
    DropTable(String),
    CreateIndex(CreateIndex),
}

/// Builds the structural commands for documents and index tables of one
/// collection and runs them through a connection.
pub struct SchemaBuilder<'a> {
    dialect: &'a dyn SqlDialect,
    names: TableNames,
    commands: Vec<SchemaCommand>,
}

impl<'a> SchemaBuilder<'a> {
    pub fn new(dialect: &'a dyn SqlDialect, names: TableNames) -> Self {
        Self {
            dialect,
            names,
            commands: Vec::new(),
        }
    }

    pub fn create_document_table(&mut self) -> &mut Self {
        let table = CreateTable::new(self.names.document())
            .column(ColumnDef::new(ID_COLUMN, ColumnKind::Integer).primary_key())
            .column(ColumnDef::new(TYPE_COLUMN, ColumnKind::Text))
            .column(ColumnDef::new(CONTENT_COLUMN, ColumnKind::Text))
            .column(ColumnDef::new(VERSION_COLUMN, ColumnKind::Integer));
        let index = CreateIndex {
            name: format!("IDX_{}_Type", table.name),
            table: table.name.clone(),
            columns: vec![TYPE_COLUMN.to_string()],
        };
        self.commands.push(SchemaCommand::CreateTable(table));
        self.commands.push(SchemaCommand::CreateIndex(index));
        self
    }

    pub fn create_map_index_table<I: Index>(&mut self) -> &mut Self {
        let name = self.names.index(I::NAME);
        let mut table = CreateTable::new(name.clone())
            .column(ColumnDef::identity(ID_COLUMN))
            .column(ColumnDef::new(DOCUMENT_ID_COLUMN, ColumnKind::Integer));
        for col in I::COLUMNS {
            table = table.column(ColumnDef::new(col.name, col.kind).nullable(col.nullable));
        }
        table = table.references(DOCUMENT_ID_COLUMN, self.names.document(), ID_COLUMN);
        self.commands.push(SchemaCommand::CreateTable(table));
        self.commands.push(SchemaCommand::CreateIndex(CreateIndex {
            name: format!("IDX_{name}_DocumentId"),
            table: name,
            columns: vec![DOCUMENT_ID_COLUMN.to_string()],
        }));
        self
    }

    pub fn create_reduce_index_table<I: Index>(&mut self) -> &mut Self {
        let name = self.names.index(I::NAME);
        let mut table = CreateTable::new(name.clone()).column(ColumnDef::identity(ID_COLUMN));
        for col in I::COLUMNS {
            table = table.column(ColumnDef::new(col.name, col.kind).nullable(col.nullable));
        }
        self.commands.push(SchemaCommand::CreateTable(table));

        let bridge = self.names.bridge(I::NAME);
        let link = TableNames::bridge_column(I::NAME);
        let bridge_table = CreateTable::new(bridge.clone())
            .column(ColumnDef::new(link.clone(), ColumnKind::Integer))
            .column(ColumnDef::new(DOCUMENT_ID_COLUMN, ColumnKind::Integer))
            .references(link.clone(), name, ID_COLUMN)
            .references(DOCUMENT_ID_COLUMN, self.names.document(), ID_COLUMN);
        self.commands.push(SchemaCommand::CreateTable(bridge_table));
        self.commands.push(SchemaCommand::CreateIndex(CreateIndex {
            name: format!("IDX_{bridge}_DocumentId"),
            table: bridge.clone(),
            columns: vec![link, DOCUMENT_ID_COLUMN.to_string()],
        }));
        self
    }

    pub fn drop_table(&mut self, name: impl Into<String>) -> &mut Self {
        self.commands.push(SchemaCommand::DropTable(name.into()));
        self
    }

    /// Drop the table of index `I` in this collection, bridge table first.
    pub fn drop_index_table<I: Index>(&mut self) -> &mut Self {
        let bridge = self.names.bridge(I::NAME);
        let index = self.names.index(I::NAME);
        self.drop_table(bridge).drop_table(index)
    }

    pub fn statements(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| self.dialect.render_schema(c))
            .collect()
    }

    pub async fn execute(&mut self, conn: &dyn Connection) -> Result<()> {
        let params = Parameters::new();
        for sql in self.statements() {
            debug!(%sql, "schema");
            conn.execute(&sql, &params).await?;
        }
        self.commands.clear();
        Ok(())
    }
}
