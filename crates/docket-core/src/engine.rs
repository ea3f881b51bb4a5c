//! Flush-time index maintenance.
//!
//! Map-only descriptors turn straight into commands tied to their document.
//! Reducing descriptors buffer [`MapState`] entries here; [`FlushArena::finish`]
//! then merges every touched group with its persisted aggregate and emits one
//! command per group.

use crate::commands::Command;
use crate::describe::{DescribedIndex, IndexRow};
use crate::dialect::SqlDialect;
use crate::error::{DocketError, Result};
use crate::model::{IndexKind, TableNames, ID_COLUMN};
use crate::predicate::{Expr, Member, PredicateCompiler};
use crate::query::index_select;
use crate::storage::Connection;
use crate::value::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapStateKind {
    New,
    /// Folded in through the descriptor's `update` function. Entity updates
    /// never produce it; they buffer Delete plus New.
    Update,
    Delete,
}

/// A mapped row waiting for the reduce phase of the current flush.
pub(crate) struct MapState {
    row: IndexRow,
    key: Value,
    document_id: i64,
    state: MapStateKind,
}

struct Buffer {
    names: TableNames,
    descriptor: Arc<dyn DescribedIndex>,
    entries: Vec<MapState>,
}

/// Per-flush scratch space. Created fresh by every flush and dropped with it.
#[derive(Default)]
pub(crate) struct FlushArena {
    buffers: Vec<Buffer>,
    commands: Vec<Command>,
}

impl FlushArena {
    pub(crate) fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.buffers.is_empty()
    }

    /// Index work for a newly created document.
    pub(crate) fn created(
        &mut self,
        names: &TableNames,
        descriptor: &Arc<dyn DescribedIndex>,
        document_id: i64,
        content: &serde_json::Value,
    ) -> Result<()> {
        let rows = descriptor.map(content)?;
        match descriptor.kind() {
            IndexKind::Map => self.create_map_rows(names, descriptor, document_id, &rows),
            IndexKind::Reduce => {
                self.buffer(names, descriptor, document_id, rows, MapStateKind::New)
            }
        }
    }

    pub(crate) fn deleted(
        &mut self,
        names: &TableNames,
        descriptor: &Arc<dyn DescribedIndex>,
        document_id: i64,
        content: &serde_json::Value,
    ) -> Result<()> {
        match descriptor.kind() {
            IndexKind::Map => {
                self.commands.push(Command::DeleteMapIndex {
                    names: names.clone(),
                    index: descriptor.index_name(),
                    document_id,
                });
                Ok(())
            }
            IndexKind::Reduce => {
                let rows = descriptor.map(content)?;
                self.buffer(names, descriptor, document_id, rows, MapStateKind::Delete)
            }
        }
    }

    /// An update is a delete of the old mapped rows plus a create of the new
    /// ones, whether or not the group key changed.
    pub(crate) fn updated(
        &mut self,
        names: &TableNames,
        descriptor: &Arc<dyn DescribedIndex>,
        document_id: i64,
        old: &serde_json::Value,
        new: &serde_json::Value,
    ) -> Result<()> {
        match descriptor.kind() {
            IndexKind::Map => {
                self.commands.push(Command::DeleteMapIndex {
                    names: names.clone(),
                    index: descriptor.index_name(),
                    document_id,
                });
                let rows = descriptor.map(new)?;
                self.create_map_rows(names, descriptor, document_id, &rows)
            }
            IndexKind::Reduce => {
                let old_rows = descriptor.map(old)?;
                let new_rows = descriptor.map(new)?;
                self.buffer(names, descriptor, document_id, old_rows, MapStateKind::Delete)?;
                self.buffer(names, descriptor, document_id, new_rows, MapStateKind::New)
            }
        }
    }

    fn create_map_rows(
        &mut self,
        names: &TableNames,
        descriptor: &Arc<dyn DescribedIndex>,
        document_id: i64,
        rows: &[IndexRow],
    ) -> Result<()> {
        for row in rows {
            self.commands.push(Command::CreateMapIndex {
                names: names.clone(),
                index: descriptor.index_name(),
                document_id,
                values: descriptor.values(row)?,
            });
        }
        Ok(())
    }

    fn buffer(
        &mut self,
        names: &TableNames,
        descriptor: &Arc<dyn DescribedIndex>,
        document_id: i64,
        rows: Vec<IndexRow>,
        state: MapStateKind,
    ) -> Result<()> {
        let keys = keys_of(descriptor, &rows)?;
        let buffer = self.buffer_for(names, descriptor);
        for (row, key) in rows.into_iter().zip(keys) {
            buffer.entries.push(MapState {
                row,
                key,
                document_id,
                state,
            });
        }
        Ok(())
    }

    fn buffer_for(&mut self, names: &TableNames, descriptor: &Arc<dyn DescribedIndex>) -> &mut Buffer {
        let pos = self.buffers.iter().position(|b| {
            b.names == *names && b.descriptor.index_name() == descriptor.index_name()
        });
        let pos = match pos {
            Some(pos) => pos,
            None => {
                self.buffers.push(Buffer {
                    names: names.clone(),
                    descriptor: descriptor.clone(),
                    entries: Vec::new(),
                });
                self.buffers.len() - 1
            }
        };
        &mut self.buffers[pos]
    }

    /// Run the reduce phase and return every command of this flush in
    /// execution order.
    pub(crate) async fn finish(
        mut self,
        conn: &dyn Connection,
        dialect: &dyn SqlDialect,
    ) -> Result<Vec<Command>> {
        for buffer in std::mem::take(&mut self.buffers) {
            let emitted = reduce_buffer(&buffer, conn, dialect).await?;
            debug!(
                index = buffer.descriptor.index_name(),
                collection = buffer.names.collection(),
                entries = buffer.entries.len(),
                commands = emitted.len(),
                "reduced"
            );
            self.commands.extend(emitted);
        }
        self.commands.sort_by_key(Command::priority);
        Ok(self.commands)
    }
}

fn keys_of(descriptor: &Arc<dyn DescribedIndex>, rows: &[IndexRow]) -> Result<Vec<Value>> {
    rows.iter().map(|r| descriptor.group_key(r)).collect()
}

async fn reduce_buffer(
    buffer: &Buffer,
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
) -> Result<Vec<Command>> {
    let d = &buffer.descriptor;
    let mut seen = HashSet::new();
    let keys: Vec<&Value> = buffer
        .entries
        .iter()
        .map(|e| &e.key)
        .filter(|k| seen.insert(*k))
        .collect();

    let mut commands = Vec::new();
    for key in keys {
        let group = |state: MapStateKind| -> Vec<&MapState> {
            buffer
                .entries
                .iter()
                .filter(|e| e.state == state && e.key == *key)
                .collect()
        };
        let created = group(MapStateKind::New);
        let updated = group(MapStateKind::Update);
        let deleted = group(MapStateKind::Delete);

        let candidate = if created.is_empty() {
            None
        } else {
            Some(collapse(d.as_ref(), &rows_of(&created), key)?)
        };
        let persisted = load_persisted(buffer, conn, dialect, key).await?;

        let mut current = match (&persisted, candidate) {
            (Some((_, p)), Some(c)) => Some(collapse(d.as_ref(), &[p.clone(), c], key)?),
            (Some((_, p)), None) => Some(p.clone()),
            (None, c) => c,
        };
        if !deleted.is_empty() {
            if let Some(c) = current {
                current = d.delete(&c, &rows_of(&deleted))?;
            }
        }
        if !updated.is_empty() {
            if let Some(c) = current {
                current = Some(d.update(&c, &rows_of(&updated))?);
            }
        }

        let mut link: BTreeSet<i64> = created.iter().map(|e| e.document_id).collect();
        let mut unlink: BTreeSet<i64> = deleted.iter().map(|e| e.document_id).collect();
        let both: Vec<i64> = link.intersection(&unlink).copied().collect();
        for id in both {
            link.remove(&id);
            unlink.remove(&id);
        }

        let names = buffer.names.clone();
        let index = d.index_name();
        match (persisted, current) {
            (None, None) => {}
            (None, Some(row)) => commands.push(Command::CreateReduceIndex {
                names,
                index,
                values: d.values(&row)?,
                link,
            }),
            (Some((id, _)), None) => commands.push(Command::DeleteReduceIndex { names, index, id }),
            (Some((id, _)), Some(row)) => commands.push(Command::UpdateReduceIndex {
                names,
                index,
                id,
                values: d.values(&row)?,
                link,
                unlink,
            }),
        }
    }
    Ok(commands)
}

fn rows_of(entries: &[&MapState]) -> Vec<IndexRow> {
    entries.iter().map(|e| e.row.clone()).collect()
}

/// Reduce `rows` that all share `key` into exactly one row with that key.
fn collapse(d: &dyn DescribedIndex, rows: &[IndexRow], key: &Value) -> Result<IndexRow> {
    let reduced = d.reduce(rows)?.ok_or_else(|| {
        DocketError::invariant(format!(
            "reduce of '{}' returned nothing for group {key}",
            d.index_name()
        ))
    })?;
    let reduced_key = d.group_key(&reduced)?;
    if reduced_key != *key {
        return Err(DocketError::invariant(format!(
            "reduce of '{}' for group {key} produced group {reduced_key}",
            d.index_name()
        )));
    }
    Ok(reduced)
}

/// The persisted aggregate row for `key`, with its identity.
async fn load_persisted(
    buffer: &Buffer,
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    key: &Value,
) -> Result<Option<(i64, IndexRow)>> {
    let d = &buffer.descriptor;
    let column = d.group_column().ok_or_else(|| {
        DocketError::invariant(format!("index '{}' has no group key", d.index_name()))
    })?;
    let lookup = Expr::Member(Member::new(d.index_name(), d.columns(), column)).eq(key.clone());
    let filter = PredicateCompiler::new(dialect, &buffer.names).compile(d.index_name(), &lookup)?;
    let sql = index_select(dialect, &buffer.names, d.index_name(), &filter.sql, "", "");
    let rows = conn.query(&sql, &filter.parameters).await?;
    match rows.as_slice() {
        [] => Ok(None),
        [row] => Ok(Some((row.get_i64(ID_COLUMN)?, d.decode(row)?))),
        _ => Err(DocketError::invariant(format!(
            "index '{}' holds {} rows for group {key}",
            d.index_name(),
            rows.len()
        ))),
    }
}
