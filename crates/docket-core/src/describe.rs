//! Index descriptors: how an entity type produces index rows.
//!
//! Providers register typed [`IndexDescriptor`]s through a
//! [`DescribeContext`]; the store erases them to [`DescribedIndex`] so the
//! session and index engine can drive any (entity, index) pair from
//! serialized content alone.

use crate::error::{DocketError, Result};
use crate::model::{decode_index, index_values, Column, Entity, Index, IndexKind};
use crate::value::{Row, Value};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

type MapFn<T, I> = Arc<dyn Fn(&T) -> Vec<I> + Send + Sync>;
type ReduceFn<I> = Arc<dyn Fn(Vec<I>) -> Option<I> + Send + Sync>;
type DeleteFn<I> = Arc<dyn Fn(I, Vec<I>) -> Option<I> + Send + Sync>;
type UpdateFn<I> = Arc<dyn Fn(I, Vec<I>) -> I + Send + Sync>;
type KeyFn<I> = Arc<dyn Fn(&I) -> Result<Value> + Send + Sync>;

/// Map/reduce functions of one index type over one entity type.
///
/// Without `reduce` the index is a map index: one row per mapped value,
/// owned by its document. With `reduce` it aggregates every mapped row that
/// shares the `group_by` column value into a single persisted row.
pub struct IndexDescriptor<T, I> {
    map: MapFn<T, I>,
    group_column: Option<&'static str>,
    group_key: Option<KeyFn<I>>,
    reduce: Option<ReduceFn<I>>,
    delete: Option<DeleteFn<I>>,
    update: Option<UpdateFn<I>>,
    _entity: PhantomData<fn(&T)>,
}

impl<T: Entity, I: Index> IndexDescriptor<T, I> {
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(&T) -> Vec<I> + Send + Sync + 'static,
    {
        Self {
            map: Arc::new(f),
            group_column: None,
            group_key: None,
            reduce: None,
            delete: None,
            update: None,
            _entity: PhantomData,
        }
    }

    /// Group rows by `column`. The accessor is built here once and reused by
    /// every reduce pass.
    pub fn group_by(mut self, column: &'static str) -> Self {
        self.group_column = Some(column);
        self.group_key = Some(Arc::new(move |row: &I| {
            index_values(row)?
                .into_iter()
                .find(|(name, _)| *name == column)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    DocketError::invariant(format!(
                        "index '{}' has no group column '{column}'",
                        I::NAME
                    ))
                })
        }));
        self
    }

    pub fn reduce<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<I>) -> Option<I> + Send + Sync + 'static,
    {
        self.reduce = Some(Arc::new(f));
        self
    }

    /// Remove contributions from an aggregate; `None` deletes the row.
    pub fn delete<F>(mut self, f: F) -> Self
    where
        F: Fn(I, Vec<I>) -> Option<I> + Send + Sync + 'static,
    {
        self.delete = Some(Arc::new(f));
        self
    }

    pub fn update<F>(mut self, f: F) -> Self
    where
        F: Fn(I, Vec<I>) -> I + Send + Sync + 'static,
    {
        self.update = Some(Arc::new(f));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.reduce.is_some() && self.group_column.is_none() {
            return Err(DocketError::invariant(format!(
                "index '{}' reduces over {} without a group key",
                I::NAME,
                T::TYPE
            )));
        }
        if let Some(column) = self.group_column {
            if I::column(column).is_none() {
                return Err(DocketError::invariant(format!(
                    "index '{}' has no group column '{column}'",
                    I::NAME
                )));
            }
        }
        Ok(())
    }
}

/// Collects the descriptors of one (entity type, collection) pair.
pub struct DescribeContext {
    entity_type: String,
    collection: String,
    described: Vec<Arc<dyn DescribedIndex>>,
}

impl DescribeContext {
    pub(crate) fn new(entity_type: &str, collection: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            collection: collection.to_string(),
            described: Vec::new(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Register a descriptor. Descriptors for other entity types are ignored
    /// so one provider can describe several types.
    pub fn add<T: Entity, I: Index>(&mut self, descriptor: IndexDescriptor<T, I>) -> Result<()> {
        if T::TYPE != self.entity_type {
            return Ok(());
        }
        descriptor.validate()?;
        if self
            .described
            .iter()
            .any(|d| d.index_name() == I::NAME)
        {
            return Err(DocketError::invariant(format!(
                "index '{}' is described twice for {}",
                I::NAME,
                T::TYPE
            )));
        }
        self.described.push(Arc::new(descriptor));
        Ok(())
    }

    pub(crate) fn finish(self) -> Vec<Arc<dyn DescribedIndex>> {
        self.described
    }
}

/// Supplies index descriptors for one collection.
pub trait IndexProvider: Send + Sync {
    /// Collection described by this provider; empty is the default one.
    fn collection(&self) -> &str {
        ""
    }

    fn describe(&self, ctx: &mut DescribeContext) -> Result<()>;
}

/// An index row whose concrete type only its descriptor knows.
pub(crate) type IndexRow = Arc<dyn Any + Send + Sync>;

/// Type-erased view of an [`IndexDescriptor`].
pub(crate) trait DescribedIndex: Send + Sync {
    fn index_name(&self) -> &'static str;

    fn columns(&self) -> &'static [Column];

    fn kind(&self) -> IndexKind;

    fn group_column(&self) -> Option<&'static str>;

    /// Run `map` over the serialized content of an entity.
    fn map(&self, content: &serde_json::Value) -> Result<Vec<IndexRow>>;

    fn group_key(&self, row: &IndexRow) -> Result<Value>;

    fn reduce(&self, rows: &[IndexRow]) -> Result<Option<IndexRow>>;

    fn delete(&self, current: &IndexRow, removed: &[IndexRow]) -> Result<Option<IndexRow>>;

    fn update(&self, current: &IndexRow, updated: &[IndexRow]) -> Result<IndexRow>;

    fn values(&self, row: &IndexRow) -> Result<Vec<(&'static str, Value)>>;

    fn decode(&self, row: &Row) -> Result<IndexRow>;
}

impl<T: Entity, I: Index> IndexDescriptor<T, I> {
    fn typed(row: &IndexRow) -> Result<I> {
        row.downcast_ref::<I>()
            .cloned()
            .ok_or_else(|| DocketError::Internal(format!("row is not a '{}' index row", I::NAME)))
    }

    fn typed_all(rows: &[IndexRow]) -> Result<Vec<I>> {
        rows.iter().map(Self::typed).collect()
    }

    fn erase(row: I) -> IndexRow {
        Arc::new(row)
    }
}

impl<T: Entity, I: Index> DescribedIndex for IndexDescriptor<T, I> {
    fn index_name(&self) -> &'static str {
        I::NAME
    }

    fn columns(&self) -> &'static [Column] {
        I::COLUMNS
    }

    fn kind(&self) -> IndexKind {
        if self.reduce.is_some() {
            IndexKind::Reduce
        } else {
            IndexKind::Map
        }
    }

    fn group_column(&self) -> Option<&'static str> {
        self.group_column
    }

    fn map(&self, content: &serde_json::Value) -> Result<Vec<IndexRow>> {
        let entity: T = serde_json::from_value(content.clone())?;
        Ok((self.map)(&entity).into_iter().map(Self::erase).collect())
    }

    fn group_key(&self, row: &IndexRow) -> Result<Value> {
        let key = self.group_key.as_ref().ok_or_else(|| {
            DocketError::invariant(format!("index '{}' has no group key", I::NAME))
        })?;
        key(&Self::typed(row)?)
    }

    fn reduce(&self, rows: &[IndexRow]) -> Result<Option<IndexRow>> {
        let reduce = self.reduce.as_ref().ok_or_else(|| {
            DocketError::invariant(format!("index '{}' has no reduce function", I::NAME))
        })?;
        Ok(reduce(Self::typed_all(rows)?).map(Self::erase))
    }

    fn delete(&self, current: &IndexRow, removed: &[IndexRow]) -> Result<Option<IndexRow>> {
        let delete = self.delete.as_ref().ok_or_else(|| {
            DocketError::invariant(format!(
                "index '{}' lost documents but has no delete function",
                I::NAME
            ))
        })?;
        Ok(delete(Self::typed(current)?, Self::typed_all(removed)?).map(Self::erase))
    }

    fn update(&self, current: &IndexRow, updated: &[IndexRow]) -> Result<IndexRow> {
        let update = self.update.as_ref().ok_or_else(|| {
            DocketError::invariant(format!("index '{}' has no update function", I::NAME))
        })?;
        Ok(Self::erase(update(
            Self::typed(current)?,
            Self::typed_all(updated)?,
        )))
    }

    fn values(&self, row: &IndexRow) -> Result<Vec<(&'static str, Value)>> {
        index_values(&Self::typed(row)?)
    }

    fn decode(&self, row: &Row) -> Result<IndexRow> {
        Ok(Self::erase(decode_index::<I>(row)?))
    }
}
