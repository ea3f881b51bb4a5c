//! The unit of work.

use crate::coalesce::{QueryCoalescer, QueryKey};
use crate::commands::Command;
use crate::engine::FlushArena;
use crate::error::Result;
use crate::model::{
    decode_index, Document, Entity, Index, CONTENT_COLUMN, ID_COLUMN, TYPE_COLUMN, VERSION_COLUMN,
};
use crate::predicate::CompiledQuery;
use crate::query::{DocumentQuery, IndexQuery};
use crate::storage::Connection;
use crate::store::Store;
use crate::value::{Parameters, Row};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocKey {
    collection: String,
    id: i64,
}

impl DocKey {
    fn new(collection: &str, id: i64) -> Self {
        Self {
            collection: collection.to_string(),
            id,
        }
    }
}

/// Persisted state of a document as this session last saw it.
#[derive(Debug, Clone)]
struct Tracked {
    content: String,
    json: serde_json::Value,
    version: i64,
}

#[derive(Debug, Clone)]
enum Pending {
    Save {
        key: DocKey,
        document_type: &'static str,
        json: serde_json::Value,
        content: String,
    },
    Delete {
        key: DocKey,
        document_type: &'static str,
    },
}

impl Pending {
    fn key(&self) -> &DocKey {
        match self {
            Pending::Save { key, .. } | Pending::Delete { key, .. } => key,
        }
    }
}

/// Tracks saves and deletes, turns them into document and index commands at
/// flush time and runs them inside one transaction on the session's own
/// connection.
///
/// Queries take `&self` and may run concurrently; identical in-flight
/// queries are coalesced. Mutating methods take `&mut self`.
pub struct Session {
    store: Store,
    conn: Box<dyn Connection>,
    tracked: Mutex<HashMap<DocKey, Tracked>>,
    pending: Vec<Pending>,
    /// Ids assigned by this session that have not been flushed yet.
    created: HashSet<DocKey>,
    coalescer: QueryCoalescer,
    in_transaction: bool,
    cancelled: bool,
}

impl Session {
    pub(crate) fn new(store: Store, conn: Box<dyn Connection>) -> Self {
        Self {
            store,
            conn,
            tracked: Mutex::new(HashMap::new()),
            pending: Vec::new(),
            created: HashSet::new(),
            coalescer: QueryCoalescer::new(),
            in_transaction: false,
            cancelled: false,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub async fn save<T: Entity>(&mut self, entity: &mut T) -> Result<()> {
        self.save_in("", entity).await
    }

    /// Schedule `entity` for insert or update. An entity without an id gets
    /// one here; an entity with an id this session has not loaded is looked
    /// up at flush time, and its id is never handed out again.
    pub async fn save_in<T: Entity>(&mut self, collection: &str, entity: &mut T) -> Result<()> {
        if entity.id() == 0 {
            let id = self.store.next_id(self.conn.as_ref(), collection).await?;
            entity.set_id(id);
            self.created.insert(DocKey::new(collection, id));
        } else {
            self.store
                .observe_id(self.conn.as_ref(), collection, entity.id())
                .await?;
        }
        let key = DocKey::new(collection, entity.id());
        let json = serde_json::to_value(&*entity)?;
        let content = self.store.serializer().serialize(&json)?;
        self.pending.retain(|p| p.key() != &key);
        self.pending.push(Pending::Save {
            key,
            document_type: T::TYPE,
            json,
            content,
        });
        Ok(())
    }

    pub async fn delete<T: Entity>(&mut self, entity: &T) -> Result<()> {
        self.delete_in("", entity).await
    }

    /// Schedule a delete. Deleting an entity created by this session and not
    /// flushed yet simply forgets it.
    pub async fn delete_in<T: Entity>(&mut self, collection: &str, entity: &T) -> Result<()> {
        let key = DocKey::new(collection, entity.id());
        self.pending.retain(|p| p.key() != &key);
        if self.created.remove(&key) {
            debug!(id = key.id, "deleted before first flush");
            return Ok(());
        }
        self.pending.push(Pending::Delete {
            key,
            document_type: T::TYPE,
        });
        Ok(())
    }

    pub async fn get<T: Entity>(&self, id: i64) -> Result<Option<T>> {
        self.get_in("", id).await
    }

    /// Load an entity. Pending saves and deletes of this session win over
    /// persisted state.
    pub async fn get_in<T: Entity>(&self, collection: &str, id: i64) -> Result<Option<T>> {
        let key = DocKey::new(collection, id);
        match self.pending.iter().find(|p| p.key() == &key) {
            Some(Pending::Save { json, .. }) => return Ok(Some(serde_json::from_value(json.clone())?)),
            Some(Pending::Delete { .. }) => return Ok(None),
            None => {}
        }
        let tracked = self.tracked.lock().get(&key).map(|t| t.json.clone());
        if let Some(json) = tracked {
            return Ok(Some(serde_json::from_value(json)?));
        }
        let (sql, params) = self.select_document(&key);
        let rows = self.fetch(&sql, &params).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let doc = Document::from_row(row)?;
        if doc.document_type != T::TYPE {
            return Ok(None);
        }
        let json = self.track(collection, doc)?;
        Ok(Some(serde_json::from_value(json)?))
    }

    pub fn query<T: Entity>(&self) -> DocumentQuery<'_, T> {
        DocumentQuery::new(self, "")
    }

    pub fn query_in<T: Entity>(&self, collection: &str) -> DocumentQuery<'_, T> {
        DocumentQuery::new(self, collection)
    }

    pub fn query_index<I: Index>(&self) -> IndexQuery<'_, I> {
        IndexQuery::new(self, "")
    }

    pub fn query_index_in<I: Index>(&self, collection: &str) -> IndexQuery<'_, I> {
        IndexQuery::new(self, collection)
    }

    pub async fn query_compiled<A, I>(&self, query: &CompiledQuery<A, I>, args: &A) -> Result<Vec<I>>
    where
        A: Send + Sync + 'static,
        I: Index,
    {
        self.query_compiled_in("", query, args).await
    }

    pub async fn query_compiled_in<A, I>(
        &self,
        collection: &str,
        query: &CompiledQuery<A, I>,
        args: &A,
    ) -> Result<Vec<I>>
    where
        A: Send + Sync + 'static,
        I: Index,
    {
        let compiled = self.store.compiled_sql(query, collection, args)?;
        let params = compiled.bind(args as &dyn Any)?;
        let rows = self.fetch(compiled.sql(), &params).await?;
        rows.iter().map(decode_index::<I>).collect()
    }

    /// Write pending changes inside the session transaction without
    /// committing. Any failure cancels the session.
    pub async fn flush(&mut self) -> Result<()> {
        if self.cancelled {
            debug!("session cancelled; flush skipped");
            return Ok(());
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        match self.flush_pending().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.cancelled = true;
                warn!(error = %err, "flush failed; session cancelled");
                Err(err)
            }
        }
    }

    /// Flush and commit. A cancelled session rolls back instead.
    pub async fn save_changes(&mut self) -> Result<()> {
        self.flush().await?;
        if self.cancelled {
            return self.rollback().await;
        }
        if self.in_transaction {
            self.in_transaction = false;
            self.conn.commit().await?;
            info!("committed");
        }
        self.coalescer.clear();
        Ok(())
    }

    /// Skip further flushes and roll back whatever was written.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// End the unit of work. Anything not committed is rolled back.
    pub async fn close(mut self) -> Result<()> {
        self.rollback().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.coalescer.clear();
        if self.in_transaction {
            self.in_transaction = false;
            self.conn.rollback().await?;
            info!("rolled back");
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<()> {
        let store = self.store.clone();
        let check = store.config().check_concurrency;
        let pending = self.pending.clone();
        let mut arena = FlushArena::default();
        let mut applied: Vec<(DocKey, Option<Tracked>)> = Vec::new();

        for change in &pending {
            match change {
                Pending::Delete { key, document_type } => {
                    let Some(old) = self.original(key).await? else {
                        debug!(id = key.id, "delete of a missing document ignored");
                        continue;
                    };
                    let names = store.names(&key.collection);
                    arena.push(Command::DeleteDocument {
                        names: names.clone(),
                        id: key.id,
                    });
                    for d in store.descriptors(document_type, &key.collection)?.iter() {
                        arena.deleted(&names, d, key.id, &old.json)?;
                    }
                    applied.push((key.clone(), None));
                }
                Pending::Save {
                    key,
                    document_type,
                    json,
                    content,
                } => {
                    let names = store.names(&key.collection);
                    let descriptors = store.descriptors(document_type, &key.collection)?;
                    let original = if self.created.contains(key) {
                        None
                    } else {
                        self.original(key).await?
                    };
                    let tracked = match original {
                        None => {
                            arena.push(Command::CreateDocument {
                                names: names.clone(),
                                id: key.id,
                                document_type: document_type.to_string(),
                                content: content.clone(),
                            });
                            for d in descriptors.iter() {
                                arena.created(&names, d, key.id, json)?;
                            }
                            Tracked {
                                content: content.clone(),
                                json: json.clone(),
                                version: 1,
                            }
                        }
                        Some(old) if old.content == *content => continue,
                        Some(old) => {
                            let version = old.version + 1;
                            arena.push(Command::UpdateDocument {
                                names: names.clone(),
                                id: key.id,
                                document_type: document_type.to_string(),
                                content: content.clone(),
                                version,
                                expected_version: check.then_some(old.version),
                            });
                            for d in descriptors.iter() {
                                arena.updated(&names, d, key.id, &old.json, json)?;
                            }
                            Tracked {
                                content: content.clone(),
                                json: json.clone(),
                                version,
                            }
                        }
                    };
                    applied.push((key.clone(), Some(tracked)));
                }
            }
        }

        if !arena.is_empty() {
            self.begin().await?;
        }
        let commands = arena.finish(self.conn.as_ref(), store.dialect()).await?;
        info!(
            documents = applied.len(),
            commands = commands.len(),
            "flushing"
        );
        for command in &commands {
            command.execute(self.conn.as_ref(), store.dialect()).await?;
        }

        let mut tracked = self.tracked.lock();
        for (key, state) in applied {
            match state {
                Some(state) => tracked.insert(key, state),
                None => tracked.remove(&key),
            };
        }
        drop(tracked);
        self.pending.clear();
        self.created.clear();
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.begin().await?;
            self.in_transaction = true;
            debug!("transaction started");
        }
        Ok(())
    }

    /// Last persisted state of a document, loading and tracking it if this
    /// session has not seen it yet.
    async fn original(&self, key: &DocKey) -> Result<Option<Tracked>> {
        if let Some(found) = self.tracked.lock().get(key).cloned() {
            return Ok(Some(found));
        }
        let (sql, params) = self.select_document(key);
        let rows = self.conn.query(&sql, &params).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let doc = Document::from_row(row)?;
        self.track(&key.collection, doc)?;
        Ok(self.tracked.lock().get(key).cloned())
    }

    fn select_document(&self, key: &DocKey) -> (String, Parameters) {
        let dialect = self.store.dialect();
        let q = |ident: &str| dialect.quote(ident);
        let p = dialect.parameter(0);
        let sql = format!(
            "SELECT {}, {}, {}, {} FROM {} WHERE {} = {p}",
            q(ID_COLUMN),
            q(TYPE_COLUMN),
            q(CONTENT_COLUMN),
            q(VERSION_COLUMN),
            q(&self.store.names(&key.collection).document()),
            q(ID_COLUMN)
        );
        (sql, Parameters::new().with(p, key.id))
    }

    /// Remember a loaded document unless it is already tracked, and return
    /// the content this session considers current.
    fn track(&self, collection: &str, doc: Document) -> Result<serde_json::Value> {
        let key = DocKey::new(collection, doc.id);
        let mut tracked = self.tracked.lock();
        if let Some(existing) = tracked.get(&key) {
            return Ok(existing.json.clone());
        }
        let json = self.store.serializer().deserialize(&doc.content)?;
        tracked.insert(
            key,
            Tracked {
                content: doc.content,
                json: json.clone(),
                version: doc.version,
            },
        );
        Ok(json)
    }

    pub(crate) fn materialize<T: Entity>(&self, collection: &str, row: &Row) -> Result<T> {
        let doc = Document::from_row(row)?;
        let key = DocKey::new(collection, doc.id);
        if let Some(Pending::Save { json, .. }) = self.pending.iter().find(|p| p.key() == &key) {
            return Ok(serde_json::from_value(json.clone())?);
        }
        let json = self.track(collection, doc)?;
        Ok(serde_json::from_value(json)?)
    }

    /// Run a query, sharing the result with identical queries already in
    /// flight on this session.
    pub(crate) async fn fetch(&self, sql: &str, params: &Parameters) -> Result<Arc<Vec<Row>>> {
        if !self.store.config().coalesce_queries {
            return Ok(Arc::new(self.conn.query(sql, params).await?));
        }
        let key = QueryKey::new(sql, params.clone());
        self.coalescer
            .produce(key, || self.conn.query(sql, params))
            .await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!("session dropped with an open transaction; it was not committed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::describe::{DescribeContext, IndexDescriptor, IndexProvider};
    use crate::dialect::StandardDialect;
    use crate::error::DocketError;
    use crate::id::{DefaultIdGenerator, IdGenerator};
    use crate::model::Column;
    use crate::predicate::field;
    use crate::testing::RecordingConnection;
    use crate::value::Value;
    use futures::future::join_all;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: i64,
        title: String,
    }

    impl Entity for Task {
        const TYPE: &'static str = "Task";

        fn id(&self) -> i64 {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = id;
        }
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct ByTitle {
        title: String,
    }

    impl Index for ByTitle {
        const NAME: &'static str = "ByTitle";
        const COLUMNS: &'static [Column] = &[Column::text("title")];
    }

    struct Tasks;

    impl IndexProvider for Tasks {
        fn describe(&self, ctx: &mut DescribeContext) -> Result<()> {
            ctx.add(IndexDescriptor::map(|t: &Task| {
                vec![ByTitle {
                    title: t.title.clone(),
                }]
            }))
        }
    }

    /// A store whose default collection is already seeded, so only flush
    /// statements reach the connection.
    fn store(conn: &RecordingConnection) -> Store {
        let ids = DefaultIdGenerator::new();
        ids.seed("", 0);
        Store::builder(StandardDialect, conn.clone())
            .id_generator(ids)
            .provider(Tasks)
            .build()
    }

    fn task(title: &str) -> Task {
        Task {
            id: 0,
            title: title.into(),
        }
    }

    fn document_row(id: i64, title: &str, version: i64) -> Row {
        Row::new(vec![
            ("Id".into(), Value::Int(id)),
            ("Type".into(), Value::Text("Task".into())),
            (
                "Content".into(),
                Value::Text(format!(r#"{{"id":{id},"title":"{title}"}}"#)),
            ),
            ("Version".into(), Value::Int(version)),
        ])
    }

    #[tokio::test]
    async fn create_writes_document_before_map_rows() {
        let conn = RecordingConnection::default();
        let mut session = store(&conn).session().await.unwrap();
        let mut t = task("write docs");
        session.save(&mut t).await.unwrap();
        assert_eq!(t.id, 1);
        session.save_changes().await.unwrap();

        let executed = conn.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed[0].0.starts_with("INSERT INTO \"Document\""));
        assert!(executed[1].0.starts_with("INSERT INTO \"ByTitle\""));
        assert_eq!(conn.transactions(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn unseeded_collections_start_above_the_stored_maximum() {
        let conn = RecordingConnection::default();
        let store = Store::builder(StandardDialect, conn.clone())
            .provider(Tasks)
            .build();
        let mut session = store.session().await.unwrap();
        let mut first = task("a");
        let mut second = task("b");
        session.save(&mut first).await.unwrap();
        session.save(&mut second).await.unwrap();
        // the recording connection answers the MAX lookup with 1
        assert_eq!((first.id, second.id), (2, 3));

        let mut chosen = Task {
            id: 40,
            title: "chosen".into(),
        };
        session.save(&mut chosen).await.unwrap();
        let mut after = task("c");
        session.save(&mut after).await.unwrap();
        assert_eq!(after.id, 41);

        let lookups = conn
            .executed()
            .iter()
            .filter(|(sql, _)| sql.starts_with("SELECT MAX"))
            .count();
        assert_eq!(lookups, 1);
    }

    #[tokio::test]
    async fn save_then_delete_before_flush_is_a_no_op() {
        let conn = RecordingConnection::default();
        let mut session = store(&conn).session().await.unwrap();
        let mut t = task("ephemeral");
        session.save(&mut t).await.unwrap();
        session.delete(&t).await.unwrap();
        assert!(!session.has_changes());
        session.save_changes().await.unwrap();
        assert!(conn.executed().is_empty());
        assert!(conn.transactions().is_empty());
    }

    #[tokio::test]
    async fn unchanged_content_issues_no_commands() {
        let conn = RecordingConnection::default();
        conn.set_rows(vec![document_row(5, "same", 1)]);
        let mut session = store(&conn).session().await.unwrap();
        let mut loaded: Task = session.get(5).await.unwrap().unwrap();
        session.save(&mut loaded).await.unwrap();
        session.save_changes().await.unwrap();
        assert!(conn.executed().is_empty());
    }

    #[tokio::test]
    async fn update_replaces_map_rows_and_bumps_version() {
        let conn = RecordingConnection::default();
        conn.set_rows(vec![document_row(5, "old", 3)]);
        let mut session = store(&conn).session().await.unwrap();
        let mut loaded: Task = session.get(5).await.unwrap().unwrap();
        loaded.title = "new".into();
        session.save(&mut loaded).await.unwrap();
        session.save_changes().await.unwrap();

        let executed = conn.executed();
        assert_eq!(executed.len(), 3);
        assert!(executed[0].0.starts_with("UPDATE \"Document\""));
        assert_eq!(executed[0].1.get("@p1"), Some(&Value::Int(4)));
        assert_eq!(executed[0].1.get("@p3"), Some(&Value::Int(3)));
        assert!(executed[1].0.starts_with("DELETE FROM \"ByTitle\""));
        assert!(executed[2].0.starts_with("INSERT INTO \"ByTitle\""));
    }

    #[tokio::test]
    async fn failed_flush_cancels_and_rolls_back() {
        let conn = RecordingConnection::default();
        conn.set_rows(vec![document_row(5, "old", 1)]);
        let mut session = store(&conn).session().await.unwrap();
        let mut loaded: Task = session.get(5).await.unwrap().unwrap();
        loaded.title = "mine".into();
        session.save(&mut loaded).await.unwrap();
        conn.set_affected(0);

        let err = session.save_changes().await.unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert!(session.is_cancelled());
        session.close().await.unwrap();
        assert_eq!(conn.transactions(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn cancelled_session_never_commits() {
        let conn = RecordingConnection::default();
        let mut session = store(&conn).session().await.unwrap();
        let mut t = task("draft");
        session.save(&mut t).await.unwrap();
        session.flush().await.unwrap();
        session.cancel();
        session.save_changes().await.unwrap();
        assert_eq!(conn.transactions(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn concurrent_identical_queries_reach_storage_once() {
        let conn = RecordingConnection::default();
        conn.set_delay(Duration::from_millis(20));
        let session = store(&conn).session().await.unwrap();
        let queries = (0..5).map(|_| {
            session
                .query_index::<ByTitle>()
                .filter(field::<ByTitle>("title").eq("x"))
                .list()
        });
        for result in join_all(queries).await {
            assert!(result.unwrap().is_empty());
        }
        assert_eq!(conn.queried().len(), 1);
    }

    #[tokio::test]
    async fn document_queries_join_their_indexes() {
        let conn = RecordingConnection::default();
        let session = store(&conn).session().await.unwrap();
        let (sql, params) = session
            .query::<Task>()
            .with::<ByTitle>(field::<ByTitle>("title").starts_with("a"))
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT \"d\".\"Id\", \"d\".\"Type\", \"d\".\"Content\", \"d\".\"Version\" \
             FROM \"Document\" AS \"d\" INNER JOIN \"ByTitle\" AS \"ByTitle\" ON \"ByTitle\".\"DocumentId\" = \"d\".\"Id\" \
             WHERE \"d\".\"Type\" = @p0 AND \"ByTitle\".\"title\" LIKE @p1"
        );
        assert_eq!(params.get("@p1"), Some(&Value::Text("a%".into())));

        let err = session
            .query::<Task>()
            .with::<Undescribed>(field::<Undescribed>("x").eq(1))
            .to_sql()
            .unwrap_err();
        assert!(matches!(err, DocketError::Validation(_)));
    }

    #[tokio::test]
    async fn ordered_document_queries_group_by_document() {
        let conn = RecordingConnection::default();
        let session = store(&conn).session().await.unwrap();
        let (sql, _) = session
            .query::<Task>()
            .with::<ByTitle>(field::<ByTitle>("title").starts_with("a"))
            .order_by_descending(field::<ByTitle>("title"))
            .take(3)
            .to_sql()
            .unwrap();
        assert!(!sql.contains("DISTINCT"));
        assert!(sql.ends_with(
            "GROUP BY \"d\".\"Id\", \"d\".\"Type\", \"d\".\"Content\", \"d\".\"Version\" \
             ORDER BY MAX(\"ByTitle\".\"title\") DESC LIMIT 3"
        ));
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct Undescribed {
        x: i64,
    }

    impl Index for Undescribed {
        const NAME: &'static str = "Undescribed";
        const COLUMNS: &'static [Column] = &[Column::integer("x")];
    }
}
