use crate::config::StoreConfig;
use crate::describe::{DescribeContext, DescribedIndex, IndexProvider};
use crate::dialect::SqlDialect;
use crate::error::{DocketError, Result};
use crate::id::{DefaultIdGenerator, IdGenerator};
use crate::model::{Index, IndexKind, TableNames, ID_COLUMN};
use crate::predicate::{CompiledQuery, CompiledSql};
use crate::schema::SchemaBuilder;
use crate::serializer::{ContentSerializer, JsonSerializer};
use crate::session::Session;
use crate::storage::{Connection, ConnectionFactory};
use crate::value::Parameters;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) type Descriptors = Arc<[Arc<dyn DescribedIndex>]>;

struct StoreInner {
    config: StoreConfig,
    dialect: Arc<dyn SqlDialect>,
    connections: Arc<dyn ConnectionFactory>,
    serializer: Arc<dyn ContentSerializer>,
    ids: Arc<dyn IdGenerator>,
    providers: RwLock<Vec<Arc<dyn IndexProvider>>>,
    descriptors: RwLock<HashMap<(String, String), Descriptors>>,
    compiled: RwLock<HashMap<(u64, String), Arc<CompiledSql>>>,
}

/// Process-wide entry point: collaborators, registered index providers and
/// the descriptor and compiled-SQL caches. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

pub struct StoreBuilder {
    config: StoreConfig,
    dialect: Arc<dyn SqlDialect>,
    connections: Arc<dyn ConnectionFactory>,
    serializer: Arc<dyn ContentSerializer>,
    ids: Arc<dyn IdGenerator>,
    providers: Vec<Arc<dyn IndexProvider>>,
}

impl StoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn serializer(mut self, serializer: impl ContentSerializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn provider(mut self, provider: impl IndexProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn build(self) -> Store {
        Store {
            inner: Arc::new(StoreInner {
                config: self.config,
                dialect: self.dialect,
                connections: self.connections,
                serializer: self.serializer,
                ids: self.ids,
                providers: RwLock::new(self.providers),
                descriptors: RwLock::new(HashMap::new()),
                compiled: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl Store {
    pub fn builder(
        dialect: impl SqlDialect + 'static,
        connections: impl ConnectionFactory + 'static,
    ) -> StoreBuilder {
        StoreBuilder {
            config: StoreConfig::default(),
            dialect: Arc::new(dialect),
            connections: Arc::new(connections),
            serializer: Arc::new(JsonSerializer),
            ids: Arc::new(DefaultIdGenerator::new()),
            providers: Vec::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.inner.dialect.as_ref()
    }

    pub(crate) fn serializer(&self) -> &dyn ContentSerializer {
        self.inner.serializer.as_ref()
    }

    pub(crate) fn ids(&self) -> &dyn IdGenerator {
        self.inner.ids.as_ref()
    }

    pub fn names(&self, collection: &str) -> TableNames {
        TableNames::new(self.inner.config.table_prefix.clone(), collection)
    }

    /// Add a provider. Cached descriptors are dropped so the next lookup
    /// sees it.
    pub fn register(&self, provider: impl IndexProvider + 'static) {
        self.inner.providers.write().push(Arc::new(provider));
        self.inner.descriptors.write().clear();
    }

    /// Descriptors of `entity_type` in `collection`, described once and then
    /// served from the cache.
    pub(crate) fn descriptors(&self, entity_type: &str, collection: &str) -> Result<Descriptors> {
        let key = (entity_type.to_string(), collection.to_string());
        if let Some(found) = self.inner.descriptors.read().get(&key) {
            return Ok(found.clone());
        }
        let mut cache = self.inner.descriptors.write();
        if let Some(found) = cache.get(&key) {
            return Ok(found.clone());
        }
        let mut ctx = DescribeContext::new(entity_type, collection);
        for provider in self.inner.providers.read().iter() {
            if provider.collection() == collection {
                provider.describe(&mut ctx)?;
            }
        }
        let described: Descriptors = ctx.finish().into();
        debug!(
            entity_type,
            collection,
            indexes = described.len(),
            "described"
        );
        cache.insert(key, described.clone());
        Ok(described)
    }

    pub(crate) fn index_kind(
        &self,
        entity_type: &str,
        collection: &str,
        index: &str,
    ) -> Result<IndexKind> {
        self.descriptors(entity_type, collection)?
            .iter()
            .find(|d| d.index_name() == index)
            .map(|d| d.kind())
            .ok_or_else(|| {
                DocketError::Validation(format!(
                    "index '{index}' is not described for {entity_type} in collection '{collection}'"
                ))
            })
    }

    pub(crate) fn compiled_sql<A: Send + Sync + 'static, I: Index>(
        &self,
        query: &CompiledQuery<A, I>,
        collection: &str,
        args: &A,
    ) -> Result<Arc<CompiledSql>> {
        let key = (query.discriminator(args)?, collection.to_string());
        if let Some(found) = self.inner.compiled.read().get(&key) {
            return Ok(found.clone());
        }
        let compiled = Arc::new(query.compile(self.dialect(), &self.names(collection), args)?);
        Ok(self
            .inner
            .compiled
            .write()
            .entry(key)
            .or_insert(compiled)
            .clone())
    }

    /// Open a unit of work on its own connection.
    pub async fn session(&self) -> Result<Session> {
        let conn = self.inner.connections.connect().await?;
        Ok(Session::new(self.clone(), conn))
    }

    /// Build and run schema commands for `collection` on a fresh connection.
    pub async fn execute_schema<F>(&self, collection: &str, build: F) -> Result<()>
    where
        F: FnOnce(&mut SchemaBuilder<'_>),
    {
        let conn = self.inner.connections.connect().await?;
        let mut builder = SchemaBuilder::new(self.dialect(), self.names(collection));
        build(&mut builder);
        builder.execute(conn.as_ref()).await?;
        info!(collection, "schema applied");
        Ok(())
    }

    /// Seed the id generator of `collection` from the highest persisted id.
    pub async fn initialize_collection(&self, collection: &str) -> Result<()> {
        let conn = self.inner.connections.connect().await?;
        self.seed_ids(conn.as_ref(), collection).await
    }

    /// Id for a new document of `collection`. A collection the generator has
    /// not seen yet is seeded from storage first.
    pub(crate) async fn next_id(&self, conn: &dyn Connection, collection: &str) -> Result<i64> {
        if !self.ids().is_seeded(collection) {
            self.seed_ids(conn, collection).await?;
        }
        Ok(self.ids().next_id(collection))
    }

    /// Keep generated ids of `collection` above an id chosen by the caller.
    pub(crate) async fn observe_id(
        &self,
        conn: &dyn Connection,
        collection: &str,
        id: i64,
    ) -> Result<()> {
        if !self.ids().is_seeded(collection) {
            self.seed_ids(conn, collection).await?;
        }
        self.ids().seed(collection, id);
        Ok(())
    }

    async fn seed_ids(&self, conn: &dyn Connection, collection: &str) -> Result<()> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            dialect.quote(ID_COLUMN),
            dialect.quote(&self.names(collection).document())
        );
        let max = conn
            .execute_scalar(&sql, &Parameters::new())
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        self.ids().seed(collection, max);
        debug!(collection, max, "seeded ids");
        Ok(())
    }
}
