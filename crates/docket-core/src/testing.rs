//! In-memory collaborators for unit tests.

use crate::error::Result;
use crate::storage::{Connection, ConnectionFactory};
use crate::value::{Parameters, Row, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct State {
    executed: Vec<(String, Parameters)>,
    queried: Vec<(String, Parameters)>,
    transactions: Vec<&'static str>,
    affected: Option<u64>,
    rows: Vec<Row>,
    next_id: i64,
    delay: Duration,
}

/// Records every statement and answers queries with canned rows.
#[derive(Clone, Default)]
pub(crate) struct RecordingConnection {
    state: Arc<Mutex<State>>,
}

impl RecordingConnection {
    pub(crate) fn set_affected(&self, n: u64) {
        self.state.lock().affected = Some(n);
    }

    pub(crate) fn set_rows(&self, rows: Vec<Row>) {
        self.state.lock().rows = rows;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub(crate) fn executed(&self) -> Vec<(String, Parameters)> {
        self.state.lock().executed.clone()
    }

    pub(crate) fn queried(&self) -> Vec<(String, Parameters)> {
        self.state.lock().queried.clone()
    }

    pub(crate) fn transactions(&self) -> Vec<&'static str> {
        self.state.lock().transactions.clone()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn begin(&self) -> Result<()> {
        self.state.lock().transactions.push("begin");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.state.lock().transactions.push("commit");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.state.lock().transactions.push("rollback");
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &Parameters) -> Result<u64> {
        let mut state = self.state.lock();
        state.executed.push((sql.to_string(), params.clone()));
        Ok(state.affected.unwrap_or(1))
    }

    async fn execute_scalar(&self, sql: &str, params: &Parameters) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        state.executed.push((sql.to_string(), params.clone()));
        state.next_id += 1;
        Ok(Some(Value::Int(state.next_id)))
    }

    async fn query(&self, sql: &str, params: &Parameters) -> Result<Vec<Row>> {
        let delay = {
            let mut state = self.state.lock();
            state.queried.push((sql.to_string(), params.clone()));
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().rows.clone())
    }
}

#[async_trait]
impl ConnectionFactory for RecordingConnection {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.clone()))
    }
}
