//! Neo4j-backed persistent store for aggregate queries
//!
//! Each query kind is registered with the Cypher statement that computes it
//! and the columns to read back. Parameters are passed as Cypher parameters,
//! never spliced into the statement text.

use crate::codec::{Field, QueryValue, Row};
use crate::error::StoreError;
use crate::key::{ParamValue, QueryParams};
use crate::store::PersistentStore;
use async_trait::async_trait;
use neo4rs::{query, BoltNull, BoltType, ConfigBuilder, Graph, Row as BoltRow};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// How result rows map onto a [`QueryValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Every returned row becomes a [`Row`] of the declared columns
    Rows,
    /// The first column of the single returned row is the result
    Scalar,
}

/// A registered Cypher aggregate query
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    cypher: String,
    columns: Vec<String>,
    shape: ResultShape,
}

impl AggregateQuery {
    /// A query returning rows of `columns`
    pub fn rows<C, I>(cypher: impl Into<String>, columns: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = C>,
    {
        Self {
            cypher: cypher.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            shape: ResultShape::Rows,
        }
    }

    /// A query returning a single integer or string in `column`
    pub fn scalar(cypher: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            cypher: cypher.into(),
            columns: vec![column.into()],
            shape: ResultShape::Scalar,
        }
    }

    pub fn cypher(&self) -> &str {
        &self.cypher
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }
}

/// [`PersistentStore`] executing registered Cypher queries through neo4rs
pub struct Neo4jAggregateStore {
    graph: Graph,
    queries: HashMap<String, AggregateQuery>,
}

impl Neo4jAggregateStore {
    /// Connect to Neo4j
    ///
    /// # Arguments
    /// * `uri` - Neo4j connection URI (e.g., "bolt://localhost:7687")
    /// * `user` - Username for authentication
    /// * `password` - Password for authentication
    /// * `database` - Database name (default: "neo4j")
    pub async fn connect(
        uri: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, StoreError> {
        info!("Connecting to Neo4j at {} (database: {})", uri, database);

        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db(database)
            .fetch_size(500)
            .max_connections(16)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let graph = Graph::connect(config)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Successfully connected to Neo4j");
        Ok(Self::from_graph(graph))
    }

    /// Wrap an existing graph handle
    pub fn from_graph(graph: Graph) -> Self {
        Self {
            graph,
            queries: HashMap::new(),
        }
    }

    /// Register the query computing `query_kind`
    pub fn register(mut self, query_kind: impl Into<String>, query: AggregateQuery) -> Self {
        self.queries.insert(query_kind.into(), query);
        self
    }

    pub fn query_for(&self, query_kind: &str) -> Option<&AggregateQuery> {
        self.queries.get(query_kind)
    }

    /// Get a reference to the underlying Neo4j Graph instance
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

#[async_trait]
impl PersistentStore for Neo4jAggregateStore {
    async fn execute_aggregate_query(
        &self,
        query_kind: &str,
        params: &QueryParams,
    ) -> Result<QueryValue, StoreError> {
        let registered = self
            .queries
            .get(query_kind)
            .ok_or_else(|| StoreError::UnknownQuery(query_kind.to_string()))?;

        let mut cypher = query(&registered.cypher);
        for (name, value) in params {
            cypher = cypher.param(name, to_bolt(value));
        }

        let start = Instant::now();
        let mut result = self.graph.execute(cypher).await.map_err(|e| {
            StoreError::Query(format!("Failed to execute '{}': {}", query_kind, e))
        })?;

        let mut rows = Vec::new();
        while let Some(row) = result.next().await.map_err(|e| {
            StoreError::Query(format!("Failed to read '{}' row: {}", query_kind, e))
        })? {
            let fields = registered
                .columns
                .iter()
                .map(|column| field_at(&row, column))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(Row::new(fields));
        }

        debug!(
            "Aggregate query '{}' returned {} rows in {}ms",
            query_kind,
            rows.len(),
            start.elapsed().as_millis()
        );

        shape_result(query_kind, registered.shape, rows)
    }
}

fn to_bolt(value: &ParamValue) -> BoltType {
    match value {
        ParamValue::Null => BoltType::Null(BoltNull),
        ParamValue::Bool(b) => (*b).into(),
        ParamValue::Int(i) => (*i).into(),
        ParamValue::Float(f) => (*f).into(),
        ParamValue::Text(s) => s.clone().into(),
    }
}

/// Read a scalar column, trying the narrowest type first
fn field_at(row: &BoltRow, column: &str) -> Result<Field, StoreError> {
    if let Ok(i) = row.get::<i64>(column) {
        return Ok(Field::Int(i));
    }
    if let Ok(f) = row.get::<f64>(column) {
        return Ok(Field::Float(f));
    }
    if let Ok(b) = row.get::<bool>(column) {
        return Ok(Field::Bool(b));
    }
    if let Ok(s) = row.get::<String>(column) {
        return Ok(Field::Text(s));
    }
    if let Ok(None) = row.get::<Option<String>>(column) {
        return Ok(Field::Null);
    }
    Err(StoreError::Query(format!(
        "column '{}' is missing or not a scalar",
        column
    )))
}

fn shape_result(query_kind: &str, shape: ResultShape, rows: Vec<Row>) -> Result<QueryValue, StoreError> {
    match shape {
        ResultShape::Rows => Ok(QueryValue::Rows(rows)),
        ResultShape::Scalar => {
            let first = rows.into_iter().next().and_then(|row| row.0.into_iter().next());
            match first {
                Some(Field::Int(i)) => Ok(QueryValue::Integer(i)),
                Some(Field::Text(s)) => Ok(QueryValue::Text(s)),
                Some(other) => Err(StoreError::Query(format!(
                    "scalar query '{}' returned {:?}, expected an integer or string",
                    query_kind, other
                ))),
                None => Err(StoreError::Query(format!(
                    "scalar query '{}' returned no rows",
                    query_kind
                ))),
            }
        }
    }
}
