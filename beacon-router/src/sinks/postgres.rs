use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::batch::{BatchOffset, DeliveryKey, Record};
use crate::sinks::{Delivery, Sink, SinkError};

/// A table identifier that is safe to place in statement text: ASCII
/// letters, digits and underscores, not starting with a digit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableNameError {
    #[error("table name is empty")]
    Empty,
    #[error("table name is longer than 63 bytes")]
    TooLong,
    #[error("table name {0:?} may only hold ASCII letters, digits and underscores")]
    InvalidCharacters(String),
}

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TableName {
    type Err = TableNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TableNameError::Empty);
        }
        if s.len() > 63 {
            return Err(TableNameError::TooLong);
        }
        let starts_with_digit = s.starts_with(|c: char| c.is_ascii_digit());
        if starts_with_digit || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TableNameError::InvalidCharacters(s.to_owned()));
        }
        Ok(TableName(s.to_owned()))
    }
}

/// Persists every record as one row, holding one pooled connection for the
/// duration of a batch.
#[derive(Clone)]
pub struct PgStoreSink {
    pool: PgPool,
    insert: Arc<str>,
}

impl PgStoreSink {
    pub fn new(pool: PgPool, table: &TableName) -> Self {
        // Only the validated table name is formatted in, record content is always bound
        let insert = format!(
            r#"INSERT INTO "{}" (jsontext, delivery_key) VALUES ($1, $2)"#,
            table.as_str()
        );
        Self {
            pool,
            insert: insert.into(),
        }
    }

    pub fn insert_statement(&self) -> &str {
        &self.insert
    }
}

#[async_trait]
impl Sink for PgStoreSink {
    fn name(&self) -> &str {
        "store"
    }

    async fn open(&self, batch: BatchOffset) -> Result<Box<dyn Delivery>, SinkError> {
        let conn = self.pool.acquire().await?;
        debug!(%batch, "acquired store connection");

        Ok(Box::new(PgDelivery {
            conn,
            insert: self.insert.clone(),
            batch,
            inserted: 0,
        }))
    }
}

/// Inserts go through a single connection, so they can only ever run one
/// after the other. The connection returns to the pool when this is dropped.
struct PgDelivery {
    conn: PoolConnection<Postgres>,
    insert: Arc<str>,
    batch: BatchOffset,
    inserted: u64,
}

#[async_trait]
impl Delivery for PgDelivery {
    #[instrument(skip_all, fields(ordinal = record.ordinal()))]
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        let key = DeliveryKey::new(self.batch, record).to_string();

        let result = sqlx::query(&self.insert)
            .bind(record.canonical())
            .bind(&key)
            .execute(&mut *self.conn)
            .await?;

        self.inserted += result.rows_affected();
        debug!(key, rows = result.rows_affected(), "record inserted");
        counter!("beacon_router_records_delivered_total", "sink" => "store").increment(1);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), SinkError> {
        debug!(batch = %self.batch, rows = self.inserted, "releasing store connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::Row;

    use super::*;

    const INJECTION: &str = "'); DROP TABLE beacon_records; --";

    #[test]
    fn validates_table_names() {
        assert_eq!(
            "beacon_records".parse::<TableName>().unwrap().as_str(),
            "beacon_records"
        );
        assert_eq!("BeaconRecords2".parse::<TableName>().unwrap().as_str(), "BeaconRecords2");
        assert_eq!("".parse::<TableName>(), Err(TableNameError::Empty));
        assert_eq!("a".repeat(64).parse::<TableName>(), Err(TableNameError::TooLong));
        for invalid in ["1records", "beacon-records", "records\"; --", "x y", "schema.table"] {
            assert!(matches!(
                invalid.parse::<TableName>(),
                Err(TableNameError::InvalidCharacters(_))
            ));
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn statement_text_never_contains_record_content(pool: PgPool) {
        let sink = PgStoreSink::new(pool, &"beacon_records".parse().unwrap());
        assert_eq!(
            sink.insert_statement(),
            r#"INSERT INTO "beacon_records" (jsontext, delivery_key) VALUES ($1, $2)"#
        );

        let before = sink.insert_statement().to_owned();
        let mut delivery = sink
            .open(BatchOffset { partition: 0, offset: 0 })
            .await
            .unwrap();
        delivery
            .accept(&Record::new(0, json!(INJECTION)))
            .await
            .unwrap();
        assert_eq!(sink.insert_statement(), before);
        assert!(!sink.insert_statement().contains(INJECTION));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn inserts_hostile_records_verbatim(pool: PgPool) {
        let sink = PgStoreSink::new(pool.clone(), &"beacon_records".parse().unwrap());
        let records = [
            Record::new(0, json!(INJECTION)),
            Record::new(1, json!({"m": INJECTION, "t": 2, "d": []})),
            Record::new(2, json!("it's a 'quoted' \\ value")),
        ];

        let mut delivery = sink
            .open(BatchOffset { partition: 1, offset: 9 })
            .await
            .expect("failed to acquire connection");
        for record in &records {
            delivery.accept(record).await.expect("failed to insert");
        }
        delivery.finish().await.unwrap();

        let rows = sqlx::query("SELECT jsontext, delivery_key FROM beacon_records ORDER BY id")
            .fetch_all(&pool)
            .await
            .expect("beacon_records must still exist");

        assert_eq!(rows.len(), records.len());
        for (row, record) in rows.iter().zip(records.iter()) {
            let jsontext: String = row.get("jsontext");
            let delivery_key: String = row.get("delivery_key");
            assert_eq!(jsontext, record.canonical());
            assert_eq!(delivery_key, format!("1/9:{}", record.ordinal()));
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn releases_connection_when_dropped(pool: PgPool) {
        let sink = PgStoreSink::new(pool.clone(), &"beacon_records".parse().unwrap());
        let idle_before = pool.num_idle();

        let delivery = sink
            .open(BatchOffset { partition: 0, offset: 1 })
            .await
            .unwrap();
        drop(delivery);

        // Connections are returned to the pool asynchronously
        for _ in 0..50 {
            if pool.num_idle() >= idle_before.max(1) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(pool.num_idle() >= 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn missing_table_is_reported_as_sink_error(pool: PgPool) {
        let sink = PgStoreSink::new(pool, &"no_such_table".parse().unwrap());
        let mut delivery = sink
            .open(BatchOffset { partition: 0, offset: 2 })
            .await
            .unwrap();

        match delivery.accept(&Record::new(0, json!({}))).await {
            Err(SinkError::Database(_)) => {}
            other => panic!("expected a database error, got {:?}", other),
        }
    }
}
