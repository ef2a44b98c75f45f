//! Postgres pool backend built on sqlx
//!
//! Pools connect lazily: creating one never touches the network, so the
//! registry can build it while holding its lock. Parameters arrive as JSON
//! values and are bound positionally; rows come back as JSON maps.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode, PgTypeInfo,
};
use sqlx::{
    Executor as _,
    Arguments, Column, Encode, PgConnection, PgPool, Postgres, Row as _, Type, TypeInfo, ValueRef,
};
use tracing::{debug, error, warn};

use crate::collaborators::{KeywordClassifier, StatementClassifier};
use crate::error::{DataError, DataResult};
use crate::pool::{redact_url, InstancePool, PoolFactory, PoolSettings, Session};
use crate::types::{Param, QueryResult, Row};

/// Builds lazily-connecting `PgPool`s
#[derive(Debug, Clone, Copy, Default)]
pub struct PgPoolFactory;

impl PoolFactory for PgPoolFactory {
    fn create(&self, url: &str, settings: &PoolSettings) -> DataResult<Arc<dyn InstancePool>> {
        let redacted = redact_url(url);
        let mut options = PgConnectOptions::from_str(url).map_err(|err| {
            DataError::configuration(format!("invalid connection URL {redacted}: {err}"))
        })?;
        if settings.require_tls {
            options = options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .idle_timeout(Some(settings.idle_timeout))
            .acquire_timeout(settings.connect_timeout)
            .connect_lazy_with(options);

        Ok(Arc::new(PgInstancePool {
            pool,
            url: redacted,
            connect_timeout: settings.connect_timeout,
        }))
    }
}

/// One sqlx pool; faults surfacing through it are logged here
pub struct PgInstancePool {
    pool: PgPool,
    url: String,
    connect_timeout: Duration,
}

#[async_trait]
impl InstancePool for PgInstancePool {
    async fn acquire(&self) -> DataResult<Box<dyn Session>> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(Box::new(PgSession { conn })),
            Err(sqlx::Error::PoolTimedOut) => {
                warn!(url = %self.url, timeout = ?self.connect_timeout, "connection pool exhausted");
                Err(DataError::ConnectionTimeout {
                    timeout: self.connect_timeout,
                })
            }
            Err(err) => {
                error!(url = %self.url, error = %err, "unexpected error in connection pool");
                Err(err.into())
            }
        }
    }

    async fn close(&self) -> DataResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// A checked-out Postgres connection; returned to the pool on drop
pub struct PgSession {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl Session for PgSession {
    async fn query(&mut self, statement: &str, params: &[Param]) -> DataResult<QueryResult> {
        run_statement(&mut self.conn, statement, params).await
    }
}

async fn run_statement(
    conn: &mut PgConnection,
    statement: &str,
    params: &[Param],
) -> DataResult<QueryResult> {
    if params.is_empty() && is_transaction_control(statement) {
        let done = (&mut *conn).execute(sqlx::raw_sql(statement)).await?;
        return Ok(QueryResult {
            rows: Vec::new(),
            rows_affected: done.rows_affected(),
        });
    }

    let arguments = bind_params(params)?;
    if returns_rows(statement) {
        let fetched = sqlx::query_with(statement, arguments)
            .fetch_all(&mut *conn)
            .await?;
        let rows = fetched.iter().map(decode_row).collect::<DataResult<Vec<_>>>()?;
        Ok(QueryResult {
            rows_affected: rows.len() as u64,
            rows,
        })
    } else {
        let done = sqlx::query_with(statement, arguments)
            .execute(&mut *conn)
            .await?;
        Ok(QueryResult {
            rows: Vec::new(),
            rows_affected: done.rows_affected(),
        })
    }
}

fn is_transaction_control(statement: &str) -> bool {
    let keyword = statement.trim().trim_end_matches(';').trim();
    ["BEGIN", "COMMIT", "ROLLBACK"]
        .iter()
        .any(|k| keyword.eq_ignore_ascii_case(k))
}

fn returns_rows(statement: &str) -> bool {
    KeywordClassifier.is_read(statement)
        || statement
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|w| w.eq_ignore_ascii_case("RETURNING"))
}

/// NULL bound with no declared type, so Postgres infers it from context
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_params(params: &[Param]) -> DataResult<PgArguments> {
    let mut arguments = PgArguments::default();
    for (idx, param) in params.iter().enumerate() {
        let bound = match param {
            Value::Null => arguments.add(UntypedNull),
            Value::Bool(b) => arguments.add(*b),
            // int8 is the widest integer Postgres binds; larger integers would
            // silently round through float8
            Value::Number(n) if n.is_u64() && n.as_i64().is_none() => {
                return Err(DataError::statement(format!(
                    "parameter ${} is out of range for int8: {n}",
                    idx + 1
                )));
            }
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => arguments.add(i),
                (None, Some(f)) => arguments.add(f),
                (None, None) => arguments.add(n.to_string()),
            },
            Value::String(s) => arguments.add(s.clone()),
            other => arguments.add(sqlx::types::Json(other.clone())),
        };
        bound.map_err(|err| DataError::statement(format!("cannot bind parameter ${}: {err}", idx + 1)))?;
    }
    Ok(arguments)
}

fn decode_row(row: &PgRow) -> DataResult<Row> {
    let mut decoded = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = if row.try_get_raw(idx)?.is_null() {
            Value::Null
        } else {
            decode_value(row, idx, column.type_info().name())?
        };
        decoded.insert(column.name().to_owned(), value);
    }
    Ok(decoded)
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> DataResult<Value> {
    let value = match type_name {
        "BOOL" => Value::from(row.try_get::<bool, _>(idx)?),
        "INT2" => Value::from(row.try_get::<i16, _>(idx)?),
        "INT4" => Value::from(row.try_get::<i32, _>(idx)?),
        "INT8" => Value::from(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => Value::from(row.try_get::<f32, _>(idx)?),
        "FLOAT8" => Value::from(row.try_get::<f64, _>(idx)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            Value::from(row.try_get::<String, _>(idx)?)
        }
        "UUID" => Value::from(row.try_get::<uuid::Uuid, _>(idx)?.to_string()),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx)?,
        "TIMESTAMPTZ" => Value::from(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx)?
                .to_rfc3339(),
        ),
        "TIMESTAMP" => Value::from(row.try_get::<chrono::NaiveDateTime, _>(idx)?.to_string()),
        "DATE" => Value::from(row.try_get::<chrono::NaiveDate, _>(idx)?.to_string()),
        "TIME" => Value::from(row.try_get::<chrono::NaiveTime, _>(idx)?.to_string()),
        "TEXT[]" | "VARCHAR[]" => Value::from(row.try_get::<Vec<String>, _>(idx)?),
        "INT4[]" => Value::from(row.try_get::<Vec<i32>, _>(idx)?),
        "INT8[]" => Value::from(row.try_get::<Vec<i64>, _>(idx)?),
        other => {
            debug!(column = idx, column_type = other, "column type not decoded; cast it to text");
            Value::Null
        }
    };
    Ok(value)
}
