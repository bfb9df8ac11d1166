use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient, NoTls};

use super::{MergeOutcome, TableLayout, Warehouse, WarehouseError};
use crate::batch::{CellValue, Row};
use crate::config::{PostgresConfig, TableNames};
use crate::entity::{Column, ColumnType, Entity};
use crate::ledger::RunStatus;
use crate::reports::ReportCounts;
use crate::sql;

const DEFAULT_INSERT_BATCH_SIZE: usize = 500;
// PostgreSQL caps bind parameters per statement at u16::MAX.
const MAX_BIND_PARAMS: usize = 65_535;

/// Warehouse backed by one PostgreSQL schema.
pub struct PostgresWarehouse {
    client: Mutex<Client>,
    dataset: String,
    insert_batch_size: usize,
}

impl PostgresWarehouse {
    pub async fn connect(
        cfg: &PostgresConfig,
        dataset: &str,
        project: Option<&str>,
    ) -> Result<Self> {
        let client = connect_postgres(cfg, project).await?;
        Ok(Self {
            client: Mutex::new(client),
            dataset: dataset.to_string(),
            insert_batch_size: cfg
                .insert_batch_size
                .unwrap_or(DEFAULT_INSERT_BATCH_SIZE)
                .max(1),
        })
    }

    fn qualified(&self, table: &str) -> String {
        sql::qualified(&self.dataset, table)
    }

    fn rows_per_statement(&self, width: usize) -> usize {
        self.insert_batch_size
            .min(MAX_BIND_PARAMS / width.max(1))
            .max(1)
    }
}

/// Connect to PostgreSQL using the provided configuration.
async fn connect_postgres(cfg: &PostgresConfig, project: Option<&str>) -> Result<Client> {
    let conn_str = build_conn_string(cfg, project);

    let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
        .await
        .with_context(|| "Failed to connect to PostgreSQL")?;

    // Spawn the connection task to drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });

    if let Some(ms) = cfg.query_timeout_ms {
        let stmt = format!("SET statement_timeout = {}", ms);
        client
            .batch_execute(&stmt)
            .await
            .with_context(|| "Failed to set PostgreSQL statement_timeout")?;
    }

    Ok(client)
}

fn build_conn_string(cfg: &PostgresConfig, project: Option<&str>) -> String {
    if let Some(url) = &cfg.url {
        return url.clone();
    }

    let host = cfg.host.as_deref().unwrap_or("localhost");
    let port = cfg.port.unwrap_or(5432);
    let user = cfg.user.as_deref().unwrap_or("postgres");
    let dbname = cfg.dbname.as_deref().unwrap_or("postgres");

    let mut parts = vec![
        format!("host={}", host),
        format!("port={}", port),
        format!("user={}", user),
        format!("dbname={}", dbname),
    ];

    if let Some(pw) = &cfg.password {
        parts.push(format!("password={}", pw));
    }

    if let Some(sslmode) = &cfg.sslmode {
        parts.push(format!("sslmode={}", sslmode));
    }

    if let Some(project) = project {
        parts.push(format!("application_name={}", project));
    }

    parts.join(" ")
}

fn classify(err: tokio_postgres::Error, object: &str) -> WarehouseError {
    match err.code() {
        Some(code)
            if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::INVALID_SCHEMA_NAME =>
        {
            WarehouseError::NotFound {
                object: object.to_string(),
            }
        }
        _ => WarehouseError::Query {
            object: object.to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        },
    }
}

/// Bind parameter for one cell; nulls are typed by their column.
fn cell_param(cell: &CellValue, ty: ColumnType) -> Box<dyn ToSql + Sync + Send> {
    match (cell, ty) {
        (CellValue::Integer(v), _) => Box::new(*v),
        (CellValue::Float(v), _) => Box::new(*v),
        (CellValue::Text(v), _) => Box::new(v.clone()),
        (CellValue::Timestamp(v), _) => Box::new(*v),
        (CellValue::Null, ColumnType::Integer) => Box::new(None::<i64>),
        (CellValue::Null, ColumnType::Float) => Box::new(None::<f64>),
        (CellValue::Null, ColumnType::Text) => Box::new(None::<String>),
        (CellValue::Null, ColumnType::Timestamp) => Box::new(None::<DateTime<Utc>>),
    }
}

async fn insert_chunked<C: GenericClient + Sync>(
    client: &C,
    qualified_table: &str,
    columns: &[Column],
    rows: &[Row],
    rows_per_statement: usize,
) -> Result<u64, WarehouseError> {
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let mut written = 0u64;

    for chunk in rows.chunks(rows_per_statement) {
        if let Some(idx) = chunk.iter().position(|r| !r.conforms_to(columns)) {
            return Err(WarehouseError::Schema {
                object: qualified_table.to_string(),
                message: format!("row {} does not match column types", idx),
            });
        }

        let params: Vec<Box<dyn ToSql + Sync + Send>> = chunk
            .iter()
            .flat_map(|row| row.0.iter().zip(columns).map(|(cell, col)| cell_param(cell, col.ty)))
            .collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| &**p as &(dyn ToSql + Sync))
            .collect();

        let stmt = sql::insert_sql(qualified_table, &names, chunk.len());
        written += client
            .execute(stmt.as_str(), &refs)
            .await
            .map_err(|e| classify(e, qualified_table))?;
    }

    Ok(written)
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn ensure_dataset(&self) -> Result<(), WarehouseError> {
        let client = self.client.lock().await;
        client
            .batch_execute(&sql::create_schema_sql(&self.dataset))
            .await
            .map_err(|e| classify(e, &self.dataset))
    }

    async fn ensure_table(&self, table: &str, layout: TableLayout) -> Result<(), WarehouseError> {
        let qualified = self.qualified(table);
        let stmt = sql::create_table_sql(&qualified, layout.columns(), &layout.primary_key());
        let client = self.client.lock().await;
        client
            .batch_execute(&stmt)
            .await
            .map_err(|e| classify(e, &qualified))
    }

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError> {
        let qualified = self.qualified(table);
        let client = self.client.lock().await;
        let row = client
            .query_one(sql::count_sql(&qualified).as_str(), &[])
            .await
            .map_err(|e| classify(e, &qualified))?;
        let count: i64 = row.try_get(0).map_err(|e| classify(e, &qualified))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn max_key(&self, table: &str, column: &str) -> Result<Option<i64>, WarehouseError> {
        let qualified = self.qualified(table);
        let client = self.client.lock().await;
        let row = client
            .query_one(sql::max_sql(&qualified, column).as_str(), &[])
            .await
            .map_err(|e| classify(e, &qualified))?;
        row.try_get(0).map_err(|e| classify(e, &qualified))
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<u64, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let qualified = self.qualified(table);
        let per_stmt = self.rows_per_statement(columns.len());

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| classify(e, &qualified))?;
        let written = insert_chunked(&tx, &qualified, columns, rows, per_stmt).await?;
        tx.commit().await.map_err(|e| classify(e, &qualified))?;
        Ok(written)
    }

    async fn overwrite_rows(
        &self,
        table: &str,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<u64, WarehouseError> {
        let qualified = self.qualified(table);
        let per_stmt = self.rows_per_statement(columns.len());

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| classify(e, &qualified))?;
        tx.batch_execute(&format!("TRUNCATE TABLE {}", qualified))
            .await
            .map_err(|e| classify(e, &qualified))?;
        let written = insert_chunked(&tx, &qualified, columns, rows, per_stmt).await?;
        tx.commit().await.map_err(|e| classify(e, &qualified))?;
        Ok(written)
    }

    async fn merge(
        &self,
        target: &str,
        staging: &str,
        entity: Entity,
    ) -> Result<MergeOutcome, WarehouseError> {
        let qualified_target = self.qualified(target);
        let stmt = sql::merge_sql(&qualified_target, &self.qualified(staging), entity.schema());

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| classify(e, &qualified_target))?;
        let affected = tx
            .query(stmt.as_str(), &[])
            .await
            .map_err(|e| classify(e, &qualified_target))?;
        tx.commit()
            .await
            .map_err(|e| classify(e, &qualified_target))?;

        let mut outcome = MergeOutcome::default();
        for row in affected {
            let inserted: bool = row.try_get(0).map_err(|e| classify(e, &qualified_target))?;
            if inserted {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
        Ok(outcome)
    }

    async fn last_ledger_run(
        &self,
        table: &str,
        entity: Entity,
        status: RunStatus,
    ) -> Result<Option<DateTime<Utc>>, WarehouseError> {
        let qualified = self.qualified(table);
        let client = self.client.lock().await;
        let row = client
            .query_one(
                sql::last_ledger_run_sql(&qualified).as_str(),
                &[&entity.as_str(), &status.as_str()],
            )
            .await
            .map_err(|e| classify(e, &qualified))?;
        row.try_get(0).map_err(|e| classify(e, &qualified))
    }

    async fn rebuild_reports(&self, tables: &TableNames) -> Result<ReportCounts, WarehouseError> {
        let statements = sql::report_statements(&self.dataset, tables);

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| classify(e, &self.dataset))?;

        let mut counts = Vec::with_capacity(statements.len());
        for (qualified, create) in &statements {
            tx.batch_execute(&format!("DROP TABLE IF EXISTS {}", qualified))
                .await
                .map_err(|e| classify(e, qualified))?;
            tx.batch_execute(create)
                .await
                .map_err(|e| classify(e, qualified))?;
            let row = tx
                .query_one(sql::count_sql(qualified).as_str(), &[])
                .await
                .map_err(|e| classify(e, qualified))?;
            let count: i64 = row.try_get(0).map_err(|e| classify(e, qualified))?;
            counts.push(u64::try_from(count).unwrap_or_default());
        }

        tx.commit().await.map_err(|e| classify(e, &self.dataset))?;

        Ok(ReportCounts {
            user_summary: counts.first().copied().unwrap_or_default(),
            category_summary: counts.get(1).copied().unwrap_or_default(),
            cart_details: counts.get(2).copied().unwrap_or_default(),
        })
    }
}
