use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use vmfinder_core::VmInstance;

use crate::dataset::{ensure_single_provider, DatasetStore, StoreError};

// 14 binds per row keeps each statement well under the 65535 parameter limit.
const INSERT_CHUNK: usize = 1000;

const SELECT_COLUMNS: &str = "SELECT instance_name, provider, region, vcpus, memory_gb, \
     storage_gb, storage_type, hourly_cost, monthly_cost, spot_price, currency, \
     instance_family, network_performance, last_updated FROM vm_instances";

/// Relational backend: one `vm_instances` table, replaced per provider inside a
/// single transaction.
#[derive(Debug, Clone)]
pub struct PgDatasetStore {
    pool: PgPool,
}

impl PgDatasetStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vm_instances (
                id BIGSERIAL PRIMARY KEY,
                instance_name TEXT NOT NULL,
                provider TEXT NOT NULL,
                region TEXT NOT NULL,
                vcpus INTEGER NOT NULL,
                memory_gb DOUBLE PRECISION,
                storage_gb BIGINT NOT NULL,
                storage_type TEXT NOT NULL,
                hourly_cost DOUBLE PRECISION,
                monthly_cost DOUBLE PRECISION,
                spot_price DOUBLE PRECISION,
                currency TEXT NOT NULL DEFAULT 'USD',
                instance_family TEXT NOT NULL,
                network_performance TEXT,
                last_updated TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_provider_region_vcpus_memory
             ON vm_instances (provider, region, vcpus, memory_gb)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_instance(row: &PgRow) -> Result<VmInstance, StoreError> {
    let vcpus: i32 = row.try_get("vcpus")?;
    let storage_gb: i64 = row.try_get("storage_gb")?;
    Ok(VmInstance {
        instance_name: row.try_get("instance_name")?,
        provider: row.try_get("provider")?,
        region: row.try_get("region")?,
        vcpus: u32::try_from(vcpus).map_err(|_| StoreError::OutOfRange(format!("vcpus={vcpus}")))?,
        memory_gb: row.try_get("memory_gb")?,
        storage_gb: u64::try_from(storage_gb)
            .map_err(|_| StoreError::OutOfRange(format!("storage_gb={storage_gb}")))?,
        storage_type: row.try_get("storage_type")?,
        hourly_cost: row.try_get("hourly_cost")?,
        monthly_cost: row.try_get("monthly_cost")?,
        spot_price: row.try_get("spot_price")?,
        currency: row.try_get("currency")?,
        instance_family: row.try_get("instance_family")?,
        network_performance: row.try_get("network_performance")?,
        last_updated: row.try_get::<DateTime<Utc>, _>("last_updated")?,
    })
}

#[async_trait]
impl DatasetStore for PgDatasetStore {
    async fn replace_provider_data(
        &self,
        provider: &str,
        records: Vec<VmInstance>,
    ) -> Result<usize, StoreError> {
        ensure_single_provider(provider, &records)?;

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM vm_instances WHERE provider = $1")
            .bind(provider)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO vm_instances (instance_name, provider, region, vcpus, memory_gb, \
                 storage_gb, storage_type, hourly_cost, monthly_cost, spot_price, currency, \
                 instance_family, network_performance, last_updated) ",
            );
            builder.push_values(chunk, |mut b, rec| {
                b.push_bind(&rec.instance_name)
                    .push_bind(&rec.provider)
                    .push_bind(&rec.region)
                    .push_bind(i32::try_from(rec.vcpus).unwrap_or(i32::MAX))
                    .push_bind(rec.memory_gb)
                    .push_bind(i64::try_from(rec.storage_gb).unwrap_or(i64::MAX))
                    .push_bind(&rec.storage_type)
                    .push_bind(rec.hourly_cost)
                    .push_bind(rec.monthly_cost)
                    .push_bind(rec.spot_price)
                    .push_bind(&rec.currency)
                    .push_bind(&rec.instance_family)
                    .push_bind(&rec.network_performance)
                    .push_bind(rec.last_updated);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        info!(provider, deleted, inserted = records.len(), "replaced provider rows");
        Ok(records.len())
    }

    async fn records_for_provider(&self, provider: &str) -> Result<Vec<VmInstance>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} WHERE provider = $1 ORDER BY id"))
            .bind(provider)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_instance).collect()
    }

    async fn all_records(&self) -> Result<Vec<VmInstance>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY provider, id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_instance).collect()
    }
}
