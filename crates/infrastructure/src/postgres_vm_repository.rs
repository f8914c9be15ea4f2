//! Postgres-backed VM store: the `vms`, `vm_role_tags` and `vm_migrations`
//! buckets with optimistic revisions and compiled index queries.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use zonegrid_application::{StoreStatus, VersionedVm, VmRepository, VmSearch, VmSearchPage};
use zonegrid_core::{AppError, AppResult};
use zonegrid_domain::{MigrationRecord, Vm};

mod search;

use search::{SqlFilter, compile_predicate, sort_expression};

/// Postgres implementation of the VM store.
#[derive(Clone)]
pub struct PostgresVmRepository {
    pool: PgPool,
}

impl PostgresVmRepository {
    /// Creates a repository over a connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_to_vm(data: Value) -> AppResult<Vm> {
        serde_json::from_value(data)
            .map_err(|error| AppError::Internal(format!("corrupt VM record: {error}")))
    }
}

#[async_trait]
impl VmRepository for PostgresVmRepository {
    async fn put_vm(&self, vm: Vm, expected_revision: Option<u64>) -> AppResult<u64> {
        let data = serde_json::to_value(&vm)
            .map_err(|error| AppError::Internal(format!("failed to encode VM: {error}")))?;
        let tags = Value::Object(vm.tags.clone());

        match expected_revision {
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO vms (
                        uuid, owner_uuid, brand, state, alias, ram, server_uuid,
                        billing_id, create_timestamp, revision, data, tags
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1, $10, $11)
                    ON CONFLICT (uuid) DO NOTHING
                    "#,
                )
                .bind(vm.uuid)
                .bind(vm.owner_uuid)
                .bind(vm.brand.as_str())
                .bind(vm.state.as_str())
                .bind(vm.alias.as_deref())
                .bind(i64::from(vm.ram))
                .bind(vm.server_uuid)
                .bind(vm.billing_id)
                .bind(vm.create_timestamp)
                .bind(&data)
                .bind(&tags)
                .execute(&self.pool)
                .await
                .map_err(|error| {
                    AppError::Internal(format!("failed to create VM {}: {error}", vm.uuid))
                })?;

                if inserted.rows_affected() == 0 {
                    return Err(AppError::Conflict(format!("VM {} already exists", vm.uuid)));
                }

                Ok(1)
            }
            Some(expected) => {
                let expected = i64::try_from(expected).map_err(|error| {
                    AppError::Internal(format!("invalid VM revision: {error}"))
                })?;

                let row = sqlx::query(
                    r#"
                    UPDATE vms
                    SET
                        owner_uuid = $3,
                        brand = $4,
                        state = $5,
                        alias = $6,
                        ram = $7,
                        server_uuid = $8,
                        billing_id = $9,
                        create_timestamp = $10,
                        revision = revision + 1,
                        data = $11,
                        tags = $12
                    WHERE uuid = $1 AND revision = $2
                    RETURNING revision
                    "#,
                )
                .bind(vm.uuid)
                .bind(expected)
                .bind(vm.owner_uuid)
                .bind(vm.brand.as_str())
                .bind(vm.state.as_str())
                .bind(vm.alias.as_deref())
                .bind(i64::from(vm.ram))
                .bind(vm.server_uuid)
                .bind(vm.billing_id)
                .bind(vm.create_timestamp)
                .bind(&data)
                .bind(&tags)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| {
                    AppError::Internal(format!("failed to update VM {}: {error}", vm.uuid))
                })?;

                match row {
                    Some(row) => {
                        let revision: i64 = row.try_get("revision").map_err(|error| {
                            AppError::Internal(format!("failed to read VM revision: {error}"))
                        })?;
                        Ok(u64::try_from(revision).unwrap_or_default())
                    }
                    None => Err(AppError::Conflict(format!(
                        "VM {} was updated concurrently or does not exist",
                        vm.uuid
                    ))),
                }
            }
        }
    }

    async fn get_vm(&self, uuid: Uuid) -> AppResult<Option<VersionedVm>> {
        let row = sqlx::query("SELECT data, revision FROM vms WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to fetch VM {uuid}: {error}"))
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let data: Value = row
            .try_get("data")
            .map_err(|error| AppError::Internal(format!("failed to read VM record: {error}")))?;
        let revision: i64 = row
            .try_get("revision")
            .map_err(|error| AppError::Internal(format!("failed to read VM revision: {error}")))?;

        Ok(Some(VersionedVm {
            vm: Self::record_to_vm(data)?,
            revision: u64::try_from(revision).unwrap_or_default(),
        }))
    }

    async fn search_vms(&self, search: VmSearch) -> AppResult<VmSearchPage> {
        let filter = match &search.predicate {
            Some(predicate) => compile_predicate(predicate)?,
            None => SqlFilter {
                clause: "TRUE".to_owned(),
                binds: Vec::new(),
            },
        };

        let count_sql = format!("SELECT COUNT(*) AS total FROM vms WHERE {}", filter.clause);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &filter.binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|error| AppError::Internal(format!("failed to count VMs: {error}")))?
            .try_get("total")
            .map_err(|error| AppError::Internal(format!("failed to read VM count: {error}")))?;

        let order = sort_expression(search.sort.field.as_str())?;
        let direction = if search.sort.descending { "DESC" } else { "ASC" };
        let page_sql = format!(
            "SELECT data FROM vms WHERE {} ORDER BY {order} {direction} LIMIT ${} OFFSET ${}",
            filter.clause,
            filter.binds.len() + 1,
            filter.binds.len() + 2,
        );

        let mut page_query = sqlx::query(&page_sql);
        for bind in &filter.binds {
            page_query = page_query.bind(bind);
        }
        let limit = i64::try_from(search.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(search.offset).unwrap_or(i64::MAX);
        let rows = page_query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| AppError::Internal(format!("failed to search VMs: {error}")))?;

        let vms = rows
            .into_iter()
            .map(|row| {
                let data: Value = row.try_get("data").map_err(|error| {
                    AppError::Internal(format!("failed to read VM record: {error}"))
                })?;
                Self::record_to_vm(data)
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(VmSearchPage {
            vms,
            total: usize::try_from(total).unwrap_or_default(),
        })
    }

    async fn put_migration(&self, record: MigrationRecord) -> AppResult<()> {
        let data = serde_json::to_value(&record).map_err(|error| {
            AppError::Internal(format!("failed to encode migration record: {error}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO vm_migrations (vm_uuid, data, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (vm_uuid) DO UPDATE SET data = $2, updated_at = now()
            "#,
        )
        .bind(record.vm_uuid)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to store migration record for VM {}: {error}",
                record.vm_uuid
            ))
        })?;

        Ok(())
    }

    async fn get_migration(&self, vm_uuid: Uuid) -> AppResult<Option<MigrationRecord>> {
        let row = sqlx::query("SELECT data FROM vm_migrations WHERE vm_uuid = $1")
            .bind(vm_uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to fetch migration record for VM {vm_uuid}: {error}"
                ))
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let data: Value = row.try_get("data").map_err(|error| {
            AppError::Internal(format!("failed to read migration record: {error}"))
        })?;

        serde_json::from_value(data)
            .map(Some)
            .map_err(|error| AppError::Internal(format!("corrupt migration record: {error}")))
    }

    async fn put_role_tags(&self, vm_uuid: Uuid, role_tags: Vec<String>) -> AppResult<()> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!("failed to begin role-tag transaction: {error}"))
        })?;

        sqlx::query("DELETE FROM vm_role_tags WHERE vm_uuid = $1")
            .bind(vm_uuid)
            .execute(&mut *transaction)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to clear role tags: {error}"))
            })?;

        for role_tag in role_tags {
            sqlx::query("INSERT INTO vm_role_tags (vm_uuid, role_tag) VALUES ($1, $2)")
                .bind(vm_uuid)
                .bind(role_tag)
                .execute(&mut *transaction)
                .await
                .map_err(|error| {
                    AppError::Internal(format!("failed to store role tag: {error}"))
                })?;
        }

        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!("failed to commit role-tag transaction: {error}"))
        })
    }

    async fn status(&self) -> StoreStatus {
        let buckets_exist = sqlx::query("SELECT to_regclass('public.vms')::text AS bucket")
            .fetch_one(&self.pool)
            .await
            .ok()
            .and_then(|row| row.try_get::<Option<String>, _>("bucket").ok())
            .flatten()
            .is_some();

        if !buckets_exist {
            return StoreStatus::NotSetup;
        }

        let migration_pending = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM _sqlx_migrations WHERE success = FALSE) AS pending",
        )
        .fetch_one(&self.pool)
        .await
        .ok()
        .and_then(|row| row.try_get::<bool, _>("pending").ok())
        .unwrap_or(false);

        if migration_pending {
            StoreStatus::MigrationPending
        } else {
            StoreStatus::Ready
        }
    }
}
