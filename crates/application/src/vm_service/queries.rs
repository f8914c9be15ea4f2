//! Read paths: VM search, single-VM fetch, job observation and liveness.

use serde_json::{Map, Value};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, FieldError, RequestId};
use zonegrid_domain::{
    Job, JobExecution, MigrationRecord, Predicate, Vm, active_state_predicate, parse_ldap_filter,
};

use super::VmService;
use crate::vm_ports::{JobsQuery, StoreStatus, VmSearch, VmSort};

/// Query surface of `GET /vms`: structured filters, an LDAP-style string, a
/// JSON predicate, projection and pagination. The three filter surfaces
/// intersect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListVmsParams {
    /// Structured equality filters (`owner_uuid`, `brand`, `alias`, `ram`,
    /// `server_uuid`, `billing_id`, `tag.<key>`).
    pub filters: Vec<(String, String)>,
    /// `state=` value; `active` expands to "not destroyed, not failed".
    pub state: Option<String>,
    /// LDAP-style filter string.
    pub query: Option<String>,
    /// JSON predicate tree, still serialized.
    pub predicate: Option<String>,
    /// Comma-separated projection.
    pub fields: Option<String>,
    /// Page size; server-capped.
    pub limit: Option<usize>,
    /// Zero-based row offset.
    pub offset: Option<usize>,
    /// `field.asc` / `field.desc` ordering override.
    pub sort: Option<String>,
}

/// Structured filter keys accepted by `GET /vms`.
const STRUCTURED_FILTER_FIELDS: &[&str] = &[
    "uuid",
    "owner_uuid",
    "brand",
    "alias",
    "ram",
    "server_uuid",
    "billing_id",
    "image_uuid",
    "docker",
];

impl VmService {
    /// Runs a VM search, returning projected rows plus the total matching
    /// count ignoring pagination.
    pub async fn list_vms(&self, params: &ListVmsParams) -> AppResult<(Vec<Value>, usize)> {
        let search = self.compile_search(params)?;
        let page = self.repository.search_vms(search).await?;

        let projection = parse_fields(params.fields.as_deref())?;
        let rows = page
            .vms
            .iter()
            .map(|vm| project_vm(vm, projection.as_deref()))
            .collect();

        Ok((rows, page.total))
    }

    /// Fetches one VM in its public wire form.
    pub async fn get_vm(&self, uuid: Uuid) -> AppResult<Value> {
        Ok(self.load_vm(uuid).await?.to_public_value())
    }

    /// Fetches the migration record of a VM.
    pub async fn get_vm_migration(&self, uuid: Uuid) -> AppResult<MigrationRecord> {
        self.load_vm(uuid).await?;
        self.repository
            .get_migration(uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("VM {uuid} has no migration")))
    }

    /// Lists jobs through the executor, newest first.
    pub async fn list_jobs(
        &self,
        request_id: RequestId,
        vm_uuid: Option<Uuid>,
        task: Option<String>,
        execution: Option<String>,
    ) -> AppResult<Vec<Job>> {
        let execution = match execution {
            None => None,
            Some(raw) => Some(JobExecution::parse(raw.as_str()).map_err(|_| {
                AppError::validation(vec![FieldError::invalid(
                    "execution",
                    format!("Invalid job execution state: {raw}"),
                )])
            })?),
        };

        self.workflows
            .list_jobs(
                request_id,
                JobsQuery {
                    vm_uuid,
                    task,
                    execution,
                    limit: 1000,
                    offset: 0,
                },
            )
            .await
    }

    /// Fetches one job.
    pub async fn get_job(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Job> {
        self.workflows
            .get_job(request_id, uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {uuid} not found")))
    }

    /// Requests cancellation of a running job.
    pub async fn cancel_job(&self, request_id: RequestId, uuid: Uuid) -> AppResult<Job> {
        self.workflows.cancel_job(request_id, uuid).await
    }

    /// Store liveness for `GET /ping`; 503-class errors until ready.
    pub async fn ping(&self) -> AppResult<()> {
        match self.repository.status().await {
            StoreStatus::Ready => Ok(()),
            StoreStatus::NotSetup => Err(AppError::BucketsNotSetup(
                "VM buckets have not been initialized".to_owned(),
            )),
            StoreStatus::MigrationPending => Err(AppError::DataVersion(
                "A data migration is in progress".to_owned(),
            )),
        }
    }

    /// Compiles the three query surfaces into one intersected predicate
    /// with capped pagination.
    fn compile_search(&self, params: &ListVmsParams) -> AppResult<VmSearch> {
        let mut conjuncts = Vec::new();

        for (field, raw) in &params.filters {
            if !is_structured_field(field) {
                return Err(AppError::validation(vec![FieldError::invalid(
                    field.clone(),
                    format!("Unsupported filter field: {field}"),
                )]));
            }
            conjuncts.push(Predicate::Eq(field.clone(), Value::from(raw.clone())));
        }

        match params.state.as_deref() {
            None => {}
            Some("active") => conjuncts.push(active_state_predicate()),
            Some(state) => conjuncts.push(Predicate::Eq("state".to_owned(), Value::from(state))),
        }

        if let Some(query) = params.query.as_deref() {
            let compiled = parse_ldap_filter(query).map_err(|reason| {
                AppError::validation(vec![FieldError::invalid(
                    "query",
                    format!("Invalid query filter: {reason}"),
                )])
            })?;
            conjuncts.push(compiled);
        }

        if let Some(predicate) = params.predicate.as_deref() {
            let parsed: Value = serde_json::from_str(predicate).map_err(|error| {
                AppError::validation(vec![FieldError::invalid(
                    "predicate",
                    format!("predicate is not valid JSON: {error}"),
                )])
            })?;
            conjuncts.push(Predicate::from_json(&parsed)?);
        }

        let predicate = match conjuncts.len() {
            0 => None,
            1 => conjuncts.pop(),
            _ => Some(Predicate::And(conjuncts)),
        };

        Ok(VmSearch {
            predicate,
            limit: params
                .limit
                .unwrap_or(self.search_limit_cap)
                .min(self.search_limit_cap),
            offset: params.offset.unwrap_or(0),
            sort: parse_sort(params.sort.as_deref())?,
        })
    }
}

fn is_structured_field(field: &str) -> bool {
    STRUCTURED_FILTER_FIELDS.contains(&field) || field.starts_with("tag.")
}

fn parse_sort(raw: Option<&str>) -> AppResult<VmSort> {
    let Some(raw) = raw else {
        return Ok(VmSort::create_timestamp_descending());
    };

    let (field, direction) = raw
        .rsplit_once('.')
        .map_or((raw, "asc"), |(field, direction)| (field, direction));

    if field.is_empty() {
        return Err(AppError::validation(vec![FieldError::invalid(
            "sort",
            format!("Invalid sort: {raw}"),
        )]));
    }

    let descending = match direction.to_ascii_lowercase().as_str() {
        "asc" => false,
        "desc" => true,
        _ => {
            return Err(AppError::validation(vec![FieldError::invalid(
                "sort",
                format!("Invalid sort order: {direction}"),
            )]));
        }
    };

    Ok(VmSort {
        field: field.to_owned(),
        descending,
    })
}

fn parse_fields(raw: Option<&str>) -> AppResult<Option<Vec<String>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let fields: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::to_owned)
        .collect();

    if fields.is_empty() {
        return Err(AppError::validation(vec![FieldError::invalid(
            "fields",
            "fields must name at least one field",
        )]));
    }

    Ok(Some(fields))
}

/// Projects a VM to its wire form; with a projection, unlisted fields are
/// absent rather than null.
fn project_vm(vm: &Vm, fields: Option<&[String]>) -> Value {
    let full = vm.to_public_value();

    let Some(fields) = fields else {
        return full;
    };

    let mut row = Map::new();
    if let Value::Object(source) = full {
        for field in fields {
            if let Some(value) = source.get(field) {
                row.insert(field.clone(), value.clone());
            }
        }
    }

    Value::Object(row)
}
