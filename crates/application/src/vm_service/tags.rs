//! Tag operations.
//!
//! The store is authoritative for tags: reads and the tag collection on the
//! VM record update synchronously, while a tag pipeline syncs zone metadata
//! and tag-scoped firewall rules asynchronously (202 + job).

use serde_json::{Map, Value, json};
use uuid::Uuid;

use zonegrid_core::{AppError, AppResult, RequestContext, RequestId};
use zonegrid_domain::{
    Job, VmAction, ensure_tag_deletable, is_reserved_docker_tag, validate_tag_write,
};

use super::{VmService, job_params};
use crate::composer::update_tags_pipeline;

impl VmService {
    /// Lists the tag collection of a VM.
    pub async fn list_tags(&self, vm_uuid: Uuid) -> AppResult<Map<String, Value>> {
        Ok(self.load_vm(vm_uuid).await?.tags)
    }

    /// Fetches a single tag value.
    pub async fn get_tag(&self, vm_uuid: Uuid, key: &str) -> AppResult<Value> {
        self.load_vm(vm_uuid)
            .await?
            .tags
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Tag {key} not found")))
    }

    /// Merges new tags into the collection (`POST /vms/:uuid/tags`).
    pub async fn add_tags(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm_uuid: Uuid,
        tags: Map<String, Value>,
    ) -> AppResult<(Map<String, Value>, Job)> {
        validate_tag_write(&tags, false)?;

        self.apply_tag_change(request_id, context, vm_uuid, move |current| {
            let mut merged = current.clone();
            for (key, value) in tags {
                merged.insert(key, value);
            }
            Ok(merged)
        })
        .await
    }

    /// Replaces the entire tag collection (`PUT /vms/:uuid/tags`).
    /// Structurally reserved docker tags survive the replacement.
    pub async fn set_tags(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm_uuid: Uuid,
        tags: Map<String, Value>,
    ) -> AppResult<(Map<String, Value>, Job)> {
        validate_tag_write(&tags, false)?;

        self.apply_tag_change(request_id, context, vm_uuid, move |current| {
            let mut replaced = tags;
            for (key, value) in current {
                if is_reserved_docker_tag(key) {
                    replaced.insert(key.clone(), value.clone());
                }
            }
            Ok(replaced)
        })
        .await
    }

    /// Deletes one tag (`DELETE /vms/:uuid/tags/:key`).
    pub async fn delete_tag(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm_uuid: Uuid,
        key: &str,
    ) -> AppResult<Job> {
        let vm = self.load_vm(vm_uuid).await?;
        ensure_tag_deletable(key, vm.docker)?;

        if !vm.tags.contains_key(key) {
            return Err(AppError::NotFound(format!("Tag {key} not found")));
        }

        let key = key.to_owned();
        let (_, job) = self
            .apply_tag_change(request_id, context, vm_uuid, move |current| {
                let mut reduced = current.clone();
                reduced.remove(key.as_str());
                Ok(reduced)
            })
            .await?;

        Ok(job)
    }

    /// Deletes every non-reserved tag (`DELETE /vms/:uuid/tags`).
    pub async fn delete_all_tags(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm_uuid: Uuid,
    ) -> AppResult<Job> {
        let (_, job) = self
            .apply_tag_change(request_id, context, vm_uuid, |current| {
                Ok(current
                    .iter()
                    .filter(|(key, _)| is_reserved_docker_tag(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect())
            })
            .await?;

        Ok(job)
    }

    /// Applies a tag transformation under the optimistic revision, updates
    /// the role-tag index and dispatches the sync pipeline.
    async fn apply_tag_change<F>(
        &self,
        request_id: RequestId,
        context: &RequestContext,
        vm_uuid: Uuid,
        transform: F,
    ) -> AppResult<(Map<String, Value>, Job)>
    where
        F: FnOnce(&Map<String, Value>) -> AppResult<Map<String, Value>>,
    {
        let stored = self
            .repository
            .get_vm(vm_uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("VM {vm_uuid} not found")))?;

        let mut vm = stored.vm;
        vm.ensure_action_allowed(VmAction::Update)?;

        let new_tags = transform(&vm.tags)?;
        vm.tags = new_tags.clone();

        self.repository.put_vm(vm.clone(), Some(stored.revision)).await?;
        self.persist_role_tags(&vm).await?;

        let ticket = self.join_vm_ticket(request_id, vm_uuid).await?;
        let params = job_params(
            context,
            Some(vm_uuid),
            "update",
            json!({"tags": new_tags}),
            &[&ticket],
        );

        match self
            .workflows
            .submit_pipeline(request_id, update_tags_pipeline(), params)
            .await
        {
            Ok(job) => Ok((new_tags, job)),
            Err(error) => {
                self.abandon_ticket(&ticket).await;
                Err(error)
            }
        }
    }
}
