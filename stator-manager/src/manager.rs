//! API manager
//!
//! Turns synchronous-style calls into request events, dispatches them and
//! waits for the correlated response. Mapper administration goes straight to
//! the repository; nodes pick the changes up through their mapper watch.

use crate::error::{ManagerError, Result};
use crate::holder::{Holder, HolderConfig};
use serde_json::{json, Map, Value};
use stator_mapper::{MapperCompiler, MapperRecord};
use stator_runtime::{Dispatcher, MapperFilter, Repository};
use stator_types::{
    meta, request_id, EntityId, EntityRecord, EntityView, Event, PatchData, PathConstructor,
    ResponseStatus, SystemOp,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Per-call options of [`ApiManager::patch_entity`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchOptions {
    pub path_constructor: PathConstructor,
}

impl PatchOptions {
    pub fn scheme() -> Self {
        Self {
            path_constructor: PathConstructor::Scheme,
        }
    }
}

#[derive(Debug)]
pub struct ApiManager {
    holder: Arc<Holder>,
    dispatcher: Arc<dyn Dispatcher>,
    repository: Arc<dyn Repository>,
    compiler: Arc<dyn MapperCompiler>,
    callback: String,
}

impl ApiManager {
    pub fn new(
        config: &HolderConfig,
        dispatcher: Arc<dyn Dispatcher>,
        repository: Arc<dyn Repository>,
        compiler: Arc<dyn MapperCompiler>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            holder: Arc::new(Holder::new(config.timeout(), shutdown)),
            dispatcher,
            repository,
            compiler,
            callback: config.respond_callback.clone(),
        }
    }

    /// Holder resolving this manager's requests; callback events go here
    pub fn holder(&self) -> &Arc<Holder> {
        &self.holder
    }

    pub async fn create_entity(&self, record: EntityRecord) -> Result<EntityView> {
        if record.id.is_empty() {
            return Err(ManagerError::InvalidRequest("entity id is empty".into()));
        }
        let id = record.id.clone();
        let data = json!({
            "type": record.entity_type,
            "owner": record.owner,
            "source": record.source,
            "properties": record.properties,
            "scheme": record.scheme,
        });
        let ev = Event::system_event(&id, SystemOp::Create, Some(data))
            .with_attr(meta::ENTITY_TYPE, record.entity_type.as_str())
            .with_attr(meta::OWNER, record.owner.as_str())
            .with_attr(meta::SOURCE, record.source.as_str());

        let data = self.call(ev).await?;
        info!(entity_id = %id, "entity created");
        self.view(&id, &data).await
    }

    pub async fn patch_entity(
        &self,
        id: &EntityId,
        patches: Vec<PatchData>,
        opts: PatchOptions,
    ) -> Result<EntityView> {
        if patches.is_empty() {
            return Err(ManagerError::InvalidRequest("empty patch batch".into()));
        }
        let ev = Event::patch_event(id, patches)
            .with_attr(meta::PATH_CONSTRUCTOR, opts.path_constructor.as_str());
        let data = self.call(ev).await?;
        self.view(id, &data).await
    }

    pub async fn get_entity(&self, id: &EntityId) -> Result<EntityView> {
        let data = self.call(Event::patch_event(id, Vec::new())).await?;
        self.view(id, &data).await
    }

    pub async fn delete_entity(&self, id: &EntityId) -> Result<()> {
        self.call(Event::system_event(id, SystemOp::Delete, None))
            .await?;
        info!(entity_id = %id, "entity deleted");
        Ok(())
    }

    /// Store a mapper after checking it compiles. An existing id may only be
    /// overwritten within the same owner and entity.
    pub async fn append_mapper(&self, record: MapperRecord) -> Result<()> {
        if record.id.is_empty() {
            return Err(ManagerError::InvalidRequest("mapper id is empty".into()));
        }
        self.compiler
            .compile(&record)
            .map_err(|err| ManagerError::InvalidRequest(err.to_string()))?;

        if let Some(existing) = self.repository.get_mapper(&record.id).await? {
            if !existing.same_scope(&record) {
                return Err(ManagerError::InvalidRequest(format!(
                    "mapper {} belongs to another owner or entity",
                    record.id
                )));
            }
        }

        debug!(mapper_id = %record.id, entity_id = %record.entity_id, "append mapper");
        self.repository.put_mapper(record).await?;
        Ok(())
    }

    pub async fn remove_mapper(&self, id: &str) -> Result<()> {
        if self.repository.get_mapper(id).await?.is_none() {
            return Err(ManagerError::MapperNotFound(id.to_string()));
        }
        self.repository.del_mapper(id).await?;
        debug!(mapper_id = %id, "remove mapper");
        Ok(())
    }

    pub async fn get_mapper(&self, id: &str) -> Result<MapperRecord> {
        self.repository
            .get_mapper(id)
            .await?
            .ok_or_else(|| ManagerError::MapperNotFound(id.to_string()))
    }

    pub async fn list_mappers(&self, filter: &MapperFilter) -> Result<Vec<MapperRecord>> {
        Ok(self.repository.list_mappers(filter).await?)
    }

    /// Dispatch `ev` as a request and wait for its response payload
    async fn call(&self, ev: Event) -> Result<Vec<u8>> {
        let request_id = request_id();
        let ev = ev
            .with_attr(meta::REQUEST_ID, request_id.as_str())
            .with_callback(self.callback.as_str());

        let waiter = self.holder.wait(&request_id);
        if let Err(err) = self.dispatcher.dispatch(ev).await {
            warn!(request_id = %request_id, error = %err, "dispatch request");
            waiter.cancel();
            return Err(err.into());
        }

        let response = waiter.wait().await;
        match response.status {
            ResponseStatus::Ok => Ok(response.data),
            ResponseStatus::Timeout => Err(ManagerError::Timeout(request_id)),
            ResponseStatus::Cancelled => Err(ManagerError::Cancelled(request_id)),
            ResponseStatus::Error => Err(ManagerError::Remote {
                code: response.err_code,
                message: String::from_utf8_lossy(&response.data).into_owned(),
            }),
        }
    }

    async fn view(&self, id: &EntityId, data: &[u8]) -> Result<EntityView> {
        let mut state: Value =
            serde_json::from_slice(data).map_err(|err| ManagerError::Decode(err.to_string()))?;
        if let Value::Object(map) = &mut state {
            map.entry("properties").or_insert_with(|| Value::Object(Map::new()));
        }
        let mut view: EntityView =
            serde_json::from_value(state).map_err(|err| ManagerError::Decode(err.to_string()))?;

        view.mappers = self
            .repository
            .list_mappers(&MapperFilter::entity(id.clone()))
            .await?
            .iter()
            .map(MapperRecord::view)
            .collect();
        Ok(view)
    }
}
