use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use gantry_core::markers::{self, FIELD_MANAGER};
use gantry_core::prelude::*;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::{strip_noisy, DeleteOutcome, Platform, PlatformError};

/// kube-rs backed platform. Resources are resolved once at connect time.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    resources: HashMap<ObjectKind, ApiResource>,
    timeout: Duration,
}

impl KubePlatform {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::with_client(client).await
    }

    pub async fn with_client(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await.context("running discovery")?;
        let mut resources = HashMap::new();
        for kind in ObjectKind::ALL.iter().copied() {
            let ops = kind.ops();
            let gvk = GroupVersionKind::gvk(ops.group(), ops.version(), ops.kind_name());
            let found = discovery.groups().find_map(|g| {
                g.recommended_resources().into_iter().find(|(ar, caps)| {
                    ar.group == gvk.group && ar.kind == gvk.kind && matches!(caps.scope, Scope::Namespaced)
                })
            });
            let ar = match found {
                Some((ar, _)) => ar,
                None => {
                    warn!(kind = %kind, "kind not served by discovery; using static resource mapping");
                    ApiResource::from_gvk_with_plural(&gvk, ops.plural())
                }
            };
            resources.insert(kind, ar);
        }
        info!(kinds = resources.len(), "platform resources resolved");
        Ok(Self { client, resources, timeout: crate::call_timeout() })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn resource(&self, kind: ObjectKind) -> Result<&ApiResource, PlatformError> {
        self.resources.get(&kind).ok_or_else(|| PlatformError::Other(format!("no api resource for {kind}")))
    }

    fn namespaced(&self, object: &ObjectRef) -> Result<Api<DynamicObject>, PlatformError> {
        Ok(Api::namespaced_with(self.client.clone(), &object.namespace, self.resource(object.kind)?))
    }

    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, PlatformError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let started = Instant::now();
        let res = match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r.map_err(PlatformError::from),
            Err(_) => Err(PlatformError::Timeout(self.timeout)),
        };
        histogram!("platform_call_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if res.is_err() {
            counter!("platform_call_errors_total", 1u64, "op" => op);
        }
        res
    }
}

fn to_live(kind: ObjectKind, obj: &DynamicObject) -> Result<LiveObject, PlatformError> {
    let meta = &obj.metadata;
    let uid = meta.uid.clone().ok_or_else(|| PlatformError::Other("object missing metadata.uid".into()))?;
    let name = meta.name.clone().ok_or_else(|| PlatformError::Other("object missing metadata.name".into()))?;
    let namespace = meta.namespace.clone().unwrap_or_default();
    let mut raw = serde_json::to_value(obj).map_err(|e| PlatformError::Other(e.to_string()))?;
    strip_noisy(&mut raw);
    Ok(LiveObject {
        object: ObjectRef::new(kind, namespace, name),
        uid,
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        raw,
    })
}

fn to_dynamic(manifest: &Manifest) -> Result<DynamicObject, PlatformError> {
    serde_json::from_value(manifest.body.clone()).map_err(|e| PlatformError::Invalid(e.to_string()))
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get(&self, object: &ObjectRef) -> Result<Option<LiveObject>, PlatformError> {
        let api = self.namespaced(object)?;
        let found = self.deadline("get", api.get_opt(&object.name)).await?;
        found.map(|o| to_live(object.kind, &o)).transpose()
    }

    async fn create(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> {
        let api = self.namespaced(&manifest.object)?;
        let obj = to_dynamic(manifest)?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let created = self.deadline("create", api.create(&pp, &obj)).await?;
        debug!(object = %manifest.object, "created");
        to_live(manifest.object.kind, &created)
    }

    async fn apply(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> {
        let api = self.namespaced(&manifest.object)?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = self.deadline("apply", api.patch(&manifest.object.name, &pp, &Patch::Apply(&manifest.body))).await?;
        to_live(manifest.object.kind, &applied)
    }

    async fn delete(&self, object: &ObjectRef, uid: &str) -> Result<DeleteOutcome, PlatformError> {
        let api = self.namespaced(object)?;
        let dp = DeleteParams {
            preconditions: Some(Preconditions { uid: Some(uid.to_string()), resource_version: None }),
            ..Default::default()
        };
        match self.deadline("delete", api.delete(&object.name, &dp)).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(PlatformError::NotFound(_)) => Ok(DeleteOutcome::AlreadyGone),
            // precondition failure: the name was reused by another object
            Err(PlatformError::Conflict(_)) => Ok(DeleteOutcome::Replaced),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, kind: ObjectKind, selector: &str) -> Result<Vec<LiveObject>, PlatformError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), self.resource(kind)?);
        let lp = ListParams::default().labels(selector);
        let list = self.deadline("list", api.list(&lp)).await?;
        list.items.iter().map(|o| to_live(kind, o)).collect()
    }

    fn watch(&self, kind: ObjectKind) -> BoxStream<'static, Result<WatchEvent, PlatformError>> {
        let ar = match self.resource(kind) {
            Ok(ar) => ar.clone(),
            Err(e) => return futures::stream::once(async move { Err(e) }).boxed(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let cfg = watcher::Config::default().labels(&markers::owned_selector());
        info!(kind = %kind, "watcher started");
        watcher::watcher(api, cfg)
            .default_backoff()
            .map(move |ev| match ev {
                Ok(watcher::Event::Applied(o)) => to_live(kind, &o)
                    .map(|object| WatchEvent::Changed(Notification { event: NotificationKind::Update, object })),
                Ok(watcher::Event::Deleted(o)) => to_live(kind, &o)
                    .map(|object| WatchEvent::Changed(Notification { event: NotificationKind::Delete, object })),
                Ok(watcher::Event::Restarted(list)) => {
                    debug!(kind = %kind, count = list.len(), "watch restart");
                    counter!("platform_watch_restarts_total", 1u64);
                    list.iter().map(|o| to_live(kind, o)).collect::<Result<Vec<_>, _>>()
                        .map(|objects| WatchEvent::Restarted { kind, objects })
                }
                Err(e) => Err(PlatformError::Unavailable(e.to_string())),
            })
            .boxed()
    }
}
