//! Closed set of platform kinds this system watches, and their per-kind
//! field extraction.
//!
//! Each kind is a fixed variant dispatched through [`KindOps`]:
//! - group/version/kind and plural for client wiring
//! - dependency rank for plan ordering
//! - managed body sections (what we own and compare for drift)
//! - status extraction into [`ResourceStatus`]

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

use crate::{markers, Condition, ResourceHealth, ResourceStatus, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    ConfigMap,
    Secret,
    Workload,
    Service,
    Route,
    Pod,
}

crate::str_enum!(ObjectKind {
    ConfigMap => "ConfigMap",
    Secret => "Secret",
    Workload => "Workload",
    Service => "Service",
    Route => "Route",
    Pod => "Pod",
});

impl ObjectKind {
    pub fn ops(self) -> &'static dyn KindOps {
        match self {
            ObjectKind::ConfigMap => &CONFIG_MAP,
            ObjectKind::Secret => &SECRET,
            ObjectKind::Workload => &WORKLOAD,
            ObjectKind::Service => &SERVICE,
            ObjectKind::Route => &ROUTE,
            ObjectKind::Pod => &POD,
        }
    }

    /// Objects others reference get a lower rank and are created first.
    pub fn rank(self) -> u8 {
        match self {
            ObjectKind::ConfigMap | ObjectKind::Secret => 0,
            ObjectKind::Workload => 1,
            ObjectKind::Service => 2,
            ObjectKind::Route => 3,
            ObjectKind::Pod => 4,
        }
    }

    /// Whether objects of this kind appear in desired specs and plans.
    /// Pods are observed for health only; their workload owns them.
    pub fn is_planned(self) -> bool { !matches!(self, ObjectKind::Pod) }

    pub fn api_version(self) -> String {
        let ops = self.ops();
        if ops.group().is_empty() { ops.version().to_string() } else { format!("{}/{}", ops.group(), ops.version()) }
    }

    /// Map a platform apiVersion/kind pair back onto the closed set.
    pub fn from_api(api_version: &str, kind: &str) -> Option<ObjectKind> {
        ObjectKind::ALL
            .iter()
            .copied()
            .find(|k| k.ops().kind_name() == kind && k.api_version() == api_version)
    }
}

/// Per-kind capability interface.
pub trait KindOps: Send + Sync {
    fn group(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn kind_name(&self) -> &'static str;
    fn plural(&self) -> &'static str;

    /// Top-level body sections owned by this system.
    fn managed_sections(&self) -> &'static [&'static str];

    fn extract_status(&self, raw: &Json) -> ResourceStatus;

    /// Subset of `raw` this system manages; everything else belongs to the platform or other actors.
    fn extract_managed_fields(&self, raw: &Json) -> Map<String, Json> {
        let mut out = Map::new();
        for section in self.managed_sections() {
            if let Some(v) = raw.get(*section) {
                out.insert((*section).to_string(), v.clone());
            }
        }
        out
    }
}

fn u32_at(raw: &Json, ptr: &str) -> Option<u32> {
    raw.pointer(ptr).and_then(|v| v.as_u64()).map(|v| v.min(u32::MAX as u64) as u32)
}

fn str_at<'a>(raw: &'a Json, ptr: &str) -> Option<&'a str> { raw.pointer(ptr).and_then(|v| v.as_str()) }

fn conditions(raw: &Json) -> Vec<Condition> {
    let mut out = Vec::new();
    if let Some(arr) = raw.pointer("/status/conditions").and_then(|v| v.as_array()) {
        for c in arr {
            let type_ = c.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if type_.is_empty() { continue; }
            out.push(Condition {
                type_,
                status: c.get("status").and_then(|v| v.as_str()).unwrap_or("Unknown").to_string(),
                reason: c.get("reason").and_then(|v| v.as_str()).map(|s| s.to_string()),
                message: c.get("message").and_then(|v| v.as_str()).map(|s| s.to_string()),
            });
        }
    }
    out
}

fn base_status(raw: &Json, health: ResourceHealth) -> ResourceStatus {
    let mut st = ResourceStatus::new(health);
    st.conditions = conditions(raw);
    st.generation_marker = markers::read_generation(raw);
    st
}

fn is_terminating(raw: &Json) -> bool { raw.pointer("/metadata/deletionTimestamp").is_some() }

pub struct WorkloadOps;
pub struct ServiceOps;
pub struct RouteOps;
pub struct ConfigMapOps;
pub struct SecretOps;
pub struct PodOps;

static WORKLOAD: WorkloadOps = WorkloadOps;
static SERVICE: ServiceOps = ServiceOps;
static ROUTE: RouteOps = RouteOps;
static CONFIG_MAP: ConfigMapOps = ConfigMapOps;
static SECRET: SecretOps = SecretOps;
static POD: PodOps = PodOps;

impl KindOps for WorkloadOps {
    fn group(&self) -> &'static str { "apps" }
    fn version(&self) -> &'static str { "v1" }
    fn kind_name(&self) -> &'static str { "StatefulSet" }
    fn plural(&self) -> &'static str { "statefulsets" }
    fn managed_sections(&self) -> &'static [&'static str] { &["spec"] }

    fn extract_status(&self, raw: &Json) -> ResourceStatus {
        let replicas = u32_at(raw, "/spec/replicas").unwrap_or(1);
        let ready = u32_at(raw, "/status/readyReplicas").unwrap_or(0);
        let updated = u32_at(raw, "/status/updatedReplicas").unwrap_or(0);
        let generation = raw.pointer("/metadata/generation").and_then(|v| v.as_u64()).unwrap_or(0);
        let observed = raw.pointer("/status/observedGeneration").and_then(|v| v.as_u64()).unwrap_or(0);
        let revisions_match = match (str_at(raw, "/status/currentRevision"), str_at(raw, "/status/updateRevision")) {
            (Some(c), Some(u)) => c == u,
            _ => updated >= replicas,
        };
        let health = if is_terminating(raw) || observed < generation {
            ResourceHealth::Progressing
        } else if replicas == 0 || (ready >= replicas && revisions_match) {
            ResourceHealth::Ready
        } else {
            ResourceHealth::Progressing
        };
        let mut st = base_status(raw, health);
        st.replicas = Some(replicas);
        st.ready_replicas = Some(ready);
        st.message = Some(format!("{}/{} ready", ready, replicas));
        st
    }
}

impl KindOps for ServiceOps {
    fn group(&self) -> &'static str { "" }
    fn version(&self) -> &'static str { "v1" }
    fn kind_name(&self) -> &'static str { "Service" }
    fn plural(&self) -> &'static str { "services" }
    fn managed_sections(&self) -> &'static [&'static str] { &["spec"] }

    fn extract_status(&self, raw: &Json) -> ResourceStatus {
        // LoadBalancer services are pending until the platform assigns an ingress address
        let mut eps: SmallVec<[String; 2]> = SmallVec::new();
        if let Some(arr) = raw.pointer("/status/loadBalancer/ingress").and_then(|v| v.as_array()) {
            for it in arr {
                if let Some(ip) = it.get("ip").and_then(|v| v.as_str()) { eps.push(ip.to_string()); }
                else if let Some(h) = it.get("hostname").and_then(|v| v.as_str()) { eps.push(h.to_string()); }
            }
        }
        let is_lb = str_at(raw, "/spec/type") == Some("LoadBalancer");
        let health = if is_terminating(raw) || (is_lb && eps.is_empty()) {
            ResourceHealth::Progressing
        } else {
            ResourceHealth::Ready
        };
        let mut st = base_status(raw, health);
        if !eps.is_empty() { st.message = Some(eps.join(",")); }
        st
    }
}

impl KindOps for RouteOps {
    fn group(&self) -> &'static str { "networking.k8s.io" }
    fn version(&self) -> &'static str { "v1" }
    fn kind_name(&self) -> &'static str { "Ingress" }
    fn plural(&self) -> &'static str { "ingresses" }
    fn managed_sections(&self) -> &'static [&'static str] { &["spec"] }

    fn extract_status(&self, raw: &Json) -> ResourceStatus {
        let health = if is_terminating(raw) { ResourceHealth::Progressing } else { ResourceHealth::Ready };
        let mut st = base_status(raw, health);
        let mut hosts: Vec<String> = Vec::new();
        if let Some(rules) = raw.pointer("/spec/rules").and_then(|v| v.as_array()) {
            for r in rules { if let Some(h) = r.get("host").and_then(|v| v.as_str()) { hosts.push(h.to_string()); } }
        }
        if !hosts.is_empty() { st.message = Some(hosts.join(",")); }
        st
    }
}

impl KindOps for ConfigMapOps {
    fn group(&self) -> &'static str { "" }
    fn version(&self) -> &'static str { "v1" }
    fn kind_name(&self) -> &'static str { "ConfigMap" }
    fn plural(&self) -> &'static str { "configmaps" }
    fn managed_sections(&self) -> &'static [&'static str] { &["data", "binaryData"] }

    fn extract_status(&self, raw: &Json) -> ResourceStatus {
        base_status(raw, if is_terminating(raw) { ResourceHealth::Progressing } else { ResourceHealth::Ready })
    }
}

impl KindOps for SecretOps {
    fn group(&self) -> &'static str { "" }
    fn version(&self) -> &'static str { "v1" }
    fn kind_name(&self) -> &'static str { "Secret" }
    fn plural(&self) -> &'static str { "secrets" }
    // stringData is write-only on the platform side; it never reads back
    fn managed_sections(&self) -> &'static [&'static str] { &["data", "type"] }

    fn extract_status(&self, raw: &Json) -> ResourceStatus {
        base_status(raw, if is_terminating(raw) { ResourceHealth::Progressing } else { ResourceHealth::Ready })
    }
}

const POD_BAD_WAIT_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

impl KindOps for PodOps {
    fn group(&self) -> &'static str { "" }
    fn version(&self) -> &'static str { "v1" }
    fn kind_name(&self) -> &'static str { "Pod" }
    fn plural(&self) -> &'static str { "pods" }
    fn managed_sections(&self) -> &'static [&'static str] { &[] }

    fn extract_status(&self, raw: &Json) -> ResourceStatus {
        let mut ready = 0u32;
        let mut total = 0u32;
        let mut restarts = 0u64;
        let mut bad_reason: Option<String> = None;
        if let Some(cs) = raw.pointer("/status/containerStatuses").and_then(|v| v.as_array()) {
            total = cs.len() as u32;
            for c in cs {
                if c.get("ready").and_then(|v| v.as_bool()).unwrap_or(false) { ready += 1; }
                restarts += c.get("restartCount").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(reason) = c.pointer("/state/waiting/reason").and_then(|v| v.as_str()) {
                    if POD_BAD_WAIT_REASONS.contains(&reason) { bad_reason = Some(reason.to_string()); }
                }
            }
        }
        let phase = str_at(raw, "/status/phase").unwrap_or("Pending");
        let health = if bad_reason.is_some() || phase == "Failed" {
            ResourceHealth::Unhealthy
        } else if is_terminating(raw) {
            ResourceHealth::Progressing
        } else if phase == "Succeeded" || (phase == "Running" && total > 0 && ready == total) {
            ResourceHealth::Ready
        } else {
            ResourceHealth::Progressing
        };
        let mut st = base_status(raw, health);
        st.replicas = Some(total);
        st.ready_replicas = Some(ready);
        st.message = Some(match bad_reason {
            Some(r) => format!("{} (restarts {})", r, restarts),
            None => format!("{} {}/{} (restarts {})", phase, ready, total, restarts),
        });
        st
    }
}

/// Parse either the closed-set name (`Workload`) or the platform kind (`StatefulSet`).
pub fn parse_kind(s: &str) -> Result<ObjectKind, UnknownVariant> {
    ObjectKind::from_str(s).or_else(|e| {
        ObjectKind::ALL.iter().copied().find(|k| k.ops().kind_name() == s).ok_or(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_api_maps_closed_set() {
        assert_eq!(ObjectKind::from_api("apps/v1", "StatefulSet"), Some(ObjectKind::Workload));
        assert_eq!(ObjectKind::from_api("networking.k8s.io/v1", "Ingress"), Some(ObjectKind::Route));
        assert_eq!(ObjectKind::from_api("v1", "ConfigMap"), Some(ObjectKind::ConfigMap));
        assert_eq!(ObjectKind::from_api("apps/v1", "Deployment"), None);
        assert_eq!(parse_kind("StatefulSet").unwrap(), ObjectKind::Workload);
        assert_eq!(parse_kind("Route").unwrap(), ObjectKind::Route);
    }

    #[test]
    fn rank_puts_config_before_consumers() {
        assert!(ObjectKind::ConfigMap.rank() < ObjectKind::Workload.rank());
        assert!(ObjectKind::Workload.rank() < ObjectKind::Service.rank());
        assert!(ObjectKind::Service.rank() < ObjectKind::Route.rank());
        assert!(!ObjectKind::Pod.is_planned());
    }

    #[test]
    fn workload_health() {
        let ready = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 2, "readyReplicas": 2, "currentRevision": "a", "updateRevision": "a"}
        });
        assert_eq!(WORKLOAD.extract_status(&ready).health, ResourceHealth::Ready);

        let rolling = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "readyReplicas": 2, "currentRevision": "a", "updateRevision": "b"}
        });
        assert_eq!(WORKLOAD.extract_status(&rolling).health, ResourceHealth::Progressing);

        let stale = json!({"metadata": {"generation": 4}, "spec": {"replicas": 1}, "status": {"observedGeneration": 3, "readyReplicas": 1}});
        assert_eq!(WORKLOAD.extract_status(&stale).health, ResourceHealth::Progressing);
    }

    #[test]
    fn pod_crash_loop_is_unhealthy() {
        let pod = json!({
            "status": {"phase": "Running", "containerStatuses": [
                {"ready": false, "restartCount": 7, "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
            ]}
        });
        let st = POD.extract_status(&pod);
        assert_eq!(st.health, ResourceHealth::Unhealthy);
        assert!(st.message.unwrap().contains("CrashLoopBackOff"));

        let ok = json!({"status": {"phase": "Running", "containerStatuses": [{"ready": true, "restartCount": 0}]}});
        assert_eq!(POD.extract_status(&ok).health, ResourceHealth::Ready);
        let pending = json!({"status": {"phase": "Pending"}});
        assert_eq!(POD.extract_status(&pending).health, ResourceHealth::Progressing);
    }

    #[test]
    fn load_balancer_waits_for_address() {
        let pending = json!({"spec": {"type": "LoadBalancer"}, "status": {"loadBalancer": {}}});
        assert_eq!(SERVICE.extract_status(&pending).health, ResourceHealth::Progressing);
        let ready = json!({"spec": {"type": "LoadBalancer"}, "status": {"loadBalancer": {"ingress": [{"ip": "10.0.0.9"}]}}});
        let st = SERVICE.extract_status(&ready);
        assert_eq!(st.health, ResourceHealth::Ready);
        assert_eq!(st.message.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn managed_fields_pick_sections_only() {
        let cm = json!({"metadata": {"name": "x"}, "data": {"k": "v"}, "extra": 1});
        let m = CONFIG_MAP.extract_managed_fields(&cm);
        assert_eq!(m.len(), 1);
        assert_eq!(m["data"], json!({"k": "v"}));
    }
}
