//! Optional post-upgrade signals: cluster DNS, storage claims, Gateway API
//! routes and cert-manager certificates.
//!
//! The last two are CRDs. A cluster without them reports `None` rather than
//! an error.

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Api;
use kube::api::{ApiResource, DynamicObject, ListParams};
use serde_json::Value;
use tracing::debug;

use super::api_error;
use crate::cluster::{CertificateState, ClaimState, ExtendedHealth, RouteState};

const DNS_NAMESPACE: &str = "kube-system";
const DNS_SERVICE_SELECTOR: &str = "kubernetes.io/service-name=kube-dns";

fn gateway_resource() -> ApiResource {
    ApiResource {
        group: "gateway.networking.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "gateway.networking.k8s.io/v1".to_string(),
        kind: "Gateway".to_string(),
        plural: "gateways".to_string(),
    }
}

fn certificate_resource() -> ApiResource {
    ApiResource {
        group: "cert-manager.io".to_string(),
        version: "v1".to_string(),
        api_version: "cert-manager.io/v1".to_string(),
        kind: "Certificate".to_string(),
        plural: "certificates".to_string(),
    }
}

pub async fn extended_health(client: &kube::Client) -> Result<ExtendedHealth> {
    Ok(ExtendedHealth {
        dns_ready_endpoints: dns_ready_endpoints(client).await?,
        claims: claims(client).await?,
        routes: list_optional(client, &gateway_resource())
            .await?
            .map(|objs| objs.iter().map(route_state).collect()),
        certificates: list_optional(client, &certificate_resource())
            .await?
            .map(|objs| objs.iter().map(certificate_state).collect()),
    })
}

async fn dns_ready_endpoints(client: &kube::Client) -> Result<usize> {
    let api: Api<EndpointSlice> = Api::namespaced(client.clone(), DNS_NAMESPACE);
    let slices = api
        .list(&ListParams::default().labels(DNS_SERVICE_SELECTOR))
        .await
        .map_err(api_error("list DNS endpoint slices"))?;

    Ok(slices
        .items
        .iter()
        .flat_map(|slice| slice.endpoints.iter())
        .filter(|ep| ep.conditions.as_ref().and_then(|c| c.ready) != Some(false))
        .count())
}

async fn claims(client: &kube::Client) -> Result<Vec<ClaimState>> {
    let api: Api<PersistentVolumeClaim> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(api_error("list persistent volume claims"))?;

    Ok(list
        .items
        .iter()
        .map(|pvc| ClaimState {
            namespace: pvc.metadata.namespace.clone().unwrap_or_default(),
            name: pvc.metadata.name.clone().unwrap_or_default(),
            phase: pvc
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
        })
        .collect())
}

/// List a CRD-backed resource across namespaces. `None` when the CRD is absent.
async fn list_optional(client: &kube::Client, ar: &ApiResource) -> Result<Option<Vec<DynamicObject>>> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), ar);
    match api.list(&ListParams::default()).await {
        Ok(list) => Ok(Some(list.items)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("{} not installed, skipping", ar.api_version);
            Ok(None)
        }
        Err(e) => Err(api_error("list custom resources")(e).into()),
    }
}

fn condition<'a>(obj: &'a DynamicObject, type_: &str) -> Option<&'a Value> {
    obj.data
        .pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn condition_true(cond: Option<&Value>) -> bool {
    cond.and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        .is_some_and(|s| s == "True")
}

pub fn route_state(obj: &DynamicObject) -> RouteState {
    let programmed = condition(obj, "Programmed");
    RouteState {
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        programmed: condition_true(programmed),
        message: programmed
            .and_then(|c| c.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

pub fn certificate_state(obj: &DynamicObject) -> CertificateState {
    CertificateState {
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        ready: condition_true(condition(obj, "Ready")),
        not_after: obj
            .data
            .pointer("/status/notAfter")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(ar: &ApiResource, value: Value) -> DynamicObject {
        let mut obj = DynamicObject::new("x", ar).within("default");
        obj.metadata.name = value["name"].as_str().map(str::to_string);
        obj.data = json!({ "status": value["status"].clone() });
        obj
    }

    #[test]
    fn test_route_state() {
        let gw = object(
            &gateway_resource(),
            json!({
                "name": "public",
                "status": {"conditions": [
                    {"type": "Accepted", "status": "True"},
                    {"type": "Programmed", "status": "False", "message": "No addresses assigned"}
                ]}
            }),
        );
        let state = route_state(&gw);
        assert_eq!(state.name, "public");
        assert_eq!(state.namespace, "default");
        assert!(!state.programmed);
        assert_eq!(state.message.as_deref(), Some("No addresses assigned"));
    }

    #[test]
    fn test_certificate_state() {
        let cert = object(
            &certificate_resource(),
            json!({
                "name": "ingress-tls",
                "status": {
                    "conditions": [{"type": "Ready", "status": "True"}],
                    "notAfter": "2026-11-01T00:00:00Z"
                }
            }),
        );
        let state = certificate_state(&cert);
        assert!(state.ready);
        assert_eq!(
            state.not_after.map(|t| t.to_rfc3339()),
            Some("2026-11-01T00:00:00+00:00".to_string())
        );

        let pending = object(&certificate_resource(), json!({"name": "new", "status": {}}));
        let state = certificate_state(&pending);
        assert!(!state.ready);
        assert!(state.not_after.is_none());
    }
}
