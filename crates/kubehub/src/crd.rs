//! OpenAPI schemas published by CustomResourceDefinitions.

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kready_core::KindRef;
use kube::{api::ListParams, Api, Client};
use serde_json::Value;

/// Pick the schema for `version`, else the storage version, else the first served one.
pub fn schema_from_crd(crd: &Value, version: &str) -> Option<Value> {
    let versions = crd.get("spec")?.get("versions")?.as_array()?;
    let flag = |v: &Value, k: &str| v.get(k).and_then(Value::as_bool).unwrap_or(false);
    let chosen = versions
        .iter()
        .find(|v| v.get("name").and_then(Value::as_str) == Some(version))
        .or_else(|| versions.iter().find(|v| flag(v, "storage")))
        .or_else(|| versions.iter().find(|v| flag(v, "served")))?;
    chosen.get("schema")?.get("openAPIV3Schema").cloned()
}

/// Fetch the OpenAPI v3 schema of a custom kind. Built-in kinds have no CRD and yield `None`.
pub async fn fetch_crd_schema(client: Client, kind: &KindRef) -> Result<Option<Value>> {
    if kind.group.is_empty() || !kind.group.contains('.') || kind.group.ends_with(".k8s.io") {
        return Ok(None);
    }
    let api: Api<apiextv1::CustomResourceDefinition> = Api::all(client);
    let crds = api.list(&ListParams::default()).await.context("listing CustomResourceDefinitions")?;
    for crd in crds {
        let v = serde_json::to_value(&crd).context("serializing CustomResourceDefinition")?;
        let Some(spec) = v.get("spec") else { continue };
        let group = spec.get("group").and_then(Value::as_str).unwrap_or("");
        let k = spec.get("names").and_then(|n| n.get("kind")).and_then(Value::as_str).unwrap_or("");
        if group == kind.group && k == kind.kind {
            return Ok(schema_from_crd(&v, &kind.version));
        }
    }
    Ok(None)
}
