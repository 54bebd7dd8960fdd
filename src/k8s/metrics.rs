//! Deprecated API usage from the API server's metrics endpoint.

use anyhow::Result;
use tracing::debug;

use super::api_error;
use crate::cluster::DeprecatedApiUsage;
use crate::error::AkupError;

const DEPRECATED_METRIC: &str = "apiserver_requested_deprecated_apis";

pub async fn deprecated_apis(client: &kube::Client) -> Result<Vec<DeprecatedApiUsage>> {
    let request = http::Request::get("/metrics")
        .body(Vec::new())
        .map_err(|e| AkupError::KubernetesApi(format!("Failed to build metrics request: {e}")))?;
    let text = client
        .request_text(request)
        .await
        .map_err(api_error("read API server metrics"))?;

    let usages = parse_deprecated_apis(&text);
    debug!("Found {} deprecated APIs in use", usages.len());
    Ok(usages)
}

/// Parse Prometheus text exposition, keeping the deprecated-API gauge samples set to 1.
pub fn parse_deprecated_apis(text: &str) -> Vec<DeprecatedApiUsage> {
    let mut usages: Vec<DeprecatedApiUsage> = Vec::new();

    for line in text.lines() {
        let Some(rest) = line.strip_prefix(DEPRECATED_METRIC) else {
            continue;
        };
        let Some((labels, value)) = rest
            .strip_prefix('{')
            .and_then(|r| r.split_once('}'))
        else {
            continue;
        };
        if value.trim().parse::<f64>().unwrap_or(0.0) < 1.0 {
            continue;
        }

        let label = |key: &str| -> Option<String> {
            labels.split(',').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
            })
        };

        let Some(resource) = label("resource") else {
            continue;
        };
        let usage = DeprecatedApiUsage {
            group: label("group").unwrap_or_default(),
            version: label("version").unwrap_or_default(),
            resource,
            removed_release: label("removed_release").filter(|r| !r.is_empty()),
        };
        if !usages.contains(&usage) {
            usages.push(usage);
        }
    }

    usages
}
