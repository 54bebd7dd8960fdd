//! Optional extended post-upgrade checks.

use chrono::{DateTime, Duration, Utc};

use crate::cluster::ExtendedHealth;
use crate::report::CheckResult;

pub const DNS_PROBE: &str = "dns-probe";
pub const STORAGE_CLAIMS: &str = "storage-claims-bound";
pub const ROUTES: &str = "routes-programmed";
pub const CERTIFICATES: &str = "certificate-validity";

/// Certificates expiring sooner than this warn.
pub const CERT_EXPIRY_WARN_DAYS: i64 = 7;

pub fn dns_probe(health: &ExtendedHealth) -> CheckResult {
    if health.dns_ready_endpoints == 0 {
        CheckResult::fail(DNS_PROBE, "kube-dns has no ready endpoints")
    } else {
        CheckResult::pass(
            DNS_PROBE,
            format!("kube-dns has {} ready endpoint(s)", health.dns_ready_endpoints),
        )
    }
}

pub fn storage_claims(health: &ExtendedHealth) -> CheckResult {
    let named = |phase: &str| -> Vec<String> {
        health
            .claims
            .iter()
            .filter(|c| c.phase == phase)
            .map(|c| format!("{}/{}", c.namespace, c.name))
            .collect()
    };
    let lost = named("Lost");
    let pending = named("Pending");

    if !lost.is_empty() {
        CheckResult::fail(STORAGE_CLAIMS, format!("claims Lost: {}", lost.join(", ")))
    } else if !pending.is_empty() {
        CheckResult::warn(STORAGE_CLAIMS, format!("claims Pending: {}", pending.join(", ")))
    } else {
        CheckResult::pass(STORAGE_CLAIMS, format!("{} claim(s) Bound", health.claims.len()))
    }
}

pub fn routes(health: &ExtendedHealth) -> CheckResult {
    let Some(routes) = &health.routes else {
        return CheckResult::pass(ROUTES, "Gateway API not installed");
    };

    let broken: Vec<String> = routes
        .iter()
        .filter(|r| !r.programmed)
        .map(|r| match &r.message {
            Some(msg) => format!("{}/{} ({msg})", r.namespace, r.name),
            None => format!("{}/{}", r.namespace, r.name),
        })
        .collect();

    if broken.is_empty() {
        CheckResult::pass(ROUTES, format!("{} gateway(s) Programmed", routes.len()))
    } else {
        CheckResult::fail(ROUTES, format!("not Programmed: {}", broken.join(", ")))
    }
}

pub fn certificates(health: &ExtendedHealth, now: DateTime<Utc>) -> CheckResult {
    let Some(certs) = &health.certificates else {
        return CheckResult::pass(CERTIFICATES, "cert-manager not installed");
    };

    let horizon = now + Duration::days(CERT_EXPIRY_WARN_DAYS);
    let mut not_ready = Vec::new();
    let mut expiring = Vec::new();
    for cert in certs {
        let name = format!("{}/{}", cert.namespace, cert.name);
        if !cert.ready || cert.not_after.is_some_and(|t| t <= now) {
            not_ready.push(name);
        } else if cert.not_after.is_some_and(|t| t <= horizon) {
            expiring.push(name);
        }
    }

    if !not_ready.is_empty() {
        CheckResult::fail(CERTIFICATES, format!("not Ready or expired: {}", not_ready.join(", ")))
    } else if !expiring.is_empty() {
        CheckResult::warn(
            CERTIFICATES,
            format!("expiring within {CERT_EXPIRY_WARN_DAYS} days: {}", expiring.join(", ")),
        )
    } else {
        CheckResult::pass(CERTIFICATES, format!("{} certificate(s) Ready", certs.len()))
    }
}

pub fn all(health: &ExtendedHealth, now: DateTime<Utc>) -> Vec<CheckResult> {
    vec![
        dns_probe(health),
        storage_claims(health),
        routes(health),
        certificates(health, now),
    ]
}
