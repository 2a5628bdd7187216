//! Layered configuration merging and profile resolution.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::payload::{Payload, deep_merge};
use crate::pipeline::{Chain, Processor};

/// Header carrying the org/project default configuration supplied by the
/// intake layer.
pub const DEFAULTS_HEADER: &str = "defaults";

/// Header carrying per-profile configuration overlays.
pub const PROFILES_HEADER: &str = "profiles";

/// Configuration key naming the active profiles.
const ACTIVE_PROFILES_KEY: &str = "activeProfiles";

/// Configuration key naming the out expressions.
const OUT_KEY: &str = "out";

/// Merges configuration layers and resolves active profiles.
///
/// Layers, later wins: org/project defaults, then each active profile's
/// overlay in order, then the request's own configuration. Also lifts
/// `activeProfiles` and `out` from the merged configuration onto the
/// payload when not already set.
pub struct ConfigurationProcessor;

impl ConfigurationProcessor {
    fn string_list(value: Option<&Value>) -> Vec<String> {
        value
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Processor for ConfigurationProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        let request_cfg = payload.configuration.clone();

        // Active profiles: explicit on the payload, otherwise from the
        // request configuration.
        let active_profiles = if payload.active_profiles.is_empty() {
            Self::string_list(request_cfg.get(ACTIVE_PROFILES_KEY))
        } else {
            payload.active_profiles.clone()
        };

        let mut merged: Map<String, Value> = match payload.header(DEFAULTS_HEADER) {
            Some(Value::Object(defaults)) => defaults.clone(),
            _ => Map::new(),
        };

        if let Some(Value::Object(profiles)) = payload.header(PROFILES_HEADER) {
            for name in &active_profiles {
                if let Some(Value::Object(overlay)) = profiles.get(name) {
                    merged = deep_merge(&merged, overlay);
                }
            }
        }

        merged = deep_merge(&merged, &request_cfg);

        let out_expressions = if payload.out_expressions.is_empty() {
            Self::string_list(merged.get(OUT_KEY)).into_iter().collect()
        } else {
            payload.out_expressions.clone()
        };

        let payload = payload
            .with_configuration(merged)
            .with_active_profiles(active_profiles)
            .with_out_expressions(out_expressions);

        chain.process(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{NoopFaultHandler, Pipeline};
    use crate::process::ProcessKey;
    use serde_json::json;
    use std::sync::Arc;

    fn run(payload: Payload) -> impl std::future::Future<Output = Result<Payload>> {
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(ConfigurationProcessor)],
            Arc::new(NoopFaultHandler),
        );
        async move { pipeline.process(payload).await }
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_overrides_defaults() {
        let payload = Payload::new(ProcessKey::generate())
            .with_header(
                DEFAULTS_HEADER,
                json!({"arguments": {"region": "us", "retries": 3}}),
            )
            .with_configuration(obj(json!({"arguments": {"region": "eu"}})));

        let out = run(payload).await.unwrap();
        assert_eq!(
            out.configuration,
            obj(json!({"arguments": {"region": "eu", "retries": 3}}))
        );
    }

    #[tokio::test]
    async fn active_profiles_applied_in_order() {
        let payload = Payload::new(ProcessKey::generate())
            .with_header(
                PROFILES_HEADER,
                json!({
                    "dev": {"arguments": {"env": "dev", "debug": true}},
                    "eu": {"arguments": {"env": "eu"}}
                }),
            )
            .with_configuration(obj(json!({"activeProfiles": ["dev", "eu"]})));

        let out = run(payload).await.unwrap();
        assert_eq!(out.active_profiles, vec!["dev", "eu"]);
        assert_eq!(
            out.configuration.get("arguments"),
            Some(&json!({"env": "eu", "debug": true}))
        );
    }

    #[tokio::test]
    async fn out_expressions_lifted_from_configuration() {
        let payload = Payload::new(ProcessKey::generate())
            .with_configuration(obj(json!({"out": ["result", "count"]})));

        let out = run(payload).await.unwrap();
        assert!(out.out_expressions.contains("result"));
        assert!(out.out_expressions.contains("count"));
    }

    #[tokio::test]
    async fn explicit_profiles_win_over_configuration() {
        let payload = Payload::new(ProcessKey::generate())
            .with_active_profiles(vec!["explicit".to_string()])
            .with_configuration(obj(json!({"activeProfiles": ["ignored"]})));

        let out = run(payload).await.unwrap();
        assert_eq!(out.active_profiles, vec!["explicit"]);
    }
}
