//! `sampler` — a reference link whose only job is to return `Ok(None)`
//! (filter) for some fraction of vCons. Demonstrates the filter outcome
//! from §4.3 / §7 item 4 (§8 scenario 2 wires this in front of a chain to
//! prove downstream stages never run on filtered items).

use std::collections::HashMap;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

use crate::error::StageError;
use crate::stages::Link;

pub struct SamplerLink;

#[async_trait]
impl Link for SamplerLink {
    async fn run(
        &self,
        uuid: &str,
        _stage_name: &str,
        options: &HashMap<String, Value>,
    ) -> Result<Option<String>, StageError> {
        // `rate` is the fraction of vCons that pass through (default 0.0,
        // i.e. "always filter" — a deterministic, test-friendly default).
        let rate = options
            .get("rate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        if rate >= 1.0 {
            return Ok(Some(uuid.to_string()));
        }
        if rate <= 0.0 {
            return Ok(None);
        }

        let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
        if roll < rate {
            Ok(Some(uuid.to_string()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_zero_always_filters() {
        let sampler = SamplerLink;
        let mut options = HashMap::new();
        options.insert("rate".to_string(), serde_json::json!(0.0));
        let result = sampler.run("U1", "sampler", &options).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn rate_one_always_passes() {
        let sampler = SamplerLink;
        let mut options = HashMap::new();
        options.insert("rate".to_string(), serde_json::json!(1.0));
        let result = sampler.run("U1", "sampler", &options).await.unwrap();
        assert_eq!(result, Some("U1".to_string()));
    }

    #[tokio::test]
    async fn default_rate_filters() {
        let sampler = SamplerLink;
        let result = sampler.run("U1", "sampler", &HashMap::new()).await.unwrap();
        assert_eq!(result, None);
    }
}
