//! Link (stage) contract (§4.3) and the built-in reference stages.

pub mod sampler;
pub mod tag;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StageError;

/// `run(uuid, stage_name, options) -> uuid | nil | error`.
///
/// A link may return a *different* UUID to transfer processing to another
/// vCon; `Ok(None)` means "filter — halt the chain cleanly"; `Err(_)` means
/// a classified failure (§4.3, §4.4).
#[async_trait]
pub trait Link: Send + Sync {
    async fn run(
        &self,
        uuid: &str,
        stage_name: &str,
        options: &HashMap<String, Value>,
    ) -> Result<Option<String>, StageError>;
}
