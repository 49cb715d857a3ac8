//! `tag` — a reference link that appends a `name:value` tag to the vCon
//! (§8 scenario 1 uses this exact stage to add `processed=true`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::VConCache;
use crate::error::StageError;
use crate::stages::Link;
use crate::vcon::VCon;

pub struct TagLink {
    cache: Arc<VConCache>,
}

impl TagLink {
    pub fn new(cache: Arc<VConCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Link for TagLink {
    async fn run(
        &self,
        uuid: &str,
        stage_name: &str,
        options: &HashMap<String, Value>,
    ) -> Result<Option<String>, StageError> {
        let name = options
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("tag")
            .to_string();
        let value = options
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or("true")
            .to_string();

        let doc = self
            .cache
            .get(uuid)
            .await
            .map_err(|e| StageError::Permanent(format!("{stage_name}: {e}")))?;
        let mut vcon = VCon::from_json(&doc)
            .map_err(|e| StageError::Permanent(format!("{stage_name}: malformed vCon: {e}")))?;
        vcon.add_tag(&name, &value);
        let updated = vcon
            .to_json()
            .map_err(|e| StageError::Permanent(format!("{stage_name}: {e}")))?;
        self.cache
            .put(uuid, &updated)
            .await
            .map_err(|e| StageError::Recoverable(format!("{stage_name}: {e}")))?;
        Ok(Some(uuid.to_string()))
    }
}
