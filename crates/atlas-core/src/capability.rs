//! External AI-assisted capability.
//!
//! The model call itself lives outside this crate. Callers plug in an
//! implementation of [`ExtractionCapability`]. An attempt invokes it at most
//! once. Every call runs under a timeout and any failure is a signal to fall
//! back to the rule-based path.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::FindingsSummary;
use crate::plan::{PlanConstraints, PlanStep};
use crate::types::{CapabilityError, Entity};

/// Ask the capability to plan a task the rule-based planner could not resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub instructions: String,
    pub domain: String,
    pub target_type: String,
    pub required_fields: Vec<String>,
    pub unresolved_fields: Vec<String>,
    pub constraints: PlanConstraints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanProposal {
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Ask the capability for a candidate schema plus data for some content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRequest {
    pub instructions: String,
    pub content: String,
    #[serde(default)]
    pub current_findings: Option<FindingsSummary>,
    pub contract_schema: Value,
}

/// Candidate schema and the data extracted under it. Never partial: a
/// capability that cannot produce both returns an error instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaProposal {
    pub schema: Value,
    pub data: Vec<Entity>,
}

#[async_trait]
pub trait ExtractionCapability: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    async fn generate_plan(&self, request: &PlanRequest) -> Result<PlanProposal, CapabilityError>;

    async fn generate_schema(
        &self,
        request: &SchemaRequest,
    ) -> Result<SchemaProposal, CapabilityError>;
}

/// Await a capability future under a caller-supplied timeout.
pub async fn invoke_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, CapabilityError>
where
    F: std::future::Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_capability_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CapabilityError>(1)
        };
        let err = invoke_with_timeout(Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Timeout { timeout_ms: 10 });
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let fast = async { Ok::<_, CapabilityError>(7) };
        assert_eq!(invoke_with_timeout(Duration::from_secs(1), fast).await, Ok(7));
    }
}
