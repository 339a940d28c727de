use serde::{Deserialize, Serialize};

use stepgate_core::{ChunkId, InstanceId, StepId};

/// Notification that a chunk has been claimed and is ready to execute.
///
/// Carries everything a worker needs to locate the chunk and its step
/// implementation; the payload itself stays in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWorkNotification {
    pub job_definition_id: String,
    pub job_definition_version: u32,
    pub instance_id: InstanceId,
    pub target_step_id: StepId,
    pub chunk_id: ChunkId,
}

impl JobWorkNotification {
    pub fn new(
        job_definition_id: impl Into<String>,
        job_definition_version: u32,
        instance_id: InstanceId,
        target_step_id: StepId,
        chunk_id: ChunkId,
    ) -> Self {
        Self {
            job_definition_id: job_definition_id.into(),
            job_definition_version,
            instance_id,
            target_step_id,
            chunk_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_uses_snake_case_fields() {
        let notification = JobWorkNotification::new(
            "bulk-export",
            3,
            InstanceId::from("i-1"),
            StepId::from("export"),
            ChunkId::from("c-9"),
        );

        let raw = notification.to_json().unwrap();
        assert!(raw.contains("\"job_definition_version\":3"));
        assert!(raw.contains("\"chunk_id\":\"c-9\""));
        assert_eq!(JobWorkNotification::from_json(&raw).unwrap(), notification);
    }
}
