use serde::Serialize;

/// Body of a 429, for HTTP and realtime rejections alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub retry_after: u64,
}

impl RejectionBody {
    pub fn new(error: impl Into<String>, retry_after: u64) -> Self {
        Self {
            error: error.into(),
            retry_after,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub cluster: &'static str,
}

impl ReadinessResponse {
    pub fn ready() -> Self {
        Self {
            status: "ready",
            cluster: "connected",
        }
    }

    pub fn not_ready() -> Self {
        Self {
            status: "not_ready",
            cluster: "unavailable",
        }
    }
}
