//! Runtime types.

use msgr_core::ConnectionState;
use msgr_events::DispatcherStats;
use msgr_guardian::SessionGuardianStatus;
use msgr_realtime::StreamStats;
use msgr_session::AntiDetectionStatus;
use serde::Serialize;

/// Snapshot of everything the engine can report about itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub user_id: String,
    pub client_id: String,
    pub connection_state: ConnectionState,
    pub listening: bool,
    pub anti_detection: AntiDetectionStatus,
    /// `None` when neither anti-logout nor token refresh is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian: Option<SessionGuardianStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamStats>,
    pub dispatcher: DispatcherStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_cause: Option<String>,
}
