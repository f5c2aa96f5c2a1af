use serde::Serialize;

use super::stage::{status_text, Stage};
use super::QrImage;

/// 单个孩子的配对会话（内存态）
///
/// `attempt` 在每次发起配对或解除配对时递增，所有异步回调凭它判断自己是否已过期。
#[derive(Debug, Clone)]
pub struct PairingSession {
    pub child_id: String,
    pub attempt: u64,
    pub trace_id: Option<String>,
    pub stage: Option<Stage>,
    pub qr_image: Option<QrImage>,
    /// 过期时间（Unix 毫秒）
    pub expires_at: Option<i64>,
    /// 进入 `error` 的原因
    pub failure: Option<String>,
}

impl PairingSession {
    pub fn idle(child_id: impl Into<String>, attempt: u64) -> Self {
        Self {
            child_id: child_id.into(),
            attempt,
            trace_id: None,
            stage: None,
            qr_image: None,
            expires_at: None,
            failure: None,
        }
    }

    /// 新的配对尝试，处于 `waiting_qr`
    pub fn started(child_id: impl Into<String>, attempt: u64, expires_in_ms: i64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            stage: Some(Stage::WaitingQr),
            expires_at: Some(now + expires_in_ms),
            ..Self::idle(child_id, attempt)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_some_and(|s| s.is_terminal())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|t| chrono::Utc::now().timestamp_millis() > t)
    }

    /// 进入 `error` 并丢弃二维码
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.stage = Some(Stage::Error);
        self.qr_image = None;
        self.failure = Some(reason.into());
    }
}

/// 推送给前端的会话快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSnapshot {
    pub child_id: String,
    pub stage: Option<Stage>,
    pub qr_image: Option<QrImage>,
    pub trace_id: Option<String>,
    /// 请求阶段（trace id / 二维码）仍在进行
    pub loading: bool,
    pub expires_at: Option<i64>,
    pub failure: Option<String>,
    pub status_text: Option<&'static str>,
}

impl PairingSnapshot {
    pub fn new(session: &PairingSession, loading: bool) -> Self {
        Self {
            child_id: session.child_id.clone(),
            stage: session.stage,
            qr_image: session.qr_image.clone(),
            trace_id: session.trace_id.clone(),
            loading,
            expires_at: session.expires_at,
            failure: session.failure.clone(),
            status_text: status_text(session.stage),
        }
    }
}
