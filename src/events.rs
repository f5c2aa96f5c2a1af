//! 前端事件
//!
//! 所有后端 → 前端的事件名集中定义，避免硬编码字符串散落各模块。
//! 事件通过 `tokio::sync::broadcast` 推送，UI 层按 [`AppEvent::name`] 转发。

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::child::ChildData;
use crate::pairing::PairingSnapshot;

// === 配对 ===
pub const PAIRING_STAGE_CHANGED: &str = "pairing-stage-changed";

// === 孩子列表 ===
pub const CHILDREN_CHANGED: &str = "children-changed";

// === 提示 ===
pub const NOTICE: &str = "notice";

/// 广播通道容量
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// 提示级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// 短暂提示（对应前端 toast）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: Uuid,
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            message: message.into(),
        }
    }
}

/// 推送给前端的事件
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "payload")]
pub enum AppEvent {
    PairingStageChanged(PairingSnapshot),
    ChildrenChanged { children: Vec<ChildData> },
    Notice(Notice),
}

impl AppEvent {
    /// 事件名
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::PairingStageChanged(_) => PAIRING_STAGE_CHANGED,
            AppEvent::ChildrenChanged { .. } => CHILDREN_CHANGED,
            AppEvent::Notice(_) => NOTICE,
        }
    }
}

pub type EventSender = broadcast::Sender<AppEvent>;

/// 创建事件广播通道
pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// 发送提示，无订阅者时静默丢弃
pub(crate) fn notify(events: &EventSender, level: NoticeLevel, message: impl Into<String>) {
    let _ = events.send(AppEvent::Notice(Notice::new(level, message)));
}
