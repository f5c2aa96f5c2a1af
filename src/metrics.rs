//! 屏幕使用时间统计

use serde::{Deserialize, Serialize};

/// 使用时长汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageKpi {
    pub total_seconds: u64,
    pub total_sessions: u64,
    #[serde(default)]
    pub top_app: Option<String>,
    #[serde(default)]
    pub top_app_seconds: Option<u64>,
}

impl UsageKpi {
    /// 是否有可展示的数据（屏幕时间或会话数大于零）
    pub fn has_data(&self) -> bool {
        self.total_seconds > 0 || self.total_sessions > 0
    }
}

/// 秒数格式化为 `{h}h {m}m`，不足一分钟的部分舍去
pub fn format_hm(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    format!("{hours}h {minutes}m")
}
