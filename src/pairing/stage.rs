use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 配对阶段
///
/// 空闲状态用 `Option<Stage>` 的 `None` 表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    WaitingQr,
    QrReady,
    WaitingForScan,
    ScanSuccess,
    SessionSaved,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::WaitingQr => "waiting_qr",
            Stage::QrReady => "qr_ready",
            Stage::WaitingForScan => "waiting_for_scan",
            Stage::ScanSuccess => "scan_success",
            Stage::SessionSaved => "session_saved",
            Stage::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::SessionSaved | Stage::Error)
    }

    /// 是否允许持有二维码（session_saved 的展示宽限期除外）
    pub fn holds_qr(&self) -> bool {
        matches!(self, Stage::QrReady | Stage::WaitingForScan)
    }

    /// 生命周期中的先后顺序，`Error` 不参与排序
    fn rank(&self) -> Option<u8> {
        match self {
            Stage::WaitingQr => Some(0),
            Stage::QrReady => Some(1),
            Stage::WaitingForScan => Some(2),
            Stage::ScanSuccess => Some(3),
            Stage::SessionSaved => Some(4),
            Stage::Error => None,
        }
    }

    /// 事件驱动的迁移是否合法
    ///
    /// 只能沿生命周期向前推进；`Error` 可从任一非终止阶段进入；
    /// 空闲只能由发起请求进入 `WaitingQr`。重复事件与回退一律丢弃。
    pub fn can_advance(from: Option<Stage>, to: Stage) -> bool {
        let Some(from) = from else {
            return to == Stage::WaitingQr;
        };
        if from.is_terminal() {
            return false;
        }
        match (from.rank(), to.rank()) {
            (_, None) => true,
            (Some(a), Some(b)) => b > a,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "waiting_qr" => Stage::WaitingQr,
            "qr_ready" => Stage::QrReady,
            "waiting_for_scan" => Stage::WaitingForScan,
            "scan_success" => Stage::ScanSuccess,
            "session_saved" => Stage::SessionSaved,
            "error" => Stage::Error,
            other => return Err(format!("unknown stage: {other}")),
        })
    }
}

/// 阶段对应的提示文案，纯函数
pub fn status_text(stage: Option<Stage>) -> Option<&'static str> {
    Some(match stage? {
        Stage::WaitingQr => "Preparing QR…",
        Stage::QrReady => "Scan the code showing above",
        Stage::WaitingForScan => "Waiting for scan...",
        Stage::ScanSuccess => "Syncing your chats…",
        Stage::SessionSaved => "All set!",
        Stage::Error => "Something went wrong - try again",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Stage; 6] = [
        Stage::WaitingQr,
        Stage::QrReady,
        Stage::WaitingForScan,
        Stage::ScanSuccess,
        Stage::SessionSaved,
        Stage::Error,
    ];

    #[test]
    fn test_wire_names_round_trip() {
        for stage in ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
            assert_eq!(
                serde_json::to_value(stage).unwrap(),
                serde_json::Value::from(stage.as_str())
            );
        }
        assert!("qr_expired".parse::<Stage>().is_err());
    }

    #[test]
    fn test_idle_only_enters_waiting_qr() {
        assert!(Stage::can_advance(None, Stage::WaitingQr));
        for stage in &ALL[1..] {
            assert!(!Stage::can_advance(None, *stage));
        }
    }

    #[test]
    fn test_documented_transitions() {
        use Stage::*;
        let allowed = [
            (WaitingQr, QrReady),
            (WaitingQr, WaitingForScan),
            (WaitingQr, ScanSuccess),
            (WaitingQr, SessionSaved),
            (WaitingQr, Error),
            (QrReady, WaitingForScan),
            (QrReady, ScanSuccess),
            (QrReady, Error),
            (WaitingForScan, ScanSuccess),
            (WaitingForScan, Error),
            (ScanSuccess, SessionSaved),
            (ScanSuccess, Error),
        ];
        for (from, to) in allowed {
            assert!(Stage::can_advance(Some(from), to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_rejects_duplicates_and_backward_moves() {
        use Stage::*;
        assert!(!Stage::can_advance(Some(QrReady), QrReady));
        assert!(!Stage::can_advance(Some(WaitingForScan), QrReady));
        assert!(!Stage::can_advance(Some(ScanSuccess), WaitingForScan));
        assert!(!Stage::can_advance(Some(WaitingQr), WaitingQr));
    }

    #[test]
    fn test_terminal_stages_are_final() {
        for stage in ALL {
            assert!(!Stage::can_advance(Some(Stage::SessionSaved), stage));
            assert!(!Stage::can_advance(Some(Stage::Error), stage));
        }
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(None), None);
        assert_eq!(status_text(Some(Stage::WaitingQr)), Some("Preparing QR…"));
        assert_eq!(status_text(Some(Stage::ScanSuccess)), Some("Syncing your chats…"));
        assert_eq!(
            status_text(Some(Stage::Error)),
            Some("Something went wrong - try again")
        );
    }

    #[test]
    fn test_holds_qr() {
        assert!(!Stage::WaitingQr.holds_qr());
        assert!(Stage::QrReady.holds_qr());
        assert!(Stage::WaitingForScan.holds_qr());
        assert!(!Stage::ScanSuccess.holds_qr());
        assert!(!Stage::Error.holds_qr());
    }
}
