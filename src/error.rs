//! 应用错误处理模块
//!
//! 错误需要实现 Serialize 才能传递给前端（统一为 `{ kind, message }`）。

use serde::Serialize;
use thiserror::Error;

/// 应用统一错误类型
///
/// 注意：使用 `#[from]` 的变体会存储原始错误类型，
/// 但由于 `reqwest::Error` 等不实现 `Serialize`，
/// 通过自定义 Serialize 实现统一转为 `{ kind, message }` 格式。
///
/// 后端返回的「配对流程已在运行」不是错误，见
/// [`QrOutcome::AlreadyRunning`](crate::pairing::QrOutcome::AlreadyRunning)。
#[derive(Debug, Error)]
pub enum AppError {
    /// HTTP 传输层错误（连接失败、超时、body 读取失败）
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 后端返回非成功状态码
    #[error("Request failed with status {status}: {message}")]
    Request { status: u16, message: String },

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 响应内容无法识别
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// 实时事件流中断
    #[error("Event stream error: {0}")]
    Stream(String),

    /// 超时窗口内未完成配对
    #[error("Pairing expired before completion")]
    PairingExpired,

    /// 调用时没有可用的 bearer 凭证
    #[error("You must be logged in")]
    NotAuthenticated,

    /// 表单输入不合法
    #[error("{0}")]
    InvalidInput(String),
}

impl AppError {
    /// 对应前端 `kind` 字段的稳定名称
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Http(_) => "Http",
            AppError::Request { .. } => "Request",
            AppError::Serialization(_) => "Serialization",
            AppError::InvalidResponse(_) => "InvalidResponse",
            AppError::Stream(_) => "Stream",
            AppError::PairingExpired => "PairingExpired",
            AppError::NotAuthenticated => "NotAuthenticated",
            AppError::InvalidInput(_) => "InvalidInput",
        }
    }
}

/// 传递给前端的序列化错误格式
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("AppError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

// ============ 便捷类型别名 ============

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;
