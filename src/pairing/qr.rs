use std::fmt;
use std::sync::Arc;

use base64::Engine;
use serde::{Serialize, Serializer};

use crate::{AppError, AppResult};

/// 二维码图片
///
/// 字节用 `Arc<[u8]>` 共享，快照克隆时不复制图片。序列化为 data URL 供前端直接展示。
#[derive(Clone, PartialEq, Eq)]
pub struct QrImage {
    content_type: String,
    bytes: Arc<[u8]>,
}

impl QrImage {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn png(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::new("image/png", bytes)
    }

    /// 解码后端返回的 base64 PNG
    pub fn from_base64_png(encoded: &str) -> AppResult<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AppError::InvalidResponse(format!("invalid base64 QR: {e}")))?;
        Ok(Self::png(bytes))
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

impl fmt::Debug for QrImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrImage")
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Serialize for QrImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_data_url())
    }
}

/// `login-qr` 的结果
#[derive(Debug, Clone)]
pub enum QrOutcome {
    /// 新生成的二维码
    Image(QrImage),
    /// 该孩子的配对流程已在运行，通过事件流跟进
    AlreadyRunning,
}
