//! 后端 HTTP 协议类型
//!
//! 字段名与后端 JSON 保持一致（snake_case），前端展示用的类型在各业务模块中定义。

use serde::{Deserialize, Deserializer, Serialize};

use crate::child::Gender;

/// 配对服务请求体：`get-trace-id` 与 `login-qr` 共用
#[derive(Debug, Clone, Serialize)]
pub struct PairingServiceRequest<'a> {
    pub user_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceIdResponse {
    pub trace_id: String,
}

/// 事件流中的一条消息
///
/// `stage` 保留原始字符串，未知阶段由消费方跳过而不是让整条消息解析失败。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub qr_path: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// `GET /auth/me`
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentUser {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub adult_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildListResponse {
    pub children: Vec<ChildRecord>,
}

/// 后端返回的孩子档案
#[derive(Debug, Clone, Deserialize)]
pub struct ChildRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub adult_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub phone_connected: Option<bool>,
    #[serde(default)]
    pub whatsapp_connected: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateChildRequest {
    pub name: String,
    pub age: u32,
    pub gender: Gender,
    pub adult_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageSummaryResponse {
    pub kpi: crate::metrics::UsageKpi,
}

/// `GET /xoul-apk/generate-download-qr`
#[derive(Debug, Clone, Deserialize)]
pub struct ApkQrResponse {
    /// base64 编码的 PNG
    pub qr: String,
}

/// 后端的 id 可能是数字也可能是字符串，统一为字符串
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Str(String),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Int(n) => n.to_string(),
        RawId::Str(s) => s,
    })
}
