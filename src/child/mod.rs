//! 孩子档案模块
//!
//! 管理当前监护人名下的孩子列表与各自的配对标志。
//! [`ChildManager`] 维护本地缓存并实现配对流程依赖的
//! [`ChildRegistry`](crate::pairing::ChildRegistry)。

pub mod manager;

pub use manager::ChildManager;

use serde::{Deserialize, Serialize};

use crate::protocol::ChildRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

/// 孩子档案（前端展示格式）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildData {
    pub id: String,
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub adult_id: Option<i64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub alias: Option<String>,
    pub phone_connected: bool,
    pub whatsapp_connected: bool,
}

impl ChildData {
    /// 从后端记录构建；后端未给出连接标志时沿用 `previous` 中的本地值
    pub(crate) fn from_record(record: ChildRecord, previous: Option<&ChildData>) -> Self {
        Self {
            phone_connected: record
                .phone_connected
                .or(previous.map(|p| p.phone_connected))
                .unwrap_or(false),
            whatsapp_connected: record
                .whatsapp_connected
                .or(previous.map(|p| p.whatsapp_connected))
                .unwrap_or(false),
            id: record.id,
            name: record.name,
            age: record.age,
            gender: record.gender,
            adult_id: record.adult_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
            alias: record.alias,
        }
    }
}

/// 新建孩子的表单
#[derive(Debug, Clone, Deserialize)]
pub struct NewChild {
    pub name: String,
    pub age: u32,
    pub gender: Gender,
}
