use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{ChildData, NewChild};
use crate::client::ApiClient;
use crate::events::{self, AppEvent, EventSender, NoticeLevel};
use crate::pairing::ChildRegistry;
use crate::protocol::{ChildRecord, CreateChildRequest};
use crate::{AppError, AppResult};

/// 孩子档案管理器
///
/// 本地缓存以孩子 id 为键，每次变更后广播完整列表。
/// 远程调用失败时不修改缓存，并发出错误提示。
///
/// 本身不含 Arc，需要共享时由使用方包裹 `Arc<ChildManager>`。
pub struct ChildManager {
    client: ApiClient,
    children: DashMap<String, ChildData>,
    events: EventSender,
}

impl ChildManager {
    pub fn new(client: ApiClient, events: EventSender) -> Self {
        Self {
            client,
            children: DashMap::new(),
            events,
        }
    }

    /// 从后端重新拉取列表
    pub async fn refresh(&self) -> AppResult<Vec<ChildData>> {
        let records = self
            .client
            .list_children()
            .await
            .inspect_err(|e| self.report("Failed to load children", e))?;

        self.replace_all(records);
        Ok(self.children())
    }

    /// 用后端记录替换缓存，后端未给出的连接标志沿用本地值
    pub(crate) fn replace_all(&self, records: Vec<ChildRecord>) {
        let fresh: Vec<ChildData> = records
            .into_iter()
            .map(|record| {
                let previous = self.children.get(&record.id).map(|c| c.clone());
                ChildData::from_record(record, previous.as_ref())
            })
            .collect();

        self.children
            .retain(|id, _| fresh.iter().any(|child| &child.id == id));
        for child in fresh {
            self.children.insert(child.id.clone(), child);
        }
        debug!("Children cache refreshed: {} entries", self.children.len());
        self.broadcast();
    }

    /// 缓存中的孩子，按创建时间、名字排序
    pub fn children(&self) -> Vec<ChildData> {
        let mut list: Vec<ChildData> = self.children.iter().map(|c| c.clone()).collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        list
    }

    pub fn get(&self, child_id: &str) -> Option<ChildData> {
        self.children.get(child_id).map(|c| c.clone())
    }

    /// 新建孩子档案，`adult_id` 取自当前登录账户
    pub async fn add_child(&self, form: NewChild) -> AppResult<ChildData> {
        let name = form.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("Please enter a name".into()));
        }

        let record = async {
            let user = self.client.current_user().await?;
            let body = CreateChildRequest {
                name: name.to_string(),
                age: form.age,
                gender: form.gender,
                adult_id: user.adult_id,
            };
            self.client.create_child(&body).await
        }
        .await
        .inspect_err(|e| self.report("Failed to add child", e))?;

        let mut child = ChildData::from_record(record, None);
        child.phone_connected = false;
        child.whatsapp_connected = false;
        self.children.insert(child.id.clone(), child.clone());

        info!("Child {} ({}) added", child.id, child.name);
        events::notify(
            &self.events,
            NoticeLevel::Success,
            format!("{} added successfully", child.name),
        );
        self.broadcast();
        Ok(child)
    }

    /// 解除手机配对
    pub async fn unpair_phone(&self, child_id: &str) -> AppResult<()> {
        self.client
            .unpair_phone(child_id)
            .await
            .inspect_err(|e| self.report("Failed to unpair phone", e))?;

        if let Some(mut child) = self.children.get_mut(child_id) {
            child.phone_connected = false;
        }
        info!("Phone unpaired for child {}", child_id);
        events::notify(&self.events, NoticeLevel::Success, "Phone unpaired successfully");
        self.broadcast();
        Ok(())
    }

    /// 删除孩子档案
    pub async fn remove_child(&self, child_id: &str) -> AppResult<()> {
        self.client
            .delete_child(child_id)
            .await
            .inspect_err(|e| self.report("Failed to remove child", e))?;

        let message = match self.children.remove(child_id) {
            Some((_, child)) => format!("{} has been removed", child.name),
            None => "Child has been removed".to_string(),
        };
        info!("Child {} removed", child_id);
        events::notify(&self.events, NoticeLevel::Success, message);
        self.broadcast();
        Ok(())
    }

    fn report(&self, message: &str, error: &AppError) {
        warn!("{}: {}", message, error);
        events::notify(&self.events, NoticeLevel::Error, message);
    }

    fn broadcast(&self) {
        let _ = self.events.send(AppEvent::ChildrenChanged {
            children: self.children(),
        });
    }
}

#[async_trait]
impl ChildRegistry for ChildManager {
    fn set_whatsapp_connected(&self, child_id: &str, connected: bool) {
        let changed = match self.children.get_mut(child_id) {
            Some(mut child) if child.whatsapp_connected != connected => {
                child.whatsapp_connected = connected;
                true
            }
            Some(_) => false,
            None => {
                debug!("WhatsApp flag for unknown child {} not cached", child_id);
                false
            }
        };
        if changed {
            self.broadcast();
        }
    }

    /// 提示由配对编排器发出
    async fn unpair_whatsapp(&self, child_id: &str) -> AppResult<()> {
        self.client.unpair_whatsapp(child_id).await?;
        self.set_whatsapp_connected(child_id, false);
        Ok(())
    }
}
