use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::auth::CredentialProvider;
use crate::child::ChildManager;
use crate::client::ApiClient;
use crate::config::ServiceConfig;
use crate::events::{self, AppEvent, EventSender, NoticeLevel};
use crate::metrics::UsageKpi;
use crate::pairing::{PairingOrchestrator, QrImage};
use crate::AppResult;

/// 仪表盘入口
///
/// 统一管理 [`ApiClient`]、[`ChildManager`] 和 [`PairingOrchestrator`]，
/// 对 UI 层提供访问接口。所有组件共享同一个事件广播通道。
pub struct Dashboard {
    client: ApiClient,
    children: Arc<ChildManager>,
    pairing: PairingOrchestrator,
    events: EventSender,
}

impl Dashboard {
    pub fn new(
        config: ServiceConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> AppResult<Self> {
        let pairing_config = config.pairing.clone();
        let client = ApiClient::new(config, credentials)?;
        let events = events::channel();

        let children = Arc::new(ChildManager::new(client.clone(), events.clone()));
        let pairing = PairingOrchestrator::new(
            Arc::new(client.clone()),
            children.clone(),
            pairing_config,
            events.clone(),
        );

        info!(
            "Dashboard ready (api: {}, scraper: {})",
            client.config().api_base_url,
            client.config().scraper_base_url
        );
        Ok(Self {
            client,
            children,
            pairing,
            events,
        })
    }

    pub fn children(&self) -> &ChildManager {
        &self.children
    }

    pub fn pairing(&self) -> &PairingOrchestrator {
        &self.pairing
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    /// 屏幕使用时间汇总
    pub async fn usage_summary(&self, child_id: &str) -> AppResult<UsageKpi> {
        self.client.usage_summary(child_id).await.inspect_err(|e| {
            warn!("Failed to load usage summary for child {}: {}", child_id, e);
            events::notify(&self.events, NoticeLevel::Error, "Could not load usage KPIs");
        })
    }

    /// 孩子端安装包的下载二维码
    pub async fn apk_download_qr(&self) -> AppResult<QrImage> {
        self.client.apk_download_qr().await.inspect_err(|e| {
            warn!("Failed to generate APK download QR: {}", e);
            events::notify(
                &self.events,
                NoticeLevel::Error,
                "Could not generate QR – try again",
            );
        })
    }

    /// 删除孩子档案，远端删除成功后才结束其配对会话
    pub async fn remove_child(&self, child_id: &str) -> AppResult<()> {
        self.children.remove_child(child_id).await?;
        self.pairing.detach(child_id);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.pairing.shutdown();
        info!("Dashboard shut down");
    }
}
