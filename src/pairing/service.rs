//! 配对流程依赖的外部协作方
//!
//! [`PairingService`] 与 [`ChildRegistry`] 是编排器与后端之间的接缝，
//! 生产环境由 [`ApiClient`] / [`ChildManager`](crate::child::ChildManager) 实现。

use async_trait::async_trait;

use super::stream::EventSubscription;
use super::{QrImage, QrOutcome};
use crate::client::ApiClient;
use crate::AppResult;

#[async_trait]
pub trait PairingService: Send + Sync {
    /// 为新的配对尝试申请 trace id
    async fn start_session(&self, child_id: &str) -> AppResult<String>;

    /// 请求二维码，或得知流程已在运行
    async fn request_qr(&self, child_id: &str) -> AppResult<QrOutcome>;

    /// 订阅 trace id 对应的实时事件
    async fn subscribe(&self, trace_id: &str) -> AppResult<EventSubscription>;

    /// 拉取事件中 `qr_path` 指向的二维码
    async fn fetch_qr(&self, qr_path: &str) -> AppResult<QrImage>;
}

#[async_trait]
pub trait ChildRegistry: Send + Sync {
    /// 写入本地的 WhatsApp 已连接标志
    fn set_whatsapp_connected(&self, child_id: &str, connected: bool);

    /// 远程解除 WhatsApp 配对，成功后清除本地标志
    async fn unpair_whatsapp(&self, child_id: &str) -> AppResult<()>;
}

#[async_trait]
impl PairingService for ApiClient {
    async fn start_session(&self, child_id: &str) -> AppResult<String> {
        self.trace_id(child_id).await
    }

    async fn request_qr(&self, child_id: &str) -> AppResult<QrOutcome> {
        self.login_qr(child_id).await
    }

    async fn subscribe(&self, trace_id: &str) -> AppResult<EventSubscription> {
        self.open_event_stream(trace_id).await
    }

    async fn fetch_qr(&self, qr_path: &str) -> AppResult<QrImage> {
        self.fetch_image(qr_path).await
    }
}
