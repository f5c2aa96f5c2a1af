//! 后端 HTTP 客户端
//!
//! 封装两个后端：账户/孩子/统计后端（`api`）与 WhatsApp 配对服务（`scraper`）。
//! 每次请求时从 [`CredentialProvider`] 读取令牌；所有非成功状态码统一为
//! [`AppError::Request`]，不做自动重试。

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use tracing::debug;

use crate::auth::CredentialProvider;
use crate::config::ServiceConfig;
use crate::metrics::UsageKpi;
use crate::pairing::stream::{spawn_sse_pump, EventSubscription};
use crate::pairing::{QrImage, QrOutcome};
use crate::protocol::{
    ApkQrResponse, ChildListResponse, ChildRecord, CreateChildRequest, CurrentUser,
    PairingServiceRequest, TraceIdResponse, UsageSummaryResponse,
};
use crate::{AppError, AppResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ServiceConfig>,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
    pub fn new(config: ServiceConfig, credentials: Arc<dyn CredentialProvider>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            config: Arc::new(config),
            credentials,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url, path)
    }

    fn scraper_url(&self, path: &str) -> String {
        format!("{}{}", self.config.scraper_base_url, path)
    }

    /// `qr_path` 可能是绝对地址，也可能是相对于配对服务的路径
    pub(crate) fn resolve_scraper_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            self.scraper_url(path)
        } else {
            self.scraper_url(&format!("/{path}"))
        }
    }

    /// 带 bearer 令牌与超时的普通请求
    fn request(&self, method: Method, url: String) -> AppResult<RequestBuilder> {
        self.request_accepting(method, url, "application/json")
    }

    /// 与 `request` 相同，但 `Accept` 只出现一次且取 `accept`
    fn request_accepting(
        &self,
        method: Method,
        url: String,
        accept: &'static str,
    ) -> AppResult<RequestBuilder> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(AppError::NotAuthenticated)?;

        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header(header::ACCEPT, accept)
            .timeout(self.config.request_timeout))
    }

    // ============ 账户 / 孩子档案 ============

    pub async fn current_user(&self) -> AppResult<CurrentUser> {
        let response = self
            .request(Method::GET, self.api_url("/auth/me"))?
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    pub async fn list_children(&self) -> AppResult<Vec<ChildRecord>> {
        let response = self
            .request(Method::GET, self.api_url("/child_users/list"))?
            .send()
            .await?;
        let list: ChildListResponse = ensure_success(response).await?.json().await?;
        Ok(list.children)
    }

    pub async fn create_child(&self, body: &CreateChildRequest) -> AppResult<ChildRecord> {
        let response = self
            .request(Method::POST, self.api_url("/child_users/"))?
            .json(body)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    pub async fn unpair_phone(&self, child_id: &str) -> AppResult<()> {
        let url = self.api_url(&format!("/child_users/{child_id}/unpair-phone"));
        let response = self.request(Method::POST, url)?.send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn unpair_whatsapp(&self, child_id: &str) -> AppResult<()> {
        let url = self.api_url(&format!("/child_users/{child_id}/unpair-whatsapp"));
        let response = self.request(Method::POST, url)?.send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn delete_child(&self, child_id: &str) -> AppResult<()> {
        let url = self.api_url(&format!("/child_users/{child_id}"));
        let response = self.request(Method::DELETE, url)?.send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    // ============ 统计 / 安装包 ============

    pub async fn usage_summary(&self, child_id: &str) -> AppResult<UsageKpi> {
        let response = self
            .request(Method::GET, self.api_url("/metrics/app-usage/summary"))?
            .query(&[("child_id", child_id)])
            .send()
            .await?;
        let summary: UsageSummaryResponse = ensure_success(response).await?.json().await?;
        Ok(summary.kpi)
    }

    /// 安装包下载二维码，无需登录
    pub async fn apk_download_qr(&self) -> AppResult<QrImage> {
        let response = self
            .http
            .get(self.api_url("/xoul-apk/generate-download-qr"))
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let body: ApkQrResponse = ensure_success(response).await?.json().await?;
        QrImage::from_base64_png(&body.qr)
    }

    // ============ WhatsApp 配对服务 ============

    /// 为一次配对尝试申请 trace id
    pub async fn trace_id(&self, child_id: &str) -> AppResult<String> {
        let response = self
            .request(
                Method::POST,
                self.scraper_url("/scraper/wa/session/get-trace-id"),
            )?
            .json(&PairingServiceRequest { user_id: child_id })
            .send()
            .await?;
        let body: TraceIdResponse = ensure_success(response).await?.json().await?;
        debug!("Issued trace id {} for child {}", body.trace_id, child_id);
        Ok(body.trace_id)
    }

    /// 请求登录二维码；400 + JSON body 表示流程已在运行
    pub async fn login_qr(&self, child_id: &str) -> AppResult<QrOutcome> {
        let response = self.login_qr_request(child_id)?.send().await?;

        let status = response.status();
        let content_type = content_type_of(&response);
        let body = response.bytes().await?;
        classify_login_qr(status, &content_type, &body)
    }

    fn login_qr_request(&self, child_id: &str) -> AppResult<RequestBuilder> {
        Ok(self
            .request_accepting(
                Method::POST,
                self.scraper_url("/scraper/wa/session/login-qr"),
                "image/png, application/json",
            )?
            .json(&PairingServiceRequest { user_id: child_id }))
    }

    /// 拉取事件流中 `qr_path` 指向的图片
    pub async fn fetch_image(&self, path: &str) -> AppResult<QrImage> {
        let response = self
            .http
            .get(self.resolve_scraper_url(path))
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let content_type = content_type_of(&response);
        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(AppError::InvalidResponse("empty QR image".into()));
        }
        Ok(QrImage::new(content_type, body.to_vec()))
    }

    /// 打开 trace id 对应的 SSE 事件流
    ///
    /// 事件流是长连接，不设置请求超时；由返回的订阅对象负责关闭。
    pub async fn open_event_stream(&self, trace_id: &str) -> AppResult<EventSubscription> {
        let url = self.scraper_url(&format!("/scraper/wa/session/stream/{trace_id}"));
        let mut builder = self
            .http
            .get(url)
            .header(header::ACCEPT, "text/event-stream");
        if let Some(token) = self.credentials.bearer_token() {
            builder = builder.bearer_auth(token);
        }

        let response = ensure_success(builder.send().await?).await?;
        Ok(spawn_sse_pump(
            trace_id,
            response.bytes_stream(),
            self.config.pairing.stream_buffer,
        ))
    }
}

/// 非成功状态码转为 [`AppError::Request`]
async fn ensure_success(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(request_error(status, message))
}

fn request_error(status: StatusCode, message: String) -> AppError {
    let message = if message.trim().is_empty() {
        status.canonical_reason().unwrap_or("unknown error").to_string()
    } else {
        message
    };
    AppError::Request {
        status: status.as_u16(),
        message,
    }
}

fn content_type_of(response: &Response) -> String {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/png")
        .to_string()
}

/// 解析 `login-qr` 响应
///
/// - 2xx：二维码图片
/// - 400 且 body 为 JSON：流程已在运行，不是错误
/// - 其他：请求失败
fn classify_login_qr(status: StatusCode, content_type: &str, body: &[u8]) -> AppResult<QrOutcome> {
    if status.is_success() {
        if body.is_empty() {
            return Err(AppError::InvalidResponse("empty QR image".into()));
        }
        return Ok(QrOutcome::Image(QrImage::new(content_type, body.to_vec())));
    }

    if status == StatusCode::BAD_REQUEST
        && serde_json::from_slice::<serde_json::Value>(body).is_ok()
    {
        return Ok(QrOutcome::AlreadyRunning);
    }

    Err(request_error(
        status,
        String::from_utf8_lossy(body).into_owned(),
    ))
}
