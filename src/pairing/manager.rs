use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::service::{ChildRegistry, PairingService};
use super::session::{PairingSession, PairingSnapshot};
use super::stage::Stage;
use super::stream::{EventSubscription, SubscriptionCloser};
use super::QrOutcome;
use crate::config::PairingConfig;
use crate::events::{self, AppEvent, EventSender, NoticeLevel};
use crate::protocol::StageEvent;
use crate::{AppError, AppResult};

const NOTICE_ALREADY_RUNNING: &str = "Pairing already in progress — attaching to current session.";
const NOTICE_PAIRED: &str = "WhatsApp paired successfully!";
const NOTICE_FAILED: &str = "Something went wrong during WhatsApp pairing";
const NOTICE_UNPAIRED: &str = "WhatsApp unpaired successfully";
const NOTICE_UNPAIR_FAILED: &str = "Failed to unpair WhatsApp";

/// [`PairingOrchestrator::begin_pairing`] 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// 该孩子已有请求在进行，本次调用被忽略
    Ignored,
    /// 请求阶段完成，后续进度由事件流推进
    Started { trace_id: String, reused: bool },
    /// 请求期间会话被解除配对或离开页面取代
    Superseded,
}

/// 每个孩子一个槽位
struct SessionSlot {
    session: PairingSession,
    loading: bool,
    /// 该尝试的后台任务（宽限期定时器）
    attempt_token: Option<CancellationToken>,
    expiry_token: Option<CancellationToken>,
    subscription: Option<SubscriptionCloser>,
    snapshot: watch::Sender<PairingSnapshot>,
}

impl SessionSlot {
    fn new(child_id: &str, attempt: u64) -> Self {
        let session = PairingSession::idle(child_id, attempt);
        let (snapshot, _) = watch::channel(PairingSnapshot::new(&session, false));
        Self {
            session,
            loading: false,
            attempt_token: None,
            expiry_token: None,
            subscription: None,
            snapshot,
        }
    }

    fn close_subscription(&mut self) {
        if let Some(closer) = self.subscription.take() {
            closer.close();
        }
    }

    fn cancel_expiry(&mut self) {
        if let Some(token) = self.expiry_token.take() {
            token.cancel();
        }
    }

    /// 关闭订阅并撤销该尝试的所有定时器
    fn teardown(&mut self) {
        self.close_subscription();
        self.cancel_expiry();
        if let Some(token) = self.attempt_token.take() {
            token.cancel();
        }
    }

    /// 进入 `error`：丢弃二维码、关闭订阅、撤销过期定时器
    fn fail(&mut self, reason: impl Into<String>) {
        self.session.fail(reason);
        self.loading = false;
        self.close_subscription();
        self.cancel_expiry();
    }
}

/// 事件作用于会话后的后续动作
enum Effect {
    Stale,
    Ignored,
    Advanced,
    FetchQr(String),
    Saved(Option<CancellationToken>),
    Failed,
}

struct Inner {
    service: Arc<dyn PairingService>,
    registry: Arc<dyn ChildRegistry>,
    config: PairingConfig,
    slots: DashMap<String, SessionSlot>,
    /// 全局递增的尝试编号
    attempts: AtomicU64,
    events: EventSender,
}

/// WhatsApp 配对编排器
///
/// 负责一次配对尝试从请求到完成/失败的全过程：申请 trace id、请求二维码、
/// 订阅实时事件、执行过期策略。每个孩子同一时刻最多一个活跃会话、一个打开的订阅。
///
/// 所有异步回调（事件消费、过期、宽限期）都携带发起时的 `attempt` 编号，
/// 仅当它仍是该孩子的当前尝试时才会修改状态；新尝试开始时旧订阅在持锁期间同步关闭。
/// 不做任何自动重试，唯一的恢复方式是再次调用 [`begin_pairing`](Self::begin_pairing)。
#[derive(Clone)]
pub struct PairingOrchestrator {
    inner: Arc<Inner>,
}

impl PairingOrchestrator {
    pub fn new(
        service: Arc<dyn PairingService>,
        registry: Arc<dyn ChildRegistry>,
        config: PairingConfig,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                registry,
                config,
                slots: DashMap::new(),
                attempts: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// 发起配对
    ///
    /// 请求阶段（trace id + 二维码）进行中再次调用直接忽略；请求阶段结束后再次调用
    /// 会取代当前尝试（关闭旧订阅、撤销旧定时器）。trace id 或二维码请求失败时
    /// 会话进入 `error` 并把错误返回给调用方。
    pub async fn begin_pairing(&self, child_id: &str) -> AppResult<BeginOutcome> {
        let inner = &self.inner;

        let (attempt, expiry_token) = {
            let mut slot = inner.slot_mut(child_id);
            if slot.loading {
                debug!(
                    "Pairing request for child {} already in flight, ignoring",
                    child_id
                );
                return Ok(BeginOutcome::Ignored);
            }

            slot.teardown();
            let attempt = inner.next_attempt();
            let expiry_token = CancellationToken::new();
            slot.session = PairingSession::started(
                child_id,
                attempt,
                inner.config.qr_expiry.as_millis() as i64,
            );
            slot.loading = true;
            slot.attempt_token = Some(CancellationToken::new());
            slot.expiry_token = Some(expiry_token.clone());
            inner.publish(&slot);
            (attempt, expiry_token)
        };
        inner.arm_expiry(child_id, attempt, expiry_token);
        info!(
            "Begin WhatsApp pairing for child {} (attempt {})",
            child_id, attempt
        );

        let trace_id = match inner.service.start_session(child_id).await {
            Ok(trace_id) => trace_id,
            Err(e) => {
                warn!("Failed to obtain trace id for child {}: {}", child_id, e);
                inner.fail_attempt(child_id, attempt, &e);
                return Err(e);
            }
        };

        let traced = inner.update_current(child_id, attempt, |slot| {
            slot.session.trace_id = Some(trace_id.clone());
        });
        if traced.is_none() {
            return Ok(BeginOutcome::Superseded);
        }

        let (subscription, qr) = tokio::join!(
            inner.service.subscribe(&trace_id),
            inner.service.request_qr(child_id)
        );

        match subscription {
            Ok(subscription) => {
                if !inner.attach(child_id, attempt, subscription) {
                    return Ok(BeginOutcome::Superseded);
                }
            }
            Err(e) => {
                warn!("Failed to subscribe to trace {}: {}", trace_id, e);
                inner.fail_attempt(child_id, attempt, &e);
                return Err(e);
            }
        }

        let reused = match qr {
            Ok(QrOutcome::Image(image)) => {
                inner.update_current(child_id, attempt, |slot| {
                    let session = &mut slot.session;
                    if session.qr_image.is_some() {
                        return;
                    }
                    match session.stage {
                        Some(Stage::WaitingQr) => {
                            session.stage = Some(Stage::QrReady);
                            session.qr_image = Some(image);
                        }
                        Some(stage) if stage.holds_qr() => session.qr_image = Some(image),
                        _ => {}
                    }
                });
                false
            }
            Ok(QrOutcome::AlreadyRunning) => {
                info!(
                    "Pairing flow already running for child {}, attaching to trace {}",
                    child_id, trace_id
                );
                events::notify(&inner.events, NoticeLevel::Info, NOTICE_ALREADY_RUNNING);
                true
            }
            Err(e) => {
                warn!("QR request for child {} failed: {}", child_id, e);
                inner.fail_attempt(child_id, attempt, &e);
                return Err(e);
            }
        };

        match inner.update_current(child_id, attempt, |slot| slot.loading = false) {
            Some(()) => Ok(BeginOutcome::Started { trace_id, reused }),
            None => Ok(BeginOutcome::Superseded),
        }
    }

    /// 解除 WhatsApp 配对
    ///
    /// 远程调用失败时不修改任何本地状态；成功后会话回到空闲，
    /// 迟到的 `session_saved` 因尝试编号已变而被丢弃。
    pub async fn unpair(&self, child_id: &str) -> AppResult<()> {
        let inner = &self.inner;

        if let Err(e) = inner.registry.unpair_whatsapp(child_id).await {
            warn!("Failed to unpair WhatsApp for child {}: {}", child_id, e);
            events::notify(&inner.events, NoticeLevel::Error, NOTICE_UNPAIR_FAILED);
            return Err(e);
        }

        {
            let mut slot = inner.slot_mut(child_id);
            slot.teardown();
            slot.loading = false;
            slot.session = PairingSession::idle(child_id, inner.next_attempt());
            inner.registry.set_whatsapp_connected(child_id, false);
            inner.publish(&slot);
        }

        info!("WhatsApp unpaired for child {}", child_id);
        events::notify(&inner.events, NoticeLevel::Success, NOTICE_UNPAIRED);
        Ok(())
    }

    /// 订阅某个孩子的会话快照
    pub fn watch(&self, child_id: &str) -> watch::Receiver<PairingSnapshot> {
        self.inner.slot_mut(child_id).snapshot.subscribe()
    }

    /// 当前快照；从未发起过配对时返回空闲快照
    pub fn snapshot(&self, child_id: &str) -> PairingSnapshot {
        match self.inner.slots.get(child_id) {
            Some(slot) => slot.snapshot.borrow().clone(),
            None => PairingSnapshot::new(&PairingSession::idle(child_id, 0), false),
        }
    }

    /// 离开页面：关闭订阅、撤销定时器并丢弃会话
    pub fn detach(&self, child_id: &str) {
        if let Some((_, mut slot)) = self.inner.slots.remove(child_id) {
            slot.teardown();
            debug!("Detached pairing session for child {}", child_id);
        }
    }

    /// 丢弃所有会话
    pub fn shutdown(&self) {
        let child_ids: Vec<String> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for child_id in child_ids {
            self.detach(&child_id);
        }
    }
}

impl Inner {
    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn slot_mut(&self, child_id: &str) -> RefMut<'_, String, SessionSlot> {
        self.slots
            .entry(child_id.to_string())
            .or_insert_with(|| SessionSlot::new(child_id, self.next_attempt()))
    }

    /// 推送快照（内容未变时不推送）
    fn publish(&self, slot: &SessionSlot) {
        let next = PairingSnapshot::new(&slot.session, slot.loading);
        let changed = slot.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            let _ = self.events.send(AppEvent::PairingStageChanged(next));
        }
    }

    /// 仅当 `attempt` 仍是该孩子的当前尝试时执行修改，随后推送快照
    fn update_current<R>(
        &self,
        child_id: &str,
        attempt: u64,
        f: impl FnOnce(&mut SessionSlot) -> R,
    ) -> Option<R> {
        let mut slot = self.slots.get_mut(child_id)?;
        if slot.session.attempt != attempt {
            return None;
        }
        let out = f(&mut *slot);
        self.publish(&slot);
        Some(out)
    }

    /// 请求阶段失败：已到达终止阶段时只清除 loading
    fn fail_attempt(&self, child_id: &str, attempt: u64, error: &AppError) {
        let failed = self.update_current(child_id, attempt, |slot| {
            slot.loading = false;
            if slot.session.is_terminal() {
                return false;
            }
            slot.fail(error.to_string());
            true
        });
        if failed == Some(true) {
            events::notify(&self.events, NoticeLevel::Error, NOTICE_FAILED);
        }
    }

    fn arm_expiry(self: &Arc<Self>, child_id: &str, attempt: u64, token: CancellationToken) {
        let inner = Arc::clone(self);
        let child_id = child_id.to_string();
        let window = self.config.qr_expiry;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => inner.expire(&child_id, attempt),
            }
        });
    }

    fn expire(&self, child_id: &str, attempt: u64) {
        let expired = self.update_current(child_id, attempt, |slot| {
            let stage = slot.session.stage;
            match stage {
                // 扫码已成功，服务端仍在同步，过期不能覆盖
                Some(Stage::ScanSuccess) => {
                    slot.session.qr_image = None;
                    slot.expiry_token = None;
                    false
                }
                Some(stage) if stage.is_terminal() => false,
                None => false,
                Some(_) => {
                    slot.fail(AppError::PairingExpired.to_string());
                    true
                }
            }
        });

        if expired == Some(true) {
            warn!("Pairing for child {} expired before completion", child_id);
            events::notify(&self.events, NoticeLevel::Error, NOTICE_FAILED);
        }
    }

    /// 登记订阅并启动消费任务；尝试已被取代时关闭订阅并返回 false
    fn attach(self: &Arc<Self>, child_id: &str, attempt: u64, subscription: EventSubscription) -> bool {
        let closer = subscription.closer();
        let attached = self.update_current(child_id, attempt, |slot| {
            if slot.session.is_terminal() {
                return false;
            }
            slot.close_subscription();
            slot.subscription = Some(closer);
            true
        });

        match attached {
            None => {
                subscription.close();
                false
            }
            Some(false) => {
                subscription.close();
                true
            }
            Some(true) => {
                let inner = Arc::clone(self);
                let child_id = child_id.to_string();
                tokio::spawn(async move { inner.consume(child_id, attempt, subscription).await });
                true
            }
        }
    }

    async fn consume(self: Arc<Self>, child_id: String, attempt: u64, mut subscription: EventSubscription) {
        let trace_id = subscription.trace_id().to_string();

        while let Some(item) = subscription.next().await {
            let keep_going = match item {
                Ok(event) => self.handle_event(&child_id, attempt, &trace_id, event).await,
                Err(e) => {
                    self.stream_failed(&child_id, attempt, &e);
                    false
                }
            };
            if !keep_going {
                break;
            }
        }

        if !subscription.is_closed() {
            self.stream_failed(
                &child_id,
                attempt,
                &AppError::Stream("event stream ended".into()),
            );
        }
        subscription.close();
    }

    /// 订阅出错或被服务端结束：关闭订阅，非终止阶段进入 `error`
    fn stream_failed(&self, child_id: &str, attempt: u64, error: &AppError) {
        let failed = self.update_current(child_id, attempt, |slot| {
            slot.close_subscription();
            if slot.session.is_terminal() {
                return false;
            }
            slot.fail(error.to_string());
            true
        });

        if failed == Some(true) {
            warn!("Event stream for child {} failed: {}", child_id, error);
            events::notify(&self.events, NoticeLevel::Error, NOTICE_FAILED);
        }
    }

    /// 处理一条事件，返回 false 表示停止消费
    async fn handle_event(
        self: &Arc<Self>,
        child_id: &str,
        attempt: u64,
        trace_id: &str,
        event: StageEvent,
    ) -> bool {
        if event.trace_id.as_deref().is_some_and(|t| t != trace_id) {
            debug!(
                "Dropping event for trace {:?} on subscription {}",
                event.trace_id, trace_id
            );
            return true;
        }
        let Some(raw) = event.stage.as_deref() else {
            return true;
        };
        let stage = match raw.parse::<Stage>() {
            Ok(stage) => stage,
            Err(e) => {
                warn!("Skipping event on trace {}: {}", trace_id, e);
                return true;
            }
        };
        let qr_path = event.qr_path;

        let effect = self.update_current(child_id, attempt, |slot| {
            if slot.session.trace_id.as_deref() != Some(trace_id) {
                return Effect::Stale;
            }
            if !Stage::can_advance(slot.session.stage, stage) {
                return Effect::Ignored;
            }

            slot.session.stage = Some(stage);
            match stage {
                Stage::QrReady => match (&slot.session.qr_image, qr_path) {
                    (None, Some(path)) => Effect::FetchQr(path),
                    _ => Effect::Advanced,
                },
                Stage::ScanSuccess => {
                    slot.session.qr_image = None;
                    slot.cancel_expiry();
                    Effect::Advanced
                }
                Stage::SessionSaved => {
                    slot.loading = false;
                    slot.cancel_expiry();
                    slot.close_subscription();
                    self.registry.set_whatsapp_connected(child_id, true);
                    Effect::Saved(slot.attempt_token.clone())
                }
                Stage::Error => {
                    slot.fail("pairing service reported an error");
                    Effect::Failed
                }
                Stage::WaitingQr | Stage::WaitingForScan => Effect::Advanced,
            }
        });

        match effect {
            None | Some(Effect::Stale) => {
                debug!(
                    "Dropping stale {} event for child {} on trace {}",
                    stage, child_id, trace_id
                );
                false
            }
            Some(Effect::Ignored) => {
                debug!(
                    "Ignoring out-of-order {} event for child {}",
                    stage, child_id
                );
                true
            }
            Some(Effect::Advanced) => {
                info!("Child {} pairing stage -> {}", child_id, stage);
                true
            }
            Some(Effect::FetchQr(path)) => {
                info!("Child {} pairing stage -> {}, fetching QR", child_id, stage);
                self.fetch_qr(child_id, attempt, trace_id, &path).await;
                true
            }
            Some(Effect::Saved(token)) => {
                info!("WhatsApp paired for child {}", child_id);
                events::notify(&self.events, NoticeLevel::Success, NOTICE_PAIRED);
                if let Some(token) = token {
                    self.arm_grace(child_id, attempt, token);
                }
                false
            }
            Some(Effect::Failed) => {
                warn!("Pairing service reported an error for child {}", child_id);
                events::notify(&self.events, NoticeLevel::Error, NOTICE_FAILED);
                false
            }
        }
    }

    /// 事件只给出 `qr_path` 时补拉二维码；失败只记录日志
    async fn fetch_qr(&self, child_id: &str, attempt: u64, trace_id: &str, path: &str) {
        match self.service.fetch_qr(path).await {
            Ok(image) => {
                self.update_current(child_id, attempt, |slot| {
                    let session = &mut slot.session;
                    let holds_qr = session.stage.is_some_and(|s| s.holds_qr());
                    if session.trace_id.as_deref() == Some(trace_id)
                        && session.qr_image.is_none()
                        && holds_qr
                    {
                        session.qr_image = Some(image);
                    }
                });
            }
            Err(e) => warn!("Failed to fetch QR for child {}: {}", child_id, e),
        }
    }

    /// session_saved 后保留二维码一小段时间再清除
    fn arm_grace(self: &Arc<Self>, child_id: &str, attempt: u64, token: CancellationToken) {
        let inner = Arc::clone(self);
        let child_id = child_id.to_string();
        let grace = self.config.success_grace;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    inner.update_current(&child_id, attempt, |slot| slot.session.qr_image = None);
                }
            }
        });
    }
}
