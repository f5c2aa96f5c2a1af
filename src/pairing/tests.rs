//! 配对编排器测试
//!
//! 使用内存中的配对服务与孩子注册表，时钟暂停以便精确控制过期与宽限期。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use super::*;
use crate::config::PairingConfig;
use crate::events::{self, AppEvent, NoticeLevel};
use crate::protocol::StageEvent;
use crate::{AppError, AppResult};

#[derive(Clone, Copy)]
enum QrBehavior {
    Image,
    AlreadyRunning,
    Fail,
}

struct MockService {
    feeds: Mutex<Vec<EventFeed>>,
    issued: AtomicUsize,
    subscribe_calls: AtomicUsize,
    fail_trace_id: AtomicBool,
    qr: Mutex<QrBehavior>,
    gate: Mutex<Option<Arc<Notify>>>,
    fetched: Mutex<Vec<String>>,
}

impl MockService {
    fn new() -> Self {
        Self {
            feeds: Mutex::new(Vec::new()),
            issued: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            fail_trace_id: AtomicBool::new(false),
            qr: Mutex::new(QrBehavior::Image),
            gate: Mutex::new(None),
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn set_qr(&self, behavior: QrBehavior) {
        *self.qr.lock().unwrap() = behavior;
    }

    fn feed_closed(&self, index: usize) -> bool {
        self.feeds.lock().unwrap()[index].is_closed()
    }

    fn open_feeds(&self) -> usize {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .filter(|f| !f.is_closed())
            .count()
    }

    /// 向第 `index` 个订阅投递一项，返回是否送达
    async fn push(&self, index: usize, item: AppResult<StageEvent>) -> bool {
        let feed = {
            let mut feeds = self.feeds.lock().unwrap();
            // 临时取出，避免跨 await 持有锁
            std::mem::replace(&mut feeds[index], EventSubscription::channel("", 1).0)
        };
        let delivered = feed.send(item).await;
        self.feeds.lock().unwrap()[index] = feed;
        delivered
    }

    async fn emit(&self, index: usize, stage: &str) -> bool {
        self.push(index, Ok(stage_event(stage, None, None))).await
    }
}

#[async_trait]
impl PairingService for MockService {
    async fn start_session(&self, _child_id: &str) -> AppResult<String> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_trace_id.load(Ordering::SeqCst) {
            return Err(AppError::Request {
                status: 503,
                message: "scraper unavailable".into(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("t{n}"))
    }

    async fn request_qr(&self, _child_id: &str) -> AppResult<QrOutcome> {
        let behavior = *self.qr.lock().unwrap();
        match behavior {
            QrBehavior::Image => Ok(QrOutcome::Image(QrImage::png(vec![1u8, 2, 3]))),
            QrBehavior::AlreadyRunning => Ok(QrOutcome::AlreadyRunning),
            QrBehavior::Fail => Err(AppError::Request {
                status: 500,
                message: "boom".into(),
            }),
        }
    }

    async fn subscribe(&self, trace_id: &str) -> AppResult<EventSubscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (feed, subscription) = EventSubscription::channel(trace_id, 16);
        self.feeds.lock().unwrap().push(feed);
        Ok(subscription)
    }

    async fn fetch_qr(&self, qr_path: &str) -> AppResult<QrImage> {
        self.fetched.lock().unwrap().push(qr_path.to_string());
        Ok(QrImage::png(vec![9u8, 9]))
    }
}

#[derive(Default)]
struct MockRegistry {
    connected: Mutex<HashMap<String, bool>>,
    fail_unpair: AtomicBool,
    unpair_calls: AtomicUsize,
}

impl MockRegistry {
    fn connected(&self, child_id: &str) -> Option<bool> {
        self.connected.lock().unwrap().get(child_id).copied()
    }
}

#[async_trait]
impl ChildRegistry for MockRegistry {
    fn set_whatsapp_connected(&self, child_id: &str, connected: bool) {
        self.connected
            .lock()
            .unwrap()
            .insert(child_id.to_string(), connected);
    }

    async fn unpair_whatsapp(&self, _child_id: &str) -> AppResult<()> {
        self.unpair_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unpair.load(Ordering::SeqCst) {
            return Err(AppError::Request {
                status: 500,
                message: "unpair failed".into(),
            });
        }
        Ok(())
    }
}

struct Harness {
    orchestrator: PairingOrchestrator,
    service: Arc<MockService>,
    registry: Arc<MockRegistry>,
    events: broadcast::Receiver<AppEvent>,
}

impl Harness {
    fn new() -> Self {
        let service = Arc::new(MockService::new());
        let registry = Arc::new(MockRegistry::default());
        let sender = events::channel();
        let events = sender.subscribe();
        let orchestrator = PairingOrchestrator::new(
            service.clone(),
            registry.clone(),
            PairingConfig::default(),
            sender,
        );
        Self {
            orchestrator,
            service,
            registry,
            events,
        }
    }

    fn stage(&self, child_id: &str) -> Option<Stage> {
        self.orchestrator.snapshot(child_id).stage
    }

    fn notices(&mut self) -> Vec<(NoticeLevel, String)> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let AppEvent::Notice(notice) = event {
                out.push((notice.level, notice.message));
            }
        }
        out
    }
}

fn stage_event(stage: &str, qr_path: Option<&str>, trace_id: Option<&str>) -> StageEvent {
    StageEvent {
        stage: Some(stage.to_string()),
        qr_path: qr_path.map(str::to_string),
        trace_id: trace_id.map(str::to_string),
    }
}

/// 让所有就绪任务运行完
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_begin_pairing_shows_qr() {
    let h = Harness::new();

    let outcome = h.orchestrator.begin_pairing("c1").await.unwrap();
    assert_eq!(
        outcome,
        BeginOutcome::Started {
            trace_id: "t1".into(),
            reused: false
        }
    );

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::QrReady));
    assert_eq!(snapshot.trace_id.as_deref(), Some("t1"));
    assert!(snapshot.qr_image.is_some());
    assert!(!snapshot.loading);
    assert!(snapshot.expires_at.is_some());
    assert_eq!(h.service.subscribe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_begin_is_ignored_while_loading() {
    let h = Harness::new();
    let gate = Arc::new(Notify::new());
    *h.service.gate.lock().unwrap() = Some(gate.clone());

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.begin_pairing("c1").await });
    settle().await;

    let snapshot = h.orchestrator.snapshot("c1");
    assert!(snapshot.loading);
    assert_eq!(snapshot.stage, Some(Stage::WaitingQr));
    assert_eq!(snapshot.status_text, Some("Preparing QR…"));

    let second = h.orchestrator.begin_pairing("c1").await.unwrap();
    assert_eq!(second, BeginOutcome::Ignored);

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, BeginOutcome::Started { .. }));
    assert_eq!(h.service.subscribe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_closes_previous_subscription() {
    let h = Harness::new();

    h.orchestrator.begin_pairing("c1").await.unwrap();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    assert!(h.service.feed_closed(0));
    assert!(!h.service.feed_closed(1));
    assert_eq!(h.service.open_feeds(), 1);
    assert_eq!(
        h.orchestrator.snapshot("c1").trace_id.as_deref(),
        Some("t2")
    );

    // 旧订阅已关闭，迟到事件无法送达
    assert!(!h.service.emit(0, "session_saved").await);
    settle().await;
    assert_eq!(h.stage("c1"), Some(Stage::QrReady));
    assert_eq!(h.registry.connected("c1"), None);
}

#[tokio::test(start_paused = true)]
async fn test_event_for_foreign_trace_is_dropped() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    let event = stage_event("session_saved", None, Some("t-other"));
    assert!(h.service.push(0, Ok(event)).await);
    settle().await;

    assert_eq!(h.stage("c1"), Some(Stage::QrReady));
    assert_eq!(h.registry.connected("c1"), None);
    assert!(!h.service.feed_closed(0));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_events_are_ignored() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    h.service.emit(0, "waiting_for_scan").await;
    h.service.emit(0, "qr_ready").await;
    h.service.emit(0, "waiting_qr").await;
    h.service.emit(0, "no_such_stage").await;
    settle().await;

    assert_eq!(h.stage("c1"), Some(Stage::WaitingForScan));
    assert!(h.orchestrator.snapshot("c1").qr_image.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_qr_ready_does_not_refetch() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    let event = stage_event("qr_ready", Some("/qr/t1.png"), None);
    h.service.push(0, Ok(event)).await;
    settle().await;

    assert!(h.service.fetched.lock().unwrap().is_empty());
    assert_eq!(
        h.orchestrator.snapshot("c1").qr_image.unwrap().bytes(),
        &[1u8, 2, 3]
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_saved_marks_connected_and_clears_qr_after_grace() {
    let mut h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();
    h.notices();

    h.service.emit(0, "waiting_for_scan").await;
    h.service.emit(0, "session_saved").await;
    settle().await;

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::SessionSaved));
    assert_eq!(snapshot.status_text, Some("All set!"));
    assert!(!snapshot.loading);
    assert!(snapshot.qr_image.is_some());
    assert_eq!(h.registry.connected("c1"), Some(true));
    assert!(h.service.feed_closed(0));
    assert_eq!(
        h.notices(),
        vec![(NoticeLevel::Success, "WhatsApp paired successfully!".to_string())]
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::SessionSaved));
    assert!(snapshot.qr_image.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_error_event_clears_qr() {
    let mut h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();
    h.notices();

    h.service.emit(0, "error").await;
    settle().await;

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::Error));
    assert!(snapshot.qr_image.is_none());
    assert!(snapshot.failure.is_some());
    assert_eq!(h.registry.connected("c1"), None);
    assert!(h.service.feed_closed(0));
    assert_eq!(
        h.notices(),
        vec![(
            NoticeLevel::Error,
            "Something went wrong during WhatsApp pairing".to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn test_expiry_moves_to_error() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    tokio::time::sleep(Duration::from_secs(119)).await;
    assert_eq!(h.stage("c1"), Some(Stage::QrReady));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::Error));
    assert!(snapshot.qr_image.is_none());
    assert_eq!(
        snapshot.failure.as_deref(),
        Some(AppError::PairingExpired.to_string().as_str())
    );
    assert!(h.service.feed_closed(0));
}

#[tokio::test(start_paused = true)]
async fn test_expiry_while_waiting_for_qr() {
    let h = Harness::new();
    h.service.set_qr(QrBehavior::AlreadyRunning);
    h.orchestrator.begin_pairing("c1").await.unwrap();
    assert_eq!(h.stage("c1"), Some(Stage::WaitingQr));

    tokio::time::sleep(Duration::from_secs(121)).await;
    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::Error));
    assert_eq!(
        snapshot.failure.as_deref(),
        Some(AppError::PairingExpired.to_string().as_str())
    );
    assert!(h.service.feed_closed(0));
}

#[tokio::test(start_paused = true)]
async fn test_expiry_while_waiting_for_scan() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    h.service.emit(0, "waiting_for_scan").await;
    settle().await;
    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::WaitingForScan));
    assert!(snapshot.qr_image.is_some());

    tokio::time::sleep(Duration::from_secs(121)).await;
    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::Error));
    assert!(snapshot.qr_image.is_none());
    assert!(h.service.feed_closed(0));
}

#[tokio::test(start_paused = true)]
async fn test_expiry_after_scan_success_is_ignored() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    h.service.emit(0, "scan_success").await;
    settle().await;
    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::ScanSuccess));
    assert!(snapshot.qr_image.is_none());

    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(h.stage("c1"), Some(Stage::ScanSuccess));

    h.service.emit(0, "session_saved").await;
    settle().await;
    assert_eq!(h.stage("c1"), Some(Stage::SessionSaved));
    assert_eq!(h.registry.connected("c1"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_full_pairing_flow() {
    let mut h = Harness::new();
    let mut watcher = h.orchestrator.watch("c1");

    h.orchestrator.begin_pairing("c1").await.unwrap();
    assert_eq!(watcher.borrow_and_update().stage, Some(Stage::QrReady));

    for stage in ["qr_ready", "waiting_for_scan", "scan_success", "session_saved"] {
        h.service.emit(0, stage).await;
    }
    settle().await;

    let snapshot = watcher.borrow_and_update().clone();
    assert_eq!(snapshot.stage, Some(Stage::SessionSaved));
    assert_eq!(snapshot.trace_id.as_deref(), Some("t1"));
    assert_eq!(h.registry.connected("c1"), Some(true));

    let stages: Vec<Option<Stage>> = std::iter::from_fn(|| h.events.try_recv().ok())
        .filter_map(|event| match event {
            AppEvent::PairingStageChanged(s) => Some(s.stage),
            _ => None,
        })
        .collect();
    let mut distinct = stages.clone();
    distinct.dedup();
    assert_eq!(
        distinct,
        vec![
            Some(Stage::WaitingQr),
            Some(Stage::QrReady),
            Some(Stage::WaitingForScan),
            Some(Stage::ScanSuccess),
            Some(Stage::SessionSaved),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_qr_ready_then_session_saved() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    h.service.emit(0, "qr_ready").await;
    h.service.emit(0, "session_saved").await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::SessionSaved));
    assert!(snapshot.qr_image.is_none());
    assert_eq!(h.registry.connected("c1"), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_already_running_attaches_to_stream() {
    let mut h = Harness::new();
    h.service.set_qr(QrBehavior::AlreadyRunning);

    let outcome = h.orchestrator.begin_pairing("c1").await.unwrap();
    assert_eq!(
        outcome,
        BeginOutcome::Started {
            trace_id: "t1".into(),
            reused: true
        }
    );
    assert_eq!(h.stage("c1"), Some(Stage::WaitingQr));
    assert!(h.notices().contains(&(
        NoticeLevel::Info,
        "Pairing already in progress — attaching to current session.".to_string()
    )));

    let event = stage_event("qr_ready", Some("/qr/t1.png"), Some("t1"));
    h.service.push(0, Ok(event)).await;
    settle().await;

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::QrReady));
    assert_eq!(snapshot.qr_image.unwrap().bytes(), &[9u8, 9]);
    assert_eq!(*h.service.fetched.lock().unwrap(), vec!["/qr/t1.png".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_trace_id_failure_does_not_subscribe() {
    let h = Harness::new();
    h.service.fail_trace_id.store(true, Ordering::SeqCst);

    let err = h.orchestrator.begin_pairing("c1").await.unwrap_err();
    assert!(matches!(err, AppError::Request { status: 503, .. }));

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::Error));
    assert!(!snapshot.loading);
    assert_eq!(h.service.subscribe_calls.load(Ordering::SeqCst), 0);

    // 失败后可以重新发起
    h.service.fail_trace_id.store(false, Ordering::SeqCst);
    h.orchestrator.begin_pairing("c1").await.unwrap();
    assert_eq!(h.stage("c1"), Some(Stage::QrReady));
}

#[tokio::test(start_paused = true)]
async fn test_qr_request_failure_moves_to_error() {
    let h = Harness::new();
    h.service.set_qr(QrBehavior::Fail);

    assert!(h.orchestrator.begin_pairing("c1").await.is_err());
    assert_eq!(h.stage("c1"), Some(Stage::Error));
    assert!(h.service.feed_closed(0));
}

#[tokio::test(start_paused = true)]
async fn test_stream_error_moves_to_error() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    h.service
        .push(0, Err(AppError::Stream("connection reset".into())))
        .await;
    settle().await;

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, Some(Stage::Error));
    assert!(snapshot.qr_image.is_none());
    assert!(h.service.feed_closed(0));
}

#[tokio::test(start_paused = true)]
async fn test_stream_end_before_terminal_moves_to_error() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    h.service.feeds.lock().unwrap().clear();
    settle().await;

    assert_eq!(h.stage("c1"), Some(Stage::Error));
}

#[tokio::test(start_paused = true)]
async fn test_unpair_resets_session() {
    let mut h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();
    h.service.emit(0, "session_saved").await;
    settle().await;
    assert_eq!(h.registry.connected("c1"), Some(true));
    h.notices();

    h.orchestrator.unpair("c1").await.unwrap();

    let snapshot = h.orchestrator.snapshot("c1");
    assert_eq!(snapshot.stage, None);
    assert!(snapshot.qr_image.is_none());
    assert!(snapshot.trace_id.is_none());
    assert_eq!(h.registry.connected("c1"), Some(false));
    assert_eq!(
        h.notices(),
        vec![(NoticeLevel::Success, "WhatsApp unpaired successfully".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unpair_failure_keeps_state() {
    let mut h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();
    h.service.emit(0, "session_saved").await;
    settle().await;
    h.notices();

    h.registry.fail_unpair.store(true, Ordering::SeqCst);
    assert!(h.orchestrator.unpair("c1").await.is_err());

    assert_eq!(h.stage("c1"), Some(Stage::SessionSaved));
    assert_eq!(h.registry.connected("c1"), Some(true));
    assert_eq!(
        h.notices(),
        vec![(NoticeLevel::Error, "Failed to unpair WhatsApp".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unpair_wins_over_late_session_saved() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();

    // session_saved 已进入缓冲区但尚未被消费
    assert!(h.service.emit(0, "session_saved").await);
    h.orchestrator.unpair("c1").await.unwrap();
    settle().await;

    assert_eq!(h.stage("c1"), None);
    assert_eq!(h.registry.connected("c1"), Some(false));
    assert!(h.service.feed_closed(0));
    assert_eq!(h.registry.unpair_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_detach_closes_subscription() {
    let h = Harness::new();
    h.orchestrator.begin_pairing("c1").await.unwrap();
    h.orchestrator.begin_pairing("c2").await.unwrap();

    h.orchestrator.detach("c1");
    assert!(h.service.feed_closed(0));
    assert!(!h.service.feed_closed(1));
    assert_eq!(h.stage("c1"), None);

    // 过期定时器随会话一起撤销
    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(h.stage("c1"), None);

    h.orchestrator.shutdown();
    assert_eq!(h.service.open_feeds(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_detach_during_request_supersedes() {
    let h = Harness::new();
    let gate = Arc::new(Notify::new());
    *h.service.gate.lock().unwrap() = Some(gate.clone());

    let orchestrator = h.orchestrator.clone();
    let pending = tokio::spawn(async move { orchestrator.begin_pairing("c1").await });
    settle().await;

    h.orchestrator.detach("c1");
    gate.notify_one();

    assert_eq!(pending.await.unwrap().unwrap(), BeginOutcome::Superseded);
    assert_eq!(h.service.subscribe_calls.load(Ordering::SeqCst), 0);
}
