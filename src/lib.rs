pub mod app;
pub mod auth;
pub mod child;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pairing;
pub mod protocol;
pub use error::{AppError, AppResult};

pub use app::Dashboard;
pub use auth::{CredentialProvider, SharedToken, StaticToken};
pub use child::{ChildData, ChildManager, Gender, NewChild};
pub use config::{PairingConfig, ServiceConfig};
pub use events::{AppEvent, Notice, NoticeLevel};
pub use pairing::{BeginOutcome, PairingOrchestrator, PairingSnapshot, Stage};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志；`RUST_LOG` 未设置时默认输出本 crate 的 debug 日志
///
/// 重复调用时保留第一次安装的 subscriber。
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("xoul_guardian=debug")),
        )
        .try_init();
}
