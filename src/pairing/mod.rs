//! 配对模块
//!
//! 管理 WhatsApp 配对流程：申请 trace id、请求二维码、订阅实时阶段事件、
//! 过期与解除配对。核心逻辑在 [`PairingOrchestrator`](manager::PairingOrchestrator)。

pub mod manager;
mod qr;
pub mod service;
pub mod session;
pub mod stage;
pub mod stream;

#[cfg(test)]
mod tests;

pub use manager::{BeginOutcome, PairingOrchestrator};
pub use qr::{QrImage, QrOutcome};
pub use service::{ChildRegistry, PairingService};
pub use session::{PairingSession, PairingSnapshot};
pub use stage::{status_text, Stage};
pub use stream::{EventFeed, EventSubscription};
