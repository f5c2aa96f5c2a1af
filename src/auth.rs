//! 凭证提供
//!
//! 访问令牌可能被刷新流程随时替换，因此 HTTP 客户端在每次请求时
//! 通过 [`CredentialProvider`] 读取当前令牌，而不是在构造时捕获。

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub trait CredentialProvider: Send + Sync {
    /// 当前 bearer 令牌，未登录时为 `None`
    fn bearer_token(&self) -> Option<String>;
}

/// 固定令牌
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// 可被外部刷新的共享令牌
#[derive(Debug, Clone, Default)]
pub struct SharedToken(Arc<RwLock<Option<String>>>);

impl SharedToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.write() = Some(token.into());
    }

    pub fn clear(&self) {
        self.write().take();
    }

    // 持锁线程 panic 后接管锁并清除中毒标记
    fn write(&self) -> RwLockWriteGuard<'_, Option<String>> {
        self.0.write().unwrap_or_else(|poisoned| {
            warn!("Credential lock poisoned, recovering");
            self.0.clear_poison();
            poisoned.into_inner()
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<String>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialProvider for SharedToken {
    fn bearer_token(&self) -> Option<String> {
        self.read().clone()
    }
}
