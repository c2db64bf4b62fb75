//! 订阅取消句柄

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type CloseFn = Box<dyn FnOnce() + Send>;

/// `listen` 返回的取消句柄
///
/// 取消动作最多执行一次，重复调用 `close` 是安全的空操作。
/// 克隆出的句柄共享同一个取消动作。
#[derive(Clone)]
pub struct Close {
    action: Arc<Mutex<Option<CloseFn>>>,
}

impl Close {
    /// 包装一个取消动作
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Arc::new(Mutex::new(Some(Box::new(action)))),
        }
    }

    /// 不做任何事的句柄（未连接或订阅失败时返回）
    pub fn noop() -> Self {
        Self {
            action: Arc::new(Mutex::new(None)),
        }
    }

    /// 请求取消订阅
    pub fn close(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    /// 取消动作是否已经执行（或本来就没有）
    pub fn is_closed(&self) -> bool {
        self.action.lock().is_none()
    }
}

impl Default for Close {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Close {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Close")
            .field("closed", &self.is_closed())
            .finish()
    }
}
