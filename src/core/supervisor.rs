//! 会话监管：每个会话至多一个进行中的编辑请求，以及请求级取消
//!
//! begin() 返回 EditGuard；guard 析构时释放会话并发出“已结束”信号。
//! cancel() 触发取消令牌后等待 guard 析构，也就是等子进程、沙箱与工作目录都清理完毕再返回。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::core::EditError;

#[derive(Debug, Clone)]
struct ActiveEdit {
    request_id: String,
    cancel: CancellationToken,
    finished: CancellationToken,
}

#[derive(Debug, Default)]
pub struct EditSupervisor {
    active: Arc<Mutex<HashMap<String, ActiveEdit>>>,
}

/// 进行中的编辑请求；持有期间同一会话的其他请求被拒绝
#[derive(Debug)]
pub struct EditGuard {
    session: String,
    edit: ActiveEdit,
    active: Arc<Mutex<HashMap<String, ActiveEdit>>>,
}

impl EditGuard {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.edit.cancel
    }

    pub fn request_id(&self) -> &str {
        &self.edit.request_id
    }
}

impl Drop for EditGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.session);
        self.edit.finished.cancel();
    }
}

fn lock(map: &Mutex<HashMap<String, ActiveEdit>>) -> MutexGuard<'_, HashMap<String, ActiveEdit>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EditSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 占用会话；已有进行中的请求时返回 SessionBusy
    pub fn begin(&self, session: &str, request_id: &str) -> Result<EditGuard, EditError> {
        let mut active = lock(&self.active);
        if let Some(running) = active.get(session) {
            tracing::warn!(session, running = %running.request_id, "edit rejected: session busy");
            return Err(EditError::SessionBusy(session.to_string()));
        }
        let edit = ActiveEdit {
            request_id: request_id.to_string(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        active.insert(session.to_string(), edit.clone());
        Ok(EditGuard {
            session: session.to_string(),
            edit,
            active: self.active.clone(),
        })
    }

    pub fn is_busy(&self, session: &str) -> bool {
        lock(&self.active).contains_key(session)
    }

    /// 取消会话中进行中的请求并等待其清理完毕；没有进行中的请求时返回 false
    pub async fn cancel(&self, session: &str) -> bool {
        let edit = lock(&self.active).get(session).cloned();
        match edit {
            Some(edit) => {
                tracing::info!(session, request = %edit.request_id, "cancelling edit");
                edit.cancel.cancel();
                edit.finished.cancelled().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_edit_is_rejected_until_first_ends() {
        let sup = EditSupervisor::new();
        let guard = sup.begin("s1", "r1").unwrap();
        assert!(matches!(sup.begin("s1", "r2"), Err(EditError::SessionBusy(_))));
        // 其他会话不受影响
        let other = sup.begin("s2", "r3").unwrap();
        drop(other);
        drop(guard);
        assert!(!sup.is_busy("s1"));
        assert!(sup.begin("s1", "r4").is_ok());
    }

    #[tokio::test]
    async fn test_cancel_waits_for_guard_release() {
        let sup = Arc::new(EditSupervisor::new());
        let guard = sup.begin("s1", "r1").unwrap();
        let token = guard.cancel_token().clone();

        let worker = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(sup.cancel("s1").await);
        assert!(!sup.is_busy("s1"));
        worker.await.unwrap();
        assert!(!sup.cancel("s1").await);
    }
}
