//! 实时同步模块
//!
//! 每个缓存至多一个变更流订阅。后台任务只持有缓存的弱引用，
//! 缓存被释放或取消订阅时任务随之结束。

use super::{EntityCache, Subscription};
use crate::data::Result;
use crate::models::{ChangeEvent, ChangeKind};
use crate::services::backend::ChangeFeed;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

impl EntityCache {
    /// 订阅本表的 INSERT/UPDATE/DELETE 变更
    ///
    /// 已订阅时只记录警告。打开变更流失败时返回后端错误，订阅状态不变。
    pub async fn subscribe(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.realtime.lock().await;

        if self.subscribed.load(Ordering::SeqCst) {
            tracing::warn!(table = %self.table, "已订阅，忽略重复订阅");
            return Ok(());
        }

        // 变更流自行关闭后遗留的任务
        if let Some(stale) = slot.take() {
            stale.cancel.cancel();
        }

        let feed = self.backend.subscribe(&self.table).await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_feed(
            Arc::downgrade(self),
            self.table.clone(),
            feed,
            cancel.clone(),
            Arc::clone(&self.subscribed),
        ));

        *slot = Some(Subscription { cancel, task });
        self.subscribed.store(true, Ordering::SeqCst);

        tracing::info!(table = %self.table, schema = %self.config.realtime_schema, "已订阅实时变更");
        Ok(())
    }

    /// 取消订阅
    ///
    /// 未订阅时只记录警告。返回时后台任务已经停止，不会再有变更写入缓存。
    pub async fn unsubscribe(&self) {
        let mut slot = self.realtime.lock().await;

        if !self.subscribed.load(Ordering::SeqCst) {
            tracing::warn!(table = %self.table, "未订阅，忽略取消订阅");
            return;
        }

        if let Some(subscription) = slot.take() {
            subscription.cancel.cancel();
            if let Err(e) = subscription.task.await {
                tracing::warn!(table = %self.table, error = %e, "实时任务异常结束");
            }
        }
        self.subscribed.store(false, Ordering::SeqCst);

        tracing::info!(table = %self.table, "已取消实时订阅");
    }

    /// 应用一条变更事件
    ///
    /// - DELETE：按 `old` 中的主键直接移除，不经过归一化
    /// - INSERT/UPDATE：归一化 `new`
    pub fn apply_change(&self, event: ChangeEvent) -> Result<()> {
        if event.schema != self.config.realtime_schema {
            tracing::trace!(table = %self.table, schema = %event.schema, "忽略其他 schema 的变更");
            return Ok(());
        }

        match event.event_type {
            ChangeKind::Delete => match event.old_id(&self.config.id_field) {
                Some(id) => {
                    self.remove(id);
                }
                None => {
                    tracing::warn!(table = %self.table, "DELETE 事件缺少主键，已忽略");
                }
            },
            ChangeKind::Insert | ChangeKind::Update => {
                self.add(vec![event.new])?;
            }
        }
        Ok(())
    }
}

async fn run_feed(
    cache: Weak<EntityCache>,
    table: String,
    mut feed: ChangeFeed,
    cancel: CancellationToken,
    subscribed: Arc<AtomicBool>,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => None,
            event = feed.recv() => Some(event),
        };

        let Some(event) = received else {
            feed.close();
            tracing::debug!(table = %table, "实时任务已停止");
            return;
        };

        let Some(event) = event else {
            tracing::warn!(table = %table, "变更流已关闭");
            subscribed.store(false, Ordering::SeqCst);
            return;
        };

        let Some(cache) = cache.upgrade() else {
            feed.close();
            return;
        };

        tracing::trace!(table = %table, kind = ?event.event_type, "收到实时变更");
        if let Err(e) = cache.apply_change(event) {
            tracing::warn!(table = %table, error = %e, "应用实时变更失败");
        }
    }
}
