use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

use tokio::runtime::{self, Handle};
use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, trace};

use crate::cache::Cache;
use crate::config::Config;
use crate::{Error, Result};

/// 带过期时间的键值存储。
///
/// 每个条目在最近一次 `set` 之后经过 TTL 即被移除。`Db` 可以廉价地克隆，
/// 所有克隆共享同一份状态；最后一个克隆被销毁时，后台清理任务随之退出。
#[derive(Debug)]
pub struct Db<T> {
    // 包装在 DbDropGuard 中，以便最后一个句柄销毁时通知后台任务
    holder: Arc<DbDropGuard<T>>,
}

// 持有共享状态；被销毁时关闭后台任务
#[derive(Debug)]
struct DbDropGuard<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    state: RwLock<State<T>>,
    background_task: Notify,
    ttl: Duration,
}

#[derive(Debug)]
struct State<T> {
    entries: HashMap<String, Entry<T>>,

    // 按 (过期时间, 条目 id) 排序的待执行过期动作
    expirations: BTreeMap<(Instant, u64), String>,

    next_id: u64,

    shutdown: bool,
}

#[derive(Debug)]
struct Entry<T> {
    // 条目版本，每次 set 递增
    id: u64,
    data: T,
    expires_at: Instant,
}

impl<T> Shared<T> {
    fn read(&self) -> RwLockReadGuard<'_, State<T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<T>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 清除所有已过期的条目，返回下一个过期时间。
    fn purge_expired_keys(&self) -> Option<Instant> {
        let mut state = self.write();

        if state.shutdown {
            return None;
        }

        // 拿到 &mut State，才能同时借用 entries 和 expirations
        let state = &mut *state;

        let now = Instant::now();
        let mut purged = 0usize;

        while let Some((&(when, id), key)) = state.expirations.iter().next() {
            if when > now {
                trace!(purged, "purged expired keys");
                return Some(when);
            }

            // 只删除该过期动作所对应的版本
            if state.entries.get(key).is_some_and(|entry| entry.id == id) {
                state.entries.remove(key);
                purged += 1;
            }
            state.expirations.remove(&(when, id));
        }

        trace!(purged, "purged expired keys");
        None
    }

    fn is_shutdown(&self) -> bool {
        self.read().shutdown
    }
}

// TTL 过大导致溢出时使用的过期时间，约 30 年
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

// 计算从现在起经过 ttl 的过期时间，溢出时截断到遥远的未来
fn deadline(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

impl<T> State<T> {
    fn next_expiration(&self) -> Option<Instant> {
        self.expirations.keys().next().map(|expiration| expiration.0)
    }
}

impl<T> Db<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 使用默认 TTL 创建一个空的存储。
    pub fn new() -> Db<T> {
        Db::with_config(Config::default())
    }

    /// 使用给定配置创建存储。
    ///
    /// 在 tokio 运行时中调用时，后台任务运行在当前运行时上；
    /// 否则启动一个专用线程，在单线程运行时上执行后台任务。
    pub fn with_config(config: Config) -> Db<T> {
        match Handle::try_current() {
            Ok(handle) => Db::with_handle(config, &handle),
            Err(_) => {
                let shared = Db::new_shared(config);
                spawn_purge_thread(shared.clone());
                Db::from_shared(shared)
            }
        }
    }

    /// 使用给定配置创建存储，后台任务运行在 `handle` 所指的运行时上。
    pub fn with_handle(config: Config, handle: &Handle) -> Db<T> {
        let shared = Db::new_shared(config);
        handle.spawn(purge_expired_tasks(shared.clone()));
        Db::from_shared(shared)
    }

    fn new_shared(config: Config) -> Arc<Shared<T>> {
        Arc::new(Shared {
            state: RwLock::new(State {
                entries: HashMap::new(),
                expirations: BTreeMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            background_task: Notify::new(),
            ttl: config.ttl,
        })
    }

    fn from_shared(shared: Arc<Shared<T>>) -> Db<T> {
        debug!(ttl = ?shared.ttl, "created expiring store");

        Db {
            holder: Arc::new(DbDropGuard { shared }),
        }
    }

    /// 获取指定键的值。
    ///
    /// 不会刷新 TTL。键不存在或已过期时返回 [`Error::NotFound`]。
    pub fn get(&self, key: &str) -> Result<T> {
        let state = self.shared().read();

        // 已过期但尚未被后台任务清除的条目同样视为不存在
        match state.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.data.clone()),
            _ => Err(Error::NotFound),
        }
    }

    /// 设置指定键的值，并从此刻起重新计算 TTL。
    ///
    /// 覆盖已有条目时，旧条目的过期动作会在同一次加锁内被取消。
    pub fn set(&self, key: String, value: T) -> Result<()> {
        let shared = self.shared();
        // 获取写锁
        let mut state = shared.write();

        // 为新条目分配版本 id
        let id = state.next_id;
        state.next_id += 1;

        // 计算过期时间
        let when = deadline(shared.ttl);

        // 新的过期时间早于所有已有的过期时间时，需要唤醒后台任务
        let notify = state
            .next_expiration()
            .map(|expiration| expiration > when)
            .unwrap_or(true);

        // 登记新条目的过期动作
        state.expirations.insert((when, id), key.clone());

        // 插入或覆盖条目
        let prev = state.entries.insert(
            key,
            Entry {
                id,
                data: value,
                expires_at: when,
            },
        );

        // 取消被覆盖条目的过期动作
        if let Some(prev) = prev {
            state.expirations.remove(&(prev.expires_at, prev.id));
        }

        // 通知后台任务之前先释放锁
        drop(state);

        if notify {
            shared.background_task.notify_one();
        }

        Ok(())
    }

    /// 移除指定键并取消其过期动作，返回被移除的值。
    pub fn remove(&self, key: &str) -> Result<T> {
        let mut state = self.shared().write();

        let entry = state.entries.remove(key).ok_or(Error::NotFound)?;
        state.expirations.remove(&(entry.expires_at, entry.id));

        if entry.expires_at > Instant::now() {
            Ok(entry.data)
        } else {
            Err(Error::NotFound)
        }
    }

    /// 当前持有的条目数，包括已过期但尚未清除的条目。
    pub fn len(&self) -> usize {
        self.shared().read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.shared().ttl
    }

    fn shared(&self) -> &Shared<T> {
        &self.holder.shared
    }
}

impl<T> Default for Db<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Db<T> {
        Db::new()
    }
}

impl<T> Clone for Db<T> {
    fn clone(&self) -> Db<T> {
        Db {
            holder: self.holder.clone(),
        }
    }
}

impl<T> Cache<T> for Db<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn set(&self, key: String, value: T) -> Result<()> {
        Db::set(self, key, value)
    }

    fn get(&self, key: &str) -> Result<T> {
        Db::get(self, key)
    }
}

impl<T> Drop for DbDropGuard<T> {
    fn drop(&mut self) {
        // 最后一个 Db 句柄已销毁，通知后台任务退出
        let mut state = self.shared.write();
        state.shutdown = true;
        drop(state);

        self.shared.background_task.notify_one();
    }
}

/// 后台任务：在最近的过期时间到达时清除过期条目，直到存储关闭。
async fn purge_expired_tasks<T>(shared: Arc<Shared<T>>) {
    // 只要存储未关闭，就一直循环执行清除
    while !shared.is_shutdown() {
        // 清除已过期的条目，并取得下一个过期时间
        if let Some(when) = shared.purge_expired_keys() {
            // 等待到下一个过期时间，或被 set / drop 提前唤醒
            tokio::select! {
                _ = time::sleep_until(when) => {}
                _ = shared.background_task.notified() => {}
            }
        } else {
            // 没有待处理的过期时间，只等待通知
            shared.background_task.notified().await;
        }
    }

    debug!("purge background task shut down");
}

// 在运行时之外构造存储时，用专用线程驱动后台任务
fn spawn_purge_thread<T>(shared: Arc<Shared<T>>)
where
    T: Send + Sync + 'static,
{
    let spawned = thread::Builder::new()
        .name("ttl-cache-purge".to_string())
        .spawn(move || {
            match runtime::Builder::new_current_thread().enable_time().build() {
                Ok(rt) => rt.block_on(purge_expired_tasks(shared)),
                // get 仍会检查过期时间，只是条目不会被物理删除
                Err(err) => error!(cause = %err, "failed to build purge runtime"),
            }
        });

    if let Err(err) = spawned {
        error!(cause = %err, "failed to spawn purge thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl_ms: u64) -> Db<&'static str> {
        Db::with_config(Config::default().with_ttl(Duration::from_millis(ttl_ms)))
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_cancels_previous_expiration() {
        let db = store(100);

        db.set("k".to_string(), "v1").unwrap();
        db.set("k".to_string(), "v2").unwrap();

        let state = db.shared().read();
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.expirations.len(), 1);

        let (&(when, id), key) = state.expirations.iter().next().unwrap();
        let entry = &state.entries["k"];
        assert_eq!(key, "k");
        assert_eq!(id, entry.id);
        assert_eq!(when, entry.expires_at);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_skips_superseded_version() {
        let db = store(100);
        db.set("k".to_string(), "v1").unwrap();

        // 模拟一个已失效的过期动作仍留在队列中
        {
            let mut state = db.shared().write();
            let stale_id = state.entries["k"].id + 1000;
            state
                .expirations
                .insert((Instant::now(), stale_id), "k".to_string());
        }

        db.shared().purge_expired_keys();

        assert_eq!(db.get("k"), Ok("v1"));
        assert_eq!(db.shared().read().expirations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_reports_next_deadline() {
        let db = store(100);
        let start = Instant::now();

        db.set("a".to_string(), "1").unwrap();
        time::advance(Duration::from_millis(40)).await;
        db.set("b".to_string(), "2").unwrap();

        assert_eq!(
            db.shared().purge_expired_keys(),
            Some(start + Duration::from_millis(100))
        );

        time::advance(Duration::from_millis(70)).await;
        assert_eq!(
            db.shared().purge_expired_keys(),
            Some(start + Duration::from_millis(140))
        );
        assert_eq!(db.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_but_unpurged_entry_is_not_found() {
        let db = store(100);
        db.set("k".to_string(), "v").unwrap();

        // 直接篡改过期时间，不经过后台任务
        db.shared().write().entries.get_mut("k").unwrap().expires_at = Instant::now();

        assert_eq!(db.get("k"), Err(Error::NotFound));
        assert_eq!(db.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_clamps_on_overflow() {
        let now = Instant::now();

        assert_eq!(deadline(Duration::from_millis(5)), now + Duration::from_millis(5));
        assert_eq!(deadline(Duration::MAX), now + FAR_FUTURE);
    }

    #[tokio::test]
    async fn drop_last_handle_shuts_down() {
        let db = store(100);
        let shared = db.holder.shared.clone();
        let other = db.clone();

        drop(db);
        assert!(!shared.is_shutdown());

        drop(other);
        assert!(shared.is_shutdown());
    }
}
