//! 按设备复用的连接池。
//!
//! - 每个设备至多一条连接，空闲超过过期时间后下次获取时重建
//! - 达到上限时拒绝新连接，不驱逐已有连接
//! - 过期连接由周期清理移除

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

struct PoolEntry<C> {
    conn: Arc<Mutex<C>>,
    last_active: Instant,
}

struct PoolState<C> {
    entries: HashMap<String, PoolEntry<C>>,
    /// 正在建连的设备数，计入容量
    connecting: usize,
}

/// 获取结果。
pub enum Acquired<C> {
    /// 复用已有连接
    Reused(Arc<Mutex<C>>),
    /// 新建连接
    Created(Arc<Mutex<C>>),
    /// 池已满
    Refused,
}

impl<C> Acquired<C> {
    pub fn connection(self) -> Option<Arc<Mutex<C>>> {
        match self {
            Acquired::Reused(conn) | Acquired::Created(conn) => Some(conn),
            Acquired::Refused => None,
        }
    }
}

/// 建连期间占用的容量名额；建连失败或被取消时归还。
struct Reservation<'a, C> {
    pool: &'a ConnectionPool<C>,
    active: bool,
}

impl<C> Reservation<'_, C> {
    fn release(&mut self, state: &mut PoolState<C>) {
        if self.active {
            state.connecting = state.connecting.saturating_sub(1);
            self.active = false;
        }
    }
}

impl<C> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.active {
            let mut state = self.pool.state();
            state.connecting = state.connecting.saturating_sub(1);
        }
    }
}

pub struct ConnectionPool<C> {
    max_connections: usize,
    expire_after: Duration,
    state: std::sync::Mutex<PoolState<C>>,
    /// 每设备建连闸门：同一设备串行建连，不同设备互不阻塞
    gates: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C> ConnectionPool<C> {
    pub fn new(max_connections: usize, expire_after: Duration) -> Self {
        Self {
            max_connections,
            expire_after,
            state: std::sync::Mutex::new(PoolState {
                entries: HashMap::new(),
                connecting: 0,
            }),
            gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(device_id.to_string()).or_default())
    }

    /// 获取设备连接；不存在或已过期时调用 `connect` 新建。
    ///
    /// 建连期间只阻塞同一设备的获取，池锁不跨越 `connect`。
    pub async fn get_or_connect<F, Fut, E>(
        &self,
        device_id: &str,
        connect: F,
    ) -> Result<Acquired<C>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        if let Some(conn) = self.try_reuse(device_id) {
            return Ok(Acquired::Reused(conn));
        }

        let gate = self.gate(device_id);
        let _building = gate.lock().await;

        let mut reservation = {
            // 等待闸门期间可能已由其他任务建好
            if let Some(conn) = self.try_reuse(device_id) {
                return Ok(Acquired::Reused(conn));
            }
            let mut state = self.state();
            if state.entries.len() + state.connecting >= self.max_connections {
                drop(state);
                gw_telemetry::record_modbus_pool_refused();
                info!(
                    target: "gw.modbus",
                    device_id,
                    max = self.max_connections,
                    "connection_pool_full"
                );
                return Ok(Acquired::Refused);
            }
            state.connecting += 1;
            Reservation {
                pool: self,
                active: true,
            }
        };

        let conn = Arc::new(Mutex::new(connect().await?));
        let mut state = self.state();
        reservation.release(&mut state);
        state.entries.insert(
            device_id.to_string(),
            PoolEntry {
                conn: Arc::clone(&conn),
                last_active: Instant::now(),
            },
        );
        Ok(Acquired::Created(conn))
    }

    /// 命中未过期连接时刷新活跃时间；过期连接直接移除。
    fn try_reuse(&self, device_id: &str) -> Option<Arc<Mutex<C>>> {
        let mut state = self.state();
        let now = Instant::now();
        let entry = state.entries.get_mut(device_id)?;
        if now.duration_since(entry.last_active) <= self.expire_after {
            entry.last_active = now;
            return Some(Arc::clone(&entry.conn));
        }
        debug!(target: "gw.modbus", device_id, "pooled_connection_expired");
        state.entries.remove(device_id);
        None
    }

    /// 移除设备连接（读写失败或驱动停止时）。
    pub async fn remove(&self, device_id: &str) -> bool {
        self.state().entries.remove(device_id).is_some()
    }

    /// 清理过期连接，返回移除数量。
    pub async fn sweep_expired(&self) -> usize {
        let removed = {
            let mut state = self.state();
            let now = Instant::now();
            let before = state.entries.len();
            let expire_after = self.expire_after;
            state
                .entries
                .retain(|_, entry| now.duration_since(entry.last_active) <= expire_after);
            before - state.entries.len()
        };
        if removed > 0 {
            info!(target: "gw.modbus", removed, "expired_connections_swept");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.state().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    async fn acquire(pool: &ConnectionPool<u32>, id: &str, value: u32) -> Acquired<u32> {
        pool.get_or_connect(id, || async move { Ok::<_, Infallible>(value) })
            .await
            .expect("infallible")
    }

    #[tokio::test]
    async fn reuses_connection_per_device() {
        let pool = ConnectionPool::new(2, Duration::from_secs(60));
        assert!(matches!(acquire(&pool, "d1", 1).await, Acquired::Created(_)));
        let reused = acquire(&pool, "d1", 2).await;
        let conn = match reused {
            Acquired::Reused(conn) => conn,
            _ => panic!("expected reuse"),
        };
        assert_eq!(*conn.lock().await, 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn refuses_beyond_capacity_without_eviction() {
        let pool = ConnectionPool::new(2, Duration::from_secs(60));
        acquire(&pool, "d1", 1).await;
        acquire(&pool, "d2", 2).await;
        assert!(matches!(acquire(&pool, "d3", 3).await, Acquired::Refused));
        assert_eq!(pool.len().await, 2);
        assert!(matches!(acquire(&pool, "d1", 9).await, Acquired::Reused(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept_and_rebuilt() {
        let pool = ConnectionPool::new(2, Duration::from_secs(30));
        acquire(&pool, "d1", 1).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(acquire(&pool, "d1", 2).await, Acquired::Created(_)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.sweep_expired().await, 1);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn connect_errors_leave_pool_untouched() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2, Duration::from_secs(60));
        let result = pool
            .get_or_connect("d1", || async { Err::<u32, _>("refused") })
            .await;
        assert!(result.is_err());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn slow_connect_does_not_block_other_devices() {
        let pool = Arc::new(ConnectionPool::new(4, Duration::from_secs(60)));
        acquire(&pool, "d2", 2).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_pool = Arc::clone(&pool);
        let slow = tokio::spawn(async move {
            slow_pool
                .get_or_connect("d1", move || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, Infallible>(1)
                })
                .await
                .map(|acquired| matches!(acquired, Acquired::Created(_)))
        });
        started_rx.await.expect("connect started");

        let reused = tokio::time::timeout(Duration::from_millis(500), acquire(&pool, "d2", 9))
            .await
            .expect("pooled device not blocked");
        assert!(matches!(reused, Acquired::Reused(_)));

        release_tx.send(()).expect("release");
        assert!(slow.await.expect("join").expect("infallible"));
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn in_flight_connect_counts_toward_capacity() {
        let pool = Arc::new(ConnectionPool::new(1, Duration::from_secs(60)));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_pool = Arc::clone(&pool);
        let slow = tokio::spawn(async move {
            slow_pool
                .get_or_connect("d1", move || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, Infallible>(1)
                })
                .await
                .map(|acquired| matches!(acquired, Acquired::Created(_)))
        });
        started_rx.await.expect("connect started");
        assert!(matches!(acquire(&pool, "d2", 2).await, Acquired::Refused));

        release_tx.send(()).expect("release");
        assert!(slow.await.expect("join").expect("infallible"));
    }

    #[tokio::test]
    async fn failed_connect_returns_its_capacity() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(1, Duration::from_secs(60));
        let _ = pool
            .get_or_connect("d1", || async { Err::<u32, _>("refused") })
            .await;
        assert!(matches!(acquire(&pool, "d2", 2).await, Acquired::Created(_)));
    }
}
