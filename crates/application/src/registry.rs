//! 连接注册表
//!
//! 房间↔连接索引的唯一所有权点：注册、注销、存活簿记和广播迭代
//! 全部经过这里的API，连接处理代码不直接接触映射。内部是一把
//! 互斥锁护住的双向索引，锁内没有任何挂起点，所有变更在有界、
//! 非阻塞时间内完成。

use crate::broadcaster::OutboundFrame;
use domain::{ConnectionId, RoomId, SenderId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<OutboundFrame>,
    rooms: HashSet<RoomId>,
    /// 连接通过 presence 信封声明过的身份，断开时据此清理在线状态
    presences: HashSet<(RoomId, SenderId)>,
    last_seen: Instant,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn remove_from_room(&mut self, conn_id: ConnectionId, room_id: &RoomId) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(&conn_id);
            // 空房间立即移除，不留墓碑
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }
}

/// 连接注册表
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// 连接打开时登记其出站发送端
    pub fn attach(&self, conn_id: ConnectionId, sender: mpsc::UnboundedSender<OutboundFrame>) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.insert(
            conn_id,
            ConnectionEntry {
                sender,
                rooms: HashSet::new(),
                presences: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        debug!(conn_id = %conn_id, "连接已登记");
    }

    /// 连接关闭时清理：等价于 unregister_all + 移除条目。
    /// 返回该连接声明过的身份，调用方据此清理在线状态。
    pub fn detach(&self, conn_id: ConnectionId) -> Vec<(RoomId, SenderId)> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.connections.remove(&conn_id) else {
            return Vec::new();
        };
        for room_id in &entry.rooms {
            inner.remove_from_room(conn_id, room_id);
        }
        info!(conn_id = %conn_id, "连接已注销");
        entry.presences.into_iter().collect()
    }

    /// 记录连接在某房间声明过的发送者身份（presence 信封），幂等
    pub fn record_presence(&self, conn_id: ConnectionId, room_id: &RoomId, sender_id: &SenderId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.connections.get_mut(&conn_id) {
            entry
                .presences
                .insert((room_id.clone(), sender_id.clone()));
        }
    }

    /// 幂等注册：把连接加入房间成员集，同时把房间加入连接的成员集。
    /// 连接未登记时返回 false。
    pub fn register(&self, conn_id: ConnectionId, room_id: &RoomId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.connections.get_mut(&conn_id) else {
            return false;
        };
        let newly_joined = entry.rooms.insert(room_id.clone());
        inner
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(conn_id);
        if newly_joined {
            debug!(conn_id = %conn_id, room_id = %room_id, "连接加入房间");
        }
        true
    }

    /// 把连接移出单个房间
    pub fn unregister(&self, conn_id: ConnectionId, room_id: &RoomId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.connections.get_mut(&conn_id) {
            entry.rooms.remove(room_id);
        }
        inner.remove_from_room(conn_id, room_id);
    }

    /// 把连接移出它所在的全部房间（连接条目保留）
    pub fn unregister_all(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.lock().unwrap();
        let rooms = match inner.connections.get_mut(&conn_id) {
            Some(entry) => std::mem::take(&mut entry.rooms),
            None => return,
        };
        for room_id in rooms {
            inner.remove_from_room(conn_id, &room_id);
        }
    }

    /// 存活簿记：观察到活动（pong 或入站信封）时刷新时间戳
    pub fn touch(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.connections.get_mut(&conn_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// 超过阈值没有存活信号则视为失联；未登记的连接也视为失联
    pub fn is_stale(&self, conn_id: ConnectionId, threshold: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.connections.get(&conn_id) {
            Some(entry) => entry.last_seen.elapsed() > threshold,
            None => true,
        }
    }

    /// 广播迭代用的房间成员快照
    pub fn room_senders(
        &self,
        room_id: &RoomId,
    ) -> Vec<(ConnectionId, mpsc::UnboundedSender<OutboundFrame>)> {
        let inner = self.inner.lock().unwrap();
        let Some(members) = inner.rooms.get(room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|conn_id| {
                inner
                    .connections
                    .get(conn_id)
                    .map(|entry| (*conn_id, entry.sender.clone()))
            })
            .collect()
    }

    /// 单个连接的出站发送端（ack/错误帧用）
    pub fn sender_of(
        &self,
        conn_id: ConnectionId,
    ) -> Option<mpsc::UnboundedSender<OutboundFrame>> {
        let inner = self.inner.lock().unwrap();
        inner
            .connections
            .get(&conn_id)
            .map(|entry| entry.sender.clone())
    }

    pub fn rooms_of(&self, conn_id: ConnectionId) -> Vec<RoomId> {
        let inner = self.inner.lock().unwrap();
        inner
            .connections
            .get(&conn_id)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.rooms.get(room_id).map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach_connection(registry: &ConnectionRegistry) -> ConnectionId {
        let conn_id = ConnectionId::generate();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.attach(conn_id, tx);
        conn_id
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let conn = attach_connection(&registry);
        let room = RoomId::from("r1");

        assert!(registry.register(conn, &room));
        assert!(registry.register(conn, &room));
        assert_eq!(registry.member_count(&room), 1);
        assert_eq!(registry.rooms_of(conn), vec![room.clone()]);
    }

    #[tokio::test]
    async fn unregister_all_clears_every_membership() {
        let registry = ConnectionRegistry::new();
        let conn = attach_connection(&registry);
        for name in ["r1", "r2", "r3"] {
            registry.register(conn, &RoomId::from(name));
        }
        // 交错一次单房间注销
        registry.unregister(conn, &RoomId::from("r2"));
        registry.register(conn, &RoomId::from("r2"));

        registry.unregister_all(conn);
        assert!(registry.rooms_of(conn).is_empty());
        for name in ["r1", "r2", "r3"] {
            assert_eq!(registry.member_count(&RoomId::from(name)), 0);
        }
    }

    #[tokio::test]
    async fn empty_room_entry_is_removed() {
        let registry = ConnectionRegistry::new();
        let conn = attach_connection(&registry);
        let room = RoomId::from("r1");

        registry.register(conn, &room);
        registry.unregister(conn, &room);
        // 房间条目删除后快照为空
        assert!(registry.room_senders(&room).is_empty());
    }

    #[tokio::test]
    async fn detach_removes_connection_from_rooms() {
        let registry = ConnectionRegistry::new();
        let conn = attach_connection(&registry);
        let other = attach_connection(&registry);
        let room = RoomId::from("r1");
        registry.register(conn, &room);
        registry.register(other, &room);

        registry.detach(conn);
        assert_eq!(registry.member_count(&room), 1);
        assert!(registry.sender_of(conn).is_none());
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn detach_removes_empty_room_entry() {
        let registry = ConnectionRegistry::new();
        let conn = attach_connection(&registry);
        let room = RoomId::from("r1");
        registry.register(conn, &room);

        registry.detach(conn);
        // 唯一成员离开后房间条目整个消失
        assert!(registry.room_senders(&room).is_empty());
        assert_eq!(registry.member_count(&room), 0);
    }

    #[tokio::test]
    async fn detach_returns_declared_presences() {
        let registry = ConnectionRegistry::new();
        let conn = attach_connection(&registry);
        let room = RoomId::from("r1");
        let sender = SenderId::new("alice");

        registry.record_presence(conn, &room, &sender);
        // 重复声明同一身份不产生重复清理项
        registry.record_presence(conn, &room, &sender);

        assert_eq!(registry.detach(conn), vec![(room, sender)]);
        // 再次 detach 已无事可做
        assert!(registry.detach(conn).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_tracks_touch() {
        let registry = ConnectionRegistry::new();
        let conn = attach_connection(&registry);
        let threshold = Duration::from_secs(60);

        assert!(!registry.is_stale(conn, threshold));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.is_stale(conn, threshold));

        registry.touch(conn);
        assert!(!registry.is_stale(conn, threshold));
    }

    #[tokio::test]
    async fn unknown_connection_is_stale() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_stale(ConnectionId::generate(), Duration::from_secs(60)));
    }
}
