//! Event fan-out to connected sessions

use crate::paper_trading::{LeaderboardEntry, Transaction};
use crate::types::{AccountId, AssetId, SessionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

/// Event pushed to subscribers
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PriceUpdate {
        asset: AssetId,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    TradeConfirmed {
        account: AccountId,
        transaction: Transaction,
    },
    LeaderboardUpdate {
        entries: Vec<LeaderboardEntry>,
    },
    AssetSettled {
        asset: AssetId,
        final_price: f64,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::PriceUpdate { .. } => "price_update",
            EngineEvent::TradeConfirmed { .. } => "trade_confirmed",
            EngineEvent::LeaderboardUpdate { .. } => "leaderboard_update",
            EngineEvent::AssetSettled { .. } => "asset_settled",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = EngineEvent> + Send>>;

/// Gateway statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayStats {
    pub sessions: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Best-effort, at-most-once delivery over one bounded queue per session
pub struct BroadcastGateway {
    sessions: DashMap<SessionId, mpsc::Sender<EngineEvent>>,
    buffer: usize,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl BroadcastGateway {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Open a stream for a session, ending any stream it already had
    pub fn subscribe(&self, session: SessionId) -> EventStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.sessions.insert(session, tx).is_some() {
            debug!("Session {} re-subscribed, previous stream closed", session);
        } else {
            info!("Session {} subscribed", session);
        }

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    /// End a session's stream after its queued events drain
    pub fn disconnect(&self, session: &SessionId) -> bool {
        let removed = self.sessions.remove(session).is_some();
        if removed {
            info!("Session {} disconnected", session);
        }
        removed
    }

    /// Deliver to every session without waiting; returns how many accepted it
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for session in self.sessions.iter() {
            match session.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Session {} queue full, dropped {}", session.key(), event.kind());
                }
                Err(TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    closed.push(*session.key());
                }
            }
        }

        for session in closed {
            // A re-subscribed session has a fresh sender by now
            if self
                .sessions
                .remove_if(&session, |_, tx| tx.is_closed())
                .is_some()
            {
                debug!("Pruned closed session {}", session);
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            sessions: self.sessions.len(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn settled(price: f64) -> EngineEvent {
        EngineEvent::AssetSettled {
            asset: AssetId::new("XQR"),
            final_price: price,
        }
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = settled(42.0).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "asset_settled");
        assert_eq!(value["asset"], "XQR");
        assert_eq!(value["final_price"], 42.0);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_sessions() {
        let gateway = BroadcastGateway::new(8);
        let mut a = gateway.subscribe(SessionId::new());
        let mut b = gateway.subscribe(SessionId::new());

        assert_eq!(gateway.publish(settled(1.0)), 2);
        assert_eq!(a.next().await, Some(settled(1.0)));
        assert_eq!(b.next().await, Some(settled(1.0)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let gateway = BroadcastGateway::new(2);
        let mut stream = gateway.subscribe(SessionId::new());

        for i in 0..5 {
            gateway.publish(settled(i as f64));
        }
        assert_eq!(gateway.stats().dropped, 3);
        assert_eq!(stream.next().await, Some(settled(0.0)));
        assert_eq!(stream.next().await, Some(settled(1.0)));
    }

    #[test]
    fn test_disconnect_ends_stream() {
        let gateway = BroadcastGateway::new(4);
        let session = SessionId::new();
        let mut stream = gateway.subscribe(session);

        gateway.publish(settled(7.0));
        assert!(gateway.disconnect(&session));
        assert_eq!(tokio_test::block_on(stream.next()), Some(settled(7.0)));
        assert_eq!(tokio_test::block_on(stream.next()), None);
        assert!(!gateway.disconnect(&session));
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_stream() {
        let gateway = BroadcastGateway::new(4);
        let session = SessionId::new();
        let mut old = gateway.subscribe(session);
        let mut new = gateway.subscribe(session);

        assert_eq!(gateway.session_count(), 1);
        gateway.publish(settled(3.0));
        assert_eq!(old.next().await, None);
        assert_eq!(new.next().await, Some(settled(3.0)));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let gateway = BroadcastGateway::new(4);
        let stream = gateway.subscribe(SessionId::new());
        drop(stream);

        assert_eq!(gateway.publish(settled(1.0)), 0);
        assert_eq!(gateway.session_count(), 0);
    }
}
