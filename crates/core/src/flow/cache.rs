//! # Per-Flow Cache
//!
//! A key/value cache scoped to one flow, for memoizing work across phases.
//! The map itself lives inside the flow actor; this handle talks to it over
//! a dedicated channel, so there is no shared-memory locking between
//! workers. Best-effort: the cache is discarded when the flow terminates.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Cache operations served by the flow actor.
#[derive(Debug)]
pub(crate) enum CacheOp {
    Put {
        key: String,
        value: Value,
        reply: oneshot::Sender<()>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<Value>>,
    },
}

/// Synchronous access to a flow's key/value cache.
///
/// Cloneable; phase modules receive one through their
/// [`PhaseContext`](crate::module::PhaseContext). All operations fail once
/// the flow has terminated.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    pub(crate) tx: mpsc::Sender<CacheOp>,
}

impl CacheHandle {
    /// Store `value` under `key`, replacing any previous value.
    pub async fn put(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let (reply, ack) = oneshot::channel();
        self.tx
            .send(CacheOp::Put {
                key: key.into(),
                value,
                reply,
            })
            .await
            .map_err(|_| anyhow!("flow terminated"))?;
        ack.await.context("flow terminated before cache reply")
    }

    /// Look up `key`; `None` means not found.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let (reply, ack) = oneshot::channel();
        self.tx
            .send(CacheOp::Get {
                key: key.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("flow terminated"))?;
        ack.await.context("flow terminated before cache reply")
    }
}
