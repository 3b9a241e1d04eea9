// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Distribution adapter seam for external fan-out.

use dk_core::EventRecord;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Callback handed to an adapter's `subscribe`: delivers a remote event into
/// the local dispatch path (which never re-publishes to the adapter).
pub type RemoteDeliver = Arc<dyn Fn(EventRecord) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bridges locally-emitted events to an external transport and feeds remote
/// events back in. Cross-node ordering is whatever the transport provides.
#[async_trait::async_trait]
pub trait DistributionAdapter: Send + Sync {
    /// Forward a locally-published event to the transport.
    async fn publish(&self, record: &EventRecord) -> Result<(), String>;

    /// Register the local delivery callback for events arriving from the
    /// transport.
    async fn subscribe(&self, deliver: RemoteDeliver);

    /// Release transport resources. Called once from `EventBus::stop`.
    async fn stop(&self) {}
}
