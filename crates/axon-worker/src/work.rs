use axon_common::GatewayError;
use axon_provider::{CanonicalResponse, RequestEnvelope, StreamChunk};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A successful unary result plus how many upstream calls it took. The
/// router needs this even on success: its fallback accounting (spec §8
/// scenario 1) counts every upstream call across every candidate, not just
/// the ones that failed.
pub struct WorkSuccess {
    pub response: CanonicalResponse,
    pub attempts: u32,
}

/// What a worker hands back on the reply channel. A unary result completes
/// the call; a stream hands back only the header — chunk consumption
/// happens on whoever holds `chunks`, matching the router contract "a
/// streaming response returns immediately after the header".
pub enum WorkOutcome {
    Unary(Result<WorkSuccess, GatewayError>),
    Stream { chunks: mpsc::Receiver<StreamChunk>, attempts: u32 },
}

/// One item admitted to a provider's queue.
pub struct QueuedRequest {
    pub envelope: Box<RequestEnvelope>,
    pub reply_tx: mpsc::Sender<WorkOutcome>,
    pub cancel: CancellationToken,
    pub deadline: tokio::time::Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue is full")]
    QueueFull,
    #[error("pool is draining")]
    Draining,
    #[error("provider is not registered")]
    UnknownProvider,
}
