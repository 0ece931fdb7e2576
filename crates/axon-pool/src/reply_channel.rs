use tokio::sync::mpsc;

/// A single-producer single-consumer reply slot, capacity 1, reusable across
/// requests.
///
/// Tokio channels can't be drained-and-rewound in place, so "reset" here
/// means: verify nothing is pending (the hard bug spec §4.1 calls out), then
/// replace the channel pair. The `ReplyChannel` wrapper itself — not the raw
/// `(tx, rx)` pair — is what the pool recycles.
pub struct ReplyChannel<T> {
    tx: Option<mpsc::Sender<T>>,
    rx: Option<mpsc::Receiver<T>>,
}

impl<T> ReplyChannel<T> {
    fn fresh_pair() -> (Option<mpsc::Sender<T>>, Option<mpsc::Receiver<T>>) {
        let (tx, rx) = mpsc::channel(1);
        (Some(tx), Some(rx))
    }

    /// Returns the sending half. Panics if called twice without an
    /// intervening `reset` — a reply channel has exactly one producer.
    pub fn sender(&mut self) -> mpsc::Sender<T> {
        self.tx.clone().expect("reply channel sender already taken or not reset")
    }

    /// Takes the receiving half. Panics if called twice without an
    /// intervening `reset`.
    pub fn take_receiver(&mut self) -> mpsc::Receiver<T> {
        self.rx.take().expect("reply channel receiver already taken or not reset")
    }
}

impl<T> Default for ReplyChannel<T> {
    fn default() -> Self {
        let (tx, rx) = Self::fresh_pair();
        Self { tx, rx }
    }
}

impl<T> super::Poolable for ReplyChannel<T> {
    fn reset(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            // Reusing a channel that still has a pending value is a hard
            // bug: the owner must have drained it before releasing. We
            // don't silently swallow it — log loudly and drop it, since
            // panicking inside a pool release path would take down an
            // unrelated request.
            match rx.try_recv() {
                Ok(_) => {
                    tracing::error!(
                        "reply channel released with a pending value still queued; dropping it"
                    );
                    debug_assert!(
                        false,
                        "reply channel released non-empty — caller did not drain before release"
                    );
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {}
            }
        }
        let (tx, rx) = Self::fresh_pair();
        self.tx = tx;
        self.rx = rx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pool;

    #[tokio::test]
    async fn sender_and_receiver_round_trip() {
        let pool: Pool<ReplyChannel<u32>> = Pool::new(4);
        let mut chan = pool.acquire();
        let sender = chan.sender();
        let mut receiver = chan.take_receiver();

        sender.send(42).await.unwrap();
        assert_eq!(receiver.recv().await, Some(42));
    }

    #[tokio::test]
    async fn release_after_full_drain_is_clean() {
        let pool: Pool<ReplyChannel<u32>> = Pool::new(4);
        let mut chan = pool.acquire();
        let sender = chan.sender();
        let mut receiver = chan.take_receiver();
        sender.send(1).await.unwrap();
        receiver.recv().await.unwrap();

        pool.release(chan);
        assert_eq!(pool.len(), 1);
    }
}
