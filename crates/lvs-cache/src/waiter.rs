use lvs_types::BlockId;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::CacheResult;

/// A block handed to an acquisition after the cache made it available.
#[derive(Debug)]
pub struct Delivery<B> {
    /// Token the acquirer attached to the waiter.
    pub token: usize,
    pub block: BlockId,
    pub result: CacheResult<B>,
}

/// Sending half of a delivery channel.
pub type DeliverySender<B> = mpsc::UnboundedSender<Delivery<B>>;

/// Receiving half of a delivery channel.
pub type DeliveryReceiver<B> = mpsc::UnboundedReceiver<Delivery<B>>;

/// Create the channel an acquirer listens on for block availability.
pub fn delivery_channel<B>() -> (DeliverySender<B>, DeliveryReceiver<B>) {
    mpsc::unbounded_channel()
}

/// Single-use availability notification for one pending acquisition.
///
/// [`deliver`](Self::deliver) consumes the waiter, so a block can reach its
/// acquirer at most once.
#[derive(Debug)]
pub struct BlockWaiter<B> {
    token: usize,
    block: BlockId,
    tx: DeliverySender<B>,
}

impl<B> BlockWaiter<B> {
    pub fn new(token: usize, block: BlockId, tx: DeliverySender<B>) -> Self {
        Self { token, block, tx }
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn block_id(&self) -> BlockId {
        self.block
    }

    /// Hand the acquisition result to the waiting acquirer.
    ///
    /// If the acquirer has gone away the buffer is dropped here, which
    /// returns it to the cache.
    pub fn deliver(self, result: CacheResult<B>) {
        let delivery = Delivery {
            token: self.token,
            block: self.block,
            result,
        };
        if self.tx.send(delivery).is_err() {
            warn!(block = %self.block, token = self.token, "acquirer gone; returning block to cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    #[test]
    fn delivery_carries_token_and_block() {
        let (tx, mut rx) = delivery_channel::<u32>();
        let block = BlockId::new(5).unwrap();
        let waiter = BlockWaiter::new(3, block, tx);
        assert_eq!(waiter.token(), 3);
        assert_eq!(waiter.block_id(), block);
        waiter.deliver(Ok(42));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.token, 3);
        assert_eq!(delivery.block, block);
        assert_eq!(delivery.result.unwrap(), 42);
    }

    #[test]
    fn deliver_after_receiver_dropped_is_harmless() {
        let (tx, rx) = delivery_channel::<u32>();
        drop(rx);
        let block = BlockId::new(1).unwrap();
        BlockWaiter::new(0, block, tx).deliver(Err(CacheError::BlockNotFound(block)));
    }
}
