//! Bounded channel that can be reopened for each connection.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::SpyNodeError;

struct Open<T> {
    sender: mpsc::Sender<T>,
    token: CancellationToken,
}

/// Queue feeding one consumer task. Producers hold the channel by reference and fail with
/// [`SpyNodeError::ChannelClosed`] once it is closed or its connection is cancelled.
pub struct MessageChannel<T> {
    name: &'static str,
    open: Mutex<Option<Open<T>>>,
}

impl<T> MessageChannel<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            open: Mutex::new(None),
        }
    }

    /// Opens a new channel and returns its receiving end. Any previous channel is closed.
    /// Blocked producers give up when `token` is cancelled.
    pub async fn open(&self, size: usize, token: CancellationToken) -> mpsc::Receiver<T> {
        let (sender, receiver) = mpsc::channel(size);
        *self.open.lock().await = Some(Open {
            sender,
            token,
        });
        receiver
    }

    /// Drops the stored sender. The receiver ends once in-flight sends complete.
    pub async fn close(&self) {
        self.open.lock().await.take();
    }

    pub async fn is_open(&self) -> bool {
        self.open.lock().await.is_some()
    }

    pub async fn add(&self, item: T) -> Result<(), SpyNodeError> {
        let (sender, token) = match self.open.lock().await.as_ref() {
            Some(open) => (open.sender.clone(), open.token.clone()),
            None => return Err(SpyNodeError::ChannelClosed(self.name)),
        };

        tokio::select! {
            result = sender.send(item) => {
                result.map_err(|_| SpyNodeError::ChannelClosed(self.name))
            }
            _ = token.cancelled() => Err(SpyNodeError::ChannelClosed(self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_requires_open() {
        let channel = MessageChannel::<u32>::new("test");
        assert!(matches!(channel.add(1).await, Err(SpyNodeError::ChannelClosed("test"))));

        let mut receiver = channel.open(4, CancellationToken::new()).await;
        channel.add(1).await.unwrap();
        channel.add(2).await.unwrap();
        channel.close().await;
        assert!(!channel.is_open().await);
        assert!(channel.add(3).await.is_err());

        assert_eq!(receiver.recv().await, Some(1));
        assert_eq!(receiver.recv().await, Some(2));
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_full_channel() {
        let channel = MessageChannel::<u32>::new("test");
        let token = CancellationToken::new();
        let _receiver = channel.open(1, token.clone()).await;
        channel.add(1).await.unwrap();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert!(channel.add(2).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen() {
        let channel = MessageChannel::<u32>::new("test");
        let mut first = channel.open(4, CancellationToken::new()).await;
        let mut second = channel.open(4, CancellationToken::new()).await;
        assert_eq!(first.recv().await, None);
        channel.add(5).await.unwrap();
        assert_eq!(second.recv().await, Some(5));
    }
}
