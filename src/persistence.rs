//! Persistence — write-through, fire-and-forget device/connection
//! storage. The graph never waits on a write; a bounded channel decouples
//! the hot observation path from whatever sink is plugged in.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{Connection, Device};

const QUEUE_CAPACITY: usize = 2048;

#[derive(Debug, Clone)]
pub enum PersistenceOp {
    SaveDevice(Device),
    DeleteDevice(String),
    SaveConnection(Connection),
}

/// Implemented by whatever storage backend a deployment wires in. TLScope
/// itself ships only [`NoopSink`]; a real sink (SQLite, a log-structured
/// file, whatever) is an external collaborator per the core's scope.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save_device(&self, device: &Device);
    async fn delete_device(&self, key: &str);
    async fn save_connection(&self, connection: &Connection);
    async fn load_devices(&self) -> Vec<Device>;
}

#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl PersistenceSink for NoopSink {
    async fn save_device(&self, _device: &Device) {}
    async fn delete_device(&self, _key: &str) {}
    async fn save_connection(&self, _connection: &Connection) {}
    async fn load_devices(&self) -> Vec<Device> {
        Vec::new()
    }
}

/// Owns a [`PersistenceSink`] and drains a bounded queue of writes on a
/// background task. A full queue drops the oldest pending write and logs
/// a warning rather than applying backpressure to the observation path.
pub struct AsyncPersistenceWriter {
    tx: mpsc::Sender<PersistenceOp>,
}

impl AsyncPersistenceWriter {
    pub fn spawn(sink: Box<dyn PersistenceSink>, cancel: CancellationToken) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_writer(sink, rx, cancel));
        (Self { tx }, handle)
    }

    /// Enqueue a write, dropping the oldest queued op on overflow instead
    /// of blocking the caller.
    pub fn enqueue(&self, op: PersistenceOp) {
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(op)) => {
                log::warn!("persistence queue full, dropping oldest write to make room");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(op).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn run_writer(sink: Box<dyn PersistenceSink>, mut rx: mpsc::Receiver<PersistenceOp>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            op = rx.recv() => {
                match op {
                    Some(PersistenceOp::SaveDevice(device)) => sink.save_device(&device).await,
                    Some(PersistenceOp::DeleteDevice(key)) => sink.delete_device(&key).await,
                    Some(PersistenceOp::SaveConnection(connection)) => sink.save_connection(&connection).await,
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        saves: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PersistenceSink for CountingSink {
        async fn save_device(&self, _device: &Device) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        async fn delete_device(&self, _key: &str) {}
        async fn save_connection(&self, _connection: &Connection) {}
        async fn load_devices(&self) -> Vec<Device> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn enqueued_writes_reach_the_sink() {
        let saves = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let (writer, handle) = AsyncPersistenceWriter::spawn(Box::new(CountingSink { saves: saves.clone() }), cancel.clone());

        let mac = crate::model::MacAddr::parse("aa:bb:cc:dd:ee:01").unwrap();
        let device = Device::new_physical(mac, None, 1000);
        writer.enqueue(PersistenceOp::SaveDevice(device));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(saves.load(Ordering::SeqCst), 1);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn noop_sink_discards_everything() {
        let sink = NoopSink;
        let mac = crate::model::MacAddr::parse("aa:bb:cc:dd:ee:01").unwrap();
        sink.save_device(&Device::new_physical(mac, None, 1000)).await;
        assert!(sink.load_devices().await.is_empty());
    }
}
