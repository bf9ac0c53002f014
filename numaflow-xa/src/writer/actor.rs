use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{pin, time};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection::ConnectionProvider;
use crate::error::{Error, Result};
use crate::statement::QueryStatement;
use crate::writer::{Snapshot, WriterState, XaWriter};
use crate::xid::TransactionId;

/// WriterMessage is a message that is sent to the [WriterActor].
pub(crate) enum WriterMessage<R> {
    Write {
        rows: Vec<R>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Flush {
        respond_to: oneshot::Sender<Result<()>>,
    },
    PrepareSnapshot {
        checkpoint_id: u64,
        respond_to: oneshot::Sender<Result<Snapshot>>,
    },
    Committed {
        xids: Vec<TransactionId>,
    },
    Resolved {
        xids: Vec<TransactionId>,
    },
    State {
        respond_to: oneshot::Sender<WriterState>,
    },
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Owns the [XaWriter] of a subtask and serializes every call on it.
struct WriterActor<P, S>
where
    P: ConnectionProvider,
    S: QueryStatement,
{
    actor_messages: mpsc::Receiver<WriterMessage<S::Row>>,
    writer: XaWriter<P, S>,
}

impl<P, S> WriterActor<P, S>
where
    P: ConnectionProvider,
    S: QueryStatement,
{
    /// Returns false once the writer is closed.
    async fn handle_message(&mut self, msg: WriterMessage<S::Row>) -> bool {
        match msg {
            WriterMessage::Write { rows, respond_to } => {
                let _ = respond_to.send(self.writer.write(rows).await);
            }
            WriterMessage::Flush { respond_to } => {
                let _ = respond_to.send(self.writer.flush().await);
            }
            WriterMessage::PrepareSnapshot {
                checkpoint_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.writer.prepare_snapshot(checkpoint_id).await);
            }
            WriterMessage::Committed { xids } => self.writer.notify_committed(&xids),
            WriterMessage::Resolved { xids } => self.writer.notify_resolved(&xids),
            WriterMessage::State { respond_to } => {
                let _ = respond_to.send(self.writer.state());
            }
            WriterMessage::Close { respond_to } => {
                let _ = respond_to.send(self.writer.close().await);
                return false;
            }
        }
        true
    }

    async fn run(mut self, cancel: CancellationToken, batch_interval: Duration) -> Result<()> {
        let timer_enabled = !batch_interval.is_zero();
        // interval panics on a zero period, the branch below is disabled in that case anyway
        let mut ticker = time::interval(batch_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancellation received, closing writer");
                    return self.writer.close().await;
                }
                msg = self.actor_messages.recv() => {
                    let Some(msg) = msg else {
                        // every handle is gone
                        return self.writer.close().await;
                    };
                    if !self.handle_message(msg).await {
                        return Ok(());
                    }
                }
                _ = ticker.tick(), if timer_enabled => {
                    if self.writer.flush_due()
                        && let Err(e) = self.writer.flush().await
                    {
                        error!(?e, "Timed flush failed");
                    }
                }
            }
        }
    }
}

/// Cloneable handle to a writer running on its own task.
pub struct WriterHandle<R> {
    sender: mpsc::Sender<WriterMessage<R>>,
}

impl<R> Clone for WriterHandle<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Start the actor for `writer`. The actor closes the writer when `cancel` fires or every
/// handle is dropped.
pub fn spawn<P, S>(
    writer: XaWriter<P, S>,
    channel_size: usize,
    cancel: CancellationToken,
) -> (WriterHandle<S::Row>, JoinHandle<Result<()>>)
where
    P: ConnectionProvider,
    S: QueryStatement,
{
    let (sender, receiver) = mpsc::channel(channel_size.max(1));
    let batch_interval = writer.settings.execution.batch_interval;
    let actor = WriterActor {
        actor_messages: receiver,
        writer,
    };
    let handle = tokio::spawn(async move { actor.run(cancel, batch_interval).await });
    (WriterHandle { sender }, handle)
}

impl<R> WriterHandle<R>
where
    R: Send + 'static,
{
    async fn send(&self, msg: WriterMessage<R>) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::Writer("writer actor is not running".to_string()))
    }

    pub async fn write(&self, rows: Vec<R>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WriterMessage::Write { rows, respond_to }).await?;
        rx.await?
    }

    pub async fn flush(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WriterMessage::Flush { respond_to }).await?;
        rx.await?
    }

    pub async fn prepare_snapshot(&self, checkpoint_id: u64) -> Result<Snapshot> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WriterMessage::PrepareSnapshot {
            checkpoint_id,
            respond_to,
        })
        .await?;
        rx.await?
    }

    pub async fn notify_committed(&self, xids: Vec<TransactionId>) -> Result<()> {
        if xids.is_empty() {
            return Ok(());
        }
        self.send(WriterMessage::Committed { xids }).await
    }

    pub async fn notify_resolved(&self, xids: Vec<TransactionId>) -> Result<()> {
        if xids.is_empty() {
            return Ok(());
        }
        self.send(WriterMessage::Resolved { xids }).await
    }

    pub async fn state(&self) -> Result<WriterState> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WriterMessage::State { respond_to }).await?;
        Ok(rx.await?)
    }

    pub async fn close(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WriterMessage::Close { respond_to }).await?;
        rx.await?
    }

    /// Write everything read from `rows`, in chunks of up to `chunk_size` rows or whatever
    /// arrived within `chunk_timeout`. A failed write cancels `cln_token` and ends the task.
    pub fn streaming_write(
        &self,
        rows: ReceiverStream<R>,
        chunk_size: usize,
        chunk_timeout: Duration,
        cln_token: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let handle = self.clone();
        tokio::spawn(async move {
            let chunk_stream = rows.chunks_timeout(chunk_size.max(1), chunk_timeout);
            pin!(chunk_stream);

            loop {
                let batch = tokio::select! {
                    _ = cln_token.cancelled() => {
                        warn!("Cancellation received, stopping streaming write");
                        return Err(Error::Cancelled);
                    }
                    batch = chunk_stream.next() => batch,
                };
                let Some(batch) = batch else {
                    return Ok(());
                };
                if batch.is_empty() {
                    continue;
                }
                if let Err(e) = handle.write(batch).await {
                    error!(?e, "Error writing rows, initiating shutdown.");
                    cln_token.cancel();
                    return Err(e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Settings;
    use crate::connection::XaConnection;
    use crate::test_utils::{BookStatement, MemoryBackend, Op, book, book_row, test_settings};
    use crate::xid::{JobId, XidCodec};

    fn start(
        backend: &MemoryBackend,
        settings: Settings,
        cancel: CancellationToken,
    ) -> (WriterHandle<(i64, String)>, JoinHandle<Result<()>>) {
        let writer = XaWriter::new(
            Arc::new(backend.provider()),
            Arc::new(BookStatement),
            XidCodec::new(JobId::from_name("J1"), 0),
            0,
            settings,
            None,
        );
        spawn(writer, 16, cancel)
    }

    #[tokio::test]
    async fn handle_drives_the_writer() {
        let backend = MemoryBackend::new();
        let (handle, task) = start(&backend, test_settings(), CancellationToken::new());

        handle.write(vec![book(1), book(2)]).await.unwrap();
        let snapshot = handle.prepare_snapshot(1).await.unwrap();
        let xid = snapshot.commitable.unwrap().transaction_id;
        assert_eq!(handle.state().await.unwrap().prepared(), &[xid.clone()]);

        handle.notify_committed(vec![xid]).await.unwrap();
        assert!(handle.state().await.unwrap().is_empty());

        handle.close().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(handle.write(vec![book(3)]).await.is_err());
    }

    #[tokio::test]
    async fn timer_flushes_buffered_rows() {
        let backend = MemoryBackend::new();
        let mut settings = test_settings();
        settings.execution.batch_interval = Duration::from_millis(10);
        let (handle, _task) = start(&backend, settings, CancellationToken::new());

        handle.write(vec![book(1)]).await.unwrap();
        time::timeout(Duration::from_secs(2), async {
            while backend.calls(Op::Execute) == 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_rolls_back_the_open_branch() {
        let backend = MemoryBackend::new();
        let cancel = CancellationToken::new();
        let (handle, task) = start(&backend, test_settings(), cancel.clone());

        handle.write(vec![book(1)]).await.unwrap();
        handle.flush().await.unwrap();
        assert_eq!(backend.active_ids().len(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(backend.active_ids().is_empty());
        assert_eq!(backend.rolled_back_ids().len(), 1);
    }

    #[tokio::test]
    async fn streaming_write_chunks_the_input() {
        let backend = MemoryBackend::new();
        let (handle, _task) = start(&backend, test_settings(), CancellationToken::new());

        let (tx, rx) = mpsc::channel(10);
        let stream_task = handle.streaming_write(
            ReceiverStream::new(rx),
            2,
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        for id in 1..=5 {
            tx.send(book(id)).await.unwrap();
        }
        drop(tx);
        stream_task.await.unwrap().unwrap();

        let snapshot = handle.prepare_snapshot(1).await.unwrap();
        let xid = snapshot.commitable.unwrap().transaction_id;
        let mut conn = backend.provider().acquire().await.unwrap();
        conn.commit(&xid).await.unwrap();
        assert_eq!(
            backend.committed_rows(),
            (1..=5).map(book_row).collect::<Vec<_>>()
        );
    }
}
