//! The redo journal: a persistent operation log with a single applier.
//!
//! The journal reuses the ring for storage: `push` durably appends an
//! operation, a background task folds the outstanding suffix and hands it
//! to the [`JournalApply`] callback, and the durable consumer cursor only
//! advances once the callback returns `Ok`. A crash therefore re-applies a
//! suffix of operations on the next start, so callbacks must be
//! idempotent.
//!
//! A permanent apply failure stops the daemon: the on-disk state then
//! needs an operator, not a retry loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use xenvm_proto::{XvError, XvResult};

use crate::dev::BlockDev;
use crate::ring::{self, Consumer, Position, Producer};

/// Callback invoked with each batch of journalled operations, in order.
///
/// Must be idempotent: after a crash the same operations are applied
/// again.
#[async_trait]
pub trait JournalApply<O>: Send + Sync {
    async fn apply(&self, ops: Vec<O>) -> XvResult<()>;
}

struct Shared {
    wake: Notify,
    stop: AtomicBool,
    done: AtomicBool,
    stopped: Notify,
    /// Pushes waiting for the applier, keyed by their end position.
    waiters: std::sync::Mutex<Vec<(u64, oneshot::Sender<()>)>>,
}

/// Resolves once the pushed operation has been applied.
pub struct JournalWait {
    rx: oneshot::Receiver<()>,
}

impl JournalWait {
    pub async fn wait(self) -> XvResult<()> {
        self.rx
            .await
            .map_err(|_| XvError::Msg("journal applier stopped".to_string()))
    }
}

pub struct Journal<O> {
    name: String,
    producer: Mutex<Producer<O>>,
    shared: Arc<Shared>,
    retry: Duration,
}

impl<O> Journal<O>
where
    O: Serialize + DeserializeOwned + Send + 'static,
{
    /// Open the journal on `dev`, replaying any un-applied suffix before
    /// returning, then start the background applier task.
    pub async fn start<A>(
        dev: Arc<dyn BlockDev>,
        name: &str,
        applier: Arc<A>,
        retry: Duration,
    ) -> XvResult<Self>
    where
        A: JournalApply<O> + 'static,
    {
        if !ring::initialized(dev.as_ref())? {
            info!("journal {name}: initialising empty log");
            ring::create(dev.as_ref())?;
        }
        let (producer, _) = Producer::attach(dev.clone(), name)?;
        let mut consumer = Consumer::attach(dev, name)?;

        // replay: apply whatever a previous run pushed but never finished
        let (pos, ops) = collect(&consumer)?;
        if !ops.is_empty() {
            info!("journal {name}: replaying {} operation(s)", ops.len());
            applier.apply(ops).await?;
            consumer.advance(pos)?;
        }

        let shared = Arc::new(Shared {
            wake: Notify::new(),
            stop: AtomicBool::new(false),
            done: AtomicBool::new(false),
            stopped: Notify::new(),
            waiters: std::sync::Mutex::new(Vec::new()),
        });
        tokio::spawn(applier_loop(
            consumer,
            applier,
            shared.clone(),
            name.to_string(),
        ));

        Ok(Self {
            name: name.to_string(),
            producer: Mutex::new(producer),
            shared,
            retry,
        })
    }

    /// Durably append `op` and wake the applier.
    ///
    /// The returned [`JournalWait`] resolves once the applier has applied
    /// the operation.
    pub async fn push(&self, op: &O) -> XvResult<JournalWait> {
        let mut producer = self.producer.lock().await;
        let pos = loop {
            match producer.push(op) {
                Ok(pos) => break pos,
                Err(e) if e.is_transient() => {
                    warn!("journal {}: log full, waiting for applier", self.name);
                    sleep(self.retry).await;
                }
                Err(e) => return Err(e),
            }
        };
        // the waiter must be registered before `advance` makes the op
        // visible, or the applier can complete the batch first and the
        // wait would never resolve
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().unwrap().push((pos.0, tx));
        if let Err(e) = producer.advance(pos) {
            self.shared.waiters.lock().unwrap().retain(|(end, _)| *end != pos.0);
            return Err(e);
        }
        drop(producer);
        self.shared.wake.notify_one();
        Ok(JournalWait { rx })
    }

    /// Let the applier drain outstanding operations, then stop it.
    /// Calling again after the applier has stopped is a no-op.
    pub async fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        if !self.shared.done.load(Ordering::Acquire) {
            self.shared.stopped.notified().await;
        }
        info!("journal {}: shut down", self.name);
    }
}

fn collect<O: Serialize + DeserializeOwned>(
    consumer: &Consumer<O>,
) -> XvResult<(Position, Vec<O>)> {
    consumer.fold(Vec::new(), |mut acc, op| {
        acc.push(op);
        acc
    })
}

async fn applier_loop<O, A>(
    mut consumer: Consumer<O>,
    applier: Arc<A>,
    shared: Arc<Shared>,
    name: String,
) where
    O: Serialize + DeserializeOwned + Send + 'static,
    A: JournalApply<O> + 'static,
{
    loop {
        let (pos, ops) = match collect(&consumer) {
            Ok(x) => x,
            Err(e) => {
                error!("fatal: journal {name}: cannot read log: {e}");
                std::process::exit(1);
            }
        };

        if !ops.is_empty() {
            debug!("journal {name}: applying {} operation(s)", ops.len());
            if let Err(e) = applier.apply(ops).await {
                error!("fatal: journal {name}: apply failed: {e}");
                std::process::exit(1);
            }
            if let Err(e) = consumer.advance(pos) {
                error!("fatal: journal {name}: cannot advance cursor: {e}");
                std::process::exit(1);
            }
            let mut waiters = shared.waiters.lock().unwrap();
            let mut kept = Vec::new();
            for (end, tx) in waiters.drain(..) {
                if end <= pos.0 {
                    let _ = tx.send(());
                } else {
                    kept.push((end, tx));
                }
            }
            *waiters = kept;
            continue;
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        shared.wake.notified().await;
    }
    shared.done.store(true, Ordering::Release);
    shared.stopped.notify_one();
}
