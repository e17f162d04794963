//! Watch tasks, the periodic resync ticker and the single ingest loop that
//! drains them.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use gantry_core::prelude::*;
use gantry_kubehub::Platform;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::index::{Coalescer, IndexBuilder, LiveIndex};
use crate::Ingestor;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub kinds: Vec<ObjectKind>,
    pub resync_every: Duration,
    pub queue_cap: usize,
    pub flush_every: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            kinds: ObjectKind::ALL.to_vec(),
            resync_every: Duration::from_secs(60),
            queue_cap: 1024,
            flush_every: Duration::from_millis(8),
        }
    }
}

impl IngestConfig {
    /// `GANTRY_RESYNC_SECS` (30..=120, default 60) and `GANTRY_INGEST_QUEUE` (default 1024).
    pub fn from_env() -> Self {
        let resync = std::env::var("GANTRY_RESYNC_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(60).clamp(30, 120);
        let cap = std::env::var("GANTRY_INGEST_QUEUE").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1024);
        Self { resync_every: Duration::from_secs(resync), queue_cap: cap, ..Self::default() }
    }
}

enum Msg {
    Changed(Notification),
    Relist { kind: ObjectKind, objects: Vec<LiveObject> },
}

/// Handle for readers of the live index. Dropping it stops ingest.
pub struct IngestHandle {
    index: Arc<ArcSwap<LiveIndex>>,
    epoch_rx: watch::Receiver<u64>,
    tasks: Vec<JoinHandle<()>>,
}

impl IngestHandle {
    pub fn current(&self) -> Arc<LiveIndex> { self.index.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Spawn one watch per kind, the resync ticker and the ingest loop.
pub fn spawn_ingest(platform: Arc<dyn Platform>, ingestor: Arc<Ingestor>, cfg: IngestConfig) -> IngestHandle {
    let (tx, mut rx) = mpsc::channel::<Msg>(cfg.queue_cap.max(1));
    let index = Arc::new(ArcSwap::from_pointee(LiveIndex::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let mut tasks = Vec::new();

    for kind in cfg.kinds.iter().copied() {
        let platform = Arc::clone(&platform);
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let mut stream = platform.watch(kind);
                while let Some(item) = stream.next().await {
                    let msg = match item {
                        Ok(WatchEvent::Changed(n)) => Msg::Changed(n),
                        Ok(WatchEvent::Restarted { kind, objects }) => Msg::Relist { kind, objects },
                        Err(e) => {
                            counter!("ingest_watch_errors_total", 1u64, "kind" => kind.as_str());
                            warn!(kind = %kind, error = %e, "watch error");
                            continue;
                        }
                    };
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                warn!(kind = %kind, "watch stream ended; re-establishing");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }));
    }

    {
        let platform = Arc::clone(&platform);
        let tx = tx.clone();
        let kinds = cfg.kinds.clone();
        let every = cfg.resync_every;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick fires at once; watches already start with a full list
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for kind in kinds.iter().copied() {
                    match platform.list_owned(kind).await {
                        Ok(objects) => {
                            if tx.send(Msg::Relist { kind, objects }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(kind = %kind, error = %e, "resync list failed"),
                    }
                }
            }
        }));
    }
    drop(tx);

    let index_clone = Arc::clone(&index);
    let cap = cfg.queue_cap;
    let flush_every = cfg.flush_every;
    tasks.push(tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = IndexBuilder::new();
        let mut ticker = tokio::time::interval(flush_every);
        let publish = |builder: &IndexBuilder| {
            let next = builder.freeze();
            let epoch = next.epoch;
            gauge!("ingest_index_objects", next.len() as f64);
            index_clone.store(next);
            let _ = epoch_tx.send(epoch);
        };
        let flush = |coalescer: &mut Coalescer, builder: &mut IndexBuilder| -> bool {
            let batch = coalescer.drain_ready();
            if batch.is_empty() {
                return false;
            }
            for n in &batch {
                if let Err(e) = ingestor.handle(n) {
                    warn!(object = %n.object.object, error = %e, "ingest failed; resync will retry");
                }
            }
            builder.apply(&batch);
            true
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(Msg::Changed(n)) => coalescer.push(n),
                        Some(Msg::Relist { kind, objects }) => {
                            flush(&mut coalescer, &mut builder);
                            match ingestor.resync(kind, &objects) {
                                Ok(r) => debug!(kind = %kind, seen = r.seen, drifted = r.drifted, missing = r.missing, "relist processed"),
                                Err(e) => warn!(kind = %kind, error = %e, "relist failed"),
                            }
                            builder.replace_kind(kind, &objects);
                            publish(&builder);
                        }
                        None => {
                            debug!("ingest channel closed; draining and exiting ingest loop");
                            if flush(&mut coalescer, &mut builder) {
                                publish(&builder);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if flush(&mut coalescer, &mut builder) {
                        publish(&builder);
                    }
                    if coalescer.dropped() > 0 {
                        gauge!("ingest_coalescer_dropped", coalescer.dropped() as f64);
                    }
                }
            }
        }
        info!("ingest loop stopped");
    }));

    IngestHandle { index, epoch_rx, tasks }
}
