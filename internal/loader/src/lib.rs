//! The async item loader: bounded-memory prefetch of file content against a
//! populated metadata tree.
//!
//! The producer walks the tree's files in depth-first insertion order and
//! hands each one to a fixed pool of fetch workers over a rendezvous
//! channel, so the pool size is the in-flight bound. Before each hand-off
//! the producer gates on the byte budget: loaded-but-unconsumed bytes plus
//! the expected size of everything already in flight, so the buffer can
//! overshoot the budget by at most one fetch. The consumer side pulls items
//! in the same tree order with [`ItemLoader::try_rob`], which moves the
//! bytes out of the item and frees budget for the producer.
//!
//! Cancellation is cooperative: every gate observes the flag on every wake,
//! in-flight fetches are drained rather than aborted, and a consumer that
//! observes cancel gets "no data" instead of an error. All waits carry
//! absolute deadlines; production and consumption timeouts are distinct
//! typed errors.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use md5::{Digest, Md5};
use svn_bridge_model::{files_in_order, ContentSlot, FolderNode};
use svn_bridge_source::{Credentials, SourceControl, SourceItem};
use tokio::{
    sync::Notify,
    task,
    time::{timeout_at, Instant},
};

mod error;
pub use self::error::Error;

/// Loader limits and deadlines.
#[derive(Debug, Clone)]
pub struct Config {
    /// Concurrent upstream fetches. The CVCS download primitive buffers
    /// each response fully in memory, so this stays small.
    pub max_in_flight: usize,

    /// Budget for loaded-but-unconsumed bytes.
    pub max_buffered_bytes: u64,

    /// Absolute bound on producer wall time.
    pub production_deadline: Duration,

    /// Bound on any single stretch of waiting for buffer space; diagnoses a
    /// stuck consumer.
    pub consumption_deadline: Duration,

    /// Upper bound on one wait iteration inside the capacity gate.
    pub consumption_step: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            // Large buffers fragment the heap badly on 32-bit hosts, so the
            // budget drops two orders of magnitude there.
            #[cfg(target_pointer_width = "64")]
            max_buffered_bytes: 100 * 1024 * 1024,
            #[cfg(not(target_pointer_width = "64"))]
            max_buffered_bytes: 10 * 1024 * 1024,
            production_deadline: Duration::from_secs(4 * 60 * 60),
            consumption_deadline: Duration::from_secs(4 * 60 * 60),
            consumption_step: Duration::from_secs(30 * 60),
        }
    }
}

/// The content moved out of an item by [`ItemLoader::try_rob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobbedContent {
    /// Base64 of the file bytes; empty when `got_data` is false.
    pub base64: String,

    /// Lowercase hex MD5 of the bytes.
    pub md5: Option<String>,

    pub got_data: bool,
}

impl RobbedContent {
    fn none() -> Self {
        Self {
            base64: String::new(),
            md5: None,
            got_data: false,
        }
    }
}

#[derive(Debug)]
struct TrackedItem {
    name: String,
    origin: SourceItem,
    slot: Arc<ContentSlot>,
}

struct Shared {
    config: Config,
    creds: Credentials,
    source: Arc<dyn SourceControl>,

    /// Depth-first snapshot of the tree's non-deleted files.
    items: Vec<TrackedItem>,
    index: HashMap<String, usize>,

    cancelled: AtomicBool,
    in_flight: AtomicUsize,

    /// Metadata sizes of dispatched-but-unpublished fetches; counted
    /// against the byte budget so overshoot is bounded by a single fetch.
    expected_bytes: AtomicU64,

    /// Wakes consumers on any fetch completion or cancel.
    consumer_notify: Notify,

    /// Wakes the producer after a rob frees budget, or on cancel.
    producer_notify: Notify,
}

/// Per-request prefetch pipeline over one metadata tree. Cheap to clone;
/// clones share the pipeline.
#[derive(Clone)]
pub struct ItemLoader {
    shared: Arc<Shared>,
}

impl ItemLoader {
    /// Snapshots the tree's files in depth-first insertion order. The tree
    /// itself stays with the caller; the loader keeps only each file's
    /// content slot and upstream identity.
    pub fn new(
        config: Config,
        creds: Credentials,
        source: Arc<dyn SourceControl>,
        root: &FolderNode,
    ) -> Self {
        let items: Vec<TrackedItem> = files_in_order(root)
            .into_iter()
            .map(|file| TrackedItem {
                name: file.meta.name.clone(),
                origin: file.origin.clone(),
                slot: file.content.clone(),
            })
            .collect();

        let index = items
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.name.clone(), idx))
            .collect();

        Self {
            shared: Arc::new(Shared {
                config,
                creds,
                source,
                items,
                index,
                cancelled: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                expected_bytes: AtomicU64::new(0),
                consumer_notify: Notify::new(),
                producer_notify: Notify::new(),
            }),
        }
    }

    /// Runs the producer loop to its natural end or until [`cancel`].
    /// Returns only after every outstanding fetch has drained.
    ///
    /// [`cancel`]: ItemLoader::cancel
    pub async fn start(&self) -> Result<(), Error> {
        let deadline = Instant::now() + self.shared.config.production_deadline;
        let (tx, rx) = flume::bounded::<usize>(0);

        let mut workers = Vec::with_capacity(self.shared.config.max_in_flight);
        for _i in 0..self.shared.config.max_in_flight {
            let shared = self.shared.clone();
            let rx = rx.clone();
            workers.push(task::spawn(async move { worker(shared, rx).await }));
        }
        drop(rx);

        let result = self.produce(tx, deadline).await;

        // Drain regardless of how production ended: pending fetches are not
        // aborted, and callers may not observe the tree until they finish.
        for worker in workers {
            worker.await?;
        }

        log::trace!("loader drained after {} items", self.shared.items.len());
        result
    }

    /// Arms the cancel flag and wakes both the producer and consumer wait
    /// points. Idempotent. In-flight fetches drain rather than abort.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            log::trace!("loader cancelled");
        }
        self.shared.consumer_notify.notify_waiters();
        self.shared.producer_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Loaded-but-unconsumed bytes across the tree.
    pub fn buffered_bytes(&self) -> u64 {
        self.shared
            .items
            .iter()
            .map(|item| item.slot.buffered_len() as u64)
            .sum()
    }

    /// Blocks until the named item's content is loaded or `timeout`
    /// elapses, then moves the bytes out of the item, freeing budget.
    ///
    /// A timed-out wait and an observed cancel both yield "no data"; a
    /// second rob of the same item yields an empty buffer. Waits re-arm
    /// against the absolute expiry, and the wait future is enabled before
    /// each re-check so a completion cannot slip between check and sleep.
    pub async fn try_rob(&self, name: &str, timeout: Duration) -> Result<RobbedContent, Error> {
        let idx = *self
            .shared
            .index
            .get(name)
            .ok_or_else(|| Error::UnknownItem(name.into()))?;
        let slot = &self.shared.items[idx].slot;
        let deadline = Instant::now() + timeout;

        loop {
            let wake = self.shared.consumer_notify.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Ok(RobbedContent::none());
            }

            if slot.is_loaded() {
                let (bytes, md5) = slot.rob();
                self.shared.producer_notify.notify_waiters();

                return Ok(match bytes {
                    Some(bytes) => RobbedContent {
                        base64: base64_encode(&bytes),
                        md5,
                        got_data: true,
                    },
                    // Loaded with nothing attached: the fetch failed, or an
                    // earlier rob already moved the bytes out.
                    None => RobbedContent::none(),
                });
            }

            if timeout_at(deadline, wake).await.is_err() {
                log::trace!("try_rob of {} timed out", name);
                return Ok(RobbedContent::none());
            }
        }
    }

    async fn produce(&self, tx: flume::Sender<usize>, deadline: Instant) -> Result<(), Error> {
        let shared = &self.shared;

        for idx in 0..shared.items.len() {
            if shared.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let size = shared.items[idx].origin.size;
            self.wait_for_capacity(size).await?;
            shared.expected_bytes.fetch_add(size, Ordering::SeqCst);

            // Rendezvous hand-off doubles as the in-flight slot gate: the
            // send completes only when a worker is free to take the item.
            // The wait also observes cancel, like every other gate.
            loop {
                let cancel_wake = shared.producer_notify.notified();
                tokio::pin!(cancel_wake);
                cancel_wake.as_mut().enable();

                if shared.cancelled.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }

                tokio::select! {
                    _ = &mut cancel_wake => continue,
                    sent = timeout_at(deadline, tx.send_async(idx)) => match sent {
                        Err(_elapsed) => {
                            log::error!("loader production deadline exceeded");
                            return Err(Error::ProductionTimeout);
                        }
                        Ok(Err(_disconnected)) => return Err(Error::WorkersExited),
                        Ok(Ok(())) => {
                            log::trace!("dispatched {}", shared.items[idx].name);
                            break;
                        }
                    },
                }
            }
        }

        Ok(())
    }

    /// The buffer-capacity gate: waits until the budget admits `incoming`
    /// more bytes. An item larger than the whole budget is admitted alone.
    async fn wait_for_capacity(&self, incoming: u64) -> Result<(), Error> {
        let shared = &self.shared;
        let budget = shared.config.max_buffered_bytes;
        let wait_deadline = Instant::now() + shared.config.consumption_deadline;

        loop {
            let wake = shared.producer_notify.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            if shared.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let committed =
                self.buffered_bytes() + shared.expected_bytes.load(Ordering::SeqCst);
            if committed + incoming <= budget || (incoming > budget && committed == 0) {
                return Ok(());
            }

            let now = Instant::now();
            if now >= wait_deadline {
                log::error!("loader consumption deadline exceeded; consumer appears stuck");
                return Err(Error::ConsumptionTimeout);
            }

            let step = wait_deadline.min(now + shared.config.consumption_step);
            // A step expiry is not fatal by itself; the loop re-checks the
            // budget and the overall deadline.
            let _timed_out = timeout_at(step, wake).await;
        }
    }
}

async fn worker(shared: Arc<Shared>, rx: flume::Receiver<usize>) {
    while let Ok(idx) = rx.recv_async().await {
        let item = &shared.items[idx];
        shared.in_flight.fetch_add(1, Ordering::SeqCst);

        match shared.source.read_file(&shared.creds, &item.origin).await {
            Ok(bytes) => {
                let md5 = hex::encode(Md5::digest(&bytes));
                item.slot.publish(bytes, md5);
            }
            Err(e) => {
                // No retry: the item reaches the consumer with no data and
                // downstream handles the absence.
                log::warn!("fetch of {} failed: {}", item.name, e);
                item.slot.publish_failed();
            }
        }

        shared
            .expected_bytes
            .fetch_sub(item.origin.size, Ordering::SeqCst);
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        shared.consumer_notify.notify_waiters();
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap as StdHashMap, time::Duration};

    use chrono::{TimeZone, Utc};
    use svn_bridge_model::{FileNode, ItemMeta, Node};
    use svn_bridge_source::{memory::InMemorySource, SourceItemKind};
    use tokio::time::sleep;

    use super::*;

    fn source_item(path: &str, size: u64) -> SourceItem {
        SourceItem {
            id: 0,
            remote_name: path.into(),
            kind: SourceItemKind::File,
            revision: 1,
            size,
            last_modified: Utc.timestamp(0, 0),
            author: String::from("author"),
            properties: StdHashMap::new(),
        }
    }

    /// Builds a flat tree over files seeded into the double, with sizes
    /// taken from the seeded content.
    fn tree(source: &InMemorySource, files: &[(&str, &str)]) -> FolderNode {
        let mut root = FolderNode::new(ItemMeta::synthetic("$/proj", 1));
        for (path, content) in files {
            source.add_file(path, 1, content.to_string());
            root.attach(Node::File(FileNode::from_source(source_item(
                path,
                content.len() as u64,
            ))));
        }
        root
    }

    fn loader(source: &InMemorySource, config: Config, root: &FolderNode) -> ItemLoader {
        ItemLoader::new(
            config,
            Credentials::default(),
            Arc::new(source.clone()),
            root,
        )
    }

    fn small_config() -> Config {
        Config {
            max_in_flight: 3,
            max_buffered_bytes: 4096,
            production_deadline: Duration::from_secs(5),
            consumption_deadline: Duration::from_secs(5),
            consumption_step: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_prefetch_and_rob_in_tree_order() {
        let source = InMemorySource::new();
        let root = tree(&source, &[("$/proj/a", "alpha"), ("$/proj/b", "beta")]);
        let loader = loader(&source, Config::default(), &root);

        let producer = {
            let loader = loader.clone();
            task::spawn(async move { loader.start().await })
        };

        let a = loader
            .try_rob("$/proj/a", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(a.got_data);
        assert_eq!(a.base64, base64_encode(b"alpha"));
        assert_eq!(a.md5.as_deref(), Some(hex::encode(Md5::digest(b"alpha")).as_str()));

        let b = loader
            .try_rob("$/proj/b", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(b.got_data);
        assert_eq!(b.base64, base64_encode(b"beta"));

        producer.await.unwrap().unwrap();
        assert_eq!(loader.in_flight(), 0);
        assert_eq!(loader.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_rob_is_a_move() {
        let source = InMemorySource::new();
        let root = tree(&source, &[("$/proj/a", "alpha")]);
        let loader = loader(&source, Config::default(), &root);
        loader.start().await.unwrap();

        let first = loader
            .try_rob("$/proj/a", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(first.got_data);

        let second = loader
            .try_rob("$/proj/a", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!second.got_data);
        assert!(second.base64.is_empty());
    }

    #[tokio::test]
    async fn test_rob_of_unknown_item() {
        let source = InMemorySource::new();
        let root = tree(&source, &[]);
        let loader = loader(&source, Config::default(), &root);

        assert!(matches!(
            loader.try_rob("$/proj/nope", Duration::from_millis(10)).await,
            Err(Error::UnknownItem(_))
        ));
    }

    // Buffer-full back-pressure: with a 4 KiB budget and three 2 KiB files
    // and no consumer, the third item must never be dispatched; the
    // producer sits at the capacity gate until cancel unblocks it.
    //
    // Note the settled state this gate produces: because the gate reserves
    // in-flight bytes as well as loaded ones, items 1 and 2 are both
    // admitted (committed reaches 4 KiB) before either completes, so the
    // producer blocks with TWO loaded items and none in flight. A gate
    // counting only loaded bytes would instead block after a single
    // completion ("exactly one data-loaded item"), but it lets every
    // concurrent fetch overshoot the budget at once. The assertions below
    // pin the reservation-gate observable deliberately; the bound that
    // matters is that buffered bytes never exceed the budget and the
    // third fetch is never issued.
    #[tokio::test]
    async fn test_capacity_gate_back_pressure() {
        let source = InMemorySource::new();
        let two_kib = "x".repeat(2048);
        let root = tree(
            &source,
            &[
                ("$/proj/a", two_kib.as_str()),
                ("$/proj/b", two_kib.as_str()),
                ("$/proj/c", two_kib.as_str()),
            ],
        );
        let loader = loader(&source, small_config(), &root);

        let producer = {
            let loader = loader.clone();
            task::spawn(async move { loader.start().await })
        };

        // Give the first two fetches time to complete and the producer time
        // to reach the gate for the third.
        sleep(Duration::from_millis(200)).await;

        assert_eq!(source.reads_started(), 2);
        assert_eq!(loader.in_flight(), 0);
        assert_eq!(loader.buffered_bytes(), 4096);
        assert!(!producer.is_finished());

        // Cancel unblocks the gate within a wake-up.
        loader.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer did not unblock after cancel")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(source.reads_started(), 2);
    }

    // A rob frees budget and lets the producer move on to the third item.
    #[tokio::test]
    async fn test_rob_releases_capacity() {
        let source = InMemorySource::new();
        let two_kib = "x".repeat(2048);
        let root = tree(
            &source,
            &[
                ("$/proj/a", two_kib.as_str()),
                ("$/proj/b", two_kib.as_str()),
                ("$/proj/c", two_kib.as_str()),
            ],
        );
        let loader = loader(&source, small_config(), &root);

        let producer = {
            let loader = loader.clone();
            task::spawn(async move { loader.start().await })
        };

        let a = loader
            .try_rob("$/proj/a", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(a.got_data);

        let c = loader
            .try_rob("$/proj/c", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(c.got_data);

        producer.await.unwrap().unwrap();
        assert_eq!(source.reads_started(), 3);
    }

    // Cancel during a slow fetch: start() returns once the fetch drains,
    // and the drained item still carries its data.
    #[tokio::test]
    async fn test_cancel_drains_pending_fetch() {
        let source = InMemorySource::new();
        let root = tree(&source, &[("$/proj/a", "alpha")]);
        source.set_read_delay(Duration::from_millis(300));
        let loader = loader(&source, Config::default(), &root);

        let producer = {
            let loader = loader.clone();
            task::spawn(async move { loader.start().await })
        };

        sleep(Duration::from_millis(50)).await;
        let cancelled_at = std::time::Instant::now();
        loader.cancel();
        loader.cancel(); // idempotent

        producer.await.unwrap().ok();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));

        // The fetch drained rather than aborting.
        assert_eq!(source.reads_completed(), 1);
        let robbed = loader
            .try_rob("$/proj/a", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!robbed.got_data, "consumers observing cancel get no data");
    }

    #[tokio::test]
    async fn test_fetch_failure_reaches_consumer_without_data() {
        let source = InMemorySource::new();
        let root = tree(&source, &[("$/proj/bad", "x"), ("$/proj/good", "fine")]);
        source.fail_reads("$/proj/bad");
        let loader = loader(&source, Config::default(), &root);

        loader.start().await.unwrap();

        let bad = loader
            .try_rob("$/proj/bad", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!bad.got_data);
        assert!(bad.md5.is_none());

        let good = loader
            .try_rob("$/proj/good", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(good.got_data);
    }

    #[tokio::test]
    async fn test_consumption_timeout_diagnoses_stuck_consumer() {
        let source = InMemorySource::new();
        let three_kib = "x".repeat(3072);
        let root = tree(
            &source,
            &[("$/proj/a", three_kib.as_str()), ("$/proj/b", three_kib.as_str())],
        );

        let config = Config {
            consumption_deadline: Duration::from_millis(200),
            consumption_step: Duration::from_millis(50),
            ..small_config()
        };
        let loader = loader(&source, config, &root);

        assert!(matches!(
            loader.start().await,
            Err(Error::ConsumptionTimeout)
        ));
    }

    #[tokio::test]
    async fn test_production_timeout_when_no_worker_frees_up() {
        let source = InMemorySource::new();
        let root = tree(&source, &[("$/proj/a", "x"), ("$/proj/b", "y")]);
        let gate = source.gate_reads();

        let config = Config {
            max_in_flight: 1,
            production_deadline: Duration::from_millis(200),
            ..small_config()
        };
        let loader = loader(&source, config, &root);

        let producer = {
            let loader = loader.clone();
            task::spawn(async move { loader.start().await })
        };

        // The lone worker is stuck on the first fetch, so the second
        // hand-off cannot complete before the production deadline.
        sleep(Duration::from_millis(400)).await;

        // Releasing the fetch lets the drain finish and start() return.
        gate.add_permits(2);
        assert!(matches!(
            producer.await.unwrap(),
            Err(Error::ProductionTimeout)
        ));
    }

    #[tokio::test]
    async fn test_rob_timeout_yields_no_data() {
        let source = InMemorySource::new();
        let root = tree(&source, &[("$/proj/a", "alpha")]);
        let loader = loader(&source, Config::default(), &root);

        // Producer never started: the wait can only time out.
        let robbed = loader
            .try_rob("$/proj/a", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!robbed.got_data);
    }
}
