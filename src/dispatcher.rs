//! Import driver.
//!
//! The driver reads the manifest one line at a time and groups consecutive
//! same-type lines into segments. Each segment gets its own pool of workers
//! fed through a bounded queue; when the record type changes, the active
//! pool's queue is closed and fully drained before the next pool starts, so
//! record types are applied strictly in file order. Failures come back on a
//! bounded error channel; enqueuing races against receiving from it, so a
//! fatal error interrupts a backpressured enqueue instead of waiting it out.

use crate::archive::{resolve_attachments, ImportArchive};
use crate::bulk_import::ImportContext;
use crate::error::LineError;
use crate::model::{ImportLine, RecordKind, WorkItem};
use crate::reader::{LineReader, DEFAULT_MAX_LINE_BYTES};
use crate::store::{FileStore, PrimaryRouteGuard, Store};
use crate::worker::run_worker;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default cap on profile image uploads: 6 MiB.
pub const DEFAULT_MAX_PROFILE_IMAGE_BYTES: u64 = 6 * 1024 * 1024;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Knobs for one import run.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Workers per segment pool.
    pub worker_count: usize,
    /// Validate without mutating the store.
    pub dry_run: bool,
    /// Base path joined with relative attachment paths.
    pub base_path: PathBuf,
    pub max_line_bytes: usize,
    pub max_profile_image_bytes: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            dry_run: false,
            base_path: PathBuf::new(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_profile_image_bytes: DEFAULT_MAX_PROFILE_IMAGE_BYTES,
        }
    }
}

/// The bulk import pipeline. One instance can run multiple imports; each
/// [`Importer::import`] call is an independent run.
pub struct Importer {
    store: Arc<dyn Store>,
    files: Arc<dyn FileStore>,
    config: ImportConfig,
}

struct WorkerPool {
    tx: Sender<WorkItem>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn(ctx: Arc<ImportContext>, worker_count: usize, errors: Sender<LineError>) -> Self {
        let (tx, rx) = mpsc::channel(worker_count);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..worker_count)
            .map(|_| tokio::spawn(run_worker(ctx.clone(), rx.clone(), errors.clone())))
            .collect();
        Self { tx, handles }
    }

    /// Close the queue and wait for every worker to finish its remaining
    /// items and flush its buffers.
    async fn drain(self) {
        drop(self.tx);
        for handle in self.handles {
            if let Err(err) = handle.await {
                log::error!("import worker task failed: {err}");
            }
        }
    }
}

enum Enqueue {
    Sent,
    Fatal(LineError),
}

impl Importer {
    pub fn new(store: Arc<dyn Store>, files: Arc<dyn FileStore>, config: ImportConfig) -> Self {
        Self {
            store,
            files,
            config,
        }
    }

    /// Run one import over a manifest stream and an optional attachment
    /// archive. Returns the first fatal error, bound to its line number
    /// (line 0 when the failure cannot be attributed to a single line).
    pub async fn import(
        &self,
        input: &mut (dyn BufRead + Send),
        archive: Option<ImportArchive>,
    ) -> Result<(), LineError> {
        let _route = PrimaryRouteGuard::acquire(self.store.clone());
        let worker_count = self.config.worker_count.max(1);
        let ctx = Arc::new(ImportContext {
            store: self.store.clone(),
            files: self.files.clone(),
            archive: archive.map(Arc::new),
            dry_run: self.config.dry_run,
            max_profile_image_bytes: self.config.max_profile_image_bytes,
        });

        let mut reader = LineReader::new(input, self.config.max_line_bytes);
        reader.expect_version()?;

        // Sized so workers normally never block reporting; once it fills the
        // driver is already aborting and further errors may be dropped.
        let (err_tx, mut err_rx) = mpsc::channel::<LineError>(2 * worker_count + 1);

        let dispatched = Arc::new(AtomicU64::new(0));
        let _progress = ProgressLogger::start(dispatched.clone());

        let mut pool: Option<(RecordKind, WorkerPool)> = None;
        loop {
            let item = match reader.next_line() {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(err) => {
                    drain_active(&mut pool).await;
                    return Err(err);
                }
            };
            if matches!(item.line, ImportLine::Version { .. }) {
                drain_active(&mut pool).await;
                return Err(LineError::new(
                    item.line_number,
                    crate::error::ImportError::UnexpectedVersion,
                ));
            }

            let kind = item.line.kind();
            let mut item = item;
            resolve_attachments(&mut item.line, &self.config.base_path, ctx.archive.as_deref());

            let rotate = pool.as_ref().map(|(k, _)| *k != kind).unwrap_or(true);
            if rotate {
                if let Some((previous, old)) = pool.take() {
                    log::debug!("segment {previous} drained, starting {kind}");
                    old.drain().await;
                    check_reported_errors(&mut err_rx)?;
                }
                pool = Some((
                    kind,
                    WorkerPool::spawn(ctx.clone(), worker_count, err_tx.clone()),
                ));
            }

            if let Some((_, active)) = pool.as_ref() {
                let tx = active.tx.clone();
                match enqueue_racing(&tx, &mut err_rx, item).await {
                    Enqueue::Sent => {
                        dispatched.fetch_add(1, Ordering::Relaxed);
                    }
                    Enqueue::Fatal(err) => {
                        drain_active(&mut pool).await;
                        return Err(err);
                    }
                }
            }
        }

        drain_active(&mut pool).await;
        check_reported_errors(&mut err_rx)?;
        log::info!(
            "import finished, {} lines dispatched",
            dispatched.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

async fn drain_active(pool: &mut Option<(RecordKind, WorkerPool)>) {
    if let Some((_, pool)) = pool.take() {
        pool.drain().await;
    }
}

/// Inspect everything workers reported so far. Recoverable errors are logged
/// and skipped; the first fatal one aborts the run.
fn check_reported_errors(err_rx: &mut Receiver<LineError>) -> Result<(), LineError> {
    while let Ok(err) = err_rx.try_recv() {
        if err.source.is_recoverable() {
            log::warn!("skipping line {}: {}", err.line, err.source);
        } else {
            return Err(err);
        }
    }
    Ok(())
}

/// Enqueue one item, racing the bounded queue's backpressure against the
/// error channel so a fatal error does not have to wait for queue space.
async fn enqueue_racing(
    tx: &Sender<WorkItem>,
    err_rx: &mut Receiver<LineError>,
    item: WorkItem,
) -> Enqueue {
    let mut item = Some(item);
    loop {
        tokio::select! {
            permit = tx.reserve() => {
                if let (Ok(permit), Some(item)) = (permit, item.take()) {
                    permit.send(item);
                }
                return Enqueue::Sent;
            }
            reported = err_rx.recv() => {
                match reported {
                    Some(err) if err.source.is_recoverable() => {
                        log::warn!("skipping line {}: {}", err.line, err.source);
                    }
                    Some(err) => return Enqueue::Fatal(err),
                    // The driver holds a sender, so the channel cannot close
                    // mid-run; nothing left to race against.
                    None => return Enqueue::Sent,
                }
            }
        }
    }
}

/// Periodic progress log, aborted when the run ends.
struct ProgressLogger(JoinHandle<()>);

impl ProgressLogger {
    fn start(dispatched: Arc<AtomicU64>) -> Self {
        Self(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                log::info!(
                    "import in progress, {} lines dispatched",
                    dispatched.load(Ordering::Relaxed)
                );
            }
        }))
    }
}

impl Drop for ProgressLogger {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use crate::memory::{MemoryFileStore, MemoryStore};
    use std::io::Cursor;

    fn importer(store: Arc<MemoryStore>, config: ImportConfig) -> Importer {
        Importer::new(store, Arc::new(MemoryFileStore::new()), config)
    }

    fn manifest(lines: &[&str]) -> Cursor<Vec<u8>> {
        let mut data = String::from("{\"type\":\"version\",\"version\":1}\n");
        for line in lines {
            data.push_str(line);
            data.push('\n');
        }
        Cursor::new(data.into_bytes())
    }

    #[tokio::test]
    async fn imports_segments_in_file_order() {
        let store = Arc::new(MemoryStore::new());
        let importer = importer(store.clone(), ImportConfig::default());
        let mut input = manifest(&[
            r#"{"type":"team","team":{"name":"eng","display_name":"Engineering","type":"O"}}"#,
            r#"{"type":"channel","channel":{"team":"eng","name":"general","display_name":"General","type":"O"}}"#,
            r#"{"type":"user","user":{"username":"alice","email":"alice@example.com"}}"#,
        ]);
        importer.import(&mut input, None).await.unwrap();
        assert_eq!(store.team_count(), 1);
        assert_eq!(store.channel_count(), 1);
        assert_eq!(store.user_count(), 1);
        assert!(!store.routed_to_primary());
    }

    #[tokio::test]
    async fn version_record_mid_stream_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let importer = importer(store, ImportConfig::default());
        let mut input = manifest(&[
            r#"{"type":"team","team":{"name":"eng","display_name":"Engineering","type":"O"}}"#,
            r#"{"type":"version","version":1}"#,
        ]);
        let err = importer.import(&mut input, None).await.unwrap_err();
        assert_eq!(err.line, 3);
        assert!(matches!(err.source, ImportError::UnexpectedVersion));
    }

    #[tokio::test]
    async fn recoverable_direct_channel_error_skips_the_line() {
        let store = Arc::new(MemoryStore::new());
        let importer = importer(store.clone(), ImportConfig::default());
        let mut input = manifest(&[
            r#"{"type":"user","user":{"username":"alice","email":"alice@example.com"}}"#,
            r#"{"type":"user","user":{"username":"bob","email":"bob@example.com"}}"#,
            r#"{"type":"direct_channel","direct_channel":{"members":["alice"]}}"#,
            r#"{"type":"direct_channel","direct_channel":{"members":["alice","bob"]}}"#,
        ]);
        importer.import(&mut input, None).await.unwrap();
        assert_eq!(store.channel_count(), 1);
    }

    #[tokio::test]
    async fn fatal_worker_error_aborts_with_its_line() {
        let store = Arc::new(MemoryStore::new());
        let importer = importer(store.clone(), ImportConfig::default());
        let mut input = manifest(&[
            r#"{"type":"team","team":{"name":"eng","display_name":"Engineering","type":"O"}}"#,
            r#"{"type":"channel","channel":{"team":"ghost","name":"general","display_name":"General","type":"O"}}"#,
        ]);
        let err = importer.import(&mut input, None).await.unwrap_err();
        assert_eq!(err.line, 3);
        assert!(matches!(err.source, ImportError::ChannelNotFound(_) | ImportError::TeamNotFound(_)));
        assert!(!store.routed_to_primary());
    }

    #[tokio::test]
    async fn missing_payload_is_fatal_at_its_line() {
        let store = Arc::new(MemoryStore::new());
        let importer = importer(store, ImportConfig::default());
        let mut input = manifest(&[r#"{"type":"team"}"#]);
        let err = importer.import(&mut input, None).await.unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.source, ImportError::MissingPayload { .. }));
    }
}
