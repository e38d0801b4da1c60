//! Live content publisher
//!
//! A background task rewrites the clock file's content on a fixed interval
//! and asks the kernel to drop its cached copy, so a reader that reopens the
//! file sees the new timestamp.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Upper bound on published content
pub const MAX_CONTENT_LEN: usize = 64;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

const TIMESTAMP_FORMAT: &str = "%y/%m/%d %H:%M:%S%.3f%z\n";

/// Content as of one publish
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Bytes,
    pub modified: SystemTime,
}

/// Shared file content, replaced wholesale on every publish
#[derive(Debug)]
pub struct ContentBuffer {
    current: RwLock<Snapshot>,
}

impl ContentBuffer {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Snapshot {
                data: Bytes::new(),
                modified: SystemTime::now(),
            }),
        }
    }

    /// Replace the content; anything past `MAX_CONTENT_LEN` is dropped
    pub fn publish(&self, data: impl Into<Bytes>, modified: SystemTime) {
        let mut data: Bytes = data.into();
        data.truncate(MAX_CONTENT_LEN);
        *self.current.write() = Snapshot { data, modified };
    }

    /// Publish the current local time
    pub fn publish_now(&self) {
        let now = Local::now();
        self.publish(format_timestamp(&now), now.into());
    }

    pub fn snapshot(&self) -> Snapshot {
        self.current.read().clone()
    }

    pub fn len(&self) -> usize {
        self.current.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContentBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Render `yy/mm/dd HH:MM:SS.mmm+hhmm` followed by a newline
pub fn format_timestamp<Tz>(time: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Kernel cache invalidation channel
pub trait Invalidator: Send + Sync + 'static {
    fn invalidate_inode(&self, ino: u64) -> io::Result<()>;
}

impl Invalidator for fuser::Notifier {
    fn invalidate_inode(&self, ino: u64) -> io::Result<()> {
        // Whole file: offset 0, length 0
        self.inval_inode(ino, 0, 0)
    }
}

/// One-shot stop request for a background task
///
/// A trigger that arrives while the task is busy is kept until the task next
/// waits.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<Notify>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.notify_one();
    }

    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

/// Periodic content refresher for one file
pub struct ClockPublisher<I> {
    content: Arc<ContentBuffer>,
    invalidator: I,
    inode: u64,
    interval: Duration,
    shutdown: ShutdownSignal,
}

impl<I: Invalidator> ClockPublisher<I> {
    pub fn new(content: Arc<ContentBuffer>, invalidator: I, inode: u64, interval: Duration) -> Self {
        Self {
            content,
            invalidator,
            inode,
            interval,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Stop on an externally owned signal as well
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Publish once and invalidate the kernel's copy
    pub fn refresh(&self) {
        self.content.publish_now();
        match self.invalidator.invalidate_inode(self.inode) {
            Ok(()) => {}
            // Nobody has looked the file up yet
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                debug!("inode {} not cached by kernel yet", self.inode);
            }
            Err(e) => error!("Failed to invalidate inode {}: {}", self.inode, e),
        }
    }

    /// Run the refresh loop on `runtime` until stopped
    pub fn spawn(self, runtime: &Handle) -> PublisherHandle {
        let shutdown = self.shutdown.clone();
        let task = runtime.spawn(async move {
            info!(
                "Clock publisher started for inode {} with interval {:?}",
                self.inode, self.interval
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => self.refresh(),
                    _ = self.shutdown.wait() => {
                        info!("Clock publisher for inode {} shutting down", self.inode);
                        break;
                    }
                }
            }
        });
        PublisherHandle { shutdown, task }
    }
}

/// Owner of a running publisher task
#[derive(Debug)]
pub struct PublisherHandle {
    shutdown: ShutdownSignal,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait for it to exit
    pub async fn stop(self) {
        self.shutdown.trigger();
        if let Err(e) = self.task.await {
            error!("Clock publisher task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<u64>>,
        fail_with: Option<i32>,
    }

    impl Invalidator for Arc<Recorder> {
        fn invalidate_inode(&self, ino: u64) -> io::Result<()> {
            self.calls.lock().push(ino);
            match self.fail_with {
                Some(code) => Err(io::Error::from_raw_os_error(code)),
                None => Ok(()),
            }
        }
    }

    fn parse(data: &[u8]) -> DateTime<FixedOffset> {
        let text = std::str::from_utf8(data).unwrap();
        assert!(text.ends_with('\n'));
        DateTime::parse_from_str(text.trim_end(), "%y/%m/%d %H:%M:%S%.3f%z").unwrap()
    }

    #[test]
    fn test_format_timestamp() {
        let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let naive = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(7, 5, 3, 42)
            .unwrap();
        let time = offset.from_local_datetime(&naive).unwrap();
        assert_eq!(format_timestamp(&time), "24/03/09 07:05:03.042+0530\n");

        let west = FixedOffset::west_opt(8 * 3600).unwrap();
        let time = west.from_local_datetime(&naive).unwrap();
        assert_eq!(format_timestamp(&time), "24/03/09 07:05:03.042-0800\n");
    }

    #[test]
    fn test_publish_replaces_snapshot() {
        let buf = ContentBuffer::new();
        assert!(buf.is_empty());

        let held = buf.snapshot();
        buf.publish_now();
        assert!(held.data.is_empty());

        let snap = buf.snapshot();
        assert_eq!(snap.data.len(), buf.len());
        parse(&snap.data);
    }

    #[test]
    fn test_publish_is_bounded() {
        let buf = ContentBuffer::new();
        buf.publish(vec![b'x'; 100], SystemTime::now());
        assert_eq!(buf.len(), MAX_CONTENT_LEN);
    }

    #[tokio::test]
    async fn test_loop_refreshes_and_invalidates() {
        let content = Arc::new(ContentBuffer::new());
        let recorder = Arc::new(Recorder::default());
        let handle = ClockPublisher::new(
            Arc::clone(&content),
            Arc::clone(&recorder),
            2,
            Duration::from_millis(10),
        )
        .spawn(&Handle::current());

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        let calls = recorder.calls.lock().clone();
        assert!(calls.len() >= 2, "only {} refreshes", calls.len());
        assert!(calls.iter().all(|&ino| ino == 2));
        parse(&content.snapshot().data);
    }

    #[tokio::test]
    async fn test_missing_inode_is_not_fatal() {
        let recorder = Arc::new(Recorder {
            fail_with: Some(libc::ENOENT),
            ..Default::default()
        });
        let handle = ClockPublisher::new(
            Arc::new(ContentBuffer::new()),
            Arc::clone(&recorder),
            2,
            Duration::from_millis(10),
        )
        .spawn(&Handle::current());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        handle.stop().await;
        assert!(recorder.calls.lock().len() >= 2);
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_interval() {
        let handle = ClockPublisher::new(
            Arc::new(ContentBuffer::new()),
            Arc::new(Recorder::default()),
            2,
            Duration::from_secs(3600),
        )
        .spawn(&Handle::current());

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("publisher did not stop");
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_kept() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let recorder = Arc::new(Recorder::default());
        let handle = ClockPublisher::new(
            Arc::new(ContentBuffer::new()),
            Arc::clone(&recorder),
            2,
            Duration::from_secs(3600),
        )
        .with_shutdown(signal)
        .spawn(&Handle::current());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stored signal was lost");
        assert!(recorder.calls.lock().is_empty());
    }
}
