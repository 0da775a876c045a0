//! Memory-then-disk receiver with health-driven fallback.

use crate::contract::{
    ArtifactReader, DataReceiver, ReceiveContext, ReceiveSource, ReceiverState, Session, Tier,
};
use crate::error::{ReceiveError, ReceiveResult};
use crate::health::FallbackSignal;
use crate::metrics::{self, MEMORY_DESTINATION, TrafficMetrics, TrafficRecorder};
use async_trait::async_trait;
use bytes::BytesMut;
use depot_core::{
    DigestCalculator, Digests, HashFileLocator, ReceiveConfig, Throughput, random_temp_name,
};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, error, info, warn};

const SIZE_CHECK_ATTEMPTS: u32 = 3;
const SIZE_CHECK_DELAY: Duration = Duration::from_millis(100);

enum Sink {
    Memory(BytesMut),
    File(BufWriter<File>),
    /// The file is complete on disk, or the sink was torn down.
    Released,
}

/// Receiver that buffers in memory and spills to a temp file past a threshold.
///
/// A storage health monitor may request a move to a fallback root at any time
/// through the receiver's [`FallbackSignal`]; the move is applied before the
/// next write, at most once.
pub struct TieredReceiver {
    threshold: u64,
    buffer_len: usize,
    sharded: bool,
    enable_transfer: bool,
    root: PathBuf,
    filename: String,
    sink: Sink,
    in_memory: bool,
    received: u64,
    digest: DigestCalculator,
    signal: Arc<FallbackSignal>,
    fallback: bool,
    has_transferred: bool,
    traffic: Arc<dyn TrafficMetrics>,
    recorder: Option<(String, Arc<dyn TrafficRecorder>)>,
    created_dirs: Vec<PathBuf>,
    session: Session,
    closed: bool,
}

impl std::fmt::Debug for TieredReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredReceiver")
            .field("path", &self.file_path())
            .field("in_memory", &self.in_memory)
            .field("received", &self.received)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl TieredReceiver {
    pub fn new(
        config: &ReceiveConfig,
        expected_length: Option<u64>,
        context: &ReceiveContext,
    ) -> Self {
        Self {
            threshold: config.file_size_threshold,
            buffer_len: config.buffer_len(),
            sharded: config.sharded_path,
            enable_transfer: true,
            root: config.temp_path.clone(),
            filename: random_temp_name(),
            sink: Sink::Memory(BytesMut::new()),
            in_memory: true,
            received: 0,
            digest: DigestCalculator::new(),
            signal: Arc::new(FallbackSignal::new()),
            fallback: false,
            has_transferred: false,
            traffic: context.traffic.clone(),
            recorder: None,
            created_dirs: Vec::new(),
            session: Session::new(
                "tiered",
                expected_length,
                context.gate.clone(),
                config.circuit_breaker_threshold,
            ),
            closed: false,
        }
    }

    /// Allow or forbid copying on-disk data to a fallback root.
    pub fn with_transfer(mut self, enable: bool) -> Self {
        self.enable_transfer = enable;
        self
    }

    /// Signal the health monitor notifies.
    pub fn signal(&self) -> Arc<FallbackSignal> {
        self.signal.clone()
    }

    /// Record a fallback request. Applied before the next write.
    pub fn unhealthy(&self, fallback_path: Option<PathBuf>, reason: &str) {
        use crate::health::HealthObserver;
        self.signal.unhealthy(fallback_path, reason);
    }

    /// Path of the temp file, whether or not it exists yet.
    pub fn file_path(&self) -> PathBuf {
        self.dir_under(&self.root).join(&self.filename)
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Whether a fallback moved this receiver to a new root.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Bytes currently held in the memory buffer.
    pub fn cached_bytes(&self) -> usize {
        match &self.sink {
            Sink::Memory(buffer) => buffer.len(),
            Sink::File(_) | Sink::Released => 0,
        }
    }

    fn dir_under(&self, root: &Path) -> PathBuf {
        if self.sharded {
            HashFileLocator.locate_under(root, &self.filename)
        } else {
            root.to_path_buf()
        }
    }

    fn destination(&self) -> String {
        if self.in_memory {
            MEMORY_DESTINATION.to_string()
        } else {
            metrics::file_destination(&self.root)
        }
    }

    /// Write `data` to the active sink and run the post-write checks.
    /// Errors leave cleanup to the caller.
    async fn write(&mut self, data: &[u8]) -> ReceiveResult<()> {
        let received = self.received;
        self.session.begin();
        self.session.admit(data.len() as u64, received).await?;
        self.check_fallback().await?;

        let started = Instant::now();
        match &mut self.sink {
            Sink::Memory(buffer) => buffer.extend_from_slice(data),
            Sink::File(writer) => writer
                .write_all(data)
                .await
                .map_err(|e| ReceiveError::from_io(e, received))?,
            Sink::Released => {
                return Err(ReceiveError::precondition("tiered receiver sink released"));
            }
        }
        let elapsed = started.elapsed();

        self.digest.update(data);
        self.received += data.len() as u64;
        self.record_quiet(data.len() as u64, elapsed);
        self.check_threshold().await
    }

    fn record_quiet(&mut self, bytes: u64, elapsed: Duration) {
        let destination = self.destination();
        if self
            .recorder
            .as_ref()
            .is_none_or(|(current, _)| *current != destination)
        {
            match self.traffic.recorder(&destination) {
                Ok(recorder) => self.recorder = Some((destination, recorder)),
                Err(e) => {
                    error!(destination = %destination, error = %e, "Failed to build traffic recorder");
                    self.recorder = None;
                    return;
                }
            }
        }
        if let Some((destination, recorder)) = &self.recorder
            && let Err(e) = recorder.record(bytes, elapsed)
        {
            error!(destination = %destination, error = %e, "Failed to record write traffic");
        }
    }

    async fn check_threshold(&mut self) -> ReceiveResult<()> {
        if self.in_memory && self.received > self.threshold {
            self.spill().await?;
        }
        Ok(())
    }

    /// Move the memory buffer to a new temp file and make the file authoritative.
    pub async fn flush_to_file(&mut self) -> ReceiveResult<()> {
        if self.closed {
            return Err(ReceiveError::precondition("tiered receiver closed"));
        }
        if self.session.state() == ReceiverState::Failed {
            return Err(ReceiveError::precondition("tiered receiver already failed"));
        }
        if !self.in_memory {
            return Ok(());
        }
        let result = self.spill().await;
        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    async fn spill(&mut self) -> ReceiveResult<()> {
        let received = self.received;
        let path = self.file_path();
        let file = self
            .create_file(&path)
            .await
            .map_err(|e| ReceiveError::from_io(e, received))?;

        let Sink::Memory(buffer) = &self.sink else {
            return Ok(());
        };
        let mut writer = BufWriter::with_capacity(self.buffer_len, file);
        let written = async {
            writer.write_all(buffer).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            drop(writer);
            remove_quietly(&path).await;
            return Err(ReceiveError::from_io(e, received));
        }

        self.sink = Sink::File(writer);
        self.in_memory = false;
        metrics::record_flush();
        info!(path = %path.display(), bytes = received, "Spilled receive buffer to temp file");
        Ok(())
    }

    async fn create_file(&mut self, path: &Path) -> io::Result<File> {
        let Some(parent) = path.parent() else {
            return File::create(path).await;
        };
        self.track_dirs(create_missing_dirs(parent).await?);
        match File::create(path).await {
            // A concurrent cleanup may have removed an empty parent.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.track_dirs(create_missing_dirs(parent).await?);
                File::create(path).await
            }
            other => other,
        }
    }

    fn track_dirs(&mut self, dirs: Vec<PathBuf>) {
        for dir in dirs {
            if !self.created_dirs.contains(&dir) {
                self.created_dirs.push(dir);
            }
        }
    }

    /// Apply a pending fallback request, at most once per receiver.
    async fn check_fallback(&mut self) -> ReceiveResult<()> {
        if self.has_transferred {
            return Ok(());
        }
        let Some(request) = self.signal.take() else {
            return Ok(());
        };
        self.has_transferred = true;

        let Some(target) = request.path.filter(|p| *p != self.root) else {
            debug!(root = %self.root.display(), "Fallback target is the current root, nothing to move");
            metrics::record_fallback("noop");
            return Ok(());
        };

        if self.in_memory {
            info!(
                from = %self.root.display(),
                to = %target.display(),
                reason = %request.reason,
                "Redirecting future temp file to fallback root"
            );
            self.root = target;
            self.fallback = true;
            metrics::record_fallback("redirected");
            return Ok(());
        }

        if !self.enable_transfer {
            warn!(
                path = %self.file_path().display(),
                to = %target.display(),
                "Fallback requested but transfer is disabled, staying on current root"
            );
            metrics::record_fallback("declined");
            return Ok(());
        }

        self.transfer(target, &request.reason).await?;
        metrics::record_fallback("transferred");
        Ok(())
    }

    /// Copy the temp file under `target`, continue writing there, and remove
    /// the original.
    async fn transfer(&mut self, target: PathBuf, reason: &str) -> ReceiveResult<()> {
        let received = self.received;
        if let Sink::File(mut writer) = mem::replace(&mut self.sink, Sink::Released) {
            writer
                .shutdown()
                .await
                .map_err(|e| ReceiveError::from_io(e, received))?;
        }

        let source = self.file_path();
        let target_dir = self.dir_under(&target);
        let target_path = target_dir.join(&self.filename);
        let new_dirs = create_missing_dirs(&target_dir)
            .await
            .map_err(|e| ReceiveError::from_io(e, received))?;

        let copied = async {
            tokio::fs::copy(&source, &target_path).await?;
            OpenOptions::new().append(true).open(&target_path).await
        }
        .await;
        let file = match copied {
            Ok(file) => file,
            Err(e) => {
                remove_quietly(&target_path).await;
                let mut new_dirs = new_dirs;
                remove_created_dirs(&mut new_dirs).await;
                return Err(ReceiveError::from_io(e, received));
            }
        };

        let mut old_dirs = mem::replace(&mut self.created_dirs, new_dirs);
        self.sink = Sink::File(BufWriter::with_capacity(self.buffer_len, file));
        self.root = target;
        self.fallback = true;

        remove_quietly(&source).await;
        remove_created_dirs(&mut old_dirs).await;
        info!(
            from = %source.display(),
            to = %target_path.display(),
            bytes = received,
            reason,
            "Transferred temp file to fallback root"
        );
        Ok(())
    }

    async fn check_size(&self) -> ReceiveResult<()> {
        if let Sink::Memory(buffer) = &self.sink {
            let held = buffer.len() as u64;
            if held != self.received {
                return Err(ReceiveError::mismatch(
                    self.received,
                    format!("memory buffer holds {held} bytes"),
                ));
            }
            return Ok(());
        }

        let path = self.file_path();
        let mut on_disk = 0;
        for attempt in 1..=SIZE_CHECK_ATTEMPTS {
            on_disk = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ReceiveError::mismatch(
                        self.received,
                        format!("temp file {} is missing", path.display()),
                    ));
                }
                Err(e) => return Err(ReceiveError::from_io(e, self.received)),
            };
            if on_disk == self.received {
                return Ok(());
            }
            if attempt < SIZE_CHECK_ATTEMPTS {
                debug!(path = %path.display(), on_disk, received = self.received, "Temp file size lagging, retrying");
                tokio::time::sleep(SIZE_CHECK_DELAY).await;
            }
        }
        Err(ReceiveError::mismatch(
            self.received,
            format!("temp file {} holds {on_disk} bytes", path.display()),
        ))
    }

    async fn finish_inner(&mut self) -> ReceiveResult<()> {
        let received = self.received;
        if let Sink::File(writer) = &mut self.sink {
            writer
                .shutdown()
                .await
                .map_err(|e| ReceiveError::from_io(e, received))?;
            self.sink = Sink::Released;
        }
        self.check_size().await
    }

    async fn abort(&mut self, err: &ReceiveError) {
        self.session.fail(err);
        if let Err(e) = self.cleanup().await {
            warn!(path = %self.file_path().display(), error = %e, "Cleanup after failed receive incomplete");
        }
    }

    /// Release the sink, delete the temp file and any directories created for it.
    async fn cleanup(&mut self) -> io::Result<()> {
        if let Sink::File(mut writer) = mem::replace(&mut self.sink, Sink::Released)
            && let Err(e) = writer.shutdown().await
        {
            debug!(error = %e, "Failed to close temp file before removal");
        }

        let mut result = Ok(());
        if !self.in_memory {
            let path = self.file_path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "Removed temp file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove temp file");
                    result = Err(e);
                }
            }
        }
        remove_created_dirs(&mut self.created_dirs).await;
        result
    }
}

#[async_trait]
impl DataReceiver for TieredReceiver {
    async fn receive_chunk(&mut self, chunk: &[u8]) -> ReceiveResult<()> {
        self.session.ensure_receiving()?;
        if chunk.is_empty() {
            return Ok(());
        }
        let result = self.write(chunk).await;
        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    async fn receive_byte(&mut self, byte: u8) -> ReceiveResult<()> {
        self.receive_chunk(&[byte]).await
    }

    async fn receive_stream(&mut self, source: ReceiveSource<'_>) -> ReceiveResult<u64> {
        self.session.ensure_receiving()?;
        let mut buf = vec![0u8; self.buffer_len];
        let mut total = 0u64;
        let result = loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break Ok(total),
                Ok(n) => n,
                Err(e) => break Err(ReceiveError::from_io(e, self.received)),
            };
            if let Err(e) = self.write(&buf[..n]).await {
                break Err(e);
            }
            total += n as u64;
        };

        self.session.gate().finish_check(result.as_ref().err());
        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    async fn finish(&mut self) -> ReceiveResult<Throughput> {
        if let Some(done) = self.session.finished_result() {
            return done;
        }
        if self.closed {
            return Err(ReceiveError::precondition("tiered receiver closed"));
        }
        match self.finish_inner().await {
            Ok(()) => Ok(self.session.complete(self.received)),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn get_input_stream(&self) -> ReceiveResult<ArtifactReader> {
        self.session.ensure_finished()?;
        if self.closed {
            return Err(ReceiveError::precondition("tiered receiver closed"));
        }
        if let Sink::Memory(buffer) = &self.sink {
            let bytes = buffer.clone().freeze();
            return Ok(Box::pin(io::Cursor::new(bytes)));
        }
        let file = File::open(self.file_path())
            .await
            .map_err(|e| ReceiveError::from_io(e, self.received))?;
        Ok(Box::pin(BufReader::new(file)))
    }

    async fn close(&mut self) -> ReceiveResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.signal.close();
        self.session.abandon();
        self.cleanup().await.map_err(|e| ReceiveError::StorageFailure {
            received: self.received,
            source: Box::new(e),
        })
    }

    fn received(&self) -> u64 {
        self.received
    }

    fn state(&self) -> ReceiverState {
        self.session.state()
    }

    fn tier(&self) -> Tier {
        if self.in_memory { Tier::Memory } else { Tier::File }
    }

    fn location(&self) -> String {
        if self.in_memory {
            MEMORY_DESTINATION.to_string()
        } else {
            self.file_path().display().to_string()
        }
    }

    fn digests(&self) -> Digests {
        self.digest.digests()
    }

    fn expected_length(&self) -> Option<u64> {
        self.session.expected_length()
    }

    fn throughput(&self) -> Option<Throughput> {
        self.session.throughput()
    }
}

impl Drop for TieredReceiver {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.signal.close();
        if !self.in_memory {
            let path = self.file_path();
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove temp file on drop");
            }
        }
        sort_deepest_first(&mut self.created_dirs);
        for dir in &self.created_dirs {
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
        }
    }
}

/// Create `dir` and its missing ancestors, returning the ones created,
/// deepest first.
async fn create_missing_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(candidate) = current {
        if tokio::fs::try_exists(candidate).await? {
            break;
        }
        missing.push(candidate.to_path_buf());
        current = candidate.parent().filter(|p| !p.as_os_str().is_empty());
    }
    if !missing.is_empty() {
        tokio::fs::create_dir_all(dir).await?;
        debug!(dir = %dir.display(), created = missing.len(), "Created temp directories");
    }
    Ok(missing)
}

fn sort_deepest_first(dirs: &mut [PathBuf]) {
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
}

/// Remove directories this receiver created, deepest first. Stops at the
/// first one that is not empty.
async fn remove_created_dirs(dirs: &mut Vec<PathBuf>) {
    sort_deepest_first(dirs);
    for dir in dirs.drain(..) {
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Removed temp directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Temp directory kept");
                break;
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}
