//! Background descriptor fetch.
//!
//! Pre-compilation wants descriptor blobs without stalling the render
//! thread, so reads happen on a worker thread and results stream back over
//! a channel. Requests that cannot produce a descriptor (unknown hash,
//! invalid-flagged entry, unresolvable file) complete immediately with
//! `valid == false` and never touch the disk.

use crate::codec::decode_descriptor;
use crate::descriptor::PipelineDescriptor;
use crate::error::{CacheError, Result};
use ahash::AHashMap;
use crossbeam::channel::{
    unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// One resolved read the worker will perform.
#[derive(Clone, Debug)]
pub(crate) struct FetchJob {
    pub hash: u32,
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

/// Outcome of one fetch request. `descriptor` is present exactly when
/// `valid` is true.
#[derive(Debug)]
pub struct FetchResult {
    pub hash: u32,
    pub valid: bool,
    pub descriptor: Option<PipelineDescriptor>,
}

impl FetchResult {
    fn invalid(hash: u32) -> Self {
        FetchResult {
            hash,
            valid: false,
            descriptor: None,
        }
    }
}

/// Handle to an in-flight batch of fetches.
///
/// Results arrive in no particular order. Dropping the stream abandons any
/// reads still queued; the worker notices and stops.
pub struct FetchStream {
    rx: Receiver<FetchResult>,
    /// Result pulled off the channel by `is_ready`, handed out on the next
    /// take.
    ready: Option<FetchResult>,
    remaining: usize,
}

impl FetchStream {
    /// True when at least one result can be taken without blocking, or the
    /// batch is exhausted. A dead worker counts as exhaustion so pollers
    /// never wait on results that will not come.
    pub fn is_ready(&mut self) -> bool {
        if self.remaining == 0 || self.ready.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.ready = Some(result);
                true
            }
            Err(TryRecvError::Disconnected) => {
                self.remaining = 0;
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Non-blocking poll.
    pub fn try_next(&mut self) -> Option<FetchResult> {
        if self.remaining == 0 {
            return None;
        }
        if let Some(result) = self.ready.take() {
            self.remaining -= 1;
            return Some(result);
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.remaining -= 1;
                Some(result)
            }
            Err(TryRecvError::Disconnected) => {
                self.remaining = 0;
                None
            }
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Block for the next result up to `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<FetchResult> {
        if self.remaining == 0 {
            return None;
        }
        if let Some(result) = self.ready.take() {
            self.remaining -= 1;
            return Some(result);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                self.remaining -= 1;
                Some(result)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.remaining = 0;
                None
            }
            Err(RecvTimeoutError::Timeout) => None,
        }
    }

    /// Results not yet taken from the stream.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for FetchStream {
    type Item = FetchResult;

    fn next(&mut self) -> Option<FetchResult> {
        if self.remaining == 0 {
            return None;
        }
        if let Some(result) = self.ready.take() {
            self.remaining -= 1;
            return Some(result);
        }
        match self.rx.recv() {
            Ok(result) => {
                self.remaining -= 1;
                Some(result)
            }
            // Worker died; report the batch as finished.
            Err(_) => {
                self.remaining = 0;
                None
            }
        }
    }
}

/// Start a fetch batch. `invalid` hashes complete immediately; `jobs` are
/// served by a detached worker thread, one file open per distinct path.
pub(crate) fn spawn_fetch(invalid: Vec<u32>, jobs: Vec<FetchJob>) -> FetchStream {
    let remaining = invalid.len() + jobs.len();
    let (tx, rx) = unbounded();

    for hash in invalid {
        // Unbounded channel; send cannot block and the receiver is alive.
        let _ = tx.send(FetchResult::invalid(hash));
    }

    if !jobs.is_empty() {
        std::thread::spawn(move || run_worker(jobs, tx));
    }

    FetchStream {
        rx,
        ready: None,
        remaining,
    }
}

fn run_worker(jobs: Vec<FetchJob>, tx: Sender<FetchResult>) {
    let mut files: AHashMap<PathBuf, Option<File>> = AHashMap::new();

    for job in jobs {
        let result = match read_job(&mut files, &job) {
            Ok(descriptor) => FetchResult {
                hash: job.hash,
                valid: true,
                descriptor: Some(descriptor),
            },
            Err(err) => {
                warn!(hash = job.hash, %err, "descriptor fetch failed");
                FetchResult::invalid(job.hash)
            }
        };
        if tx.send(result).is_err() {
            // Stream dropped; abandon the rest of the batch.
            debug!("fetch stream dropped, cancelling remaining reads");
            return;
        }
    }
}

fn read_job(
    files: &mut AHashMap<PathBuf, Option<File>>,
    job: &FetchJob,
) -> Result<PipelineDescriptor> {
    let file = match files.entry(job.path.clone()) {
        std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(File::open(&job.path).ok())
        }
    };
    let file = file.as_mut().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "cache file unavailable")
    })?;
    let len = file.metadata()?.len();
    if job.offset.checked_add(job.size).map_or(true, |end| end > len) {
        return Err(CacheError::CorruptToc("blob range past end of file".into()));
    }
    file.seek(SeekFrom::Start(job.offset))?;
    let mut blob = vec![0u8; job.size as usize];
    file.read_exact(&mut blob)?;
    decode_descriptor(&blob)
}
