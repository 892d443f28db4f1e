//! The compilation lock state machine.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt;
use kiln_common::ContentHash;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::LockError;

/// Observable state of a [`CompilationLock`].
///
/// `in_use` counts sessions that hold the lock or are waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Accepting new sessions.
    Open {
        /// Holders plus registered waiters.
        in_use: usize,
    },
    /// Refusing new sessions; registered ones may still run.
    Draining {
        /// Holders plus registered waiters still to finish.
        in_use: usize,
    },
    /// Drained with nothing left in flight. Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Draining,
    Closed,
}

struct Inner {
    phase: Phase,
    in_use: usize,
    owner: Option<ThreadId>,
    depth: usize,
    file: Option<File>,
}

/// Serializes compilations for one application across threads and processes.
///
/// Acquisition is re-entrant per thread: a thread that already holds the
/// lock gets a nested guard immediately. The in-process owner slot is always
/// claimed before the named file lock, and released after it.
pub struct CompilationLock {
    name: String,
    lock_path: PathBuf,
    inner: Mutex<Inner>,
    released: Condvar,
}

impl CompilationLock {
    /// Creates a lock for the application identified by `identity`
    /// (typically its physical root), whose named lock file lives in
    /// `lock_dir`.
    pub fn new(lock_dir: &Path, identity: &str) -> Self {
        let digest = ContentHash::from_bytes(identity.to_lowercase().as_bytes()).to_string();
        let lock_path = lock_dir.join(format!("{}.lock", &digest[..16]));
        Self {
            name: identity.to_string(),
            lock_path,
            inner: Mutex::new(Inner {
                phase: Phase::Open,
                in_use: 0,
                owner: None,
                depth: 0,
                file: None,
            }),
            released: Condvar::new(),
        }
    }

    /// The application identity this lock protects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path of the named lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Returns the current state.
    pub fn state(&self) -> LockState {
        let inner = self.inner.lock();
        match inner.phase {
            Phase::Open => LockState::Open {
                in_use: inner.in_use,
            },
            Phase::Draining => LockState::Draining {
                in_use: inner.in_use,
            },
            Phase::Closed => LockState::Closed,
        }
    }

    /// Returns `true` if the calling thread currently holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.inner.lock().owner == Some(thread::current().id())
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// Fails immediately with [`LockError::Drained`] once draining has begun,
    /// unless the calling thread already holds the lock. A caller that
    /// registered before draining began still gets the lock.
    pub fn acquire(&self) -> Result<CompilationGuard<'_>, LockError> {
        let me = thread::current().id();
        let mut inner = self.inner.lock();

        if inner.owner == Some(me) {
            inner.depth += 1;
            return Ok(CompilationGuard::new(self));
        }
        if inner.phase != Phase::Open {
            debug!(lock = %self.name, "acquire refused, lock is draining");
            return Err(LockError::Drained {
                name: self.name.clone(),
            });
        }

        inner.in_use += 1;
        while inner.owner.is_some() {
            self.released.wait(&mut inner);
        }
        inner.owner = Some(me);
        inner.depth = 1;
        drop(inner);

        // From here on the guard releases the in-process slot on every exit
        // path, including a failure to take the named lock below.
        let guard = CompilationGuard::new(self);
        let file = self.lock_named()?;
        self.inner.lock().file = Some(file);
        debug!(lock = %self.name, "compilation lock acquired");
        Ok(guard)
    }

    fn lock_named(&self) -> Result<File, LockError> {
        let io_err = |source: std::io::Error| LockError::Io {
            path: self.lock_path.clone(),
            source,
        };
        if let Some(dir) = self.lock_path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(io_err)?;
        file.lock_exclusive().map_err(io_err)?;
        Ok(file)
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth > 0 {
            return;
        }

        if let Some(file) = inner.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(lock = %self.name, error = %e, "failed to unlock named lock file");
            }
        }
        inner.owner = None;
        inner.in_use = inner.in_use.saturating_sub(1);
        if inner.phase == Phase::Draining && inner.in_use == 0 {
            inner.phase = Phase::Closed;
            info!(lock = %self.name, "compilation lock closed");
        }
        drop(inner);

        debug!(lock = %self.name, "compilation lock released");
        self.released.notify_all();
    }

    /// Stops accepting new sessions.
    ///
    /// Returns `true` if this call started the drain. With nothing in flight
    /// the lock closes immediately.
    pub fn begin_drain(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Open {
            return false;
        }
        inner.phase = if inner.in_use == 0 {
            Phase::Closed
        } else {
            Phase::Draining
        };
        info!(lock = %self.name, in_use = inner.in_use, "compilation lock draining");
        drop(inner);
        self.released.notify_all();
        true
    }

    /// Begins draining and waits up to `timeout` for in-flight sessions to
    /// finish. Returns `true` if the lock reached [`LockState::Closed`].
    pub fn drain(&self, timeout: Duration) -> bool {
        self.begin_drain();
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.phase != Phase::Closed {
            if self.released.wait_until(&mut inner, deadline).timed_out() {
                return inner.phase == Phase::Closed;
            }
        }
        true
    }
}

impl std::fmt::Debug for CompilationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationLock")
            .field("name", &self.name)
            .field("lock_path", &self.lock_path)
            .field("state", &self.state())
            .finish()
    }
}

/// Proof that the calling thread holds a [`CompilationLock`].
///
/// Dropping the guard releases one level of the session; the named lock is
/// released when the outermost guard drops. Guards stay on the thread that
/// acquired them.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct CompilationGuard<'a> {
    lock: &'a CompilationLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> CompilationGuard<'a> {
    fn new(lock: &'a CompilationLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for CompilationGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
