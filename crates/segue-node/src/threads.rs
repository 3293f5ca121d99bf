//! Application thread creation.
//!
//! The legacy API lets applications (and wrappers around them) take over
//! thread creation. The creator is an injected capability with a
//! process-wide default; "kill" is cooperative: a cancel token plus join.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Polled by thread bodies that want to honor `kill_thread`.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A thread created on behalf of the application.
pub struct ClientThread {
    handle: JoinHandle<()>,
    token: CancelToken,
}

impl ClientThread {
    pub fn new(handle: JoinHandle<()>, token: CancelToken) -> ClientThread {
        ClientThread { handle, token }
    }
}

pub type ThreadBody = Box<dyn FnOnce(CancelToken) + Send + 'static>;

/// Replacement thread-creation function.
pub type ThreadCreator =
    Arc<dyn Fn(bool, i32, ThreadBody) -> io::Result<ClientThread> + Send + Sync>;

static CREATOR: Mutex<Option<ThreadCreator>> = Mutex::new(None);

fn default_creator(realtime: bool, priority: i32, body: ThreadBody) -> io::Result<ClientThread> {
    debug!(realtime, priority, "creating client thread");
    let token = CancelToken::default();
    let thread_token = token.clone();
    let handle = std::thread::Builder::new()
        .name("segue-client".to_string())
        .spawn(move || body(thread_token))?;
    Ok(ClientThread::new(handle, token))
}

/// Install (or with `None` reset) the process-wide creator.
pub fn set_thread_creator(creator: Option<ThreadCreator>) {
    *CREATOR.lock() = creator;
}

/// Create a thread through the installed creator.
pub fn create_thread(realtime: bool, priority: i32, body: ThreadBody) -> io::Result<ClientThread> {
    let creator = CREATOR.lock().clone();
    match creator {
        Some(f) => f(realtime, priority, body),
        None => default_creator(realtime, priority, body),
    }
}

/// Wait for a thread to finish on its own.
pub fn stop_thread(thread: ClientThread) -> io::Result<()> {
    debug!("joining client thread");
    thread
        .handle
        .join()
        .map_err(|_| io::Error::other("client thread panicked"))
}

/// Ask a thread to stop, then wait for it.
pub fn kill_thread(thread: ClientThread) -> io::Result<()> {
    debug!("cancelling client thread");
    thread.token.cancel();
    stop_thread(thread)
}

/// Scheduling-class changes are the creator hook's business.
pub fn acquire_real_time_scheduling(_priority: i32) -> io::Result<()> {
    tracing::warn!("realtime scheduling changes not implemented");
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

pub fn drop_real_time_scheduling() -> io::Result<()> {
    tracing::warn!("realtime scheduling changes not implemented");
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
