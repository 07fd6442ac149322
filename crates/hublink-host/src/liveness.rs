//! Client liveness monitoring.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::callback::CallbackRef;
use crate::client_id::Pid;

/// Reports when a connected client becomes unreachable.
///
/// `link` and `unlink` are bookkeeping only and must not block; the manager
/// calls them while holding its lock.
pub trait LivenessMonitor: Send + Sync {
    /// Start watching `pid`. Returns `false` if it cannot be watched.
    fn link(&self, pid: Pid, callback: &CallbackRef) -> bool;

    /// Stop watching the registration made by [`link`](Self::link).
    fn unlink(&self, pid: Pid, callback: &CallbackRef);
}

type DeathHandler = Box<dyn Fn(Pid) + Send + Sync>;

struct WatchState {
    /// Live links per pid.
    watched: HashMap<Pid, usize>,
    stopping: bool,
    thread: Option<(ThreadId, JoinHandle<()>)>,
}

struct Shared {
    state: Mutex<WatchState>,
    wake: Condvar,
    poll_interval: Duration,
    on_death: DeathHandler,
}

/// Detects client death by polling process existence.
///
/// The polling thread starts on the first `link`. Deaths are reported to
/// the handler outside any internal lock.
pub struct ProcessWatcher {
    shared: Arc<Shared>,
}

impl ProcessWatcher {
    pub fn new(poll_interval: Duration, on_death: impl Fn(Pid) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WatchState {
                    watched: HashMap::new(),
                    stopping: false,
                    thread: None,
                }),
                wake: Condvar::new(),
                poll_interval,
                on_death: Box::new(on_death),
            }),
        }
    }

    /// Pids currently watched.
    pub fn watched(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = lock(&self.shared.state).watched.keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

impl LivenessMonitor for ProcessWatcher {
    fn link(&self, pid: Pid, _callback: &CallbackRef) -> bool {
        if pid <= 0 {
            return false;
        }
        let mut state = lock(&self.shared.state);
        if state.stopping {
            return false;
        }
        if state.thread.is_none() {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("hublink-liveness".to_string())
                .spawn(move || poll_loop(shared));
            match spawned {
                Ok(handle) => state.thread = Some((handle.thread().id(), handle)),
                Err(err) => {
                    warn!(%err, "failed to start liveness thread");
                    return false;
                }
            }
        }
        *state.watched.entry(pid).or_insert(0) += 1;
        debug!(pid, "watching client process");
        true
    }

    fn unlink(&self, pid: Pid, _callback: &CallbackRef) {
        let mut state = lock(&self.shared.state);
        if let Some(links) = state.watched.get_mut(&pid) {
            *links -= 1;
            if *links == 0 {
                state.watched.remove(&pid);
                debug!(pid, "stopped watching client process");
            }
        }
    }
}

impl Drop for ProcessWatcher {
    fn drop(&mut self) {
        let thread = {
            let mut state = lock(&self.shared.state);
            state.stopping = true;
            state.thread.take()
        };
        self.shared.wake.notify_all();
        if let Some((id, handle)) = thread {
            // Dropped from inside a death report: the loop exits on its own.
            if id != thread::current().id() && handle.join().is_err() {
                warn!("liveness thread panicked");
            }
        }
    }
}

fn poll_loop(shared: Arc<Shared>) {
    loop {
        let dead: Vec<Pid> = {
            let state = lock(&shared.state);
            // Checks `stopping` before sleeping so an early stop is not missed.
            let waited = shared
                .wake
                .wait_timeout_while(state, shared.poll_interval, |state| !state.stopping);
            let mut state = match waited {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            if state.stopping {
                return;
            }
            let dead: Vec<Pid> = state
                .watched
                .keys()
                .copied()
                .filter(|&pid| !process_alive(pid))
                .collect();
            for pid in &dead {
                state.watched.remove(pid);
            }
            dead
        };

        for pid in dead {
            info!(pid, "client process exited");
            (shared.on_death)(pid);
        }
    }
}

fn lock(state: &Mutex<WatchState>) -> MutexGuard<'_, WatchState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Whether a process with `pid` exists.
pub fn process_alive(pid: Pid) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs the existence and permission check only.
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::callback::{AsyncEventType, ContextHubCallback, ContextHubMessage, NanoappInfo};

    struct Silent;

    impl ContextHubCallback for Silent {
        fn handle_nanoapp_info(&self, _apps: &[NanoappInfo]) {}
        fn handle_context_hub_message(&self, _message: &ContextHubMessage, _permissions: &[String]) {}
        fn handle_transaction_result(&self, _transaction_id: u32, _success: bool) {}
        fn handle_context_hub_async_event(&self, _event: AsyncEventType) {}
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id() as Pid));
        assert!(!process_alive(0));
        assert!(!process_alive(-4));
    }

    #[test]
    fn links_are_counted_per_pid() {
        let watcher = ProcessWatcher::new(Duration::from_secs(60), |_| {});
        let callback: CallbackRef = Arc::new(Silent);
        let pid = std::process::id() as Pid;

        assert!(watcher.link(pid, &callback));
        assert!(watcher.link(pid, &callback));
        watcher.unlink(pid, &callback);
        assert_eq!(watcher.watched(), vec![pid]);
        watcher.unlink(pid, &callback);
        assert!(watcher.watched().is_empty());

        assert!(!watcher.link(0, &callback));
    }

    #[test]
    fn drop_does_not_wait_out_the_poll_interval() {
        let watcher = ProcessWatcher::new(Duration::from_secs(10), |_| {});
        let callback: CallbackRef = Arc::new(Silent);
        assert!(watcher.link(std::process::id() as Pid, &callback));

        let started = Instant::now();
        drop(watcher);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn reports_exited_child() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as Pid;
        child.wait().unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let watcher = ProcessWatcher::new(Duration::from_millis(10), move |pid| {
            let _ = tx.lock().unwrap().send(pid);
        });
        let callback: CallbackRef = Arc::new(Silent);
        assert!(watcher.link(pid, &callback));

        let started = Instant::now();
        let reported = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reported, pid);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(watcher.watched().is_empty());
    }
}
