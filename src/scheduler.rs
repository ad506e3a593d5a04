// =============================================================================
// DRIFTBRIDGE v1.3 - Worker Pool and Timer
// =============================================================================
//
// Blocking-RPC concurrency: a pool of worker threads sized to hardware
// concurrency drains a job channel, and a dedicated timer thread posts the
// periodic checks every 15 seconds. The timer never blocks on RPC itself,
// it only dispatches.
//
// =============================================================================

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Worker Pool
// =============================================================================

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver: Arc<Mutex<Receiver<Job>>> = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("driftbridge-worker-{}", i))
                .spawn(move || loop {
                    let job = { receiver.lock().unwrap().recv() };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break, // channel closed on stop
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        WorkerPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job; dropped silently after stop.
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Close the channel and join every worker.
    pub fn stop(&self) {
        self.sender.lock().unwrap().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }

    pub fn size(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Timer
// =============================================================================

/// Fires a callback on a fixed interval until stopped. The callback runs on
/// the timer thread and is expected to only post work elsewhere.
pub struct Timer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn start<F: FnMut() + Send + 'static>(interval: Duration, mut tick: F) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop2 = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("driftbridge-timer".to_string())
            .spawn(move || {
                let (lock, cvar) = &*stop2;
                loop {
                    let mut stopped = lock.lock().unwrap();
                    let result = cvar
                        .wait_timeout_while(stopped, interval, |s| !*s)
                        .unwrap();
                    stopped = result.0;
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    tick();
                }
            })
            .expect("failed to spawn timer thread");

        Timer {
            stop,
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_runs_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(4);
        for _ in 0..32 {
            let c = Arc::clone(&counter);
            pool.post(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_pool_post_after_stop_is_noop() {
        let pool = WorkerPool::new(1);
        pool.stop();
        pool.post(|| panic!("must not run"));
    }

    #[test]
    fn test_timer_fires_and_cancels() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let mut timer = Timer::start(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        timer.cancel();
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 2, "timer fired {} times", fired);

        // no further ticks after cancel
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }
}
