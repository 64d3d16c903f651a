//! # Stage workers
//!
//! Every pipeline stage runs its own thread pulling from a bounded
//! input channel, so independent frames and sift sequences can be in
//! flight at different stages simultaneously. The wait on
//! each iteration is bounded by the configured idle timeout rather than
//! blocking forever, so a stopped session's threads notice
//! `should_stop` promptly instead of waiting for one more item that may
//! never arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

/// A running stage loop. Dropping it requests a stop but does not block;
/// call `join` to wait for the thread to actually exit.
pub struct StageWorker {
    should_stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StageWorker {
    /// Spawn a thread that repeatedly pulls one item from `input` and
    /// runs `process` on it, until the channel disconnects or `stop` is
    /// called.
    pub fn spawn<T: Send + 'static>(
        name: &'static str,
        input: Receiver<T>,
        idle_timeout: Duration,
        mut process: impl FnMut(T) + Send + 'static,
    ) -> StageWorker {
        let should_stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&should_stop);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    match input.recv_timeout(idle_timeout) {
                        Ok(item) => process(item),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn stage worker thread");

        StageWorker { should_stop, handle: Some(handle) }
    }

    /// Request the loop stop at its next idle-timeout check. Does not
    /// block.
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }

    pub fn is_stopping(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    /// Request a stop and block until the thread has exited.
    pub fn join(mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StageWorker {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn processes_items_in_order() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_worker = Arc::clone(&seen);

        let worker = StageWorker::spawn("test-stage", rx, Duration::from_millis(20), move |item: i32| {
            seen_worker.lock().unwrap().push(item);
        });

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        worker.join();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn stop_halts_processing_without_new_items() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_worker = Arc::clone(&seen);

        let worker = StageWorker::spawn("test-stage", rx, Duration::from_millis(10), move |item: i32| {
            seen_worker.lock().unwrap().push(item);
        });
        worker.stop();
        std::thread::sleep(Duration::from_millis(50));
        let _ = tx.send(99);
        worker.join();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn disconnected_channel_ends_the_loop() {
        let (tx, rx) = crossbeam_channel::unbounded::<i32>();
        let mut worker = StageWorker::spawn("test-stage", rx, Duration::from_millis(10), |_| {});
        drop(tx);
        let handle = worker.handle.take().unwrap();
        handle.join().unwrap();
    }
}
