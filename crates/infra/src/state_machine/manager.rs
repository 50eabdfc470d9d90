//! Worker loop driving a set of processors.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use dataspace_core::WaitStrategy;

use super::processor::Processor;

/// Handle to control a running state machine.
#[derive(Debug)]
pub struct StateMachineHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ManagerStats>>,
}

impl StateMachineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the current iteration to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current manager statistics.
    pub fn stats(&self) -> ManagerStats {
        read_stats(&self.stats)
    }
}

/// Manager runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ManagerStats {
    pub iterations: u64,
    pub entities_processed: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub uptime_secs: u64,
}

/// Result of one pass over every processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Iteration {
    pub processed: usize,
    pub errors: usize,
}

/// Repeatedly runs its processors on a dedicated thread.
///
/// After an iteration that processed nothing it idles for
/// `wait_strategy.wait_for_millis()`; after an iteration with processor
/// errors it backs off for `wait_strategy.retry_in_millis(consecutive_errors)`.
pub struct StateMachineManager {
    name: String,
    wait_strategy: Arc<dyn WaitStrategy>,
    processors: Vec<Box<dyn Processor>>,
}

impl core::fmt::Debug for StateMachineManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<&str> = self.processors.iter().map(|p| p.name()).collect();
        f.debug_struct("StateMachineManager")
            .field("name", &self.name)
            .field("processors", &names)
            .finish_non_exhaustive()
    }
}

impl StateMachineManager {
    pub fn new(name: impl Into<String>, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        Self {
            name: name.into(),
            wait_strategy,
            processors: Vec::new(),
        }
    }

    pub fn with_processor<P: Processor + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run every processor once.
    pub fn run_once(&mut self) -> Iteration {
        let mut iteration = Iteration::default();
        for processor in &mut self.processors {
            match processor.process() {
                Ok(n) => iteration.processed += n,
                Err(err) => {
                    iteration.errors += 1;
                    warn!(
                        manager = %self.name,
                        processor = processor.name(),
                        error = %err,
                        "processor failed"
                    );
                }
            }
        }
        iteration
    }

    /// Delay before the next iteration given the last outcome.
    fn delay_after(&self, iteration: Iteration, consecutive_errors: u32) -> Duration {
        let millis = if iteration.errors > 0 {
            self.wait_strategy.retry_in_millis(consecutive_errors)
        } else if iteration.processed == 0 {
            self.wait_strategy.wait_for_millis()
        } else {
            0
        };
        Duration::from_millis(millis)
    }

    /// Spawn the manager loop on a named thread.
    pub fn spawn(self) -> std::io::Result<StateMachineHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ManagerStats::default()));
        let stats_clone = stats.clone();

        let name = self.name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || manager_loop(self, shutdown_rx, stats_clone))?;

        Ok(StateMachineHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn manager_loop(
    mut manager: StateMachineManager,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ManagerStats>>,
) {
    info!(manager = %manager.name, processors = manager.processors.len(), "state machine started");
    let start_time = Instant::now();
    let mut consecutive_errors: u32 = 0;

    loop {
        let iteration = manager.run_once();
        consecutive_errors = if iteration.errors > 0 {
            consecutive_errors.saturating_add(1)
        } else {
            0
        };

        update_stats(&stats, |s| {
            s.iterations += 1;
            s.entities_processed += iteration.processed as u64;
            s.errors += iteration.errors as u64;
            s.consecutive_errors = consecutive_errors;
            s.uptime_secs = start_time.elapsed().as_secs();
        });

        let delay = manager.delay_after(iteration, consecutive_errors);
        if !delay.is_zero() {
            debug!(
                manager = %manager.name,
                processed = iteration.processed,
                errors = iteration.errors,
                delay_ms = delay.as_millis() as u64,
                "state machine waiting"
            );
        }

        // Sleeping on the channel lets shutdown interrupt the wait.
        match shutdown_rx.recv_timeout(delay) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!(manager = %manager.name, "state machine stopped");
}

fn update_stats(stats: &Mutex<ManagerStats>, f: impl FnOnce(&mut ManagerStats)) {
    match stats.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

fn read_stats(stats: &Mutex<ManagerStats>) -> ManagerStats {
    match stats.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}
