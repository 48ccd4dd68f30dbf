//! Periodic tick threads
//!
//! A timer never touches engine state. It posts a task carrying its
//! generation into the worker FIFO; the worker ignores ticks from a timer
//! it has since cancelled.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, Sender};

use crate::engine::EngineError;

/// Handle to a running tick thread; dropping it stops the thread
#[derive(Debug)]
pub struct Ticker {
    generation: u64,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawns a thread posting `make(generation)` every `period`
    pub fn spawn<T, F>(
        name: &'static str,
        period: Duration,
        generation: u64,
        tasks: Sender<T>,
        make: F,
    ) -> Result<Self, EngineError>
    where
        T: Send + 'static,
        F: Fn(u64) -> T + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let ticks = crossbeam_channel::tick(period);
                loop {
                    select! {
                        recv(ticks) -> _ => {
                            if tasks.send(make(generation)).is_err() {
                                break;
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                tracing::trace!(name, generation, "Ticker exited");
            })
            .map_err(|source| EngineError::Spawn { name, source })?;

        Ok(Self {
            generation,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        // Disconnecting the stop channel wakes the select
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(generation = self.generation, "Ticker thread panicked");
            }
        }
    }
}
