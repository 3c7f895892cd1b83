//! Single-worker FIFO queues that serialize ownership of pipeline state.
//!
//! Each queue is one dedicated thread draining a channel of boxed jobs, so
//! everything submitted to a queue runs in submission order and all state a
//! queue owns is mutated from exactly one thread. Cross-queue communication
//! is one-way job submission; no queue ever blocks on another.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

pub struct DispatchQueue {
    name: &'static str,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl DispatchQueue {
    pub fn new(name: &'static str) -> Result<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in receiver.iter() {
                    job();
                }
            })
            .with_context(|| format!("failed to spawn {name} queue worker"))?;
        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Submit a job; returns immediately. Jobs submitted after the queue shut
    /// down are dropped with a warning.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                tracing::warn!(queue = self.name, "job dropped, worker already stopped");
            }
        }
    }

    /// Block until every job submitted before this call has run.
    pub fn drain(&self) {
        let (tx, rx) = bounded::<()>(1);
        self.execute(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued jobs and exit.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
