use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, warn};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
#[error("thread pool '{0}' is shut down")]
pub struct PoolClosed(String);

/// Fixed set of named worker threads pulling jobs from a shared queue.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> Self {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver)));
        }

        Self {
            name: name.to_string(),
            workers,
            sender,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .ok_or_else(|| PoolClosed(self.name.clone()))?
            .send(job)
            .map_err(|_| PoolClosed(self.name.clone()))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down {} worker {}", self.name, worker.id);

            if worker.thread.join().is_err() {
                warn!("{} worker {} panicked", self.name, worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    pub fn new(pool: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        let pool = pool.to_string();
        let thread = thread::spawn(move || {
            loop {
                let msg = match receiver.lock() {
                    Ok(receiver) => receiver.recv(),
                    Err(_) => break,
                };
                match msg {
                    Ok(job) => {
                        debug!("{pool} worker {id} picked up a job");
                        job();
                    }
                    Err(_) => {
                        debug!("{pool} worker {id} disconnected");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}
