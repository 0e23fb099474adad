use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Admission-controlled fan-out: `spawn` waits for a free slot before the task starts.
#[derive(Debug)]
pub struct WorkerPool<T> {
    slots: Arc<Semaphore>,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tasks: JoinSet::new(),
        }
    }

    pub async fn spawn<F>(&mut self, job: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        self.tasks.spawn(async move {
            let _permit = permit;
            job.await
        });
    }

    /// Waits for every spawned job, in completion order.
    pub async fn join_all(mut self) -> Vec<Result<T, JoinError>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.tasks.join_next().await {
            results.push(result);
        }
        results
    }
}
