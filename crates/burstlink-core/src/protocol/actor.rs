//! Serialized dispatcher access for async callers
//!
//! The transport tolerates one dispatch at a time. [`DispatchHandle`] moves a
//! [`Dispatcher`] onto a blocking worker task and feeds it requests from a
//! queue, so any number of tasks can share it.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    clock::Clock,
    dispatcher::{DispatchOutcome, Dispatcher},
    stream::Transport,
    CommandRequest, DispatchError,
};

/// Requests queued ahead of the one in flight
const QUEUE_DEPTH: usize = 32;

struct Job {
    request: CommandRequest,
    cancel: CancellationToken,
    reply: oneshot::Sender<DispatchOutcome>,
}

/// Cloneable handle to a dispatcher running on its own worker
#[derive(Clone)]
pub struct DispatchHandle {
    jobs: mpsc::Sender<Job>,
}

impl DispatchHandle {
    /// Start the worker. Must be called within a tokio runtime.
    ///
    /// The worker, and with it the transport, stops once every handle is dropped.
    pub fn spawn<T, C>(dispatcher: Dispatcher<T, C>) -> Self
    where
        T: Transport + 'static,
        C: Clock + 'static,
    {
        let (jobs, mut queue) = mpsc::channel::<Job>(QUEUE_DEPTH);
        tokio::task::spawn_blocking(move || {
            let mut dispatcher = dispatcher;
            while let Some(job) = queue.blocking_recv() {
                let outcome = dispatcher.send_with_cancel(&job.request, &job.cancel);
                if job.reply.send(outcome).is_err() {
                    debug!("caller went away before dispatch finished");
                }
            }
            debug!("dispatch worker stopped");
        });
        Self { jobs }
    }

    /// Dispatch a command and wait for its outcome
    pub async fn send(&self, request: CommandRequest) -> DispatchOutcome {
        self.send_with_cancel(request, CancellationToken::new()).await
    }

    /// Dispatch a command; cancelling `cancel` aborts it, queued or in flight
    pub async fn send_with_cancel(
        &self,
        request: CommandRequest,
        cancel: CancellationToken,
    ) -> DispatchOutcome {
        let (reply, outcome) = oneshot::channel();
        let echo = request.clone();
        let job = Job {
            request,
            cancel,
            reply,
        };

        if self.jobs.send(job).await.is_err() {
            return DispatchOutcome::rejected(&echo, &DispatchError::NotConnected);
        }
        match outcome.await {
            Ok(outcome) => outcome,
            Err(_) => DispatchOutcome::rejected(&echo, &DispatchError::NotConnected),
        }
    }

    /// Whether the worker is still accepting requests
    pub fn is_running(&self) -> bool {
        !self.jobs.is_closed()
    }
}
