//! Task-flow engine: run independent fallible tasks concurrently
//!
//! A [`Flow`] never fails fast. Every dispatched task runs to completion and
//! all failures are collected into one [`FlowError`]. Cancelling the token
//! stops dispatch of tasks that have not started yet; running tasks receive a
//! child token and are expected to observe it at their own I/O boundaries.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::FlowTimer;
use crate::Error;

type TaskFn<'a> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'a, Result<(), Error>> + Send + 'a>;


/// A named, zero-argument unit of work
pub struct Task<'a> {
    name: String,
    run: TaskFn<'a>,
}

impl<'a> Task<'a> {
    /// Wrap a closure; it receives a token that fires when the flow is cancelled
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), Error>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(move |token| Box::pin(f(token))),
        }
    }

    /// Task name used in logs and aggregated errors
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One failed task inside a flow
#[derive(Debug)]
pub struct TaskError {
    /// Name of the failed task
    pub task: String,
    /// What went wrong
    pub error: Error,
}

/// Aggregate outcome of a flow with at least one failure or skipped task
#[derive(Debug)]
pub struct FlowError {
    /// Name of the flow
    pub flow: String,
    /// Every task failure, in completion order
    pub errors: Vec<TaskError>,
    /// Tasks never dispatched because the flow was cancelled
    pub skipped: usize,
}

impl FlowError {
    /// True if the flow only stopped because of cancellation
    pub fn is_cancelled(&self) -> bool {
        self.errors.is_empty() && self.skipped > 0
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.errors.len())?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        for e in &self.errors {
            write!(f, "; [{}] {}", e.task, e.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FlowError {}

impl From<FlowError> for Error {
    fn from(e: FlowError) -> Self {
        if e.is_cancelled() {
            return Error::cancelled(format!(
                "flow {}: {} task(s) not started",
                e.flow, e.skipped
            ));
        }
        Error::Flow {
            name: e.flow.clone(),
            message: e.to_string(),
            failures: e.errors.len(),
        }
    }
}

/// An unordered batch of tasks
pub struct Flow<'a> {
    name: String,
    tasks: Vec<Task<'a>>,
    concurrency: Option<usize>,
}

impl<'a> Flow<'a> {
    /// Create an empty flow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            concurrency: None,
        }
    }

    /// Limit how many tasks run at once (default: all of them)
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    /// Add a task
    pub fn task(mut self, task: Task<'a>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add many tasks
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Task<'a>>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if no tasks are queued
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task and aggregate the failures
    pub async fn run(self, cancel: &CancellationToken) -> Result<(), FlowError> {
        let total = self.tasks.len();
        let limit = self.concurrency.unwrap_or(total).max(1);
        let child = cancel.child_token();
        let timer = FlowTimer::start(self.name.clone());

        debug!(flow = %self.name, tasks = total, concurrency = limit, "Starting flow");

        let dispatches: Vec<_> = self
            .tasks
            .into_iter()
            .map(|task| {
                let token = child.clone();
                async move {
                    // Dispatch happens on first poll
                    if token.is_cancelled() {
                        return None;
                    }
                    let result = (task.run)(token).await;
                    Some((task.name, result))
                }
            })
            .collect();

        let outcomes: Vec<Option<(String, Result<(), Error>)>> = stream::iter(dispatches)
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut errors = Vec::new();
        let mut skipped = 0;
        for outcome in outcomes {
            match outcome {
                None => skipped += 1,
                Some((_, Ok(()))) => {}
                Some((task, Err(error))) => {
                    warn!(flow = %self.name, task = %task, error = %error, "Task failed");
                    errors.push(TaskError { task, error });
                }
            }
        }

        timer.finish(errors.len());

        if errors.is_empty() && skipped == 0 {
            debug!(flow = %self.name, tasks = total, "Flow completed");
            return Ok(());
        }
        Err(FlowError {
            flow: self.name,
            errors,
            skipped,
        })
    }
}

/// Run `tasks` concurrently without a concurrency limit
pub async fn parallel<'a>(
    name: &str,
    cancel: &CancellationToken,
    tasks: Vec<Task<'a>>,
) -> Result<(), FlowError> {
    Flow::new(name).tasks(tasks).run(cancel).await
}

/// Run `f` once per object, naming each task `<namespace>/<name>`
pub async fn apply_to_objects<'a, K, F, Fut>(
    name: &str,
    cancel: &CancellationToken,
    objects: impl IntoIterator<Item = K>,
    f: F,
) -> Result<(), FlowError>
where
    K: kube::Resource + Send + 'a,
    F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'a,
    Fut: Future<Output = Result<(), Error>> + Send + 'a,
{
    let f = Arc::new(f);
    let tasks = objects.into_iter().map(|obj| {
        let f = Arc::clone(&f);
        let task_name = match obj.namespace() {
            Some(ns) => format!("{}/{}", ns, obj.name_any()),
            None => obj.name_any(),
        };
        Task::new(task_name, move |token| (*f)(obj, token))
    });
    Flow::new(name).tasks(tasks).run(cancel).await
}

/// Treat a missing object as success; maintenance tasks skip what isn't there
pub fn ignore_not_found<T: Default>(result: Result<T, Error>) -> Result<T, Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}
