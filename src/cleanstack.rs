//! Ordered cleanup stack
//!
//! Jobs are registered as resources are acquired and run in reverse order
//! once the work is done, so later acquisitions are released first.

use crate::error::Result;
use std::fmt;

type Job<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// A cleanup job and the outcome it runs on
pub enum CleanJob<'a> {
    /// Runs whatever the outcome
    Always(Job<'a>),
    /// Runs only while no error has been seen
    OnSuccess(Job<'a>),
    /// Runs only once an error has been seen
    OnError(Job<'a>),
}

impl CleanJob<'_> {
    fn kind(&self) -> &'static str {
        match self {
            CleanJob::Always(_) => "always",
            CleanJob::OnSuccess(_) => "on-success",
            CleanJob::OnError(_) => "on-error",
        }
    }
}

impl fmt::Debug for CleanJob<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CleanJob({})", self.kind())
    }
}

#[derive(Debug, Default)]
pub struct CleanStack<'a> {
    jobs: Vec<CleanJob<'a>>,
}

impl<'a> CleanStack<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.jobs.push(CleanJob::Always(Box::new(job)));
    }

    pub fn push_on_success<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.jobs.push(CleanJob::OnSuccess(Box::new(job)));
    }

    pub fn push_on_error<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.jobs.push(CleanJob::OnError(Box::new(job)));
    }

    /// Remove the most recently pushed job without running it
    pub fn pop(&mut self) -> Option<CleanJob<'a>> {
        self.jobs.pop()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job in reverse push order against `result`.
    ///
    /// A failing job counts as an error for the jobs after it. Job errors are
    /// appended to the result, behind any error it already carried.
    pub fn cleanup<T>(mut self, mut result: Result<T>) -> Result<T> {
        while let Some(job) = self.jobs.pop() {
            let run = match job {
                CleanJob::Always(run) => run,
                CleanJob::OnSuccess(run) if result.is_ok() => run,
                CleanJob::OnError(run) if result.is_err() => run,
                skipped => {
                    log::debug!("Skipping {:?}", skipped);
                    continue;
                }
            };

            if let Err(err) = run() {
                result = match result {
                    Ok(_) => Err(err),
                    Err(prior) => Err(prior.with([err])),
                };
            }
        }

        result
    }
}
