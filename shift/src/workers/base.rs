use std::future::Future;

use crate::error::ShiftResult;

/// A unit of work which runs in its own task once started.
///
/// `H` is the handle returned when the worker starts and `S` the state reachable through it.
pub trait Worker<H, S>
where
    H: WorkerHandle<S>,
{
    type Error;

    /// Spawns the worker and returns a handle to it.
    fn start(self) -> impl Future<Output = Result<H, Self::Error>> + Send;
}

/// A handle to a started worker.
pub trait WorkerHandle<S> {
    /// Returns the state shared with the worker.
    ///
    /// The state outlives the worker, so holding it says nothing about whether the worker is
    /// still running.
    fn state(&self) -> S;

    /// Waits for the worker task to end, returning its error or panic.
    fn wait(self) -> impl Future<Output = ShiftResult<()>> + Send;
}
