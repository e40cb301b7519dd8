use tokio::sync::watch;

/// Sending half of the process wide shutdown signal.
///
/// Shutting down stops every migration worker at its next suspension point without changing
/// the status of its migration, so that it can be resumed by a later process.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiving half of the shutdown signal. A change, or the sender being dropped, means shutdown.
pub type ShutdownRx = watch::Receiver<()>;

/// Result of an operation which may be interrupted by shutdown, carrying partial work `I`.
#[derive(Debug)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}
