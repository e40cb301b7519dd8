use std::{sync::Mutex, time::Duration};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::trace;

// A mutex instead of `OnceLock` because initialization is fallible. Installing the recorder
// twice fails, which happens when several tests ask for a handle.
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Interval between two upkeep runs on the installed recorder.
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Installs the global Prometheus recorder once and returns a handle to it.
///
/// The handle renders the exposition text for a `/metrics` endpoint. Later calls return clones
/// of the same handle. Must be called from within a Tokio runtime, which runs the periodic
/// upkeep keeping histogram memory bounded.
pub fn init_metrics_handle() -> Result<PrometheusHandle, BuildError> {
    let mut prometheus_handle = PROMETHEUS_HANDLE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(handle) = &*prometheus_handle {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *prometheus_handle = Some(handle.clone());

    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(UPKEEP_INTERVAL).await;
            trace!("running metrics upkeep");
            upkeep_handle.run_upkeep();
        }
    });

    Ok(handle)
}

/// Installs the global recorder with an HTTP listener serving `0.0.0.0:9000/metrics`.
///
/// When given, `cell` is attached to every metric as a global label.
pub fn init_metrics(cell: Option<String>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new();

    if let Some(cell) = cell {
        builder = builder.add_global_label("cell", cell);
    }

    builder.install()?;

    Ok(())
}
