use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tagharvest_core::harvest::{HarvestProcessor, RunOutcome, RunReport, ServiceConfig};
use tokio_util::sync::CancellationToken;

/// Runs the processor on a fixed cadence until shutdown.
///
/// Runs start immediately and then every `run_interval`, measured from the
/// start of the previous run. A run that ended because the connection
/// dropped is followed by a fresh run after `restart_delay` instead.
pub struct ServiceHost {
    processor: Arc<HarvestProcessor>,
    service: ServiceConfig,
    shutdown: CancellationToken,
}

impl fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHost")
            .field("processor", &self.processor)
            .field("service", &self.service)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ServiceHost {
    pub fn new(processor: Arc<HarvestProcessor>, service: ServiceConfig) -> Self {
        Self {
            processor,
            service,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel this token to stop the active run and leave [`Self::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A single run that still honours the shutdown token.
    pub async fn run_once(&self) -> RunReport {
        let run = self.processor.start();
        tokio::pin!(run);
        // The run is polled first so it is registered before a pending
        // shutdown asks the processor to stop it.
        tokio::select! {
            biased;
            report = &mut run => report,
            _ = self.shutdown.cancelled() => {
                // `shutdown` waits for the run to unwind, so both are driven together.
                let ((), report) = tokio::join!(self.processor.shutdown(), run);
                report
            }
        }
    }

    /// Keep running until shutdown. Returns the report of the last run, if
    /// one was started.
    pub async fn run(&self) -> Option<RunReport> {
        let mut last = None;

        while !self.shutdown.is_cancelled() {
            let report = self.run_once().await;
            let delay = next_delay(&report, &self.service);
            tracing::info!(
                run_id = %report.run_id,
                outcome = ?report.outcome,
                next_run_in = %humantime::format_duration(delay),
                "run ended"
            );
            last = Some(report);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("service host stopped");
        last
    }
}

/// Wait before the next run.
pub fn next_delay(report: &RunReport, service: &ServiceConfig) -> Duration {
    match report.outcome {
        RunOutcome::Reconnecting => service.restart_delay(),
        _ => service.run_interval().saturating_sub(report.elapsed),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
