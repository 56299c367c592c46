//! Entry points for binaries.
use crate::runtime::Builder;
use std::fmt::Display;
use std::future::Future;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Installs a `tracing` fmt subscriber filtered by `RUST_LOG`, `info` when
/// unset. Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
    if let Err(e) = res {
        tracing::debug!(error = %e, "subscriber already installed");
    }
}

/// Builds the runtime, runs `fut` on core 0 and stops every core once it
/// resolves.
///
/// Failures to start, the error `fut` resolves with, or the runtime
/// stopping first (on SIGINT or SIGTERM for example) are logged and turn
/// into a failing exit code.
pub fn run<F, E>(builder: Builder, fut: F) -> ExitCode
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    let rt = match builder.try_build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "failed to start the runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.try_block_on(fut) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "application failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::warn!(error = %e, "runtime stopped before the application finished");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_maps_outcome_to_exit_code() {
        let ok = run(Builder::new().cores(1), async { Ok::<_, crate::Error>(()) });
        assert_eq!(ok, ExitCode::SUCCESS);

        let failed = run(Builder::new().cores(2), async {
            Err::<(), _>(crate::Error::TimedOut)
        });
        assert_eq!(failed, ExitCode::FAILURE);

        let stopped = run(Builder::new().cores(1), async {
            crate::stop();
            crate::yield_now().await;
            Ok::<_, anyhow::Error>(())
        });
        assert_eq!(stopped, ExitCode::FAILURE);
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
