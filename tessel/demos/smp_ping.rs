//! Core 0 bounces a counter off every other core and reports the mean round
//! trip of a cross-core call.
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tessel::runtime::{app, Builder};
use tessel::smp;

const ROUNDS: u32 = 10_000;

async fn ping_all() -> tessel::Result<()> {
    let cores = smp::count();
    if cores < 2 {
        tracing::warn!("nothing to ping with a single core");
        return Ok(());
    }

    for core in 1..cores {
        let started = Instant::now();
        let mut counter = 0u64;
        for _ in 0..ROUNDS {
            counter = smp::submit_to(core, move || async move { counter + 1 }).await?;
        }
        let mean = started.elapsed() / ROUNDS;

        assert_eq!(counter, u64::from(ROUNDS));
        tracing::info!(core, ?mean, "round trip");
    }

    // Everyone answers, in core order.
    let ids = smp::invoke_on_all(|| async {
        tessel::sleep(Duration::from_millis(1)).await;
        smp::this_core()
    })
    .await?;
    tracing::info!(?ids, "all cores answered");
    Ok(())
}

fn main() -> ExitCode {
    app::init_logging();
    app::run(Builder::new().cores(4), ping_all())
}
