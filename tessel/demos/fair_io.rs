//! Two priority classes compete for one disk. Bytes written converge to the
//! ratio of their shares.
//!
//! ```text
//! RUST_LOG=tessel=debug cargo run --example fair_io
//! ```
use std::cell::Cell;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tessel::io::{DeviceId, DiskFile, IoPriorityClass, IoQueueConfig};
use tessel::runtime::{app, Builder};

const CHUNK: usize = 64 << 10;
const WRITERS_PER_CLASS: usize = 8;
const RUN_FOR: Duration = Duration::from_secs(3);

async fn writer(
    file: Rc<DiskFile>,
    class: IoPriorityClass,
    slot: u64,
    written: Rc<Cell<u64>>,
) -> tessel::Result<()> {
    let buf = vec![slot as u8; CHUNK];
    let started = Instant::now();
    let mut pos = slot * (CHUNK as u64) * 1024;

    while started.elapsed() < RUN_FOR {
        let n = file.write_at(pos, &buf, class, None).await?;
        written.set(written.get() + n as u64);
        pos += n as u64;
    }
    Ok(())
}

async fn compete() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = Rc::new(DiskFile::create(dir.path().join("fair_io.dat")).await?);

    let classes = [
        (tessel::io::register_priority_class("batch", 100)?, Rc::new(Cell::new(0))),
        (tessel::io::register_priority_class("interactive", 400)?, Rc::new(Cell::new(0))),
    ];

    let mut tasks = Vec::new();
    for (i, (class, written)) in classes.iter().enumerate() {
        for w in 0..WRITERS_PER_CLASS {
            let slot = (i * WRITERS_PER_CLASS + w) as u64;
            tasks.push(tessel::spawn(writer(
                Rc::clone(&file),
                *class,
                slot,
                Rc::clone(written),
            )));
        }
    }
    for t in tasks {
        t.await??;
    }

    let (batch, interactive) = (classes[0].1.get(), classes[1].1.get());
    tracing::info!(
        batch_mib = batch >> 20,
        interactive_mib = interactive >> 20,
        ratio = format!("{:.2}", interactive as f64 / batch.max(1) as f64),
        "bytes written per class"
    );

    for sample in tessel::metrics::registry().snapshot() {
        if sample.key.group == "io_queue" {
            tracing::info!(series = %sample.key, value = sample.value);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    app::init_logging();

    // Few slots in flight, so the queue has something to arbitrate.
    let mut disk = IoQueueConfig::named("demo");
    disk.max_request_count = 4;
    disk.max_bytes_count = 4 * CHUNK as u64;

    let builder = Builder::new().cores(1).io_queue(DeviceId::DEFAULT, disk);
    app::run(builder, compete())
}
