use super::*;
use crate as tessel;
use crate::io::{register_priority_class, DiskFile};
use crate::memory;
use crate::smp;
use anyhow::Result;
use std::collections::BTreeSet;
use std::os::fd::OwnedFd;

struct Fixture {
    queue: Rc<IoQueue>,
    sink: Rc<IoSink>,
    group: Arc<FairGroup>,
    fd: Arc<OwnedFd>,
}

impl Fixture {
    /// A queue with room for `max_requests` reads in flight, draining into a
    /// sink of its own instead of the reactor's.
    fn new(max_requests: u32) -> Result<Self> {
        let cfg = IoQueueConfig {
            max_request_count: max_requests,
            ..IoQueueConfig::named("fixture")
        };
        let group = Arc::new(FairGroup::new("fixture", cfg.fair_group_config()));
        let sink = Rc::new(IoSink::new());
        let queue = Rc::new(IoQueue::new(
            smp::this_core(),
            DeviceId(4242),
            cfg,
            Arc::clone(&group),
            Rc::clone(&sink),
        ));
        Ok(Self {
            queue,
            sink,
            group,
            fd: Arc::new(OwnedFd::from(tempfile::tempfile()?)),
        })
    }

    fn read(&self, class: IoPriorityClass, pos: u64, intent: Option<&IoIntent>) -> Deferred<IoDone> {
        let req = IoRequest::Read {
            fd: Arc::clone(&self.fd),
            pos,
            buf: vec![0; 512],
        };
        self.queue.queue_request(class, req, intent)
    }

    /// Completes everything in the sink, returning the positions in
    /// dispatch order.
    fn complete_all(&self) -> Vec<u64> {
        let mut seen = Vec::new();
        self.sink.drain(|req, completion| {
            let (pos, buf) = match req {
                IoRequest::Read { pos, buf, .. } | IoRequest::Write { pos, buf, .. } => (pos, buf),
                IoRequest::Fsync { .. } => (u64::MAX, Vec::new()),
            };
            seen.push(pos);
            completion.complete_with(Ok(IoDone {
                bytes: buf.len(),
                buf,
            }));
        });
        seen
    }
}

#[test]
fn test_ticket_costs() {
    let cfg = IoQueueConfig {
        disk_req_write_to_read_multiplier: 256,
        disk_bytes_write_to_read_multiplier: 192,
        ..IoQueueConfig::default()
    };
    assert_eq!(cfg.ticket_for(4096, false), FairQueueTicket::new(128, 8 * 128));
    assert_eq!(cfg.ticket_for(4096, true), FairQueueTicket::new(256, 8 * 192));
    // Below one size unit only the weight counts.
    assert_eq!(cfg.ticket_for(100, false), FairQueueTicket::new(128, 0));

    let group = IoQueueConfig::default().fair_group_config();
    assert_eq!(group.max_weight, 128 * 128);
    assert_eq!(group.max_size, ((16 << 20) >> 9) * 128);
}

#[tessel::test]
async fn test_dispatch_stays_within_capacity() -> Result<()> {
    let fx = Fixture::new(2)?;
    let class = IoPriorityClass::default_class();
    let pending: Vec<_> = (0..5).map(|i| fx.read(class, i, None)).collect();

    assert_eq!(fx.queue.poll_io_queue(), 2);
    assert_eq!(fx.queue.poll_io_queue(), 0);
    assert_eq!(fx.sink.len(), 2);
    assert_eq!(fx.group.outstanding().weight(), 256);

    assert_eq!(fx.complete_all(), vec![0, 1]);
    assert_eq!(fx.queue.executing(), 0);
    assert_eq!(fx.queue.poll_io_queue(), 2);
    assert_eq!(fx.complete_all(), vec![2, 3]);
    assert_eq!(fx.queue.poll_io_queue(), 1);
    assert_eq!(fx.complete_all(), vec![4]);

    for d in pending {
        assert_eq!(d.await?.bytes, 512);
    }
    assert_eq!(fx.group.outstanding(), FairQueueTicket::default());
    Ok(())
}

#[tessel::test]
async fn test_equal_classes_alternate() -> Result<()> {
    let fx = Fixture::new(2)?;
    let a = register_priority_class("alternate-a", 100)?;
    let b = register_priority_class("alternate-b", 100)?;

    let mut pending = Vec::new();
    for i in 0..10 {
        pending.push(fx.read(a, i, None));
        pending.push(fx.read(b, 1000 + i, None));
    }

    let mut order = Vec::new();
    while order.len() < 20 {
        assert!(fx.queue.poll_io_queue() > 0);
        order.extend(fx.complete_all());
    }

    let first_half = order[..10].iter().filter(|&&pos| pos < 1000).count();
    assert!((4..=6).contains(&first_half), "dispatch order {order:?}");
    for d in pending {
        d.await?;
    }
    Ok(())
}

#[tessel::test]
async fn test_higher_shares_dispatch_more() -> Result<()> {
    let fx = Fixture::new(1)?;
    let heavy = register_priority_class("shares-heavy", 300)?;
    let light = register_priority_class("shares-light", 100)?;

    let mut pending = Vec::new();
    for i in 0..40 {
        pending.push(fx.read(heavy, i, None));
        pending.push(fx.read(light, 1000 + i, None));
    }

    let mut order = Vec::new();
    while order.len() < 40 {
        fx.queue.poll_io_queue();
        order.extend(fx.complete_all());
    }
    let heavy_share = order[..40].iter().filter(|&&pos| pos < 1000).count();
    assert!((27..=33).contains(&heavy_share), "heavy got {heavy_share} of 40");

    while fx.queue.waiters() > 0 {
        fx.queue.poll_io_queue();
        fx.complete_all();
    }
    futures::future::try_join_all(pending).await?;
    Ok(())
}

#[tessel::test]
async fn test_intent_cancellation() -> Result<()> {
    let mut rng = fastrand::Rng::with_seed(7);
    let fx = Fixture::new(4)?;
    let classes = [
        register_priority_class("cancel-a", 100)?,
        register_priority_class("cancel-b", 100)?,
    ];

    let live = IoIntent::new();
    let dead = IoIntent::new();

    let mut requests = Vec::new();
    for round in 0..10u64 {
        for i in 0..10u64 {
            let class = classes[rng.usize(..classes.len())];
            let (kind, intent) = match rng.u8(..3) {
                0 => ("live", Some(&live)),
                1 => ("dead", Some(&dead)),
                _ => ("legacy", None),
            };
            requests.push((kind, fx.read(class, round * 100 + i, intent)));
        }
        // Some of each round are already in flight when the intent dies.
        fx.queue.poll_io_queue();
    }

    let in_flight = fx.sink.len();
    let removed = dead.cancel();
    assert!(dead.is_cancelled());
    assert_eq!(dead.linked(), 0);

    // Every queued request of the dead intent failed before cancel returned.
    let queued_dead = requests
        .iter()
        .filter(|(kind, d)| *kind == "dead" && d.failed())
        .count();
    assert_eq!(queued_dead, removed);
    assert!(requests
        .iter()
        .filter(|(kind, _)| *kind != "dead")
        .all(|(_, d)| !d.available()));

    // New requests on a cancelled intent fail at once.
    let late = fx.read(classes[0], 9999, Some(&dead));
    assert!(late.failed());

    let mut completed = fx.complete_all().len();
    while fx.queue.waiters() > 0 {
        fx.queue.poll_io_queue();
        completed += fx.complete_all().len();
    }
    assert!(completed >= in_flight);

    for (kind, d) in requests {
        match d.await {
            Ok(done) => assert_eq!(done.bytes, 512),
            Err(e) => {
                assert_eq!(kind, "dead");
                assert_eq!(e, Error::Cancelled);
            }
        }
    }
    assert_eq!(live.linked(), 0);
    Ok(())
}

#[tessel::test]
async fn test_dropped_intent_detaches() -> Result<()> {
    let fx = Fixture::new(1)?;
    let class = IoPriorityClass::default_class();

    let intent = IoIntent::new();
    let d = fx.read(class, 0, Some(&intent));
    drop(intent);

    assert_eq!(fx.queue.poll_io_queue(), 1);
    fx.complete_all();
    assert_eq!(d.await?.bytes, 512);
    Ok(())
}

#[tessel::test]
async fn test_unregistered_class_drains_then_detaches() -> Result<()> {
    let fx = Fixture::new(1)?;
    let class = register_priority_class("short-lived", 100)?;
    let queued = fx.read(class, 0, None);
    class.unregister()?;

    let refused = fx.read(class, 1, None);
    assert_eq!(refused.await.err(), Some(Error::NoSuchPriorityClass));

    assert_eq!(fx.queue.poll_io_queue(), 1);
    fx.complete_all();
    assert_eq!(queued.await?.bytes, 512);

    fx.queue.poll_io_queue();
    let inner = fx.queue.inner.borrow();
    assert!(inner.classes.is_empty());
    assert_eq!(inner.free_ids, vec![0]);
    Ok(())
}

#[tessel::test]
async fn test_share_updates_reach_the_queue() -> Result<()> {
    let fx = Fixture::new(1)?;
    let class = register_priority_class("resharing", 100)?;
    let d = fx.read(class, 0, None);
    class.update_shares(700)?;

    fx.queue.poll_io_queue();
    {
        let inner = fx.queue.inner.borrow();
        let local = &inner.classes[&class.serial()];
        assert_eq!(inner.fq.shares(local.id), Some(700));
    }
    fx.complete_all();
    d.await?;
    Ok(())
}

#[tessel::test]
async fn test_queue_length_and_delay_metrics() -> Result<()> {
    let fx = Fixture::new(1)?;
    let class = register_priority_class("measured", 100)?;
    let pending: Vec<_> = (0..3).map(|i| fx.read(class, i, None)).collect();

    let labels = labels([
        ("class", "measured".to_string()),
        ("mountpoint", "fixture".to_string()),
        ("shard", "0".to_string()),
    ]);
    let get = |name: &str| crate::metrics::registry().get(METRICS_GROUP, name, &labels);
    assert_eq!(get("queue_length"), Some(3));

    while fx.queue.waiters() > 0 {
        fx.queue.poll_io_queue();
        fx.complete_all();
    }
    futures::future::try_join_all(pending).await?;

    assert_eq!(get("queue_length"), Some(0));
    assert_eq!(get("total_requests"), Some(3));
    assert_eq!(get("total_bytes"), Some(3 * 512));
    Ok(())
}

#[tessel::test]
async fn test_cannot_sleep_on_foreign_capacity() -> Result<()> {
    let fx = Fixture::new(1)?;
    assert!(fx.queue.can_sleep());

    // Another core holds all of the device.
    let held = fx.group.capacity();
    assert!(fx.group.try_grab(held));

    let d = fx.read(IoPriorityClass::default_class(), 0, None);
    assert_eq!(fx.queue.poll_io_queue(), 0);
    assert!(!fx.queue.can_sleep());

    fx.group.release(held);
    assert_eq!(fx.queue.poll_io_queue(), 1);
    // Our own completion will wake us.
    assert!(fx.queue.can_sleep());
    fx.complete_all();
    d.await?;
    Ok(())
}

#[tessel::test]
async fn test_every_allocation_failure_leaves_queue_consistent() -> Result<()> {
    let fx = Fixture::new(8)?;
    let class = IoPriorityClass::default_class();
    // Attach the class first so only queueing hits checkpoints.
    fx.read(class, 0, None);
    fx.queue.poll_io_queue();
    fx.complete_all();

    for n in 0..4 {
        memory::with_failure_injector(|inj| inj.fail_after(n));
        let batch: Vec<_> = (0..4).map(|i| fx.read(class, i, None)).collect();
        memory::with_failure_injector(|inj| inj.cancel());

        let failed: Vec<_> = batch.iter().map(Deferred::failed).collect();
        assert_eq!(failed.iter().filter(|f| **f).count(), 1, "failure at {n}");
        assert!(failed[n as usize]);
        assert_eq!(fx.queue.waiters(), 3);

        assert_eq!(fx.queue.poll_io_queue(), 3);
        assert_eq!(fx.complete_all().len(), 3);
        for (d, failed) in batch.into_iter().zip(failed) {
            match d.await {
                Ok(_) => assert!(!failed),
                Err(e) => assert_eq!(e, Error::AllocationFailed),
            }
        }
    }
    assert_eq!(fx.group.outstanding(), FairQueueTicket::default());
    Ok(())
}

#[tessel::test(cores = 4)]
async fn test_class_rename_storm_keeps_one_label() -> Result<()> {
    let class = register_priority_class("storm", 100)?;

    // Give the class a series on every core.
    smp::invoke_on_all(move || async move {
        let file = DiskFile::from_std(tempfile::tempfile()?)?;
        file.write_at(0, b"storm", class, None).await
    })
    .await?
    .into_iter()
    .collect::<crate::Result<Vec<_>>>()?;

    for round in 0..20 {
        smp::invoke_on_all(move || async move {
            class.rename(&format!("storm-{}-{round}", smp::this_core()))
        })
        .await?
        .into_iter()
        .collect::<crate::Result<Vec<()>>>()?;

        let names: BTreeSet<String> = crate::metrics::registry()
            .label_values(METRICS_GROUP, "class")
            .into_iter()
            .filter(|name| name.starts_with("storm"))
            .collect();
        assert_eq!(names.len(), 1, "round {round}: {names:?}");
        assert_eq!(names.first().cloned(), class.name());
    }
    Ok(())
}
