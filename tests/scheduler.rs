use gantry::{Error, Priority, Scheduler, SchedulerBuilder, Timeout};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn scheduler(threads: usize, fibers: usize) -> Scheduler {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = SchedulerBuilder::new();
    builder.set_max_jobs(256).unwrap();
    builder.add_thread_pool(threads, Priority::ALL).unwrap();
    builder.add_fiber_pool(fibers, 256 * 1024).unwrap();
    builder.init().unwrap()
}

#[test]
fn builder_requires_pools() {
    let mut no_threads = SchedulerBuilder::new();
    no_threads.add_fiber_pool(4, 64 * 1024).unwrap();
    assert_eq!(no_threads.init().unwrap_err(), Error::NoThreadPools);

    let mut no_fibers = SchedulerBuilder::new();
    no_fibers.add_thread_pool(1, Priority::ALL).unwrap();
    assert_eq!(no_fibers.init().unwrap_err(), Error::NoFiberPools);
}

#[test]
fn builder_rejects_changes_after_init() {
    let mut builder = SchedulerBuilder::new();
    builder.add_thread_pool(1, Priority::ALL).unwrap();
    builder.add_fiber_pool(4, 64 * 1024).unwrap();
    let _scheduler = builder.init().unwrap();

    assert_eq!(builder.set_max_jobs(10).unwrap_err(), Error::AlreadyInitialized);
    assert_eq!(
        builder.add_thread_pool(1, Priority::ALL).unwrap_err(),
        Error::AlreadyInitialized
    );
    assert_eq!(builder.init().unwrap_err(), Error::AlreadyInitialized);
}

#[test]
fn runs_a_single_job() {
    let scheduler = scheduler(2, 8);
    let ran = Arc::new(AtomicBool::new(false));

    let job = scheduler.create_job().unwrap();
    let ran_in_job = Arc::clone(&ran);
    job.set_work(move || {
        assert!(gantry::in_job());
        ran_in_job.store(true, Ordering::SeqCst);
    })
    .unwrap();
    job.set_tag("single").unwrap();
    assert!(job.is_valid());
    assert!(!gantry::in_job());
    job.dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert!(job.is_complete());
    assert!(scheduler.is_idle());
}

#[test]
fn linear_chain_runs_in_order() {
    let scheduler = scheduler(4, 8);
    let order = Arc::new(Mutex::new(Vec::new()));

    let jobs: Vec<_> = (1..=3)
        .map(|id| {
            let job = scheduler.create_job().unwrap();
            let order = Arc::clone(&order);
            job.set_work(move || order.lock().unwrap().push(id)).unwrap();
            job
        })
        .collect();

    jobs[1].add_predecessor(&jobs[0]).unwrap();
    jobs[1].add_successor(&jobs[2]).unwrap();

    // Dispatch out of order; the graph must still serialize them.
    jobs[2].dispatch().unwrap();
    jobs[1].dispatch().unwrap();
    jobs[0].dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn diamond_joins_before_the_tail() {
    let scheduler = scheduler(4, 8);
    let order = Arc::new(Mutex::new(Vec::new()));

    let make_job = |id: u32| {
        let job = scheduler.create_job().unwrap();
        let order = Arc::clone(&order);
        job.set_work(move || order.lock().unwrap().push(id)).unwrap();
        job
    };

    let head = make_job(1);
    let left = make_job(2);
    let right = make_job(3);
    let tail = make_job(4);

    left.add_predecessor(&head).unwrap();
    right.add_predecessor(&head).unwrap();
    tail.add_predecessor(&left).unwrap();
    tail.add_predecessor(&right).unwrap();

    for job in [&tail, &right, &left, &head] {
        job.dispatch().unwrap();
    }

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], 1);
    assert_eq!(order[3], 4);
}

#[test]
fn counter_fence_releases_after_all_adds() {
    let scheduler = scheduler(4, 16);
    let counter = scheduler.create_counter().unwrap();
    let observed = Arc::new(AtomicUsize::new(0));

    let fence = scheduler.create_job().unwrap();
    {
        let counter = counter.clone();
        let observed = Arc::clone(&observed);
        fence
            .set_work(move || {
                counter.wait_for(100, Timeout::INFINITE).unwrap();
                observed.store(counter.get() as usize, Ordering::SeqCst);
            })
            .unwrap();
    }
    fence.set_tag("fence").unwrap();
    fence.dispatch().unwrap();

    let adders: Vec<_> = (0..100)
        .map(|_| {
            let job = scheduler.create_job().unwrap();
            let counter = counter.clone();
            job.set_work(move || counter.add(1)).unwrap();
            job.dispatch().unwrap();
            job
        })
        .collect();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    drop(adders);

    assert_eq!(observed.load(Ordering::SeqCst), 100);
    assert_eq!(counter.get(), 100);
}

#[test]
fn auto_reset_event_wakes_exactly_one_waiter() {
    let scheduler = scheduler(2, 8);
    let event = scheduler.create_event(true).unwrap();
    let resumed = Arc::new(AtomicUsize::new(0));

    for tag in ["waiter-a", "waiter-b"] {
        let job = scheduler.create_job().unwrap();
        let event = event.clone();
        let resumed = Arc::clone(&resumed);
        job.set_work(move || {
            event.wait(Timeout::INFINITE).unwrap();
            resumed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        job.set_tag(tag).unwrap();
        job.dispatch().unwrap();
    }

    // Let both waiters park.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(resumed.load(Ordering::SeqCst), 0);

    event.signal();
    let deadline = Instant::now() + Duration::from_secs(5);
    while resumed.load(Ordering::SeqCst) < 1 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(resumed.load(Ordering::SeqCst), 1);

    event.signal();
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(resumed.load(Ordering::SeqCst), 2);

    // Both signals were consumed; the event is no longer set.
    assert_eq!(event.wait(Timeout::from_millis(20)).unwrap_err(), Error::Timeout);
}

#[test]
fn timeout_and_signal_race_resolves_exactly_once() {
    let scheduler = scheduler(2, 8);
    let counter = scheduler.create_counter().unwrap();
    let outcome = Arc::new(Mutex::new(None));

    let job = scheduler.create_job().unwrap();
    {
        let counter = counter.clone();
        let outcome = Arc::clone(&outcome);
        job.set_work(move || {
            let result = counter.remove(1, Timeout::from_millis(50));
            *outcome.lock().unwrap() = Some(result);
        })
        .unwrap();
    }
    job.dispatch().unwrap();

    std::thread::sleep(Duration::from_millis(45));
    counter.add(1);

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();

    // Either the job consumed the add, or it timed out and the value
    // remains; never both, never neither.
    let outcome = outcome.lock().unwrap().expect("job never ran");
    match outcome {
        Ok(()) => assert_eq!(counter.get(), 0),
        Err(Error::Timeout) => assert_eq!(counter.get(), 1),
        Err(other) => panic!("unexpected wait result: {:?}", other),
    }
}

#[test]
fn sleeping_jobs_share_one_worker_thread() {
    let scheduler = scheduler(1, 10);
    let finished = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    for id in 0..5 {
        let job = scheduler.create_job().unwrap();
        let finished = Arc::clone(&finished);
        job.set_work(move || {
            gantry::sleep(Timeout::from_millis(200)).unwrap();
            finished.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        job.set_tag(&format!("sleeper-{}", id)).unwrap();
        job.dispatch().unwrap();
    }

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(finished.load(Ordering::SeqCst), 5);
    // Five 200ms sleeps in series would be a full second; cooperative
    // suspension overlaps them on the single worker.
    assert!(elapsed >= Duration::from_millis(200));
    assert!(
        elapsed < Duration::from_millis(800),
        "sleeps did not overlap: {:?}",
        elapsed
    );
}

#[test]
fn job_can_wait_on_another_job() {
    let scheduler = scheduler(2, 8);
    let order = Arc::new(Mutex::new(Vec::new()));

    let child = scheduler.create_job().unwrap();
    {
        let order = Arc::clone(&order);
        child
            .set_work(move || {
                gantry::sleep(Timeout::from_millis(50)).unwrap();
                order.lock().unwrap().push("child");
            })
            .unwrap();
    }

    let parent = scheduler.create_job().unwrap();
    {
        let child = child.clone();
        let order = Arc::clone(&order);
        parent
            .set_work(move || {
                child.wait(Timeout::INFINITE).unwrap();
                order.lock().unwrap().push("parent");
            })
            .unwrap();
    }

    parent.dispatch().unwrap();
    child.dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["child", "parent"]);
}

#[test]
fn thread_can_wait_on_a_job_handle() {
    let scheduler = scheduler(2, 8);

    let job = scheduler.create_job().unwrap();
    job.set_work(|| {
        gantry::sleep(Timeout::from_millis(100)).unwrap();
    })
    .unwrap();
    job.dispatch().unwrap();

    job.wait(Timeout::INFINITE).unwrap();
    assert!(job.is_complete());

    // Waiting on an already-completed job returns immediately.
    job.wait(Timeout::INFINITE).unwrap();
}

#[test]
fn thread_wait_times_out_on_a_slow_job() {
    let scheduler = scheduler(2, 8);

    let job = scheduler.create_job().unwrap();
    job.set_work(|| {
        gantry::sleep(Timeout::from_millis(300)).unwrap();
    })
    .unwrap();
    job.dispatch().unwrap();

    assert_eq!(job.wait(Timeout::from_millis(20)).unwrap_err(), Error::Timeout);
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
}

#[test]
fn wait_until_idle_times_out_while_work_remains() {
    let scheduler = scheduler(1, 4);

    let job = scheduler.create_job().unwrap();
    job.set_work(|| {
        gantry::sleep(Timeout::from_millis(300)).unwrap();
    })
    .unwrap();
    job.dispatch().unwrap();

    assert_eq!(
        scheduler.wait_until_idle(Timeout::from_millis(30)).unwrap_err(),
        Error::Timeout
    );
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
}

#[test]
fn completed_jobs_can_be_dispatched_again() {
    let scheduler = scheduler(2, 8);
    let runs = Arc::new(AtomicUsize::new(0));

    let job = scheduler.create_job().unwrap();
    let runs_in_job = Arc::clone(&runs);
    job.set_work(move || {
        runs_in_job.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    job.dispatch().unwrap();
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    job.dispatch().unwrap();
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn dispatched_jobs_are_not_mutable() {
    let scheduler = scheduler(1, 4);
    let release = scheduler.create_event(false).unwrap();

    let job = scheduler.create_job().unwrap();
    {
        let release = release.clone();
        job.set_work(move || {
            release.wait(Timeout::INFINITE).unwrap();
        })
        .unwrap();
    }
    job.dispatch().unwrap();

    assert!(!job.is_mutable());
    assert_eq!(job.set_tag("nope").unwrap_err(), Error::NotMutable);
    assert_eq!(job.set_stack_size(1).unwrap_err(), Error::NotMutable);
    assert_eq!(job.dispatch().unwrap_err(), Error::AlreadyDispatched);

    release.signal();
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert!(job.is_mutable());
}

#[test]
fn job_pool_exhaustion_is_reported() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = SchedulerBuilder::new();
    builder.set_max_jobs(2).unwrap();
    builder.add_thread_pool(1, Priority::ALL).unwrap();
    builder.add_fiber_pool(2, 64 * 1024).unwrap();
    let scheduler = builder.init().unwrap();

    let first = scheduler.create_job().unwrap();
    let _second = scheduler.create_job().unwrap();
    assert_eq!(scheduler.create_job().unwrap_err(), Error::OutOfJobs);

    // Releasing a handle frees its slot.
    drop(first);
    let _third = scheduler.create_job().unwrap();
}

#[test]
fn dependency_pool_exhaustion_leaves_the_graph_consistent() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = SchedulerBuilder::new();
    // One logical edge takes two pool nodes.
    builder.set_max_dependencies(2).unwrap();
    builder.add_thread_pool(1, Priority::ALL).unwrap();
    builder.add_fiber_pool(4, 64 * 1024).unwrap();
    let scheduler = builder.init().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let make_job = || {
        let job = scheduler.create_job().unwrap();
        let runs = Arc::clone(&runs);
        job.set_work(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        job
    };

    let a = make_job();
    let b = make_job();
    let c = make_job();

    b.add_predecessor(&a).unwrap();
    assert_eq!(c.add_predecessor(&b).unwrap_err(), Error::OutOfDependencies);

    // The failed edge must not leave c blocked on b.
    a.dispatch().unwrap();
    b.dispatch().unwrap();
    c.dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn cleared_dependencies_no_longer_gate_dispatch() {
    let scheduler = scheduler(2, 8);
    let ran = Arc::new(AtomicBool::new(false));

    let gate = scheduler.create_job().unwrap();
    gate.set_work(|| {}).unwrap();

    let job = scheduler.create_job().unwrap();
    let ran_in_job = Arc::clone(&ran);
    job.set_work(move || ran_in_job.store(true, Ordering::SeqCst)).unwrap();
    job.add_predecessor(&gate).unwrap();

    // Without the clear this dispatch would wait for `gate` forever.
    job.clear_dependencies().unwrap();
    job.dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn completion_counter_counts_each_run() {
    let scheduler = scheduler(2, 8);
    let counter = scheduler.create_counter().unwrap();

    let job = scheduler.create_job().unwrap();
    job.set_work(|| {}).unwrap();
    job.set_completion_counter(&counter).unwrap();

    job.dispatch().unwrap();
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(counter.get(), 1);

    job.dispatch().unwrap();
    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert_eq!(counter.get(), 2);
}

#[test]
fn priority_classes_dequeue_highest_first() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = SchedulerBuilder::new();
    builder.set_max_jobs(64).unwrap();
    builder.add_thread_pool(1, Priority::ALL).unwrap();
    builder.add_fiber_pool(8, 64 * 1024).unwrap();
    let scheduler = builder.init().unwrap();

    // Occupy the single worker with a blocking stint (a fiber wait would
    // cooperatively free it) so the other jobs pile up in the queues.
    let plug = scheduler.create_job().unwrap();
    plug.set_work(|| std::thread::sleep(Duration::from_millis(200))).unwrap();
    plug.set_priority(Priority::CRITICAL).unwrap();
    plug.dispatch().unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let order = Arc::new(Mutex::new(Vec::new()));
    for (priority, id) in [
        (Priority::SLOW, "slow"),
        (Priority::CRITICAL, "critical"),
        (Priority::MEDIUM, "medium"),
    ] {
        let job = scheduler.create_job().unwrap();
        let order = Arc::clone(&order);
        job.set_work(move || order.lock().unwrap().push(id)).unwrap();
        job.set_priority(priority).unwrap();
        job.dispatch().unwrap();
    }

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["critical", "medium", "slow"]);
}

#[test]
fn restricted_thread_pool_never_runs_other_priorities() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = SchedulerBuilder::new();
    builder.add_thread_pool(1, Priority::CRITICAL).unwrap();
    builder.add_fiber_pool(4, 64 * 1024).unwrap();
    let scheduler = builder.init().unwrap();

    let ran = Arc::new(AtomicBool::new(false));

    let slow = scheduler.create_job().unwrap();
    let ran_in_job = Arc::clone(&ran);
    slow.set_work(move || ran_in_job.store(true, Ordering::SeqCst)).unwrap();
    slow.set_priority(Priority::SLOW).unwrap();
    slow.dispatch().unwrap();

    // No worker dequeues SLOW, so the scheduler never drains.
    assert_eq!(
        scheduler.wait_until_idle(Timeout::from_millis(100)).unwrap_err(),
        Error::Timeout
    );
    assert!(!ran.load(Ordering::SeqCst));

    let critical = scheduler.create_job().unwrap();
    critical.set_work(|| {}).unwrap();
    critical.set_priority(Priority::CRITICAL).unwrap();
    critical.dispatch().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !critical.is_complete() {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn panicking_job_does_not_poison_the_worker() {
    let scheduler = scheduler(1, 4);

    let bad = scheduler.create_job().unwrap();
    bad.set_work(|| panic!("job went sideways")).unwrap();
    bad.set_tag("panicker").unwrap();
    bad.dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert!(bad.is_complete());

    let good = scheduler.create_job().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_job = Arc::clone(&ran);
    good.set_work(move || ran_in_job.store(true, Ordering::SeqCst)).unwrap();
    good.dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn stack_requirement_binds_the_smallest_sufficient_pool() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut builder = SchedulerBuilder::new();
    builder.add_thread_pool(2, Priority::ALL).unwrap();
    builder.add_fiber_pool(4, 64 * 1024).unwrap();
    builder.add_fiber_pool(2, 512 * 1024).unwrap();
    let scheduler = builder.init().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let job = scheduler.create_job().unwrap();
    let ran_in_job = Arc::clone(&ran);
    job.set_work(move || ran_in_job.store(true, Ordering::SeqCst)).unwrap();
    // Only the larger pool can host this.
    job.set_stack_size(256 * 1024).unwrap();
    job.dispatch().unwrap();

    scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn profile_hooks_balance_across_context_switches() {
    let _ = env_logger::builder().is_test(true).try_init();

    let enters = Arc::new(AtomicUsize::new(0));
    let leaves = Arc::new(AtomicUsize::new(0));

    {
        let mut builder = SchedulerBuilder::new();
        let enters_hook = Arc::clone(&enters);
        let leaves_hook = Arc::clone(&leaves);
        builder
            .set_profile_functions(gantry::ProfileFunctions {
                enter_scope: Box::new(move |_kind, _tag| {
                    enters_hook.fetch_add(1, Ordering::SeqCst);
                }),
                leave_scope: Box::new(move || {
                    leaves_hook.fetch_add(1, Ordering::SeqCst);
                }),
            })
            .unwrap();
        builder.add_thread_pool(2, Priority::ALL).unwrap();
        builder.add_fiber_pool(8, 256 * 1024).unwrap();
        let scheduler = builder.init().unwrap();

        for _ in 0..4 {
            let job = scheduler.create_job().unwrap();
            job.set_work(|| {
                let _scope = gantry::ProfileScope::new("inner");
                gantry::sleep(Timeout::from_millis(20)).unwrap();
            })
            .unwrap();
            job.dispatch().unwrap();
        }

        scheduler.wait_until_idle(Timeout::INFINITE).unwrap();
    }

    // Scheduler dropped: every worker left its scopes, so the hook calls
    // must balance and must have fired at all.
    assert!(enters.load(Ordering::SeqCst) > 0);
    assert_eq!(enters.load(Ordering::SeqCst), leaves.load(Ordering::SeqCst));
}

#[test]
fn debug_sink_receives_the_init_report() {
    let messages = Arc::new(AtomicUsize::new(0));

    let mut builder = SchedulerBuilder::new();
    let messages_in_sink = Arc::clone(&messages);
    builder
        .set_debug_output(
            Box::new(move |_verbosity, _group, _message| {
                messages_in_sink.fetch_add(1, Ordering::SeqCst);
            }),
            gantry::LogVerbosity::Message,
        )
        .unwrap();
    builder.add_thread_pool(1, Priority::ALL).unwrap();
    builder.add_fiber_pool(2, 64 * 1024).unwrap();
    let scheduler = builder.init().unwrap();

    assert!(messages.load(Ordering::SeqCst) > 0);
    drop(scheduler);
}

#[test]
fn memory_hooks_see_fiber_stack_traffic() {
    let _ = env_logger::builder().is_test(true).try_init();

    let allocated = Arc::new(AtomicUsize::new(0));
    let freed = Arc::new(AtomicUsize::new(0));

    {
        let mut builder = SchedulerBuilder::new();
        let allocated_hook = Arc::clone(&allocated);
        let freed_hook = Arc::clone(&freed);
        builder
            .set_memory_functions(gantry::MemoryFunctions {
                alloc: Box::new(move |size, align| {
                    allocated_hook.fetch_add(size, Ordering::SeqCst);
                    unsafe {
                        std::alloc::alloc(std::alloc::Layout::from_size_align(size, align).unwrap())
                    }
                }),
                free: Box::new(move |ptr, size, align| {
                    freed_hook.fetch_add(size, Ordering::SeqCst);
                    unsafe {
                        std::alloc::dealloc(
                            ptr,
                            std::alloc::Layout::from_size_align(size, align).unwrap(),
                        )
                    }
                }),
            })
            .unwrap();
        builder.add_thread_pool(1, Priority::ALL).unwrap();
        builder.add_fiber_pool(4, 128 * 1024).unwrap();
        let scheduler = builder.init().unwrap();

        assert_eq!(allocated.load(Ordering::SeqCst), 4 * 128 * 1024);
        assert_eq!(scheduler.total_memory_allocated(), 4 * 128 * 1024);
    }

    // All handles gone: the shared state dropped and returned every stack.
    assert_eq!(freed.load(Ordering::SeqCst), 4 * 128 * 1024);
}

#[test]
fn logical_core_count_is_positive() {
    assert!(Scheduler::logical_core_count() > 0);
}
