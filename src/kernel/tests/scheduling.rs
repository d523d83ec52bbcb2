//! Preemption and cross-core wakes driven by timer traps.

mod common;

use std::collections::HashMap;

use common::{main_task, run_until_current, tick, user_call, user_regs};
use kestrel_common::syscall::Syscall;
use kestrel_common::{Event, EventKind};
use kestrel_kernel::config::{KernelConfig, KILLED_EXIT_CODE};
use kestrel_kernel::sched::TaskStatus;
use kestrel_kernel::testutil;

#[test]
fn timer_shares_the_core_evenly() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    let quantum = kernel.config().quantum_ticks as usize;
    let tasks: Vec<_> = (0..3)
        .map(|_| main_task(&testutil::user_process(&kernel)))
        .collect();

    let mut share: HashMap<_, usize> = HashMap::new();
    let mut run = 0;
    let mut last = None;
    for _ in 0..quantum * tasks.len() * 2 {
        tick(&kernel, &clock, 0);
        let current = kernel.current_task(0);
        *share.entry(current).or_default() += 1;
        run = if last == Some(current) { run + 1 } else { 1 };
        last = Some(current);
        assert!(run <= quantum, "task kept the core past its quantum");
    }

    for task in &tasks {
        assert_eq!(share.get(task), Some(&(quantum * 2)));
    }
    assert!(!share.contains_key(&kernel.core(0).idle()));
}

#[test]
fn idle_gives_way_as_soon_as_work_arrives() {
    let (kernel, _cpu, clock) = testutil::hosted_kernel();
    tick(&kernel, &clock, 0);
    assert_eq!(kernel.current_task(0), kernel.core(0).idle());

    let task = main_task(&testutil::user_process(&kernel));
    tick(&kernel, &clock, 0);
    assert_eq!(kernel.current_task(0), task);
}

fn two_core_kernel() -> (
    kestrel_kernel::Kernel,
    std::sync::Arc<kestrel_kernel::arch::host::ManualClock>,
) {
    let (kernel, _cpu, clock) = testutil::hosted_kernel_with_config(KernelConfig {
        cores: 2,
        ..KernelConfig::default()
    });
    (kernel, clock)
}

#[test]
fn processes_spread_over_cores() {
    let (kernel, _clock) = two_core_kernel();
    let cores: Vec<usize> = (0..4)
        .map(|_| {
            let task = main_task(&testutil::user_process(&kernel));
            kernel.task_shared(task).unwrap().core()
        })
        .collect();
    assert!(cores.contains(&0) && cores.contains(&1));
    assert_eq!(kernel.task_count(0) + kernel.task_count(1), 4 + 2);
}

#[test]
fn wake_from_another_core_lands_on_the_owner() {
    let (kernel, clock) = two_core_kernel();
    let first = testutil::user_process(&kernel);
    let second = testutil::user_process(&kernel);
    let (a, b) = (main_task(&first), main_task(&second));
    let core_a = kernel.task_shared(a).unwrap().core();
    let core_b = kernel.task_shared(b).unwrap().core();
    assert_ne!(core_a, core_b);

    run_until_current(&kernel, &clock, core_a, a, 4);
    run_until_current(&kernel, &clock, core_b, b, 4);

    let buf = testutil::put_user(&first, &[0u8; Event::SIZE]);
    let mut regs = user_regs();
    user_call(&kernel, core_a, &mut regs, Syscall::WaitForEvent, &[buf]);
    assert_eq!(kernel.task_status(core_a, a), Some(TaskStatus::Waiting));

    // Posted while core B is busy: only A's core picks it up.
    kernel.post_event(a, Event::new(EventKind::User, 1, 0)).unwrap();
    tick(&kernel, &clock, core_b);
    assert_eq!(kernel.current_task(core_b), b);
    assert_eq!(kernel.task_status(core_b, a), None);

    run_until_current(&kernel, &clock, core_a, a, 4);
    assert_eq!(user_call(&kernel, core_a, &mut regs, Syscall::WaitForEvent, &[buf]), 0);
}

#[test]
fn blocked_task_on_another_core_dies_when_killed() {
    let (kernel, clock) = two_core_kernel();
    let first = testutil::user_process(&kernel);
    let _second = testutil::user_process(&kernel);
    let a = main_task(&first);
    let core_a = kernel.task_shared(a).unwrap().core();
    run_until_current(&kernel, &clock, core_a, a, 4);

    let mut regs = user_regs();
    user_call(&kernel, core_a, &mut regs, Syscall::Sleep, &[10_000]);
    assert_eq!(kernel.task_status(core_a, a), Some(TaskStatus::Waiting));

    kernel.kill_process(first.id()).unwrap();
    tick(&kernel, &clock, core_a);
    assert_eq!(first.exit_code(), Some(KILLED_EXIT_CODE));
    assert_eq!(kernel.current_task(core_a), kernel.core(core_a).idle());
}
