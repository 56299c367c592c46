//! Thread-local access to the reactor owning the current thread.
use crate::reactor::Reactor;
use crate::sched::SchedulingGroup;
use crate::task::TaskId;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread_local;

mod core;
pub(crate) use core::{AlienItem, CoreHandle};

mod shared;
pub(crate) use shared::Shared;

thread_local! {
    static REACTOR: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };

    // Kept apart from the reactor so task ids and groups can be tracked, and
    // tested, without a running reactor.
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
    static CURRENT_GROUP: Cell<SchedulingGroup> = const { Cell::new(SchedulingGroup::MAIN) };
}

#[track_caller]
pub(crate) fn install(reactor: Rc<Reactor>) {
    REACTOR.with(|r| {
        let mut slot = r.borrow_mut();
        assert!(
            slot.is_none(),
            "a tessel reactor is already running on this thread"
        );
        *slot = Some(reactor);
    });
}

pub(crate) fn uninstall() -> Option<Rc<Reactor>> {
    REACTOR.with(|r| r.borrow_mut().take())
}

pub(crate) fn is_installed() -> bool {
    REACTOR.with(|r| r.borrow().is_some())
}

/// Runs `f` with the reactor of this thread.
///
/// # Panics
///
/// Panics when called from a thread that does not run a tessel reactor.
#[track_caller]
#[inline]
pub(crate) fn with_reactor<F, R>(f: F) -> R
where
    F: FnOnce(&Rc<Reactor>) -> R,
{
    match try_with_reactor(f) {
        Some(r) => r,
        None => panic!("must be called from a tessel reactor thread"),
    }
}

/// Like [`with_reactor`], `None` outside of a reactor thread.
#[inline]
pub(crate) fn try_with_reactor<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Rc<Reactor>) -> R,
{
    // Clone out of the cell so `f` may re-enter, or uninstall, freely.
    let reactor = REACTOR.with(|r| r.borrow().clone())?;
    Some(f(&reactor))
}

#[track_caller]
#[inline]
pub(crate) fn with_shared<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Shared>) -> R,
{
    with_reactor(|r| f(&r.shared))
}

pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.with(Cell::get)
}

pub(crate) fn set_current_task_id(id: Option<TaskId>) -> Option<TaskId> {
    CURRENT_TASK.with(|c| c.replace(id))
}

pub(crate) fn current_scheduling_group() -> SchedulingGroup {
    CURRENT_GROUP.with(Cell::get)
}

pub(crate) fn set_current_scheduling_group(group: SchedulingGroup) -> SchedulingGroup {
    CURRENT_GROUP.with(|c| c.replace(group))
}
