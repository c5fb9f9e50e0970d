//! Scheduler-side per-container state machine.
//!
//! Each agent representation tracks every container id it knows about in
//! this machine. Its states are distinct from the agent-side lifecycle:
//! they fold together what the event stream reports and which commands
//! we have issued but not yet seen resolve.
//!
//! `initial` is the absence of an entry. The `deleted` transition removes
//! the entry; `timeout` is emitted only by the outstanding-op tracker and
//! restores the previously-stable state.

use convoy_types::ContainerStatus;

/// FSM position for one tracked container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedState {
    PendingSchedule,
    Created,
    Running,
    CreatedPendingUnschedule,
    RunningPendingUnschedule,
}

/// Transition alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A schedule command was issued.
    Schedule,
    /// An unschedule command was issued.
    Unschedule,
    /// The agent reported the container created (or exited).
    Created,
    /// The agent reported the container running.
    Running,
    /// The agent reported the container finished or failed.
    Stopped,
    /// The agent reported the container destroyed (or it vanished).
    Deleted,
    /// A pending operation timed out; fall back to the stable state.
    Timeout,
}

/// Outcome of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Goto(TrackedState),
    Remove,
    Ignore,
}

/// The transition table. `state == None` is `initial`.
pub fn step(state: Option<TrackedState>, transition: Transition) -> Step {
    use Step::{Goto, Ignore, Remove};
    use TrackedState as S;
    use Transition as T;

    match (state, transition) {
        (Some(_), T::Deleted) => Remove,
        (None, T::Deleted) => Ignore,

        (None, T::Schedule) => Goto(S::PendingSchedule),
        (None, T::Unschedule) => Ignore,
        (None, T::Created) => Goto(S::Created),
        (None, T::Running) => Goto(S::Running),
        (None, T::Stopped) => Goto(S::Created),
        (None, T::Timeout) => Ignore,

        (Some(S::PendingSchedule), T::Schedule) => Goto(S::PendingSchedule),
        (Some(S::PendingSchedule), T::Unschedule) => Goto(S::PendingSchedule),
        (Some(S::PendingSchedule), T::Created) => Goto(S::Created),
        (Some(S::PendingSchedule), T::Running) => Goto(S::Running),
        (Some(S::PendingSchedule), T::Stopped) => Goto(S::Created),
        (Some(S::PendingSchedule), T::Timeout) => Ignore,

        (Some(S::Created), T::Schedule) => Goto(S::Created),
        (Some(S::Created), T::Unschedule) => Goto(S::CreatedPendingUnschedule),
        (Some(S::Created), T::Created) => Goto(S::Created),
        (Some(S::Created), T::Running) => Goto(S::Running),
        (Some(S::Created), T::Stopped) => Goto(S::Created),
        (Some(S::Created), T::Timeout) => Goto(S::Created),

        (Some(S::Running), T::Schedule) => Goto(S::Running),
        (Some(S::Running), T::Unschedule) => Goto(S::RunningPendingUnschedule),
        (Some(S::Running), T::Created) => Goto(S::Created),
        (Some(S::Running), T::Running) => Goto(S::Running),
        (Some(S::Running), T::Stopped) => Goto(S::Created),
        (Some(S::Running), T::Timeout) => Goto(S::Running),

        (Some(S::CreatedPendingUnschedule), T::Schedule) => Goto(S::CreatedPendingUnschedule),
        (Some(S::CreatedPendingUnschedule), T::Unschedule) => Goto(S::CreatedPendingUnschedule),
        (Some(S::CreatedPendingUnschedule), T::Created) => Goto(S::CreatedPendingUnschedule),
        (Some(S::CreatedPendingUnschedule), T::Running) => Goto(S::RunningPendingUnschedule),
        (Some(S::CreatedPendingUnschedule), T::Stopped) => Goto(S::CreatedPendingUnschedule),
        (Some(S::CreatedPendingUnschedule), T::Timeout) => Goto(S::Created),

        (Some(S::RunningPendingUnschedule), T::Schedule) => Goto(S::RunningPendingUnschedule),
        (Some(S::RunningPendingUnschedule), T::Unschedule) => Goto(S::RunningPendingUnschedule),
        (Some(S::RunningPendingUnschedule), T::Created) => Goto(S::CreatedPendingUnschedule),
        (Some(S::RunningPendingUnschedule), T::Running) => Goto(S::RunningPendingUnschedule),
        (Some(S::RunningPendingUnschedule), T::Stopped) => Goto(S::CreatedPendingUnschedule),
        (Some(S::RunningPendingUnschedule), T::Timeout) => Goto(S::Running),
    }
}

/// The transition an observed agent-side status maps to.
pub fn transition_for(status: ContainerStatus) -> Transition {
    match status {
        ContainerStatus::Created => Transition::Created,
        ContainerStatus::Running => Transition::Running,
        ContainerStatus::Finished | ContainerStatus::Failed => Transition::Stopped,
        ContainerStatus::Deleted => Transition::Deleted,
    }
}
