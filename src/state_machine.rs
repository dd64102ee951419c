//! Ticket status transitions.
//!
//! A pure function from `(status, event)` to the next status. Nothing is
//! written until a transition has been validated here, so a rejected
//! event never leaves partial state behind.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Status, TicketId};

/// Something that asks a ticket to change status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Automatic: a freshly created (or reopened) ticket is checked against
    /// its prerequisites.
    Validate { blocked: bool },
    Claim,
    Release,
    Expire,
    Complete,
    /// A new unresolved prerequisite was added.
    AddDependency,
    /// Automatic: the last unresolved prerequisite closed successfully.
    DependencyResolved,
    Flag,
    /// A human answered; resume in `resume` (`ready` or `in_progress`).
    Respond { resume: Status },
    Accept,
    Reject,
    Cancel,
    Reopen,
    /// Automatic: every child of a parent closed successfully. A parent
    /// still waiting on prerequisites stays where it is.
    ChildrenCompleted,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Validate { .. } => "validate",
            Event::Claim => "claim",
            Event::Release => "release",
            Event::Expire => "expire",
            Event::Complete => "complete",
            Event::AddDependency => "add a dependency to",
            Event::DependencyResolved => "unblock",
            Event::Flag => "flag",
            Event::Respond { .. } => "respond to",
            Event::Accept => "accept",
            Event::Reject => "reject",
            Event::Cancel => "cancel",
            Event::Reopen => "reopen",
            Event::ChildrenCompleted => "complete children of",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where `event` takes a ticket in `from`, or `None` if the table has no row.
pub fn next_status(from: Status, event: Event) -> Option<Status> {
    use Status::*;
    match (from, event) {
        (Created, Event::Validate { blocked }) => Some(if blocked { Blocked } else { Ready }),
        (Ready, Event::Claim) => Some(InProgress),
        (InProgress, Event::Release | Event::Expire) => Some(Ready),
        (InProgress, Event::Complete) => Some(Review),
        (Ready | InProgress, Event::AddDependency) => Some(Blocked),
        (Blocked, Event::DependencyResolved) => Some(Ready),
        (NeedsHuman, Event::Respond { resume }) => match resume {
            Ready | InProgress => Some(resume),
            _ => None,
        },
        (Review, Event::Accept) => Some(Done),
        (Review, Event::Reject) => Some(Ready),
        (Done | Cancelled, Event::Reopen) => Some(Created),
        (Ready | InProgress | NeedsHuman, Event::ChildrenCompleted) => Some(Review),
        (s, Event::Flag) if !s.is_terminal() => Some(NeedsHuman),
        (s, Event::Cancel) if !s.is_terminal() => Some(Cancelled),
        _ => None,
    }
}

/// Validate `event` against ticket `id` in status `from`.
pub fn transition(id: &TicketId, from: Status, event: Event) -> Result<Status> {
    next_status(from, event).ok_or_else(|| Error::InvalidTransition {
        id: id.clone(),
        from,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EVENTS: [Event; 16] = [
        Event::Validate { blocked: false },
        Event::Validate { blocked: true },
        Event::Claim,
        Event::Release,
        Event::Expire,
        Event::Complete,
        Event::AddDependency,
        Event::DependencyResolved,
        Event::Flag,
        Event::Respond {
            resume: Status::Ready,
        },
        Event::Respond {
            resume: Status::InProgress,
        },
        Event::Accept,
        Event::Reject,
        Event::Cancel,
        Event::Reopen,
        Event::ChildrenCompleted,
    ];

    fn any_status() -> impl Strategy<Value = Status> {
        prop::sample::select(Status::ALL.to_vec())
    }

    fn any_event() -> impl Strategy<Value = Event> {
        prop::sample::select(EVENTS.to_vec())
    }

    #[test]
    fn validate_routes_on_blocked_flag() {
        assert_eq!(
            next_status(Status::Created, Event::Validate { blocked: false }),
            Some(Status::Ready)
        );
        assert_eq!(
            next_status(Status::Created, Event::Validate { blocked: true }),
            Some(Status::Blocked)
        );
        assert_eq!(next_status(Status::Ready, Event::Validate { blocked: false }), None);
    }

    #[test]
    fn claim_only_from_ready() {
        for status in Status::ALL {
            let expected = (status == Status::Ready).then_some(Status::InProgress);
            assert_eq!(next_status(status, Event::Claim), expected, "{status}");
        }
    }

    #[test]
    fn respond_resumes_prior_state_only_when_workable() {
        let resume = |resume| next_status(Status::NeedsHuman, Event::Respond { resume });
        assert_eq!(resume(Status::Ready), Some(Status::Ready));
        assert_eq!(resume(Status::InProgress), Some(Status::InProgress));
        assert_eq!(resume(Status::Review), None);
        assert_eq!(
            next_status(Status::Ready, Event::Respond { resume: Status::Ready }),
            None
        );
    }

    #[test]
    fn reopen_only_from_terminal() {
        assert_eq!(next_status(Status::Done, Event::Reopen), Some(Status::Created));
        assert_eq!(next_status(Status::Cancelled, Event::Reopen), Some(Status::Created));
        assert_eq!(next_status(Status::Review, Event::Reopen), None);
    }

    #[test]
    fn children_completed_only_from_workable_states() {
        assert_eq!(next_status(Status::Review, Event::ChildrenCompleted), None);
        assert_eq!(next_status(Status::Done, Event::ChildrenCompleted), None);
        assert_eq!(next_status(Status::Blocked, Event::ChildrenCompleted), None);
        assert_eq!(next_status(Status::Created, Event::ChildrenCompleted), None);
        assert_eq!(
            next_status(Status::NeedsHuman, Event::ChildrenCompleted),
            Some(Status::Review)
        );
    }

    #[test]
    fn rejection_carries_context() {
        let id = TicketId::new("TEST", 1);
        match transition(&id, Status::Blocked, Event::Claim) {
            Err(Error::InvalidTransition { from, event, .. }) => {
                assert_eq!(from, Status::Blocked);
                assert_eq!(event, Event::Claim);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn terminal_states_only_reopen(status in any_status(), event in any_event()) {
            if status.is_terminal() {
                let next = next_status(status, event);
                prop_assert_eq!(next.is_some(), event == Event::Reopen);
            }
        }

        #[test]
        fn flag_and_cancel_accept_every_open_status(status in any_status()) {
            prop_assert_eq!(next_status(status, Event::Flag).is_some(), !status.is_terminal());
            prop_assert_eq!(next_status(status, Event::Cancel).is_some(), !status.is_terminal());
        }

        #[test]
        fn only_accept_and_cancel_reach_terminal(status in any_status(), event in any_event()) {
            if let Some(next) = next_status(status, event) {
                if next.is_terminal() {
                    prop_assert!(matches!(event, Event::Accept | Event::Cancel));
                }
            }
        }
    }
}
