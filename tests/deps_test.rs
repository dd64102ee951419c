//! Integration tests for dependency resolution and parent propagation.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use ticketq::activity::{Action, Actor};
use ticketq::clock::ManualClock;
use ticketq::engine::{
    DependentOutcome, Engine, EngineConfig, ParentOutcome, ParentPolicy,
};
use ticketq::model::*;
use ticketq::store::{MemoryStore, TicketStore};
use ticketq::{Error, ErrorKind};

fn test_engine() -> Engine<MemoryStore> {
    engine_with(EngineConfig::default())
}

fn engine_with(config: EngineConfig) -> Engine<MemoryStore> {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap(),
    ));
    Engine::in_memory().with_clock(clock).with_config(config)
}

fn alice() -> Actor {
    Actor::human("alice")
}

fn create(engine: &Engine<MemoryStore>, title: &str) -> Ticket {
    engine
        .create_ticket(NewTicket::new("DEP", title), &alice())
        .unwrap()
}

fn create_child(engine: &Engine<MemoryStore>, parent: &TicketId, title: &str) -> Ticket {
    engine
        .create_ticket(NewTicket::new("DEP", title).parent(parent.clone()), &alice())
        .unwrap()
}

/// Claim, complete and accept.
fn finish(engine: &Engine<MemoryStore>, id: &TicketId) {
    engine.claim(id, "agent-1", None).unwrap();
    engine.complete(id, "agent-1", None).unwrap();
    engine.accept(id, &alice()).unwrap();
}

fn status(engine: &Engine<MemoryStore>, id: &TicketId) -> Status {
    engine.get_ticket(id).unwrap().status
}

fn count(engine: &Engine<MemoryStore>, id: &TicketId, action: Action) -> usize {
    engine
        .activity(id)
        .unwrap()
        .iter()
        .filter(|e| e.action == action)
        .count()
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

#[test]
fn adding_open_prerequisite_blocks_dependent() {
    let engine = test_engine();
    let pre = create(&engine, "schema");
    let dep = create(&engine, "api");

    let dep = engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    assert_eq!(dep.status, Status::Blocked);
    assert_eq!(engine.prerequisites(&dep.id).unwrap(), vec![pre.id]);
}

#[test]
fn adding_done_prerequisite_leaves_dependent_ready() {
    let engine = test_engine();
    let pre = create(&engine, "schema");
    finish(&engine, &pre.id);
    let dep = create(&engine, "api");

    let dep = engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    assert_eq!(dep.status, Status::Ready);
}

#[test]
fn blocking_in_progress_dependent_releases_its_claim() {
    let engine = test_engine();
    let pre = create(&engine, "schema");
    let dep = create(&engine, "api");
    engine.claim(&dep.id, "agent-1", None).unwrap();

    let dep = engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    assert_eq!(dep.status, Status::Blocked);
    assert!(engine.active_claim(&dep.id).unwrap().is_none());
}

#[test]
fn duplicate_edge_is_a_no_op() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();

    assert_eq!(engine.prerequisites(&dep.id).unwrap().len(), 1);
    assert_eq!(count(&engine, &dep.id, Action::DependencyAdded), 1);
}

#[test]
fn self_edge_is_invalid() {
    let engine = test_engine();
    let t = create(&engine, "a");
    let err = engine.add_dependency(&t.id, &t.id, &alice()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
}

#[test]
fn two_node_cycle_is_rejected_and_graph_unchanged() {
    let engine = test_engine();
    let a = create(&engine, "a");
    let b = create(&engine, "b");
    engine.add_dependency(&a.id, &b.id, &alice()).unwrap();

    match engine.add_dependency(&b.id, &a.id, &alice()) {
        Err(Error::Cycle { .. }) => {}
        other => panic!("expected Cycle, got {other:?}"),
    }
    assert_eq!(engine.prerequisites(&a.id).unwrap(), vec![b.id.clone()]);
    assert!(engine.prerequisites(&b.id).unwrap().is_empty());
    assert_eq!(status(&engine, &b.id), Status::Ready);
}

#[test]
fn transitive_cycle_is_rejected() {
    let engine = test_engine();
    let a = create(&engine, "a");
    let b = create(&engine, "b");
    let c = create(&engine, "c");
    engine.add_dependency(&a.id, &b.id, &alice()).unwrap();
    engine.add_dependency(&b.id, &c.id, &alice()).unwrap();

    let err = engine.add_dependency(&c.id, &a.id, &alice()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
    assert!(err.hint().is_some());
    assert!(engine.prerequisites(&c.id).unwrap().is_empty());
}

#[test]
fn dependency_on_closed_dependent_is_state_error() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    finish(&engine, &dep.id);

    let err = engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateError);
}

#[test]
fn removing_last_open_prerequisite_unblocks() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();

    let dep = engine
        .remove_dependency(&dep.id, &pre.id, &alice())
        .unwrap();
    assert_eq!(dep.status, Status::Ready);
    assert_eq!(count(&engine, &dep.id, Action::Unblocked), 1);

    let err = engine
        .remove_dependency(&dep.id, &pre.id, &alice())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ---------------------------------------------------------------------------
// Close propagation to dependents
// ---------------------------------------------------------------------------

#[test]
fn accepting_prerequisite_unblocks_dependent() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();

    engine.claim(&pre.id, "agent-1", None).unwrap();
    engine.complete(&pre.id, "agent-1", None).unwrap();
    let closed = engine.accept(&pre.id, &alice()).unwrap();

    assert_eq!(closed.propagation.unblocked(), 1);
    assert_eq!(status(&engine, &dep.id), Status::Ready);
    let unblocked = engine
        .activity(&dep.id)
        .unwrap()
        .into_iter()
        .find(|e| e.action == Action::Unblocked)
        .unwrap();
    assert_eq!(
        unblocked.details.unwrap()["prerequisite"],
        serde_json::json!(pre.id.to_string())
    );
}

#[test]
fn cancelled_prerequisite_flags_dependents_without_unblocking() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    let other = create(&engine, "c");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    engine.add_dependency(&other.id, &pre.id, &alice()).unwrap();
    engine.remove_dependency(&other.id, &pre.id, &alice()).unwrap();

    let closed = engine
        .cancel(&pre.id, &alice(), Resolution::Duplicate)
        .unwrap();
    assert_eq!(closed.propagation.flagged(), 1);

    let dep = engine.get_ticket(&dep.id).unwrap();
    assert_eq!(dep.status, Status::Blocked);
    let reason = dep.human_flag_reason.unwrap();
    assert!(reason.contains(&pre.id.to_string()));
    assert!(reason.contains("duplicate"));
    assert_eq!(count(&engine, &dep.id, Action::Escalated), 1);
}

#[test]
fn failed_prerequisite_leaves_closed_dependents_alone() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    engine.cancel(&dep.id, &alice(), Resolution::WontDo).unwrap();

    let closed = engine.cancel(&pre.id, &alice(), Resolution::WontDo).unwrap();
    assert_eq!(
        closed.propagation.dependents[0].outcome,
        DependentOutcome::Unchanged
    );
    assert!(engine.get_ticket(&dep.id).unwrap().human_flag_reason.is_none());
}

#[test]
fn repeated_close_propagation_is_idempotent() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    let flagged = create(&engine, "c");
    let other = create(&engine, "d");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    engine.add_dependency(&flagged.id, &other.id, &alice()).unwrap();

    finish(&engine, &pre.id);
    engine.cancel(&other.id, &alice(), Resolution::Invalid).unwrap();
    let before_dep = engine.activity(&dep.id).unwrap().len();
    let before_flagged = engine.activity(&flagged.id).unwrap().len();

    let again = engine.on_ticket_closed(&pre.id, false).unwrap();
    assert_eq!(again.unblocked(), 0);
    let again = engine.on_ticket_closed(&other.id, false).unwrap();
    assert_eq!(again.flagged(), 0);

    assert_eq!(engine.activity(&dep.id).unwrap().len(), before_dep);
    assert_eq!(engine.activity(&flagged.id).unwrap().len(), before_flagged);
}

#[test]
fn on_ticket_closed_rejects_open_ticket() {
    let engine = test_engine();
    let t = create(&engine, "a");
    let err = engine.on_ticket_closed(&t.id, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
}

#[test]
fn reopening_prerequisite_blocks_dependent_again() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    finish(&engine, &pre.id);
    assert_eq!(status(&engine, &dep.id), Status::Ready);

    engine.reopen(&pre.id, &alice()).unwrap();
    assert_eq!(status(&engine, &dep.id), Status::Blocked);
}

#[test]
fn rejected_ticket_with_open_prerequisite_lands_blocked() {
    let engine = test_engine();
    let t = create(&engine, "a");
    let pre = create(&engine, "b");
    engine.claim(&t.id, "agent-1", None).unwrap();
    engine.complete(&t.id, "agent-1", None).unwrap();
    // Edge added while in review: stored, status unchanged.
    let reviewed = engine.add_dependency(&t.id, &pre.id, &alice()).unwrap();
    assert_eq!(reviewed.status, Status::Review);

    let rejected = engine.reject(&t.id, &alice(), "needs b first").unwrap();
    assert_eq!(rejected.status, Status::Blocked);
}

#[test]
fn resolve_all_repairs_stale_blocks() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    let still = create(&engine, "c");
    let open = create(&engine, "d");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    engine.add_dependency(&still.id, &open.id, &alice()).unwrap();

    // Close `pre` behind the engine's back so nothing propagates.
    engine
        .store()
        .transaction(|tx| {
            let mut t = tx.get_ticket(&pre.id)?;
            t.status = Status::Done;
            t.resolution = Some(Resolution::Completed);
            tx.update_ticket(&t)
        })
        .unwrap();
    assert_eq!(status(&engine, &dep.id), Status::Blocked);

    let report = engine.resolve_all().unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.unblocked, 1);
    assert_eq!(report.still_blocked, 1);
    assert!(report.errors.is_empty());
    assert_eq!(status(&engine, &dep.id), Status::Ready);
}

// ---------------------------------------------------------------------------
// No premature unblock, in every close order
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn dependent_unblocks_only_after_last_prerequisite(
        order in Just((0..4usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let engine = test_engine();
        let prerequisites: Vec<Ticket> =
            (0..4).map(|i| create(&engine, &format!("pre {i}"))).collect();
        let dep = create(&engine, "dependent");
        for p in &prerequisites {
            engine.add_dependency(&dep.id, &p.id, &alice()).unwrap();
        }

        for (step, &i) in order.iter().enumerate() {
            prop_assert_eq!(status(&engine, &dep.id), Status::Blocked);
            finish(&engine, &prerequisites[i].id);
            let expected = if step + 1 == order.len() { Status::Ready } else { Status::Blocked };
            prop_assert_eq!(status(&engine, &dep.id), expected);
        }
        prop_assert_eq!(count(&engine, &dep.id, Action::Unblocked), 1);
    }
}

// ---------------------------------------------------------------------------
// Parent propagation
// ---------------------------------------------------------------------------

#[test]
fn parent_moves_to_review_when_all_children_succeed() {
    let engine = test_engine();
    let parent = create(&engine, "epic");
    let a = create_child(&engine, &parent.id, "a");
    let b = create_child(&engine, &parent.id, "b");

    finish(&engine, &a.id);
    assert_eq!(status(&engine, &parent.id), Status::Ready);

    engine.claim(&b.id, "agent-1", None).unwrap();
    engine.complete(&b.id, "agent-1", None).unwrap();
    let closed = engine.accept(&b.id, &alice()).unwrap();
    let parent_result = closed.propagation.parent.unwrap();
    assert_eq!(parent_result.outcome, ParentOutcome::Review);

    let parent = engine.get_ticket(&parent.id).unwrap();
    assert_eq!(parent.status, Status::Review);
    assert!(parent.resolution.is_none());
    assert_eq!(count(&engine, &parent.id, Action::ChildrenCompleted), 1);
}

#[test]
fn parent_propagation_is_idempotent() {
    let engine = test_engine();
    let parent = create(&engine, "epic");
    let child = create_child(&engine, &parent.id, "only child");
    finish(&engine, &child.id);
    let log_len = engine.activity(&parent.id).unwrap().len();

    let again = engine.on_ticket_closed(&child.id, false).unwrap();
    assert_eq!(again.parent.unwrap().outcome, ParentOutcome::Unchanged);
    assert_eq!(status(&engine, &parent.id), Status::Review);
    assert_eq!(engine.activity(&parent.id).unwrap().len(), log_len);
}

#[test]
fn failed_child_does_not_unlock_parent_by_default() {
    let engine = test_engine();
    let parent = create(&engine, "epic");
    let a = create_child(&engine, &parent.id, "a");
    let b = create_child(&engine, &parent.id, "b");

    engine.cancel(&a.id, &alice(), Resolution::WontDo).unwrap();
    finish(&engine, &b.id);

    assert_eq!(status(&engine, &parent.id), Status::Ready);
}

#[test]
fn allow_closed_policy_counts_failed_children() {
    let engine = engine_with(EngineConfig {
        parent_policy: ParentPolicy::AllowClosed,
        ..EngineConfig::default()
    });
    let parent = create(&engine, "epic");
    let a = create_child(&engine, &parent.id, "a");
    let b = create_child(&engine, &parent.id, "b");

    engine.cancel(&a.id, &alice(), Resolution::WontDo).unwrap();
    finish(&engine, &b.id);

    assert_eq!(status(&engine, &parent.id), Status::Review);
}

#[test]
fn auto_accept_closes_parent_and_cascades() {
    let engine = engine_with(EngineConfig {
        auto_accept_parent: true,
        ..EngineConfig::default()
    });
    let epic = create(&engine, "epic");
    let story = create_child(&engine, &epic.id, "story");
    let task = create_child(&engine, &story.id, "task");
    let follow_up = create(&engine, "follow-up");
    engine
        .add_dependency(&follow_up.id, &story.id, &alice())
        .unwrap();

    engine.claim(&task.id, "agent-1", None).unwrap();
    engine.complete(&task.id, "agent-1", None).unwrap();
    let closed = engine.accept(&task.id, &alice()).unwrap();

    let story = engine.get_ticket(&story.id).unwrap();
    assert_eq!(story.status, Status::Done);
    assert_eq!(story.resolution, Some(Resolution::Completed));
    assert!(story.completed_at.is_some());
    assert_eq!(status(&engine, &epic.id), Status::Done);
    assert_eq!(status(&engine, &follow_up.id), Status::Ready);
    assert_eq!(closed.propagation.cascaded.len(), 1);
    assert_eq!(closed.propagation.unblocked(), 1);
}

#[test]
fn blocked_parent_waits_for_its_prerequisites_before_completing() {
    let engine = engine_with(EngineConfig {
        auto_accept_parent: true,
        ..EngineConfig::default()
    });
    let gate = create(&engine, "gate");
    let parent = create(&engine, "epic");
    engine.add_dependency(&parent.id, &gate.id, &alice()).unwrap();
    let child = create_child(&engine, &parent.id, "only child");

    engine.claim(&child.id, "agent-1", None).unwrap();
    engine.complete(&child.id, "agent-1", None).unwrap();
    let closed = engine.accept(&child.id, &alice()).unwrap();
    assert_eq!(
        closed.propagation.parent.unwrap().outcome,
        ParentOutcome::Blocked { remaining: 1 }
    );
    let waiting = engine.get_ticket(&parent.id).unwrap();
    assert_eq!(waiting.status, Status::Blocked);
    assert!(waiting.resolution.is_none());
    assert_eq!(count(&engine, &parent.id, Action::ChildrenCompleted), 0);

    engine.claim(&gate.id, "agent-1", None).unwrap();
    engine.complete(&gate.id, "agent-1", None).unwrap();
    let closed = engine.accept(&gate.id, &alice()).unwrap();

    let result = &closed.propagation.dependents[0];
    assert_eq!(result.outcome, DependentOutcome::Unblocked);
    assert_eq!(result.children, Some(ParentOutcome::Accepted));
    assert_eq!(closed.propagation.cascaded.len(), 1);
    let parent = engine.get_ticket(&parent.id).unwrap();
    assert_eq!(parent.status, Status::Done);
    assert_eq!(parent.resolution, Some(Resolution::Completed));
}

#[test]
fn unblocked_parent_with_finished_children_moves_to_review() {
    let engine = test_engine();
    let gate = create(&engine, "gate");
    let parent = create(&engine, "epic");
    engine.add_dependency(&parent.id, &gate.id, &alice()).unwrap();
    let child = create_child(&engine, &parent.id, "child");
    finish(&engine, &child.id);
    assert_eq!(status(&engine, &parent.id), Status::Blocked);

    let parent_after = engine
        .remove_dependency(&parent.id, &gate.id, &alice())
        .unwrap();
    assert_eq!(parent_after.status, Status::Review);
    assert_eq!(count(&engine, &parent.id, Action::ChildrenCompleted), 1);
}

#[test]
fn resolve_all_completes_parents_it_unblocks() {
    let engine = test_engine();
    let gate = create(&engine, "gate");
    let parent = create(&engine, "epic");
    engine.add_dependency(&parent.id, &gate.id, &alice()).unwrap();
    let child = create_child(&engine, &parent.id, "child");
    finish(&engine, &child.id);

    engine
        .store()
        .transaction(|tx| {
            let mut t = tx.get_ticket(&gate.id)?;
            t.status = Status::Done;
            t.resolution = Some(Resolution::Completed);
            tx.update_ticket(&t)
        })
        .unwrap();

    let report = engine.resolve_all().unwrap();
    assert_eq!(report.unblocked, 1);
    assert_eq!(report.parents_completed, 1);
    assert_eq!(status(&engine, &parent.id), Status::Review);
}

// ---------------------------------------------------------------------------
// Failed-prerequisite flags
// ---------------------------------------------------------------------------

#[test]
fn removing_failed_prerequisite_clears_its_flag() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    engine.cancel(&pre.id, &alice(), Resolution::WontDo).unwrap();
    assert!(engine.get_ticket(&dep.id).unwrap().human_flag_reason.is_some());

    let dep = engine
        .remove_dependency(&dep.id, &pre.id, &alice())
        .unwrap();
    assert_eq!(dep.status, Status::Ready);
    assert!(dep.human_flag_reason.is_none());
}

#[test]
fn flag_moves_to_remaining_failed_prerequisite() {
    let engine = test_engine();
    let first = create(&engine, "a");
    let second = create(&engine, "b");
    let dep = create(&engine, "c");
    engine.add_dependency(&dep.id, &first.id, &alice()).unwrap();
    engine.add_dependency(&dep.id, &second.id, &alice()).unwrap();
    engine.cancel(&first.id, &alice(), Resolution::WontDo).unwrap();
    engine
        .cancel(&second.id, &alice(), Resolution::Duplicate)
        .unwrap();
    let reason = engine.get_ticket(&dep.id).unwrap().human_flag_reason.unwrap();
    assert!(reason.contains(&second.id.to_string()));

    let dep = engine
        .remove_dependency(&dep.id, &second.id, &alice())
        .unwrap();
    assert_eq!(dep.status, Status::Blocked);
    let reason = dep.human_flag_reason.unwrap();
    assert!(reason.contains(&first.id.to_string()));
    assert!(reason.contains("wont_do"));
}

#[test]
fn reopened_prerequisite_clears_flag_and_later_unblocks() {
    let engine = test_engine();
    let pre = create(&engine, "a");
    let dep = create(&engine, "b");
    engine.add_dependency(&dep.id, &pre.id, &alice()).unwrap();
    engine.cancel(&pre.id, &alice(), Resolution::WontDo).unwrap();

    engine.reopen(&pre.id, &alice()).unwrap();
    let waiting = engine.get_ticket(&dep.id).unwrap();
    assert_eq!(waiting.status, Status::Blocked);
    assert!(waiting.human_flag_reason.is_none());

    finish(&engine, &pre.id);
    let dep = engine.get_ticket(&dep.id).unwrap();
    assert_eq!(dep.status, Status::Ready);
    assert!(dep.human_flag_reason.is_none());
}
