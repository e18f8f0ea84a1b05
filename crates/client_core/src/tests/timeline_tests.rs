use super::*;
use shared::domain::{MessageId, UserId};

fn payload(id: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        channel_id: ChannelId(9),
        sender_id: UserId(1),
        sender_name: Some("Alice Ngo".to_string()),
        content: content.to_string(),
        parent_id: None,
        is_edited: false,
        is_deleted: false,
        sent_at: Utc::now(),
    }
}

fn contents(timeline: &Timeline) -> Vec<String> {
    timeline
        .entries()
        .iter()
        .map(|entry| match entry {
            TimelineEntry::Confirmed(message) => message.content.clone(),
            TimelineEntry::Optimistic(optimistic) => optimistic.content.clone(),
        })
        .collect()
}

#[test]
fn confirm_replaces_the_placeholder_in_place() {
    let mut timeline = Timeline::new();
    let now = Instant::now();
    timeline.receive(payload(1, "earlier"));
    timeline.push_optimistic("tmp-1", ChannelId(9), "hello", now);

    assert!(timeline.confirm("tmp-1", payload(2, "hello")));

    assert_eq!(contents(&timeline), vec!["earlier", "hello"]);
    assert!(matches!(
        timeline.entries()[1],
        TimelineEntry::Confirmed(ref m) if m.message_id == MessageId(2)
    ));
    assert_eq!(timeline.in_flight(), 0);
}

#[test]
fn reject_retains_the_entry_flagged_as_failed() {
    let mut timeline = Timeline::new();
    timeline.push_optimistic("tmp-1", ChannelId(9), "doomed", Instant::now());

    assert!(timeline.reject("tmp-1"));

    let TimelineEntry::Optimistic(optimistic) = &timeline.entries()[0] else {
        panic!("entry should remain");
    };
    assert_eq!(optimistic.state, OptimisticState::Failed);
    assert_eq!(timeline.failed_tokens(), vec!["tmp-1".to_string()]);
}

#[test]
fn exactly_one_terminal_outcome_per_token() {
    let mut timeline = Timeline::new();
    timeline.push_optimistic("tmp-1", ChannelId(9), "hello", Instant::now());

    assert!(timeline.confirm("tmp-1", payload(2, "hello")));
    // The token is spent: neither a second confirm nor a reject applies.
    assert!(!timeline.confirm("tmp-1", payload(3, "dup")));
    assert!(!timeline.reject("tmp-1"));
    assert_eq!(timeline.entries().len(), 1);
}

#[test]
fn unknown_tokens_reconcile_nothing() {
    let mut timeline = Timeline::new();
    timeline.push_optimistic("tmp-1", ChannelId(9), "hello", Instant::now());

    assert!(!timeline.confirm("tmp-9", payload(2, "stranger")));
    assert!(!timeline.reject("tmp-9"));
    assert_eq!(timeline.in_flight(), 1);
}

#[test]
fn incoming_messages_slot_before_the_optimistic_tail() {
    let mut timeline = Timeline::new();
    let now = Instant::now();
    timeline.push_optimistic("tmp-1", ChannelId(9), "mine", now);
    timeline.receive(payload(5, "theirs"));

    assert_eq!(contents(&timeline), vec!["theirs", "mine"]);

    // The shifted index still resolves the pending token correctly.
    assert!(timeline.confirm("tmp-1", payload(6, "mine")));
    assert_eq!(contents(&timeline), vec!["theirs", "mine"]);
    assert!(matches!(
        timeline.entries()[1],
        TimelineEntry::Confirmed(ref m) if m.message_id == MessageId(6)
    ));
}

#[test]
fn duplicate_receive_updates_in_place() {
    let mut timeline = Timeline::new();
    timeline.receive(payload(1, "original"));
    let mut edited = payload(1, "edited");
    edited.is_edited = true;
    timeline.receive(edited);

    assert_eq!(timeline.entries().len(), 1);
    assert!(matches!(
        timeline.entries()[0],
        TimelineEntry::Confirmed(ref m) if m.is_edited && m.content == "edited"
    ));
}

#[test]
fn expiry_fails_only_entries_past_their_deadline() {
    let mut timeline = Timeline::new();
    let start = Instant::now();
    timeline.push_optimistic("tmp-old", ChannelId(9), "stale", start);
    timeline.push_optimistic("tmp-new", ChannelId(9), "fresh", start + CONFIRM_TIMEOUT);

    let failed = timeline.expire_pending(start + CONFIRM_TIMEOUT + Duration::from_millis(1));

    assert_eq!(failed, vec!["tmp-old".to_string()]);
    assert_eq!(timeline.in_flight(), 1);
    assert_eq!(timeline.failed_tokens(), vec!["tmp-old".to_string()]);
}

#[test]
fn late_confirm_after_timeout_upgrades_the_failed_entry() {
    let mut timeline = Timeline::new();
    let start = Instant::now();
    timeline.push_optimistic("tmp-1", ChannelId(9), "slow", start);
    timeline.expire_pending(start + CONFIRM_TIMEOUT + Duration::from_millis(1));

    assert!(timeline.confirm("tmp-1", payload(7, "slow")));
    assert_eq!(timeline.entries().len(), 1);
    assert!(matches!(
        timeline.entries()[0],
        TimelineEntry::Confirmed(ref m) if m.message_id == MessageId(7)
    ));
    assert!(timeline.failed_tokens().is_empty());
}

#[test]
fn retry_rearms_a_failed_entry_under_a_fresh_token() {
    let mut timeline = Timeline::new();
    let now = Instant::now();
    timeline.push_optimistic("tmp-1", ChannelId(9), "try again", now);
    timeline.reject("tmp-1");

    let content = timeline.retry("tmp-1", "tmp-2", now).expect("retry");
    assert_eq!(content, "try again");
    assert_eq!(timeline.in_flight(), 1);
    assert!(timeline.failed_tokens().is_empty());

    assert!(timeline.confirm("tmp-2", payload(8, "try again")));
}

#[test]
fn discard_failed_removes_the_entry_and_reindexes() {
    let mut timeline = Timeline::new();
    let now = Instant::now();
    timeline.push_optimistic("tmp-1", ChannelId(9), "first", now);
    timeline.push_optimistic("tmp-2", ChannelId(9), "second", now);
    timeline.reject("tmp-1");

    assert!(timeline.discard_failed("tmp-1"));
    assert_eq!(contents(&timeline), vec!["second"]);
    assert!(timeline.confirm("tmp-2", payload(9, "second")));
}

#[test]
fn hydrate_keeps_the_optimistic_tail() {
    let mut timeline = Timeline::new();
    let now = Instant::now();
    timeline.push_optimistic("tmp-1", ChannelId(9), "unsent", now);

    timeline.hydrate(vec![payload(1, "a"), payload(2, "b")]);

    assert_eq!(contents(&timeline), vec!["a", "b", "unsent"]);
    assert!(timeline.confirm("tmp-1", payload(3, "unsent")));
}
