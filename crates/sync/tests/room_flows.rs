mod support;

use std::sync::Arc;

use murmur_storage::{AuthorId, ContextId, ContextKey, FeedEvent};
use murmur_sync::{
    ConnectionStatus, CurrentUser, EntryKey, EntryStatus, Profile, Room, RoomNotice, SyncSettings,
};

use support::{ScriptedBackend, WAIT, contents, wait_for_snapshot};

fn user(full_name: &str) -> CurrentUser {
    CurrentUser::new(AuthorId::new_v7(), Profile::new(full_name))
}

fn fast_reconnect() -> SyncSettings {
    SyncSettings {
        reconnect_delay_ms: 10,
        max_reconnect_attempts: 3,
        ..SyncSettings::default()
    }
}

async fn open(backend: &Arc<ScriptedBackend>, context: ContextKey, user: CurrentUser) -> Room {
    let room = Room::open(backend.clone(), context, user, fast_reconnect())
        .await
        .expect("room should open");
    wait_for_snapshot(&room, |snapshot| snapshot.connection == ConnectionStatus::Live).await;
    room
}

#[tokio::test]
async fn pending_entry_is_confirmed_in_place() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let stranger = AuthorId::new_v7();
    backend.insert_from(context, stranger, "earlier");
    let room = open(&backend, context, user("Ada")).await;
    backend.hold_creates();

    let local_id = room.submit("hi").await.unwrap().expect("content is not blank");
    let snapshot = room.snapshot();
    assert_eq!(contents(&snapshot)[..2], ["earlier", "hi"]);
    assert_eq!(snapshot.entries[1].key, EntryKey::Local(local_id));
    assert_eq!(snapshot.entries[1].status, EntryStatus::Pending);

    backend.wait_for_create_arrivals(1).await;
    backend.insert_from(context, stranger, "later");
    wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 4).await;
    backend.release_create(0);

    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.pending_count() == 0).await;
    let stored = backend.rows(context);
    assert_eq!(contents(&snapshot), vec!["earlier", "hi", "later"]);
    assert_eq!(snapshot.entries[1].key, EntryKey::Stored(stored[1].id));
    assert_eq!(snapshot.entries[1].status, EntryStatus::Confirmed);
}

#[tokio::test]
async fn identical_sends_never_cross_reconcile() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    backend.set_quiet(true);
    backend.hold_creates();

    let first = room.submit("hi").await.unwrap().unwrap();
    let second = room.submit("hi").await.unwrap().unwrap();
    assert_ne!(first, second);
    backend.wait_for_create_arrivals(2).await;
    let stored = backend.rows(context);

    backend.release_create(1);
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.pending_count() == 1).await;
    assert_eq!(snapshot.entries[0].key, EntryKey::Local(first));
    assert_eq!(snapshot.entries[1].key, EntryKey::Stored(stored[1].id));

    backend.release_create(0);
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.pending_count() == 0).await;
    let keys: Vec<_> = snapshot.entries.iter().map(|entry| entry.key).collect();
    assert_eq!(
        keys,
        vec![EntryKey::Stored(stored[0].id), EntryKey::Stored(stored[1].id)]
    );
}

#[tokio::test]
async fn failed_send_rolls_back_and_notifies() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let mut room = open(&backend, context, user("Ada")).await;
    backend.fail_next_create();

    let local_id = room.submit("oops").await.unwrap().unwrap();
    let notice = tokio::time::timeout(WAIT, room.next_notice())
        .await
        .unwrap()
        .unwrap();

    match notice {
        RoomNotice::SendFailed {
            local_id: failed,
            content,
            ..
        } => {
            assert_eq!(failed, local_id);
            assert_eq!(content, "oops");
        }
        other => panic!("unexpected notice {other:?}"),
    }
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.entries.is_empty()).await;
    assert!(!snapshot
        .entries
        .iter()
        .any(|entry| entry.key == EntryKey::Local(local_id)));
    assert!(backend.rows(context).is_empty());
}

#[tokio::test]
async fn blank_submission_is_ignored() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;

    assert_eq!(room.submit("  \n ").await.unwrap(), None);
    assert!(room.snapshot().entries.is_empty());
    assert!(backend.rows(context).is_empty());
}

#[tokio::test]
async fn own_echo_before_confirmation_is_not_duplicated() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    backend.hold_creates();

    let local_id = room.submit("echo").await.unwrap().unwrap();
    backend.wait_for_create_arrivals(1).await;
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 2).await;
    assert_eq!(snapshot.entries[0].key, EntryKey::Local(local_id));

    backend.release_create(0);
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.pending_count() == 0).await;
    let stored = backend.rows(context);
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].key, EntryKey::Stored(stored[0].id));
}

#[tokio::test]
async fn confirmation_before_echo_is_not_duplicated() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    backend.set_quiet(true);

    room.submit("late echo").await.unwrap().unwrap();
    wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.len() == 1 && snapshot.pending_count() == 0
    })
    .await;
    let stored = backend.rows(context);
    backend.set_quiet(false);
    backend.emit(FeedEvent::Inserted(stored[0].clone()));
    backend.insert_from(context, AuthorId::new_v7(), "marker");

    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.entries.len() >= 2).await;
    assert_eq!(contents(&snapshot), vec!["late echo", "marker"]);
}

#[tokio::test]
async fn push_and_feed_show_other_participants_entry_once() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let alice = user("Alice");
    let alice_id = alice.author_id;
    let sender = open(&backend, context, alice).await;
    let receiver = open(&backend, context, user("Bob")).await;
    backend.set_quiet(true);

    sender.submit("hello bob").await.unwrap().unwrap();
    let snapshot = wait_for_snapshot(&receiver, |snapshot| snapshot.entries.len() == 1).await;
    let entry = &snapshot.entries[0];
    assert_eq!(entry.author_id, alice_id);
    assert_eq!(
        entry.author.as_ref().map(|profile| profile.full_name.as_str()),
        Some("Alice")
    );

    let stored = backend.rows(context);
    backend.set_quiet(false);
    backend.emit(FeedEvent::Inserted(stored[0].clone()));
    backend.insert_from(context, AuthorId::new_v7(), "marker");
    let snapshot = wait_for_snapshot(&receiver, |snapshot| snapshot.entries.len() >= 2).await;

    assert_eq!(contents(&snapshot), vec!["hello bob", "marker"]);
    assert_eq!(
        wait_for_snapshot(&sender, |snapshot| snapshot.entries.len() >= 2)
            .await
            .entries
            .len(),
        2
    );
}

#[tokio::test]
async fn uncached_author_renders_immediately_then_patches() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let stranger = AuthorId::new_v7();
    backend.put_profile(stranger, "Bea");
    let room = open(&backend, context, user("Ada")).await;
    backend.hold_profiles();

    backend.insert_from(context, stranger, "hey");
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 1).await;
    assert!(snapshot.entries[0].author.is_none());

    backend.release_profiles();
    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.iter().all(|entry| entry.author.is_some())
    })
    .await;
    assert_eq!(
        snapshot.entries[0]
            .author
            .as_ref()
            .map(|profile| profile.full_name.as_str()),
        Some("Bea")
    );
}

#[tokio::test]
async fn simultaneous_entries_of_one_author_share_one_fetch() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let stranger = AuthorId::new_v7();
    backend.put_profile(stranger, "Cy");
    let room = open(&backend, context, user("Ada")).await;
    backend.hold_profiles();

    for content in ["one", "two", "three"] {
        backend.insert_from(context, stranger, content);
    }
    wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 3).await;
    backend.release_profiles();

    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.iter().all(|entry| entry.author.is_some())
    })
    .await;
    assert_eq!(backend.profile_fetches(), 1);
    let first = snapshot.entries[0].author.clone().unwrap();
    assert!(snapshot.entries.iter().all(|entry| {
        entry
            .author
            .as_ref()
            .is_some_and(|profile| Arc::ptr_eq(profile, &first))
    }));
}

#[tokio::test]
async fn missing_profile_falls_back_to_placeholder() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;

    backend.insert_from(context, AuthorId::new_v7(), "who am i");
    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.len() == 1 && snapshot.entries[0].author.is_some()
    })
    .await;

    assert_eq!(
        snapshot.entries[0]
            .author
            .as_ref()
            .map(|profile| profile.full_name.as_str()),
        Some("Unknown")
    );
}

#[tokio::test]
async fn history_profiles_are_seeded_without_fetching() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let stranger = AuthorId::new_v7();
    backend.put_profile(stranger, "Dee");
    backend.insert_from(context, stranger, "from history");

    let room = open(&backend, context, user("Ada")).await;
    backend.insert_from(context, stranger, "live");
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 2).await;

    assert_eq!(backend.profile_fetches(), 0);
    assert!(snapshot.entries.iter().all(|entry| {
        entry
            .author
            .as_ref()
            .is_some_and(|profile| profile.full_name == "Dee")
    }));
}

#[tokio::test]
async fn deletions_are_idempotent_and_final() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let stranger = AuthorId::new_v7();
    let room = open(&backend, context, user("Ada")).await;

    let doomed = backend.insert_from(context, stranger, "doomed");
    wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 1).await;
    backend.remove_and_notify(&doomed);
    backend.emit(FeedEvent::Deleted {
        context,
        entry_id: doomed.id,
    });
    backend.emit(FeedEvent::Inserted(doomed.clone()));
    backend.insert_from(context, stranger, "marker");

    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.iter().any(|entry| entry.content == "marker")
    })
    .await;
    assert_eq!(contents(&snapshot), vec!["marker"]);
}

#[tokio::test]
async fn local_delete_is_limited_to_own_confirmed_entries() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let mut room = open(&backend, context, user("Ada")).await;

    room.submit("mine").await.unwrap().unwrap();
    let theirs = backend.insert_from(context, AuthorId::new_v7(), "theirs");
    wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.len() == 2 && snapshot.pending_count() == 0
    })
    .await;
    let mine = backend
        .rows(context)
        .into_iter()
        .find(|row| row.content == "mine")
        .map(|row| row.id)
        .unwrap();

    room.delete(theirs.id).unwrap();
    let notice = tokio::time::timeout(WAIT, room.next_notice())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice, RoomNotice::DeleteRejected { entry_id: theirs.id });

    backend.fail_next_delete();
    room.delete(mine).unwrap();
    let notice = tokio::time::timeout(WAIT, room.next_notice())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(notice, RoomNotice::DeleteFailed { entry_id, .. } if entry_id == mine));
    assert_eq!(room.snapshot().entries.len(), 2);

    room.delete(mine).unwrap();
    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 1).await;
    assert_eq!(contents(&snapshot), vec!["theirs"]);
    assert_eq!(backend.rows(context).len(), 1);
}

#[tokio::test]
async fn reconnect_backfills_missed_changes() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let stranger = AuthorId::new_v7();
    let kept = backend.insert_from(context, stranger, "kept");
    let deleted = backend.insert_from(context, stranger, "deleted while away");
    let room = open(&backend, context, user("Ada")).await;
    assert_eq!(room.snapshot().entries.len(), 2);

    backend.fail_next_subscribes(1);
    backend.hub().disconnect(context);
    wait_for_snapshot(&room, |snapshot| {
        matches!(snapshot.connection, ConnectionStatus::Reconnecting { .. })
    })
    .await;
    backend.remove_silently(deleted.id);
    backend.insert_from(context, stranger, "sent while away");

    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.connection == ConnectionStatus::Live
            && snapshot.entries.iter().any(|entry| entry.content == "sent while away")
    })
    .await;
    assert_eq!(contents(&snapshot), vec!["kept", "sent while away"]);
    assert_eq!(snapshot.entries[0].key, EntryKey::Stored(kept.id));
    assert_eq!(backend.hub().subscriber_count(context), 1);
}

#[tokio::test]
async fn entry_confirmed_during_backfill_survives_the_stale_reply() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let stranger = AuthorId::new_v7();
    backend.insert_from(context, stranger, "newest before outage");
    let room = open(&backend, context, user("Ada")).await;
    backend.set_quiet(true);
    backend.insert_from(context, stranger, "missed");
    backend.set_quiet(false);

    backend.hold_listings();
    backend.hub().disconnect(context);
    // Initial history load plus the backfill after resubscribing.
    backend.wait_for_listing_arrivals(2).await;

    // The own row lands with an older timestamp than the newest row of the held batch.
    backend.set_clock(500);
    room.submit("mine").await.unwrap().unwrap();
    let confirmed = wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.len() == 2 && snapshot.pending_count() == 0
    })
    .await;
    assert_eq!(confirmed.entries[1].created_at_unix_ms, 501);
    backend.release_listings();

    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.iter().any(|entry| entry.content == "missed")
    })
    .await;
    assert_eq!(contents(&snapshot), vec!["newest before outage", "mine", "missed"]);
    assert_eq!(snapshot.entries[1].status, EntryStatus::Confirmed);
}

#[tokio::test]
async fn lagging_feed_backfills_skipped_entries() {
    let backend = ScriptedBackend::with_feed_capacity(4);
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    let stranger = AuthorId::new_v7();

    // Nothing awaits between inserts, so the dispatcher falls behind the feed.
    let expected: Vec<String> = (0..10).map(|index| format!("burst {index}")).collect();
    for content in &expected {
        backend.insert_from(context, stranger, content);
    }

    let snapshot = wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 10).await;
    let mut listed = contents(&snapshot);
    listed.sort_unstable();
    assert_eq!(listed, expected);
    assert_eq!(snapshot.connection, ConnectionStatus::Live);
}

#[tokio::test]
async fn online_count_follows_open_rooms() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let ada = open(&backend, context, user("Ada")).await;
    wait_for_snapshot(&ada, |snapshot| snapshot.online == 1).await;

    let grace = open(&backend, context, user("Grace")).await;
    wait_for_snapshot(&ada, |snapshot| snapshot.online == 2).await;
    wait_for_snapshot(&grace, |snapshot| snapshot.online == 2).await;

    grace.close().await.unwrap();
    wait_for_snapshot(&ada, |snapshot| snapshot.online == 1).await;
    assert_eq!(backend.hub().online_count(context), 1);
}

#[tokio::test]
async fn reconnect_gives_up_after_configured_attempts() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    let stranger = AuthorId::new_v7();
    backend.insert_from(context, stranger, "before outage");
    wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 1).await;

    backend.fail_next_subscribes(u32::MAX);
    backend.hub().disconnect(context);

    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.connection == ConnectionStatus::Disconnected
    })
    .await;
    assert_eq!(contents(&snapshot), vec!["before outage"]);
}

#[tokio::test]
async fn closing_releases_the_subscription() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    assert_eq!(backend.hub().subscriber_count(context), 1);

    room.close().await.unwrap();

    assert_eq!(backend.hub().subscriber_count(context), 0);
}

#[tokio::test]
async fn submission_finishing_after_close_is_harmless() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    backend.hold_creates();

    room.submit("in flight").await.unwrap().unwrap();
    backend.wait_for_create_arrivals(1).await;
    room.close().await.unwrap();
    backend.release_create(0);
    backend.wait_for_completed_creates(1).await;

    assert_eq!(backend.rows(context).len(), 1);
    assert_eq!(backend.hub().subscriber_count(context), 0);
}

#[tokio::test]
async fn comment_threads_list_newest_first() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::post(ContextId::new_v7());
    let room = Room::open(
        backend.clone(),
        context,
        user("Ada"),
        SyncSettings::for_comments(),
    )
    .await
    .unwrap();

    backend.insert_from(context, AuthorId::new_v7(), "first");
    backend.insert_from(context, AuthorId::new_v7(), "second");
    wait_for_snapshot(&room, |snapshot| snapshot.entries.len() == 2).await;
    room.submit("mine").await.unwrap().unwrap();

    let snapshot = wait_for_snapshot(&room, |snapshot| {
        snapshot.entries.len() == 3 && snapshot.pending_count() == 0
    })
    .await;
    assert_eq!(contents(&snapshot), vec!["mine", "second", "first"]);
}

#[tokio::test]
async fn dropping_the_handle_stops_the_dispatcher() {
    let backend = ScriptedBackend::new();
    let context = ContextKey::room(ContextId::new_v7());
    let room = open(&backend, context, user("Ada")).await;
    let watcher = room.watch();
    drop(room);

    let mut watcher = watcher;
    tokio::time::timeout(WAIT, async {
        while watcher.changed().await.is_ok() {}
    })
    .await
    .expect("dispatcher should stop after the handle is dropped");
    assert_eq!(backend.hub().subscriber_count(context), 0);
}
