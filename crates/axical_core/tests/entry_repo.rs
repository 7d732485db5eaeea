mod common;

use axical_core::db::open_db;
use axical_core::keys::{entry_index_key, entry_key};
use axical_core::store::{
    CallContext, Item, ItemStore, MemoryItemStore, Precondition, SqliteItemStore, StoreError,
};
use axical_core::{
    EntryRepository, ErrorKind, RepoError, StoreEntryRepository, StoreThemeRepository, Theme,
    ThemeRepository,
};
use chrono::NaiveDate;
use common::{amount_fields, data, date, entry, owner, FaultyStore};
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use uuid::Uuid;

fn amounts(entries: &[axical_core::Entry]) -> Vec<i64> {
    entries
        .iter()
        .map(|entry| entry.data["amount"].as_i64().unwrap())
        .collect()
}

#[test]
fn create_then_get_by_id_roundtrip() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();
    let theme_id = Uuid::new_v4();

    let mut created = entry(user, theme_id, "2024-01-10", 5);
    created
        .data
        .insert("note".to_string(), json!("lunch with team"));
    repo.create(&ctx, &mut created).unwrap();
    assert!(!created.entry_id.is_nil());

    let loaded = repo.get_by_id(&ctx, user, created.entry_id).unwrap();
    assert_eq!(loaded, created);
    assert_eq!(loaded.entry_date, date("2024-01-10"));

    let item = store
        .get(&ctx, &entry_key(user, date("2024-01-10"), created.entry_id))
        .unwrap()
        .unwrap();
    assert_eq!(
        item.index_key,
        Some(entry_index_key(user, date("2024-01-10"), theme_id))
    );
}

#[test]
fn create_requires_owner_and_theme_and_rejects_duplicates() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();

    let mut no_owner = entry(Uuid::nil(), Uuid::new_v4(), "2024-01-10", 1);
    assert_eq!(
        repo.create(&ctx, &mut no_owner).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    let mut no_theme = entry(owner(), Uuid::nil(), "2024-01-10", 1);
    assert_eq!(
        repo.create(&ctx, &mut no_theme).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    let mut first = entry(owner(), Uuid::new_v4(), "2024-01-10", 1);
    repo.create(&ctx, &mut first).unwrap();
    let mut again = first.clone();
    assert!(matches!(
        repo.create(&ctx, &mut again),
        Err(RepoError::AlreadyExists { .. })
    ));
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn date_range_is_inclusive_and_scoped_to_theme() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();
    let theme_id = Uuid::new_v4();
    let other_theme = Uuid::new_v4();

    for (day, amount) in [("2024-01-03", 3), ("2024-01-01", 1), ("2024-01-02", 2)] {
        repo.create(&ctx, &mut entry(user, theme_id, day, amount))
            .unwrap();
    }
    repo.create(&ctx, &mut entry(user, other_theme, "2024-01-02", 99))
        .unwrap();
    repo.create(&ctx, &mut entry(owner(), theme_id, "2024-01-02", 42))
        .unwrap();

    let d1_d2 = repo
        .list_by_date_range(&ctx, user, date("2024-01-01"), date("2024-01-02"), theme_id)
        .unwrap();
    assert_eq!(amounts(&d1_d2), vec![1, 2]);

    let d2_only = repo
        .list_by_date_range(&ctx, user, date("2024-01-02"), date("2024-01-02"), theme_id)
        .unwrap();
    assert_eq!(amounts(&d2_only), vec![2]);

    let err = repo
        .list_by_date_range(&ctx, user, date("2024-01-03"), date("2024-01-01"), theme_id)
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidArgument(_)));
    assert!(matches!(
        repo.list_by_date_range(&ctx, user, date("2024-01-01"), date("2024-01-03"), Uuid::nil()),
        Err(RepoError::InvalidArgument(_))
    ));
}

#[test]
fn range_reads_follow_continuation_tokens() {
    let store = MemoryItemStore::with_page_size(2);
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();
    let theme_id = Uuid::new_v4();
    let noise = Uuid::new_v4();

    for day in 1..=7 {
        let day = format!("2024-03-{day:02}");
        repo.create(&ctx, &mut entry(user, theme_id, &day, 1))
            .unwrap();
        repo.create(&ctx, &mut entry(user, noise, &day, 0)).unwrap();
    }

    let listed = repo
        .list_by_date_range(&ctx, user, date("2024-03-01"), date("2024-03-31"), theme_id)
        .unwrap();
    assert_eq!(listed.len(), 7);
    assert!(listed
        .windows(2)
        .all(|pair| pair[0].entry_date <= pair[1].entry_date));

    let last = listed.last().unwrap().entry_id;
    assert_eq!(repo.get_by_id(&ctx, user, last).unwrap().entry_id, last);
}

#[test]
fn same_date_update_rewrites_in_place() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();

    let mut stored = entry(user, Uuid::new_v4(), "2024-01-10", 5);
    repo.create(&ctx, &mut stored).unwrap();
    let created_at = stored.created_at;

    let mut edit = stored.clone();
    edit.theme_id = Uuid::nil();
    edit.data = data(json!({ "amount": 8 }));
    repo.update(&ctx, &mut edit).unwrap();
    assert_eq!(edit.theme_id, stored.theme_id);

    let loaded = repo.get_by_id(&ctx, user, stored.entry_id).unwrap();
    assert_eq!(loaded.data["amount"], json!(8));
    assert_eq!(loaded.created_at, created_at);
    assert_eq!(loaded.updated_at, edit.updated_at);
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn date_change_migrates_key_and_keeps_one_copy() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();
    let theme_id = Uuid::new_v4();

    let mut stored = entry(user, theme_id, "2024-01-10", 5);
    repo.create(&ctx, &mut stored).unwrap();

    let mut moved = stored.clone();
    moved.entry_date = date("2024-02-01");
    repo.update(&ctx, &mut moved).unwrap();

    let loaded = repo.get_by_id(&ctx, user, stored.entry_id).unwrap();
    assert_eq!(loaded.entry_date, date("2024-02-01"));
    assert_eq!(loaded.created_at, stored.created_at);
    assert_eq!(store.len().unwrap(), 1);
    assert!(store
        .get(&ctx, &entry_key(user, date("2024-01-10"), stored.entry_id))
        .unwrap()
        .is_none());

    let january = repo
        .list_by_date_range(&ctx, user, date("2024-01-01"), date("2024-01-31"), theme_id)
        .unwrap();
    assert!(january.is_empty());
}

#[test]
fn migration_into_occupied_key_conflicts_and_keeps_original() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();

    let mut stored = entry(user, Uuid::new_v4(), "2024-01-10", 5);
    repo.create(&ctx, &mut stored).unwrap();
    let squatter = Item::new(
        entry_key(user, date("2024-02-01"), stored.entry_id),
        Default::default(),
    );
    store.put(&ctx, &squatter, &Precondition::None).unwrap();

    let mut moved = stored.clone();
    moved.entry_date = date("2024-02-01");
    let err = repo.update(&ctx, &mut moved).unwrap_err();
    assert!(matches!(err, RepoError::Conflict { .. }));
    assert!(err.is_retryable());

    let loaded = repo.get_by_id(&ctx, user, stored.entry_id).unwrap();
    assert_eq!(loaded, stored);
}

#[test]
fn theme_id_cannot_change_on_update() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();

    let mut stored = entry(user, Uuid::new_v4(), "2024-01-10", 5);
    repo.create(&ctx, &mut stored).unwrap();

    let mut edit = stored.clone();
    edit.theme_id = Uuid::new_v4();
    assert!(matches!(
        repo.update(&ctx, &mut edit),
        Err(RepoError::InvalidArgument(_))
    ));
    assert_eq!(repo.get_by_id(&ctx, user, stored.entry_id).unwrap(), stored);
}

#[test]
fn other_owners_see_nothing_and_change_nothing() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let alice = owner();
    let bob = owner();

    let mut stored = entry(alice, Uuid::new_v4(), "2024-01-10", 5);
    repo.create(&ctx, &mut stored).unwrap();
    let before = store.snapshot().unwrap();

    assert!(matches!(
        repo.get_by_id(&ctx, bob, stored.entry_id),
        Err(RepoError::NotFound { .. })
    ));

    let mut hijack = stored.clone();
    hijack.owner_id = bob;
    hijack.entry_date = date("2024-03-01");
    assert!(matches!(
        repo.update(&ctx, &mut hijack),
        Err(RepoError::NotFound { .. })
    ));
    assert!(matches!(
        repo.delete(&ctx, bob, stored.entry_id, stored.entry_date),
        Err(RepoError::NotFound { .. })
    ));
    assert!(repo
        .list_by_date_range(
            &ctx,
            bob,
            date("2024-01-01"),
            date("2024-12-31"),
            stored.theme_id
        )
        .unwrap()
        .is_empty());

    assert_eq!(store.snapshot().unwrap(), before);
}

#[test]
fn delete_needs_the_stored_date() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();

    let mut stored = entry(user, Uuid::new_v4(), "2024-01-10", 5);
    repo.create(&ctx, &mut stored).unwrap();

    assert!(matches!(
        repo.delete(&ctx, user, stored.entry_id, date("2024-01-11")),
        Err(RepoError::NotFound { .. })
    ));
    repo.delete(&ctx, user, stored.entry_id, stored.entry_date)
        .unwrap();
    assert!(store.is_empty().unwrap());
    assert!(matches!(
        repo.get_by_id(&ctx, user, stored.entry_id),
        Err(RepoError::NotFound { .. })
    ));

    let mut replacement = entry(user, stored.theme_id, "2024-01-10", 6);
    repo.create(&ctx, &mut replacement).unwrap();
    assert_ne!(replacement.entry_id, stored.entry_id);
}

#[test]
fn concurrent_date_changes_leave_exactly_one_copy() {
    let memory = MemoryItemStore::new();
    let ctx = CallContext::new();
    let user = owner();

    let mut stored = entry(user, Uuid::new_v4(), "2024-01-10", 5);
    StoreEntryRepository::new(&memory)
        .create(&ctx, &mut stored)
        .unwrap();

    let gated = FaultyStore::new(&memory).with_transact_gate(Arc::new(Barrier::new(2)));
    let repo = StoreEntryRepository::new(&gated);

    let results = thread::scope(|scope| {
        let handles = ["2024-02-01", "2024-03-01"]
            .into_iter()
            .map(|day| {
                let mut target = stored.clone();
                target.entry_date = date(day);
                let repo = &repo;
                let ctx = ctx.clone();
                scope.spawn(move || repo.update(&ctx, &mut target).map(|_| target.entry_date))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(
                err.kind(),
                ErrorKind::NotFound | ErrorKind::Conflict
            ));
        }
    }

    let winning_date = results
        .into_iter()
        .find_map(Result::ok)
        .unwrap();
    assert_eq!(memory.len().unwrap(), 1);
    let loaded = repo.get_by_id(&ctx, user, stored.entry_id).unwrap();
    assert_eq!(loaded.entry_date, winning_date);
}

#[test]
fn cancellation_after_lookup_stops_date_migration() {
    let memory = MemoryItemStore::new();
    let store = FaultyStore::new(&memory);
    let repo = StoreEntryRepository::new(&store);
    let user = owner();

    let mut stored = entry(user, Uuid::new_v4(), "2024-01-10", 5);
    repo.create(&CallContext::new(), &mut stored).unwrap();

    let ctx = CallContext::new();
    store.cancel_after(&ctx, 1);
    let mut moved = stored.clone();
    moved.entry_date = date("2024-02-01");
    let err = repo.update(&ctx, &mut moved).unwrap_err();
    assert!(matches!(err, RepoError::Unavailable(StoreError::Cancelled)));
    assert!(err.is_retryable());

    let loaded = repo
        .get_by_id(&CallContext::new(), user, stored.entry_id)
        .unwrap();
    assert_eq!(loaded, stored);
    assert_eq!(memory.len().unwrap(), 1);
}

#[test]
fn month_listing_uses_index_prefix() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();
    let theme_id = Uuid::new_v4();

    for (day, amount) in [
        ("2024-01-31", 1),
        ("2024-02-01", 2),
        ("2024-02-29", 3),
        ("2024-03-01", 4),
    ] {
        repo.create(&ctx, &mut entry(user, theme_id, day, amount))
            .unwrap();
    }

    let february = repo.list_for_month(&ctx, user, theme_id, 2024, 2).unwrap();
    assert_eq!(amounts(&february), vec![2, 3]);
    assert!(matches!(
        repo.list_for_month(&ctx, user, theme_id, 2024, 13),
        Err(RepoError::InvalidArgument(_))
    ));
}

#[test]
fn dates_outside_four_digit_years_are_rejected() {
    let store = MemoryItemStore::new();
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();
    let theme_id = Uuid::new_v4();
    let far_future = NaiveDate::from_ymd_opt(10000, 1, 1).unwrap();
    let before_year_zero = NaiveDate::from_ymd_opt(-1, 12, 31).unwrap();

    for day in [far_future, before_year_zero] {
        let mut invalid = entry(user, theme_id, "2024-01-01", 1);
        invalid.entry_date = day;
        assert!(matches!(
            repo.create(&ctx, &mut invalid),
            Err(RepoError::InvalidArgument(_))
        ));
    }
    assert!(store.is_empty().unwrap());

    let mut last_day = entry(user, theme_id, "9999-12-31", 7);
    repo.create(&ctx, &mut last_day).unwrap();
    let listed = repo
        .list_by_date_range(&ctx, user, date("2024-01-01"), date("9999-12-31"), theme_id)
        .unwrap();
    assert_eq!(amounts(&listed), vec![7]);

    let mut moved = last_day.clone();
    moved.entry_date = far_future;
    assert!(matches!(
        repo.update(&ctx, &mut moved),
        Err(RepoError::InvalidArgument(_))
    ));
    assert_eq!(
        repo.get_by_id(&ctx, user, last_day.entry_id)
            .unwrap()
            .entry_date,
        date("9999-12-31")
    );
    assert!(matches!(
        repo.list_by_date_range(&ctx, user, date("2024-01-01"), far_future, theme_id),
        Err(RepoError::InvalidArgument(_))
    ));
}

#[test]
fn exact_date_listing_and_range_count() {
    let store = MemoryItemStore::with_page_size(2);
    let repo = StoreEntryRepository::new(&store);
    let ctx = CallContext::new();
    let user = owner();
    let theme_id = Uuid::new_v4();
    let noise = Uuid::new_v4();

    for (day, amount) in [
        ("2024-04-01", 1),
        ("2024-04-02", 2),
        ("2024-04-02", 3),
        ("2024-04-02", 4),
        ("2024-04-03", 5),
    ] {
        repo.create(&ctx, &mut entry(user, theme_id, day, amount))
            .unwrap();
        repo.create(&ctx, &mut entry(user, noise, day, 0)).unwrap();
    }

    let mut second = amounts(
        &repo
            .list_for_date(&ctx, user, theme_id, date("2024-04-02"))
            .unwrap(),
    );
    second.sort();
    assert_eq!(second, vec![2, 3, 4]);
    assert!(repo
        .list_for_date(&ctx, owner(), theme_id, date("2024-04-02"))
        .unwrap()
        .is_empty());

    assert_eq!(
        repo.count_by_date_range(&ctx, user, date("2024-04-02"), date("2024-04-30"), theme_id)
            .unwrap(),
        4
    );
    assert_eq!(
        repo.count_by_date_range(&ctx, user, date("2024-05-01"), date("2024-05-31"), theme_id)
            .unwrap(),
        0
    );
    assert!(matches!(
        repo.count_by_date_range(&ctx, user, date("2024-04-03"), date("2024-04-01"), theme_id),
        Err(RepoError::InvalidArgument(_))
    ));
}

#[test]
fn scenario_on_file_backed_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("axical.db");
    let ctx = CallContext::new();
    let user = owner();

    let (theme_id, entry_id) = {
        let conn = open_db(&path).unwrap();
        let store = SqliteItemStore::new(&conn);
        let themes = StoreThemeRepository::new(&store);
        let entries = StoreEntryRepository::new(&store);

        let mut theme = Theme::new(user, "Expenses", amount_fields());
        themes.create(&ctx, &mut theme).unwrap();

        let mut e1 = entry(user, theme.theme_id, "2024-01-10", 5);
        entries.create(&ctx, &mut e1).unwrap();

        let january = entries
            .list_by_date_range(&ctx, user, date("2024-01-01"), date("2024-01-31"), theme.theme_id)
            .unwrap();
        assert_eq!(january, vec![e1.clone()]);
        (theme.theme_id, e1.entry_id)
    };

    let conn = open_db(&path).unwrap();
    let store = SqliteItemStore::new(&conn);
    let entries = StoreEntryRepository::new(&store);

    let mut moved = entries.get_by_id(&ctx, user, entry_id).unwrap();
    moved.entry_date = date("2024-02-01");
    entries.update(&ctx, &mut moved).unwrap();

    assert_eq!(
        entries.get_by_id(&ctx, user, entry_id).unwrap().entry_date,
        date("2024-02-01")
    );
    assert!(entries
        .list_by_date_range(&ctx, user, date("2024-01-01"), date("2024-01-31"), theme_id)
        .unwrap()
        .is_empty());
    assert_eq!(
        entries.list_for_month(&ctx, user, theme_id, 2024, 2).unwrap().len(),
        1
    );
}
