use kyrie_core::model::{Issue, IssueId, IssuePatch, IssueRow, Status};
use kyrie_core::store::{IssueStore, MergePolicy};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

fn make_issue(id: u8, status: Status) -> Issue {
    let row: IssueRow = serde_json::from_value(json!({
        "id": format!("i{id}"),
        "project_id": "p1",
        "workspace_id": "w1",
        "sequence_id": u64::from(id),
        "status": status,
        "title": format!("issue {id}"),
        "created_at": "2025-01-01T00:00:00Z",
        "updated_at": "2025-01-01T00:00:00Z"
    }))
    .expect("row");
    Issue::from_row(row)
}

fn arb_status() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

#[derive(Debug, Clone)]
enum Op {
    Upsert(u8, Status),
    Remove(u8),
    Patch(u8, Status),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..12, arb_status()).prop_map(|(id, s)| Op::Upsert(id, s)),
        (0u8..12).prop_map(Op::Remove),
        (0u8..12, arb_status()).prop_map(|(id, s)| Op::Patch(id, s)),
    ]
}

fn apply(store: &mut IssueStore, op: &Op) {
    match op {
        Op::Upsert(id, status) => {
            store.upsert_one(make_issue(*id, *status), MergePolicy::PreserveDenormalized);
        }
        Op::Remove(id) => {
            store.remove_one(&IssueId::new(format!("i{id}")));
        }
        Op::Patch(id, status) => {
            store.patch_one(&IssueId::new(format!("i{id}")), &IssuePatch::status(*status));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn ids_stay_unique(ops in prop::collection::vec(arb_op(), 0..64)) {
        let mut store = IssueStore::new();
        for op in &ops {
            apply(&mut store, op);
        }
        let ids: HashSet<&IssueId> = store.iter().map(Issue::id).collect();
        prop_assert_eq!(ids.len(), store.len());
    }

    #[test]
    fn repeating_any_op_is_idempotent(
        ops in prop::collection::vec(arb_op(), 0..32),
        last in arb_op(),
    ) {
        let mut store = IssueStore::new();
        for op in &ops {
            apply(&mut store, op);
        }
        apply(&mut store, &last);
        let once = store.snapshot();
        apply(&mut store, &last);
        prop_assert_eq!(store.snapshot(), once);
    }

    #[test]
    fn new_ids_land_in_front(
        seed in prop::collection::vec((0u8..12, arb_status()), 0..12),
        fresh in 100u8..200,
        status in arb_status(),
    ) {
        let mut store = IssueStore::new();
        for (id, s) in &seed {
            store.upsert_one(make_issue(*id, *s), MergePolicy::Overwrite);
        }
        let before = store.snapshot();
        store.upsert_one(make_issue(fresh, status), MergePolicy::Overwrite);

        let after = store.snapshot();
        prop_assert_eq!(after[0].id().as_str(), format!("i{fresh}"));
        prop_assert_eq!(&after[1..], &before[..]);
    }

    #[test]
    fn patch_then_inverse_restores(
        seed in prop::collection::vec((0u8..8, arb_status()), 1..8),
        target in arb_status(),
    ) {
        let mut store = IssueStore::new();
        for (id, s) in &seed {
            store.upsert_one(make_issue(*id, *s), MergePolicy::Overwrite);
        }
        let before = store.snapshot();
        let id = before[0].id().clone();

        let patch = IssuePatch::status(target);
        let inverse = patch.inverse_for(&before[0].row);
        prop_assert!(store.patch_one(&id, &patch));
        prop_assert!(store.patch_one(&id, &inverse));
        prop_assert_eq!(store.snapshot(), before);
    }
}
