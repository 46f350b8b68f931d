// SPDX-License-Identifier: Apache-2.0
//! Merge engine: existence resolution, field policies, uniqify, journaling.
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::collections::BTreeMap;

use cairn_core::{
    CommitOutcome, ConflictReason, ConstraintKind, Csid, Datatype, FieldDef, FieldSel,
    FieldValue, JournalSpec, MergeError, MergeOp, MergeOptions, QuerySpec, Recid, RectypeDef,
    Store, StoreConfig, Template, TemplateError, Timestamp, TxError, TxOptions, UniqifyOp,
    UniqifySpec, UniqifyWhich, UserIdent,
};

fn opts(user: &str, at: u64) -> TxOptions {
    TxOptions::new()
        .user(UserIdent::new(user))
        .at(Timestamp::from_millis(at))
}

fn merge_opts(user: &str, at: u64) -> MergeOptions {
    MergeOptions::new()
        .user(UserIdent::new(user))
        .at(Timestamp::from_millis(at))
}

fn committed(outcome: CommitOutcome) -> Csid {
    match outcome {
        CommitOutcome::Committed(csid) => csid,
        CommitOutcome::Rejected(violations) => panic!("unexpected rejection: {violations:?}"),
    }
}

fn store_with(template: Template) -> (Store, Csid) {
    let mut store = Store::new(StoreConfig::new());
    let tx = store.begin(opts("setup", 1)).expect("begin");
    store.set_template(tx, template).expect("set template");
    let root = committed(store.commit(tx).expect("commit template"));
    (store, root)
}

fn counter_template(ops: Vec<MergeOp>) -> Template {
    Template::new().rectype(
        "counter",
        RectypeDef::new()
            .field("name", FieldDef::new(Datatype::Str))
            .field("val", FieldDef::new(Datatype::Int).merge(ops)),
    )
}

/// Creates one counter record and returns (leaf, recid).
fn seed_counter(store: &mut Store, val: i64) -> (Csid, Recid) {
    let tx = store.begin(opts("seed", 10)).expect("begin");
    let recid = store.create(tx, "counter").expect("create");
    store
        .set_field(tx, recid, "name", Some(FieldValue::Str("hits".to_owned())))
        .expect("name");
    store
        .set_field(tx, recid, "val", Some(FieldValue::Int(val)))
        .expect("val");
    let leaf = committed(store.commit(tx).expect("commit"));
    (leaf, recid)
}

/// Commits `val` on a branch rooted at `base`.
fn branch_set_val(store: &mut Store, base: Csid, recid: Recid, user: &str, at: u64, val: i64) {
    let tx = store.begin(opts(user, at).baseline(base)).expect("begin");
    store.open_record(tx, "counter", recid).expect("open");
    store
        .set_field(tx, recid, "val", Some(FieldValue::Int(val)))
        .expect("set val");
    committed(store.commit(tx).expect("commit"));
}

fn val_of(store: &Store, recid: Recid) -> Option<FieldValue> {
    store
        .get_record("counter", recid, None)
        .expect("get")
        .and_then(|s| s.fields.get("val").cloned())
}

#[test]
fn most_recent_adopts_the_later_edit() {
    let (mut store, _) = store_with(counter_template(vec![MergeOp::MostRecent]));
    let (base, recid) = seed_counter(&mut store, 10);
    branch_set_val(&mut store, base, recid, "amy", 100, 35);
    branch_set_val(&mut store, base, recid, "bob", 200, 44);
    assert_eq!(store.get_leaves().len(), 2);

    let outcome = store.merge(merge_opts("moderator", 300)).expect("merge");
    assert_eq!(store.get_leaves(), vec![outcome.csid]);
    assert_eq!(outcome.parents.len(), 2);
    assert_eq!(val_of(&store, recid), Some(FieldValue::Int(44)));
}

#[test]
fn least_recent_adopts_the_earlier_edit() {
    let (mut store, _) = store_with(counter_template(vec![MergeOp::LeastRecent]));
    let (base, recid) = seed_counter(&mut store, 10);
    branch_set_val(&mut store, base, recid, "amy", 100, 35);
    branch_set_val(&mut store, base, recid, "bob", 200, 44);

    store.merge(merge_opts("moderator", 300)).expect("merge");
    assert_eq!(val_of(&store, recid), Some(FieldValue::Int(35)));
}

#[test]
fn min_picks_the_smallest_candidate() {
    let (mut store, _) = store_with(counter_template(vec![MergeOp::Min]));
    let (base, recid) = seed_counter(&mut store, 50);
    branch_set_val(&mut store, base, recid, "a", 100, 23);
    branch_set_val(&mut store, base, recid, "b", 200, 7);
    branch_set_val(&mut store, base, recid, "c", 300, 11);

    store.merge(merge_opts("moderator", 400)).expect("merge");
    assert_eq!(val_of(&store, recid), Some(FieldValue::Int(7)));
}

#[test]
fn shortest_picks_the_shorter_string() {
    let template = Template::new().rectype(
        "counter",
        RectypeDef::new()
            .field("name", FieldDef::new(Datatype::Str).merge(vec![MergeOp::Shortest]))
            .field("val", FieldDef::new(Datatype::Int)),
    );
    let (mut store, _) = store_with(template);
    let (base, recid) = seed_counter(&mut store, 10);
    for (user, at, name) in [("amy", 100, "hit-counter"), ("bob", 200, "hits")] {
        let tx = store.begin(opts(user, at).baseline(base)).expect("begin");
        store.open_record(tx, "counter", recid).expect("open");
        store
            .set_field(tx, recid, "name", Some(FieldValue::Str(name.to_owned())))
            .expect("name");
        committed(store.commit(tx).expect("commit"));
    }

    store.merge(merge_opts("moderator", 300)).expect("merge");
    let name = store
        .get_record("counter", recid, None)
        .expect("get")
        .and_then(|s| s.fields.get("name").cloned());
    assert_eq!(name, Some(FieldValue::Str("hits".to_owned())));
}

#[test]
fn tied_operator_falls_through_to_the_next() {
    let (mut store, _) = store_with(counter_template(vec![
        MergeOp::MostRecent,
        MergeOp::Min,
    ]));
    let (base, recid) = seed_counter(&mut store, 10);
    // Equal timestamps: most_recent ties, min decides.
    branch_set_val(&mut store, base, recid, "amy", 100, 44);
    branch_set_val(&mut store, base, recid, "bob", 100, 35);

    store.merge(merge_opts("moderator", 300)).expect("merge");
    assert_eq!(val_of(&store, recid), Some(FieldValue::Int(35)));
}

#[test]
fn single_sided_edits_win_without_a_policy() {
    // No merge policy declared anywhere: only one side edited, so the
    // classic three-way rule decides and no operator is consulted.
    let (mut store, _) = store_with(counter_template(vec![]));
    let (base, recid) = seed_counter(&mut store, 10);
    branch_set_val(&mut store, base, recid, "amy", 100, 35);
    // Second branch edits only the name.
    let tx = store.begin(opts("bob", 200).baseline(base)).expect("begin");
    store.open_record(tx, "counter", recid).expect("open");
    store
        .set_field(tx, recid, "name", Some(FieldValue::Str("misses".to_owned())))
        .expect("name");
    committed(store.commit(tx).expect("commit"));

    store.merge(merge_opts("moderator", 300)).expect("merge");
    let snapshot = store
        .get_record("counter", recid, None)
        .expect("get")
        .expect("live");
    assert_eq!(snapshot.fields.get("val"), Some(&FieldValue::Int(35)));
    assert_eq!(
        snapshot.fields.get("name"),
        Some(&FieldValue::Str("misses".to_owned()))
    );
}

#[test]
fn sum_aggregates_all_candidates() {
    let (mut store, _) = store_with(counter_template(vec![MergeOp::Sum]));
    let (base, recid) = seed_counter(&mut store, 0);
    branch_set_val(&mut store, base, recid, "a", 100, 7);
    branch_set_val(&mut store, base, recid, "b", 200, 11);
    branch_set_val(&mut store, base, recid, "c", 300, 23);
    assert_eq!(store.get_leaves().len(), 3);

    store.merge(merge_opts("moderator", 400)).expect("merge");
    assert_eq!(store.get_leaves().len(), 1);
    assert_eq!(val_of(&store, recid), Some(FieldValue::Int(41)));
}

#[test]
fn exhausted_policies_fail_atomically_with_conflicts() {
    let (mut store, _) = store_with(counter_template(vec![MergeOp::MostRecent]));
    let (base, recid) = seed_counter(&mut store, 10);
    // Same timestamp, different values: most_recent ties, list exhausted.
    branch_set_val(&mut store, base, recid, "amy", 100, 35);
    branch_set_val(&mut store, base, recid, "bob", 100, 44);
    let leaves_before = store.get_leaves();

    let err = store
        .merge(merge_opts("moderator", 300))
        .expect_err("tie must conflict");
    let MergeError::Unresolved(conflicts) = err else {
        panic!("expected unresolved merge");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].recid, recid);
    assert_eq!(conflicts[0].field.as_deref(), Some("val"));
    assert!(matches!(
        conflicts[0].reason,
        ConflictReason::Tie {
            op: MergeOp::MostRecent
        }
    ));
    // Atomic: the store is untouched.
    assert_eq!(store.get_leaves(), leaves_before);
}

#[test]
fn delete_wins_over_unmodified_but_conflicts_with_modify() {
    let (mut store, _) = store_with(counter_template(vec![MergeOp::MostRecent]));
    let (base, recid) = seed_counter(&mut store, 10);

    // Deleted on one branch, untouched on the other: delete wins.
    let tx = store.begin(opts("amy", 100).baseline(base)).expect("begin");
    store.delete_record(tx, "counter", recid).expect("delete");
    committed(store.commit(tx).expect("commit"));
    let tx = store.begin(opts("bob", 200).baseline(base)).expect("begin");
    let other = store.create(tx, "counter").expect("create");
    store
        .set_field(tx, other, "val", Some(FieldValue::Int(1)))
        .expect("val");
    committed(store.commit(tx).expect("commit"));

    store.merge(merge_opts("moderator", 300)).expect("merge");
    assert_eq!(store.get_record("counter", recid, None).expect("get"), None);
    assert!(store.get_record("counter", other, None).expect("get").is_some());

    // Deleted on one branch, modified on the other: explicit conflict.
    let base = store.get_leaves()[0];
    let tx = store.begin(opts("amy", 400).baseline(base)).expect("begin");
    store.delete_record(tx, "counter", other).expect("delete");
    committed(store.commit(tx).expect("commit"));
    branch_set_val(&mut store, base, other, "bob", 500, 2);

    let err = store.merge(merge_opts("moderator", 600)).expect_err("conflict");
    let MergeError::Unresolved(conflicts) = err else {
        panic!("expected unresolved merge");
    };
    assert_eq!(conflicts[0].reason, ConflictReason::DeleteVsModify);
    assert_eq!(conflicts[0].recid, other);
}

fn part_template(uniqify: UniqifySpec) -> Template {
    Template::new().rectype(
        "part",
        RectypeDef::new().field(
            "code",
            FieldDef::new(Datatype::Str).unique().uniqify(uniqify),
        ),
    )
}

#[test]
fn uniqify_rewrites_the_last_modified_collider() {
    let (mut store, root) = store_with(part_template(UniqifySpec {
        which: UniqifyWhich::LastModified,
        op: UniqifyOp::AppendUserPrefixUnique,
    }));

    // Two writers independently create a part coded "CQ".
    let mut made = Vec::new();
    for (user, at) in [("amy", 100), ("bob", 200)] {
        let tx = store.begin(opts(user, at).baseline(root)).expect("begin");
        let recid = store.create(tx, "part").expect("create");
        store
            .set_field(tx, recid, "code", Some(FieldValue::Str("CQ".to_owned())))
            .expect("code");
        committed(store.commit(tx).expect("commit"));
        made.push(recid);
    }
    assert_eq!(store.get_leaves().len(), 2);

    store.merge(merge_opts("moderator", 300)).expect("merge");
    assert_eq!(store.get_leaves().len(), 1);

    // Both records survive; the later write was rewritten.
    let amy_code = store
        .get_record("part", made[0], None)
        .expect("get")
        .and_then(|s| s.fields.get("code").cloned());
    let bob_code = store
        .get_record("part", made[1], None)
        .expect("get")
        .and_then(|s| s.fields.get("code").cloned());
    assert_eq!(amy_code, Some(FieldValue::Str("CQ".to_owned())));
    assert_eq!(bob_code, Some(FieldValue::Str("CQ~moderator".to_owned())));
}

#[test]
fn journaled_decisions_create_records_in_the_merge_changeset() {
    let template = Template::new()
        .rectype(
            "counter",
            RectypeDef::new().field(
                "val",
                FieldDef::new(Datatype::Int)
                    .merge(vec![MergeOp::Max])
                    .journal(JournalSpec {
                        rectype: "journal".to_owned(),
                        fields: BTreeMap::from([(
                            "note".to_owned(),
                            "$op on $field: $candidates -> $resolved".to_owned(),
                        )]),
                    }),
            ),
        )
        .rectype(
            "journal",
            RectypeDef::new().field("note", FieldDef::new(Datatype::Str)),
        );
    let (mut store, _) = store_with(template);
    let (base, recid) = seed_counter_typed(&mut store, 10);
    branch_set_val(&mut store, base, recid, "amy", 100, 35);
    branch_set_val(&mut store, base, recid, "bob", 200, 44);

    store.merge(merge_opts("moderator", 300)).expect("merge");
    assert_eq!(val_of(&store, recid), Some(FieldValue::Int(44)));

    let rows = store
        .query(&QuerySpec::rectype("journal").select(FieldSel::Field("note".to_owned())))
        .expect("query journal");
    assert_eq!(rows.len(), 1);
    let note = rows[0].cells.get("note").expect("note cell");
    match note {
        cairn_core::QueryValue::Value(FieldValue::Str(text)) => {
            assert!(text.starts_with("max on val:"), "unexpected note: {text}");
            assert!(text.ends_with("-> 44"), "unexpected note: {text}");
        }
        other => panic!("unexpected cell: {other:?}"),
    }
}

#[test]
fn journal_template_must_cover_required_journal_fields() {
    // A journal rectype with a required field outside the pattern map could
    // only ever produce invalid records; the template is rejected up front.
    let template = Template::new()
        .rectype(
            "counter",
            RectypeDef::new().field(
                "val",
                FieldDef::new(Datatype::Int)
                    .merge(vec![MergeOp::Max])
                    .journal(JournalSpec {
                        rectype: "journal".to_owned(),
                        fields: BTreeMap::from([("note".to_owned(), "$op on $field".to_owned())]),
                    }),
            ),
        )
        .rectype(
            "journal",
            RectypeDef::new()
                .field("note", FieldDef::new(Datatype::Str))
                .field("severity", FieldDef::new(Datatype::Int).required()),
        );
    let mut store = Store::new(StoreConfig::new());
    let tx = store.begin(opts("setup", 1)).expect("begin");
    assert!(matches!(
        store.set_template(tx, template),
        Err(TxError::InvalidTemplate(TemplateError::JournalMissingRequired {
            journal_field,
            ..
        })) if journal_field == "severity"
    ));
}

#[test]
fn journal_records_that_violate_constraints_fail_the_merge() {
    // The pattern map is well formed, but the substituted message overruns
    // the journal field's maxlength at merge time.
    let template = Template::new()
        .rectype(
            "counter",
            RectypeDef::new().field(
                "val",
                FieldDef::new(Datatype::Int)
                    .merge(vec![MergeOp::Max])
                    .journal(JournalSpec {
                        rectype: "journal".to_owned(),
                        fields: BTreeMap::from([(
                            "note".to_owned(),
                            "$op on $field: $candidates -> $resolved".to_owned(),
                        )]),
                    }),
            ),
        )
        .rectype(
            "journal",
            RectypeDef::new().field("note", FieldDef::new(Datatype::Str).length(None, Some(8))),
        );
    let (mut store, _) = store_with(template);
    let (base, recid) = seed_counter_typed(&mut store, 10);
    branch_set_val(&mut store, base, recid, "amy", 100, 35);
    branch_set_val(&mut store, base, recid, "bob", 200, 44);
    let leaves_before = store.get_leaves();

    let err = store
        .merge(merge_opts("moderator", 300))
        .expect_err("journal constraint must fail the merge");
    let MergeError::Unresolved(conflicts) = err else {
        panic!("expected unresolved merge");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].rectype.as_deref(), Some("journal"));
    assert_eq!(conflicts[0].field.as_deref(), Some("note"));
    assert!(matches!(
        &conflicts[0].reason,
        ConflictReason::Constraint(v) if v.kind == ConstraintKind::MaxLength
    ));
    // Atomic: the store is untouched.
    assert_eq!(store.get_leaves(), leaves_before);
}

/// Like `seed_counter` but for templates without a `name` field.
fn seed_counter_typed(store: &mut Store, val: i64) -> (Csid, Recid) {
    let tx = store.begin(opts("seed", 10)).expect("begin");
    let recid = store.create(tx, "counter").expect("create");
    store
        .set_field(tx, recid, "val", Some(FieldValue::Int(val)))
        .expect("val");
    let leaf = committed(store.commit(tx).expect("commit"));
    (leaf, recid)
}

#[test]
fn merge_needs_two_leaves_and_a_branching_store() {
    let (mut store, _) = store_with(counter_template(vec![MergeOp::MostRecent]));
    assert_eq!(
        store.merge(merge_opts("m", 1)),
        Err(MergeError::NotEnoughLeaves { have: 1 })
    );

    let mut trivial = Store::new(StoreConfig::new().trivial(true));
    assert_eq!(
        trivial.merge(merge_opts("m", 1)),
        Err(MergeError::TrivialStore)
    );
}

#[test]
fn records_born_on_one_branch_survive_unmerged() {
    let (mut store, root) = store_with(counter_template(vec![MergeOp::MostRecent]));
    let mut made = Vec::new();
    for (user, at, val) in [("amy", 100, 1), ("bob", 200, 2)] {
        let tx = store.begin(opts(user, at).baseline(root)).expect("begin");
        let recid = store.create(tx, "counter").expect("create");
        store
            .set_field(tx, recid, "val", Some(FieldValue::Int(val)))
            .expect("val");
        committed(store.commit(tx).expect("commit"));
        made.push(recid);
    }

    store.merge(merge_opts("moderator", 300)).expect("merge");
    assert_eq!(val_of(&store, made[0]), Some(FieldValue::Int(1)));
    assert_eq!(val_of(&store, made[1]), Some(FieldValue::Int(2)));
}
