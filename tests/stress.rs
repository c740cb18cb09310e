//! Randomized (seeded) storage stress: the engine against an in-memory
//! model across commits and rollbacks.

use std::collections::HashMap;
use std::sync::Arc;

use quiver::{Database, Direction, LogicalType, Value};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const NUM_NODES: u64 = 600;
const ROUNDS: usize = 20;
const INSERTS_PER_ROUND: usize = 120;

#[test]
fn random_rel_inserts_match_model() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    let conn = db.connect();
    conn.create_node_table("N", &[("id", LogicalType::Int64)], "id")
        .expect("create nodes");
    conn.create_rel_table("E", "N", "N", &[("w", LogicalType::Int64)])
        .expect("create rels");
    for i in 0..NUM_NODES {
        conn.insert_node("N", &[Value::Int64(i as i64)]).expect("insert node");
    }

    // Model: src offset -> multiset of (dst offset, weight).
    let mut model: HashMap<u64, Vec<(u64, i64)>> = HashMap::new();

    for round in 0..ROUNDS {
        let rollback = round % 5 == 4;
        conn.begin_write().expect("begin");
        let mut staged: HashMap<u64, Vec<(u64, i64)>> = HashMap::new();
        for _ in 0..INSERTS_PER_ROUND {
            let src = rng.gen_range(0..NUM_NODES);
            let dst = rng.gen_range(0..NUM_NODES);
            let weight = rng.gen_range(-1000..1000i64);
            conn.insert_rel(
                "E",
                &Value::Int64(src as i64),
                &Value::Int64(dst as i64),
                &[Value::Int64(weight)],
            )
            .expect("insert rel");
            staged.entry(src).or_default().push((dst, weight));
        }
        if rollback {
            conn.rollback().expect("rollback");
        } else {
            conn.commit().expect("commit");
            for (src, mut entries) in staged {
                model.entry(src).or_default().append(&mut entries);
            }
        }
    }

    // Compare adjacency (with weights resolved through the rel property
    // column) against the model, as multisets per source.
    let catalog = db
        .catalog()
        .snapshot(quiver::transaction::TransactionKind::ReadOnly);
    let rel_def = catalog.rel_table("E").expect("rel def");
    let rel = db.tables().rel_table(rel_def.id).expect("rel table");
    let kind = quiver::transaction::TransactionKind::ReadOnly;

    for src in 0..NUM_NODES {
        let mut got: Vec<(u64, i64)> = Vec::new();
        for (dst, rel_offset) in rel.adjacency(src, Direction::Fwd, kind).expect("adjacency") {
            let weight = match rel.column(0).get_value(rel_offset, kind).expect("weight") {
                Value::Int64(w) => w,
                other => panic!("expected INT64 weight, found {other:?}"),
            };
            got.push((dst, weight));
        }
        let mut want = model.get(&src).cloned().unwrap_or_default();
        got.sort_unstable();
        want.sort_unstable();
        assert_eq!(got, want, "adjacency of node {src}");
    }

    db.verify().expect("verify");
    db.checkpoint().expect("checkpoint");
}

#[test]
fn random_string_columns_round_trip() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    let conn = db.connect();
    conn.create_node_table(
        "Doc",
        &[("id", LogicalType::Int64), ("body", LogicalType::String)],
        "id",
    )
    .expect("create");

    let mut model = Vec::new();
    for i in 0..500i64 {
        let len = rng.gen_range(0..600usize);
        let body: String = (0..len)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect();
        conn.insert_node("Doc", &[Value::Int64(i), Value::String(body.clone())])
            .expect("insert");
        model.push(body);
    }

    let catalog = db
        .catalog()
        .snapshot(quiver::transaction::TransactionKind::ReadOnly);
    let def = catalog.node_table("Doc").expect("def");
    let table = db.tables().node_table(def.id).expect("table");
    let kind = quiver::transaction::TransactionKind::ReadOnly;
    for (offset, want) in model.iter().enumerate() {
        let got = table
            .column(1)
            .get_value(offset as u64, kind)
            .expect("read body");
        assert_eq!(got, Value::String(want.clone()), "offset {offset}");
    }
}
