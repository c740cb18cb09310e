//! Transactional visibility and durability, end to end.

use std::collections::HashMap;
use std::sync::Arc;

use quiver::{
    AggregateSpec, BoundExpr, BoundPlan, Config, Database, LogicalType, QuiverError, Value,
};
use tempfile::tempdir;

fn count_nodes_plan(db: &Arc<Database>, table: &str) -> BoundPlan {
    let catalog = db
        .catalog()
        .snapshot(quiver::transaction::TransactionKind::ReadOnly);
    let id = catalog.node_table(table).expect("table exists").id;
    BoundPlan::ScanNodes {
        table: id,
        columns: vec![],
    }
    .aggregate(vec![], vec![AggregateSpec::CountStar])
}

fn count_of(result: &quiver::QueryResult) -> i64 {
    match result.rows[0][0] {
        Value::Int64(v) => v,
        ref other => panic!("expected a count, found {other:?}"),
    }
}

fn setup_person(db: &Arc<Database>) {
    let conn = db.connect();
    conn.create_node_table(
        "Person",
        &[("name", LogicalType::String), ("age", LogicalType::Int64)],
        "name",
    )
    .expect("create table");
}

#[test]
fn rollback_hides_inserts_from_later_readers() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    setup_person(&db);

    let conn = db.connect();
    conn.begin_write().expect("begin write");
    for i in 0..10 {
        conn.insert_node(
            "Person",
            &[Value::String(format!("p{i}")), Value::Int64(20 + i)],
        )
        .expect("insert");
    }
    conn.rollback().expect("rollback");

    let reader = db.connect();
    reader.begin_read().expect("begin read");
    let result = reader.execute(&count_nodes_plan(&db, "Person")).expect("count");
    assert_eq!(count_of(&result), 0);
    reader.commit().expect("commit reader");
}

#[test]
fn commit_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    {
        let db = Database::open(dir.path()).expect("open");
        setup_person(&db);
        let conn = db.connect();
        conn.begin_write().expect("begin write");
        for i in 0..10 {
            conn.insert_node(
                "Person",
                &[Value::String(format!("p{i}")), Value::Int64(20 + i)],
            )
            .expect("insert");
        }
        conn.commit().expect("commit");
        // No checkpoint: reopen must recover from the WAL alone.
    }
    {
        let db = Database::open(dir.path()).expect("reopen");
        let conn = db.connect();
        let result = conn.execute(&count_nodes_plan(&db, "Person")).expect("count");
        assert_eq!(count_of(&result), 10);
    }
}

#[test]
fn snapshot_readers_see_pre_commit_state() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    setup_person(&db);

    let writer = db.connect();
    let early_reader = db.connect();
    early_reader.begin_read().expect("begin early reader");

    writer.begin_write().expect("begin write");
    for i in 0..5 {
        writer
            .insert_node(
                "Person",
                &[Value::String(format!("w{i}")), Value::Int64(i)],
            )
            .expect("insert");
    }
    // Begun before commit: sees the pre-insert count.
    let before = early_reader
        .execute(&count_nodes_plan(&db, "Person"))
        .expect("early count");
    assert_eq!(count_of(&before), 0);

    // Commit blocks until the early reader drains, so it runs on its
    // own thread while the reader keeps observing the old state.
    let commit_handle = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || {
            let _ = &db;
            writer.commit()
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    let still_before = early_reader
        .execute(&count_nodes_plan(&db, "Person"))
        .expect("early count during pending commit");
    assert_eq!(count_of(&still_before), 0);
    early_reader.commit().expect("finish early reader");
    commit_handle
        .join()
        .expect("join committer")
        .expect("commit");

    // Begun after commit returned: sees the post-insert count.
    let late_reader = db.connect();
    late_reader.begin_read().expect("begin late reader");
    let after = late_reader
        .execute(&count_nodes_plan(&db, "Person"))
        .expect("late count");
    assert_eq!(count_of(&after), 5);
    late_reader.commit().expect("finish late reader");
}

#[test]
fn second_writer_is_rejected_until_first_finishes() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    setup_person(&db);

    let first = db.connect();
    let second = db.connect();
    first.begin_write().expect("first writer");
    assert!(matches!(
        second.begin_write(),
        Err(QuiverError::WriteConflict)
    ));
    first.commit().expect("commit first");
    second.begin_write().expect("second writer after commit");
    second.rollback().expect("rollback second");
}

#[test]
fn commit_without_transaction_errors() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    let conn = db.connect();
    assert!(matches!(conn.commit(), Err(QuiverError::NotActive)));
    assert!(matches!(conn.rollback(), Err(QuiverError::NotActive)));
}

#[test]
fn duplicate_pk_taints_manual_transaction_until_rollback() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    setup_person(&db);

    let conn = db.connect();
    conn.begin_write().expect("begin");
    conn.insert_node("Person", &[Value::String("ada".into()), Value::Int64(1)])
        .expect("insert");
    let err = conn
        .insert_node("Person", &[Value::String("ada".into()), Value::Int64(2)])
        .unwrap_err();
    assert!(matches!(err, QuiverError::Runtime(_)));

    // The transaction is still open but refuses further statements.
    let err = conn
        .insert_node("Person", &[Value::String("bob".into()), Value::Int64(3)])
        .unwrap_err();
    assert!(matches!(err, QuiverError::Runtime(_)));
    conn.rollback().expect("rollback");

    // Afterwards the connection works again.
    conn.insert_node("Person", &[Value::String("bob".into()), Value::Int64(3)])
        .expect("insert after rollback");
}

#[test]
fn prepared_statement_with_parameters() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    setup_person(&db);

    let conn = db.connect();
    for (name, age) in [("ada", 36), ("bob", 17), ("eve", 63)] {
        conn.insert_node("Person", &[Value::String(name.into()), Value::Int64(age)])
            .expect("insert");
    }

    let catalog = db
        .catalog()
        .snapshot(quiver::transaction::TransactionKind::ReadOnly);
    let table = catalog.node_table("Person").expect("table").id;
    let plan = BoundPlan::ScanNodes {
        table,
        columns: vec![0, 1],
    }
    .filter(BoundExpr::call(
        ">=",
        vec![BoundExpr::Column(2), BoundExpr::Parameter("min_age".into())],
    ))
    .aggregate(vec![], vec![AggregateSpec::CountStar]);
    let stmt = conn.prepare(plan);

    let mut params = HashMap::new();
    params.insert("min_age".to_string(), Value::Int64(18));
    let result = conn.execute_prepared(&stmt, &params).expect("execute");
    assert_eq!(count_of(&result), 2);

    params.insert("min_age".to_string(), Value::Int64(50));
    let result = conn.execute_prepared(&stmt, &params).expect("execute");
    assert_eq!(count_of(&result), 1);

    // Missing parameter is a binder error.
    assert!(matches!(
        conn.execute_prepared(&stmt, &HashMap::new()),
        Err(QuiverError::Binder(_))
    ));
}

#[test]
fn checkpoint_then_reopen_without_wal() {
    let dir = tempdir().expect("tempdir");
    {
        let db = Database::open_with_config(dir.path(), Config::default()).expect("open");
        setup_person(&db);
        let conn = db.connect();
        for i in 0..50 {
            conn.insert_node(
                "Person",
                &[Value::String(format!("p{i}")), Value::Int64(i)],
            )
            .expect("insert");
        }
        db.checkpoint().expect("checkpoint");
        db.verify().expect("verify");
    }
    {
        let db = Database::open(dir.path()).expect("reopen");
        let conn = db.connect();
        let result = conn.execute(&count_nodes_plan(&db, "Person")).expect("count");
        assert_eq!(count_of(&result), 50);
        db.verify().expect("verify after reopen");
    }
}
