//! Query execution over a small property graph.

use std::sync::Arc;

use quiver::{
    AggregateSpec, BoundExpr, BoundPlan, Database, Direction, LogicalType, PathEmission, TableId,
    Value,
};
use tempfile::tempdir;

struct Graph {
    db: Arc<Database>,
    person: TableId,
    knows: TableId,
}

/// Nodes a, b, c with edges a->b, b->c, a->c.
fn triangle() -> (tempfile::TempDir, Graph) {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    let conn = db.connect();
    let person = conn
        .create_node_table(
            "Person",
            &[("name", LogicalType::String), ("age", LogicalType::Int64)],
            "name",
        )
        .expect("create Person");
    let knows = conn
        .create_rel_table("Knows", "Person", "Person", &[("since", LogicalType::Int64)])
        .expect("create Knows");

    for (name, age) in [("a", 30), ("b", 40), ("c", 30)] {
        conn.insert_node("Person", &[Value::String(name.into()), Value::Int64(age)])
            .expect("insert node");
    }
    for (src, dst, since) in [("a", "b", 2001), ("b", "c", 2002), ("a", "c", 2003)] {
        conn.insert_rel(
            "Knows",
            &Value::String(src.into()),
            &Value::String(dst.into()),
            &[Value::Int64(since)],
        )
        .expect("insert rel");
    }
    (dir, Graph { db, person, knows })
}

fn int_at(result: &quiver::QueryResult, row: usize, col: usize) -> i64 {
    match result.rows[row][col] {
        Value::Int64(v) => v,
        ref other => panic!("expected INT64, found {other:?}"),
    }
}

/// Scan persons, filter to one name, emit the id column.
fn bind_person(graph: &Graph, name: &str) -> BoundPlan {
    BoundPlan::ScanNodes {
        table: graph.person,
        columns: vec![0],
    }
    .filter(BoundExpr::call(
        "=",
        vec![
            BoundExpr::Column(1),
            BoundExpr::Literal(Value::String(name.into())),
        ],
    ))
}

#[test]
fn expand_matches_inserted_edges() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    // Every (src)-[:Knows]->(dst) pair.
    let plan = BoundPlan::Expand {
        child: Box::new(BoundPlan::ScanNodes {
            table: graph.person,
            columns: vec![0],
        }),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Fwd,
    }
    .aggregate(vec![], vec![AggregateSpec::CountStar]);
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(int_at(&result, 0, 0), 3);

    // Backward expansion finds the same rels.
    let plan = BoundPlan::Expand {
        child: Box::new(BoundPlan::ScanNodes {
            table: graph.person,
            columns: vec![0],
        }),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Bwd,
    }
    .aggregate(vec![], vec![AggregateSpec::CountStar]);
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(int_at(&result, 0, 0), 3);
}

#[test]
fn scan_rels_without_node_anchor() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    // A bare rel scan sees every rel once, in either direction.
    for direction in [Direction::Fwd, Direction::Bwd] {
        let plan = BoundPlan::ScanRels {
            table: graph.knows,
            direction,
            columns: vec![],
        }
        .aggregate(vec![], vec![AggregateSpec::CountStar]);
        let result = conn.execute(&plan).expect("execute");
        assert_eq!(int_at(&result, 0, 0), 3, "direction {direction}");
    }

    // Projected properties ride along: since >= 2002 keeps b->c and
    // a->c. Output columns are [src, dst, rel, since].
    let plan = BoundPlan::ScanRels {
        table: graph.knows,
        direction: Direction::Fwd,
        columns: vec![0],
    }
    .filter(BoundExpr::call(
        ">=",
        vec![
            BoundExpr::Column(3),
            BoundExpr::Literal(Value::Int64(2002)),
        ],
    ));
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(result.num_rows(), 2);
    for row in &result.rows {
        match (&row[0], &row[1], &row[3]) {
            (
                Value::InternalId { offset: src, .. },
                Value::InternalId { offset: dst, .. },
                Value::Int64(since),
            ) => {
                assert!(
                    (*src, *dst, *since) == (1, 2, 2002) || (*src, *dst, *since) == (0, 2, 2003),
                    "unexpected rel {src}->{dst} since {since}"
                );
            }
            other => panic!("unexpected row shape {other:?}"),
        }
    }
}

#[test]
fn expand_from_bound_source() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    // a has exactly two outgoing rels.
    let plan = BoundPlan::Expand {
        child: Box::new(bind_person(&graph, "a")),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Fwd,
    }
    .aggregate(vec![], vec![AggregateSpec::CountStar]);
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(int_at(&result, 0, 0), 2);
}

#[test]
fn variable_length_counts_paths_with_multiplicity() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    // From a, lengths 1..2: a->b, a->c, and a->b->c.
    let plan = BoundPlan::RecursiveExtend {
        child: Box::new(bind_person(&graph, "a")),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Fwd,
        lower: 1,
        upper: 2,
        emit: PathEmission::DstWithMultiplicity,
        target_mask: vec![],
    }
    .aggregate(vec![], vec![AggregateSpec::CountStar]);
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(int_at(&result, 0, 0), 3);
}

#[test]
fn variable_length_distinct_destinations() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    // Distinct destinations per length: b and c at length 1, c at 2.
    let plan = BoundPlan::RecursiveExtend {
        child: Box::new(bind_person(&graph, "a")),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Fwd,
        lower: 1,
        upper: 2,
        emit: PathEmission::DstOnly,
        target_mask: vec![],
    }
    .aggregate(vec![], vec![AggregateSpec::CountStar]);
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(int_at(&result, 0, 0), 3);
}

#[test]
fn path_enumeration_returns_full_tuples() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    let plan = BoundPlan::RecursiveExtend {
        child: Box::new(bind_person(&graph, "a")),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Fwd,
        lower: 1,
        upper: 2,
        emit: PathEmission::Paths,
        target_mask: vec![],
    };
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(result.num_rows(), 3);

    // Output: child columns (id, name), dst id, path list, length.
    // Paths are grouped by length.
    let lengths: Vec<i64> = (0..3).map(|row| int_at(&result, row, 4)).collect();
    assert_eq!(lengths, vec![1, 1, 2]);
    let path_col = result.types.len() - 2;
    for row in &result.rows {
        match &row[path_col] {
            Value::List(items) => {
                let length = match row.last() {
                    Some(Value::Int64(v)) => *v as usize,
                    other => panic!("expected length, found {other:?}"),
                };
                assert_eq!(items.len(), 2 * length + 1);
            }
            other => panic!("expected a path list, found {other:?}"),
        }
    }
}

#[test]
fn zero_length_path_binds_source_to_itself() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    let plan = BoundPlan::RecursiveExtend {
        child: Box::new(bind_person(&graph, "a")),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Fwd,
        lower: 0,
        upper: 0,
        emit: PathEmission::DstOnly,
        target_mask: vec![],
    };
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(result.num_rows(), 1);

    // With a target mask that excludes the source, nothing comes back.
    let plan = BoundPlan::RecursiveExtend {
        child: Box::new(bind_person(&graph, "a")),
        from_column: 0,
        rel_table: graph.knows,
        direction: Direction::Fwd,
        lower: 0,
        upper: 0,
        emit: PathEmission::DstOnly,
        target_mask: vec![999],
    };
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(result.num_rows(), 0);
}

#[test]
fn count_distinct_versus_count() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open");
    let conn = db.connect();
    let table = conn
        .create_node_table(
            "Sample",
            &[("id", LogicalType::Int64), ("x", LogicalType::Int64)],
            "id",
        )
        .expect("create");
    for (id, x) in [(0, 1), (1, 1), (2, 2), (3, 2), (4, 3)] {
        conn.insert_node("Sample", &[Value::Int64(id), Value::Int64(x)])
            .expect("insert");
    }

    let scan = BoundPlan::ScanNodes {
        table,
        columns: vec![1],
    };
    let plan = scan.clone().aggregate(
        vec![],
        vec![
            AggregateSpec::Count {
                arg: BoundExpr::Column(1),
                distinct: true,
            },
            AggregateSpec::Count {
                arg: BoundExpr::Column(1),
                distinct: false,
            },
        ],
    );
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(int_at(&result, 0, 0), 3);
    assert_eq!(int_at(&result, 0, 1), 5);
}

#[test]
fn group_by_with_sum_min_max_avg() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    // Group persons by age.
    let plan = BoundPlan::ScanNodes {
        table: graph.person,
        columns: vec![1],
    }
    .aggregate(
        vec![BoundExpr::Column(1)],
        vec![
            AggregateSpec::CountStar,
            AggregateSpec::Sum {
                arg: BoundExpr::Column(1),
                distinct: false,
            },
            AggregateSpec::Min {
                arg: BoundExpr::Column(1),
            },
            AggregateSpec::Max {
                arg: BoundExpr::Column(1),
            },
            AggregateSpec::Avg {
                arg: BoundExpr::Column(1),
                distinct: false,
            },
        ],
    );
    let mut result = conn.execute(&plan).expect("execute");
    result.rows.sort_by_key(|row| match row[0] {
        Value::Int64(v) => v,
        _ => 0,
    });
    assert_eq!(result.num_rows(), 2);
    // age 30: a and c.
    assert_eq!(int_at(&result, 0, 1), 2);
    assert_eq!(int_at(&result, 0, 2), 60);
    assert_eq!(int_at(&result, 0, 3), 30);
    assert_eq!(int_at(&result, 0, 4), 30);
    assert_eq!(result.rows[0][5], Value::Float64(30.0));
    // age 40: b.
    assert_eq!(int_at(&result, 1, 1), 1);
}

#[test]
fn hash_join_pairs_people_of_equal_age() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    // Probe persons against build persons on age: a and c share age 30,
    // so 2x2 pairs for that age plus b with itself.
    let scan = BoundPlan::ScanNodes {
        table: graph.person,
        columns: vec![1],
    };
    let plan = BoundPlan::HashJoin {
        probe: Box::new(scan.clone()),
        build: Box::new(scan),
        probe_key: 1,
        build_key: 1,
    }
    .aggregate(vec![], vec![AggregateSpec::CountStar]);
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(int_at(&result, 0, 0), 5);
}

#[test]
fn projection_runs_scalar_functions() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    let plan = bind_person(&graph, "a").project(vec![
        BoundExpr::call(
            "concat",
            vec![
                BoundExpr::Column(1),
                BoundExpr::Literal(Value::String("!".into())),
            ],
        ),
        BoundExpr::call(
            "substr",
            vec![
                BoundExpr::Column(1),
                BoundExpr::Literal(Value::Int64(1)),
                BoundExpr::Literal(Value::Int64(1)),
            ],
        ),
    ]);
    let result = conn.execute(&plan).expect("execute");
    assert_eq!(result.num_rows(), 1);
    assert_eq!(result.rows[0][0], Value::String("a!".into()));
    assert_eq!(result.rows[0][1], Value::String("a".into()));
}

#[test]
fn runtime_error_aborts_query_without_partial_output() {
    let (_dir, graph) = triangle();
    let conn = graph.db.connect();

    let plan = BoundPlan::ScanNodes {
        table: graph.person,
        columns: vec![1],
    }
    .project(vec![BoundExpr::call(
        "/",
        vec![
            BoundExpr::Literal(Value::Int64(1)),
            BoundExpr::call(
                "-",
                vec![BoundExpr::Column(1), BoundExpr::Column(1)],
            ),
        ],
    )]);
    let err = conn.execute(&plan).unwrap_err();
    assert!(matches!(err, quiver::QuiverError::Runtime(_)));
}
