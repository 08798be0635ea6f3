use super::*;
use crate::core::transforms::memory::MemoryTransform;
use crate::domain::model::DataType;
use chrono::NaiveDate;

fn customers(rows: Vec<Row>) -> MemoryTransform {
    let schema = Schema::new(
        "customers",
        vec![Column::new("id", DataType::Int), Column::new("name", DataType::String)],
    );
    MemoryTransform::new(schema, rows)
}

fn accounts(rows: Vec<Row>) -> MemoryTransform {
    let schema = Schema::new(
        "accounts",
        vec![Column::new("customer_id", DataType::Int), Column::new("name", DataType::String)],
    );
    MemoryTransform::new(schema, rows)
}

fn on_id() -> JoinConfig {
    JoinConfig {
        keys: vec![JoinKey::new("id", "customer_id")],
        ..JoinConfig::default()
    }
}

async fn run(mut join: JoinTransform) -> (Vec<Row>, JoinTransform) {
    let cancel = CancellationToken::new();
    join.open(1, &SelectQuery::default(), &cancel).await.unwrap();
    let mut rows = Vec::new();
    while let Some(row) = join.read_record(&cancel).await.unwrap() {
        rows.push(row);
    }
    (rows, join)
}

async fn run_err(mut join: JoinTransform) -> EtlError {
    let cancel = CancellationToken::new();
    join.open(1, &SelectQuery::default(), &cancel).await.unwrap();
    loop {
        match join.read_record(&cancel).await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("join finished without an error"),
            Err(e) => return e,
        }
    }
}

#[tokio::test]
async fn test_sorted_merge_and_hash_agree() {
    let primary = vec![vec![2.into(), "y".into()], vec![1.into(), "x".into()]];
    let reference = vec![vec![2.into(), "q".into()], vec![1.into(), "p".into()]];

    let merge = JoinTransform::new(
        Box::new(customers(primary.clone())),
        Box::new(accounts(reference.clone())),
        on_id(),
    );
    let (mut merged, merge) = run(merge).await;
    assert!(merge.is_sorted_merge());
    assert_eq!(merge.schema().column_names(), vec!["id", "name", "customer_id", "accounts_name"]);

    let hash = JoinTransform::new(
        Box::new(customers(primary).as_flat_file()),
        Box::new(accounts(reference).as_flat_file()),
        on_id(),
    );
    let (mut hashed, hash) = run(hash).await;
    assert!(!hash.is_sorted_merge());
    // Hash output keeps primary order.
    assert_eq!(hashed[0][0], Value::Int(2));

    merged.sort();
    hashed.sort();
    assert_eq!(merged, hashed);
    assert_eq!(
        merged[0],
        vec![Value::Int(1), Value::from("x"), Value::Int(1), Value::from("p")]
    );
}

#[tokio::test]
async fn test_sorted_merge_skips_unmatched_keys_on_both_sides() {
    let primary = customers(vec![
        vec![1.into(), "a".into()],
        vec![2.into(), "b".into()],
        vec![3.into(), "c".into()],
        vec![5.into(), "e".into()],
        vec![Value::Null, "n".into()],
    ]);
    let reference = accounts(vec![
        vec![0.into(), "zero".into()],
        vec![2.into(), "two".into()],
        vec![4.into(), "four".into()],
        vec![5.into(), "five".into()],
    ]);
    let config = JoinConfig {
        not_found_strategy: NotFoundStrategy::Filter,
        ..on_id()
    };
    let (rows, join) = run(JoinTransform::new(Box::new(primary), Box::new(reference), config)).await;
    assert!(join.is_sorted_merge());
    let names: Vec<String> = rows.iter().map(|r| r[3].to_string()).collect();
    assert_eq!(names, vec!["two", "five"]);

    let stats = join.total_stats();
    assert_eq!(stats.rows_filtered, 3);
    assert_eq!(stats.rows_read_primary, 5);
    assert_eq!(stats.rows_read_reference, 4);
}

#[tokio::test]
async fn test_duplicate_strategies() {
    let primary = || customers(vec![vec![1.into(), "a".into()]]);
    let reference = || accounts(vec![vec![1.into(), "first".into()], vec![1.into(), "second".into()]]);

    let err = run_err(JoinTransform::new(Box::new(primary()), Box::new(reference()), on_id())).await;
    assert!(matches!(err, EtlError::DuplicateJoinKey { .. }));

    for (strategy, expected) in [
        (DuplicateStrategy::First, vec!["first"]),
        (DuplicateStrategy::Last, vec!["second"]),
        (DuplicateStrategy::All, vec!["first", "second"]),
    ] {
        let config = JoinConfig {
            duplicate_strategy: strategy,
            ..on_id()
        };
        let (rows, _) = run(JoinTransform::new(Box::new(primary()), Box::new(reference()), config)).await;
        let names: Vec<String> = rows.iter().map(|r| r[3].to_string()).collect();
        assert_eq!(names, expected, "{:?}", strategy);
    }
}

#[tokio::test]
async fn test_not_found_strategies() {
    let primary = || customers(vec![vec![1.into(), "a".into()], vec![7.into(), "g".into()]]);
    let reference = || accounts(vec![vec![1.into(), "p".into()]]);

    let (rows, _) = run(JoinTransform::new(Box::new(primary()), Box::new(reference()), on_id())).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], vec![Value::Int(7), Value::from("g"), Value::Null, Value::Null]);

    let config = JoinConfig {
        not_found_strategy: NotFoundStrategy::Abend,
        ..on_id()
    };
    let err = run_err(JoinTransform::new(Box::new(primary()), Box::new(reference()), config)).await;
    match err {
        EtlError::JoinNotFound { key, .. } => assert_eq!(key, "[7]"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_single_side_conditions_become_prefilters() {
    let primary = customers(vec![
        vec![1.into(), "a".into()],
        vec![2.into(), "b".into()],
        vec![3.into(), "c".into()],
    ]);
    let reference = accounts(vec![
        vec![1.into(), "open".into()],
        vec![2.into(), "closed".into()],
        vec![3.into(), "open".into()],
    ])
    .as_flat_file();
    let config = JoinConfig {
        filters: vec![
            JoinFilter::value(JoinSide::Reference, "name", Operator::Equal, "open"),
            JoinFilter::value(JoinSide::Primary, "id", Operator::LessThan, 3),
        ],
        not_found_strategy: NotFoundStrategy::Filter,
        ..on_id()
    };
    let (rows, join) = run(JoinTransform::new(Box::new(primary), Box::new(reference), config)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Value::Int(1));
    // The reference filter ran inside its own filter transform.
    assert_eq!(join.reference().unwrap().name(), "filter");
    assert_eq!(join.total_stats().rows_filtered, 2);
}

#[tokio::test]
async fn test_cross_side_condition_filters_matches() {
    let schema = Schema::new(
        "orders",
        vec![Column::new("customer_id", DataType::Int), Column::new("amount", DataType::Int)],
    );
    let primary = MemoryTransform::new(schema, vec![vec![1.into(), 50.into()], vec![2.into(), 500.into()]]);
    let limits = Schema::new(
        "limits",
        vec![Column::new("id", DataType::Int), Column::new("limit", DataType::Int)],
    );
    let reference = MemoryTransform::new(limits, vec![vec![1.into(), 100.into()], vec![2.into(), 100.into()]]);
    let config = JoinConfig {
        keys: vec![JoinKey::new("customer_id", "id")],
        filters: vec![JoinFilter::across("amount", Operator::LessThanEqual, "limit")],
        ..JoinConfig::default()
    };
    let (rows, _) = run(JoinTransform::new(Box::new(primary), Box::new(reference), config)).await;
    assert_eq!(rows[0][3], Value::Int(100));
    assert_eq!(rows[1][3], Value::Null);
}

#[tokio::test]
async fn test_node_column_holds_matching_rows() {
    let primary = customers(vec![vec![1.into(), "a".into()], vec![2.into(), "b".into()]]);
    let reference = accounts(vec![
        vec![1.into(), "savings".into()],
        vec![1.into(), "cheque".into()],
    ]);
    let config = JoinConfig {
        node_column: Some("accounts".to_string()),
        ..on_id()
    };
    let (rows, join) = run(JoinTransform::new(Box::new(primary), Box::new(reference), config)).await;
    let node = join.schema().column("accounts").unwrap();
    assert_eq!(node.data_type, DataType::Node);
    assert_eq!(node.child.as_ref().unwrap().name, "accounts");

    match &rows[0][2] {
        Value::Node(table) => assert_eq!(table.rows.len(), 2),
        other => panic!("expected a node, got {other:?}"),
    }
    match &rows[1][2] {
        Value::Node(table) => assert!(table.rows.is_empty()),
        other => panic!("expected a node, got {other:?}"),
    }
}

fn day(d: u32) -> Value {
    Value::Date(NaiveDate::from_ymd_opt(2024, 1, d).unwrap())
}

#[tokio::test]
async fn test_merge_valid_dates_splits_primary_interval() {
    let schema = Schema::new(
        "positions",
        vec![
            Column::new("employee", DataType::Int),
            Column::new("from", DataType::Date).with_delta_type(DeltaType::ValidFromDate),
            Column::new("to", DataType::Date).with_delta_type(DeltaType::ValidToDate),
        ],
    );
    let primary = MemoryTransform::new(schema, vec![vec![1.into(), day(3), day(12)]]);
    let grades = Schema::new(
        "grades",
        vec![
            Column::new("employee", DataType::Int),
            Column::new("grade", DataType::String),
            Column::new("from", DataType::Date).with_delta_type(DeltaType::ValidFromDate),
            Column::new("to", DataType::Date).with_delta_type(DeltaType::ValidToDate),
        ],
    );
    let reference = MemoryTransform::new(
        grades,
        vec![
            vec![1.into(), "B".into(), day(8), day(20)],
            vec![1.into(), "A".into(), day(1), day(8)],
            vec![1.into(), "Z".into(), day(20), day(25)],
        ],
    );
    let config = JoinConfig {
        keys: vec![JoinKey::new("employee", "employee")],
        duplicate_strategy: DuplicateStrategy::MergeValidDates,
        ..JoinConfig::default()
    };
    let (rows, _) = run(JoinTransform::new(Box::new(primary), Box::new(reference), config)).await;
    let spans: Vec<(Value, Value, Value)> = rows
        .iter()
        .map(|r| (r[1].clone(), r[2].clone(), r[4].clone()))
        .collect();
    assert_eq!(
        spans,
        vec![(day(3), day(8), "A".into()), (day(8), day(12), "B".into())]
    );
}

#[tokio::test]
async fn test_merge_valid_dates_requires_date_columns() {
    let cancel = CancellationToken::new();
    let config = JoinConfig {
        duplicate_strategy: DuplicateStrategy::MergeValidDates,
        ..on_id()
    };
    let mut join = JoinTransform::new(
        Box::new(customers(Vec::new())),
        Box::new(accounts(Vec::new())),
        config,
    );
    assert!(matches!(
        join.open(1, &SelectQuery::default(), &cancel).await,
        Err(EtlError::ConfigError { .. })
    ));
}

#[tokio::test]
async fn test_reset_replays_join() {
    let cancel = CancellationToken::new();
    let join = JoinTransform::new(
        Box::new(customers(vec![vec![1.into(), "a".into()]])),
        Box::new(accounts(vec![vec![1.into(), "p".into()]]).as_flat_file()),
        on_id(),
    );
    let (first, mut join) = run(join).await;
    join.reset().unwrap();
    let mut again = Vec::new();
    while let Some(row) = join.read_record(&cancel).await.unwrap() {
        again.push(row);
    }
    assert_eq!(first, again);
}
