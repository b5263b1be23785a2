//! Tests for table resolution, empty-table elision and bound discovery

mod common;

use common::*;
use rivven_batch::prelude::*;

fn table_names(works: &[TableWork]) -> Vec<String> {
    works.iter().map(|w| w.identity().to_string()).collect()
}

fn shop_schema() -> StaticSchemaProvider {
    let keyed = |name: &str| {
        TableDefinition::new("shop", name)
            .with_column(ColumnDefinition::new("id", "bigint").primary_key(1))
            .with_column(ColumnDefinition::new("note", "text"))
    };
    StaticSchemaProvider::from_tables([
        keyed("orders"),
        keyed("order_items_2023"),
        keyed("order_items_2024"),
        keyed("Users"),
        TableDefinition::new("shop", "audit").with_column(ColumnDefinition::new("payload", "json")),
        keyed("other").with_column(ColumnDefinition::new("x", "int")),
    ])
}

// ============================================================================
// Resolution Tests
// ============================================================================

#[tokio::test]
async fn test_resolve_literal_and_glob_names() {
    init_test_logging();
    let schema = shop_schema();
    let configs = vec![TableConfig::new("shop", ["orders", "order_items_*"])];

    let works = resolve_tables(&schema, &configs).await.unwrap();

    assert_eq!(
        table_names(&works),
        vec!["shop.orders", "shop.order_items_2023", "shop.order_items_2024"]
    );
    assert!(works
        .iter()
        .all(|w| w.scan_columns == ScanColumnSet::keyed(["id"]).unwrap()));
}

#[tokio::test]
async fn test_glob_matching_is_case_insensitive() {
    init_test_logging();
    let schema = shop_schema();
    let configs = vec![TableConfig::new("shop", ["user?"])];

    let works = resolve_tables(&schema, &configs).await.unwrap();

    assert_eq!(table_names(&works), vec!["shop.Users"]);
}

#[tokio::test]
async fn test_table_matched_twice_is_scanned_once_with_first_config() {
    init_test_logging();
    let schema = shop_schema();
    let configs = vec![
        TableConfig::new("shop", ["order*"]),
        TableConfig::new("shop", ["orders"]).with_scan_columns(["note"]),
    ];

    let works = resolve_tables(&schema, &configs).await.unwrap();

    let orders: Vec<&TableWork> = works
        .iter()
        .filter(|w| w.identity().table == "orders")
        .collect();
    assert_eq!(orders.len(), 1);
    assert!(orders[0].config.scan_column.is_none());
    assert_eq!(works.len(), 3);
}

#[tokio::test]
async fn test_missing_literal_table_is_an_error() {
    init_test_logging();
    let schema = shop_schema();
    let configs = vec![TableConfig::new("shop", ["orders", "refunds"])];

    match resolve_tables(&schema, &configs).await {
        Err(Error::TableNotFound { table }) => assert_eq!(table, "shop.refunds"),
        other => panic!("expected TableNotFound, got {:?}", other.map(|w| table_names(&w))),
    }
}

#[tokio::test]
async fn test_unmatched_glob_resolves_to_nothing() {
    init_test_logging();
    let schema = shop_schema();
    let configs = vec![TableConfig::new("shop", ["archive_*"])];

    let works = resolve_tables(&schema, &configs).await.unwrap();
    assert!(works.is_empty());
}

#[tokio::test]
async fn test_scan_column_override_and_fallbacks() {
    init_test_logging();
    let schema = shop_schema();
    let configs = vec![
        TableConfig::new("shop", ["other"]).with_scan_columns(["x"]),
        TableConfig::new("shop", ["orders"]).with_scan_columns(["missing"]),
        TableConfig::new("shop", ["audit"]),
    ];

    let works = resolve_tables(&schema, &configs).await.unwrap();

    assert_eq!(works[0].scan_columns, ScanColumnSet::keyed(["x"]).unwrap());
    // an unusable override falls back to the primary key
    assert_eq!(works[1].scan_columns, ScanColumnSet::keyed(["id"]).unwrap());
    assert!(works[2].scan_columns.is_full_dump());
}

#[test]
fn test_unique_index_fallback_requires_not_null() {
    let nullable = TableDefinition::new("shop", "codes")
        .with_column(ColumnDefinition::new("code", "varchar(8)"))
        .with_index(IndexDefinition::unique("uq_code", vec!["code".into()]));
    assert!(select_scan_columns(&nullable, None).unwrap().is_full_dump());

    let not_null = TableDefinition::new("shop", "codes")
        .with_column(ColumnDefinition::new("code", "varchar(8)").not_null())
        .with_index(IndexDefinition::unique("uq_code", vec!["code".into()]));
    assert_eq!(
        select_scan_columns(&not_null, None).unwrap(),
        ScanColumnSet::keyed(["code"]).unwrap()
    );
}

// ============================================================================
// Empty Table Tests
// ============================================================================

#[tokio::test]
async fn test_empty_tables_are_dropped() {
    init_test_logging();
    let db = MemoryDatabase::new();
    let full = id("shop", "full");
    let empty = id("shop", "empty");
    let works = vec![
        work_for(int_table(&db, &full, 3)),
        work_for(int_table(&db, &empty, 0)),
    ];

    let kept = delete_empty_tables(&db, &MySqlDialect, works).await.unwrap();

    assert_eq!(table_names(&kept), vec!["shop.full"]);
    let statements: Vec<String> = db.queries().into_iter().map(|(sql, _)| sql).collect();
    assert_eq!(
        statements,
        vec![
            "SELECT 1 FROM `shop`.`full` LIMIT 1",
            "SELECT 1 FROM `shop`.`empty` LIMIT 1",
        ]
    );
}

// ============================================================================
// Bound Tests
// ============================================================================

#[tokio::test]
async fn test_composite_bounds_per_column() {
    init_test_logging();
    let db = MemoryDatabase::new();
    let t = id("shop", "contacts");
    db.create_table(t.clone(), &["name", "email"]);
    for i in 1..100 {
        db.insert(
            &t,
            vec![
                Value::String(format!("name_{}", i)),
                Value::String(format!("email_{}", i)),
            ],
        );
    }

    let (max, min) =
        find_max_min_values(&db, &MySqlDialect, &t, &["email".into(), "name".into()])
            .await
            .unwrap();

    assert_eq!(
        max,
        Bound::from_pairs([("email", "email_99"), ("name", "name_99")])
    );
    assert_eq!(min, Bound::from_pairs([("email", "email_1"), ("name", "name_1")]));
    assert_eq!(max.columns(), vec!["email", "name"]);
    assert_eq!(db.queries().len(), 2);
    assert_eq!(
        db.queries()[0].0,
        "SELECT MIN(`email`), MAX(`email`) FROM `shop`.`contacts`"
    );
}

#[tokio::test]
async fn test_bounds_of_empty_table_are_null() {
    init_test_logging();
    let db = MemoryDatabase::new();
    let t = id("shop", "nothing");
    int_table(&db, &t, 0);

    let (max, min) = find_max_min_values(&db, &MySqlDialect, &t, &["id".into()])
        .await
        .unwrap();

    assert!(max.is_all_null());
    assert!(min.is_all_null());
}

#[tokio::test]
async fn test_bounds_ignore_null_values() {
    init_test_logging();
    let db = MemoryDatabase::new();
    let t = id("shop", "partial");
    db.create_table(t.clone(), &["ref"]);
    db.insert(&t, vec![Value::Null]);
    db.insert(&t, vec![Value::Int64(7)]);
    db.insert(&t, vec![Value::Int64(3)]);

    let (max, min) = find_max_min_values(&db, &MySqlDialect, &t, &["ref".into()])
        .await
        .unwrap();

    assert_eq!(max, Bound::from_pairs([("ref", 7)]));
    assert_eq!(min, Bound::from_pairs([("ref", 3)]));
}
