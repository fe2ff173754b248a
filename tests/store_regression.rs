use std::{
    collections::BTreeMap,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use tempfile::tempdir;

use resultdbx::{
    DataStore, DataStoreFactory, FieldIndex, Key, ResultStoreConfig, Sizes, TableSettings, Val,
};

fn factory(dir: &Path, configure: impl FnOnce(&mut ResultStoreConfig)) -> Result<DataStoreFactory> {
    let mut config = ResultStoreConfig {
        data_dir: dir.join("env"),
        ..ResultStoreConfig::default()
    };
    configure(&mut config);
    Ok(DataStoreFactory::open(config)?)
}

fn table(definition: &str) -> Result<TableSettings> {
    Ok(toml::from_str(definition)?)
}

const COUNT_BY_NAME: &str = r#"
[[fields]]
name = "name"
group = 0

[[fields]]
name = "count"
expression = "count()"

[[fields]]
name = "total"
expression = "sum(${amount})"
"#;

fn add_named_rows(store: &DataStore, index: &FieldIndex, rows: &[(&str, i64)]) -> Result<()> {
    let name = index.get("name").expect("name field registered");
    let amount = index.get("amount").expect("amount field registered");
    for (value, quantity) in rows {
        let mut row = vec![Val::Null; index.len()];
        row[name] = Val::from(*value);
        row[amount] = Val::from(*quantity);
        store.add(&row)?;
    }
    Ok(())
}

/// Root items keyed by name, holding their count and total.
fn counts_by_name(store: &DataStore) -> Result<BTreeMap<String, (Val, Val)>> {
    let mut counts = BTreeMap::new();
    for item in &store.get(&Key::root())? {
        counts.insert(
            item.value(0)?.to_string(),
            (item.value(1)?, item.value(2)?),
        );
    }
    Ok(counts)
}

fn finish(store: &DataStore) -> Result<()> {
    store.complete();
    store.await_completion()?;
    Ok(())
}

#[test]
fn grouped_rows_merge_into_one_item_per_key() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &table(COUNT_BY_NAME)?, &mut index, None)?;

    let mut rows = vec![("A", 1); 3];
    rows.extend(vec![("B", 2); 5]);
    add_named_rows(&store, &index, &rows)?;
    finish(&store)?;

    assert!(store.is_complete());
    assert_eq!(store.size(), 2);
    assert_eq!(store.total_size(), 8);

    let counts = counts_by_name(&store)?;
    assert_eq!(counts["A"], (Val::Long(3), Val::Double(3.0)));
    assert_eq!(counts["B"], (Val::Long(5), Val::Double(10.0)));
    Ok(())
}

#[test]
fn payloads_move_results_between_stores() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let settings = table(COUNT_BY_NAME)?;

    let mut index = FieldIndex::new();
    let source = factory.create("q", "source", &settings, &mut index, None)?;
    add_named_rows(&source, &index, &[("A", 1), ("B", 2), ("A", 3)])?;
    finish(&source)?;

    let mut payload = Vec::new();
    source.write_payload(&mut payload)?;
    assert!(source.get(&Key::root())?.is_empty());

    let mut target_index = FieldIndex::new();
    let target = factory.create("q", "target", &settings, &mut target_index, None)?;
    assert!(target.read_payload(&mut payload.as_slice())?);
    finish(&target)?;

    let counts = counts_by_name(&target)?;
    assert_eq!(counts["A"], (Val::Long(2), Val::Double(4.0)));
    assert_eq!(counts["B"], (Val::Long(1), Val::Double(2.0)));
    Ok(())
}

#[test]
fn merging_payloads_is_order_independent() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let settings = table(COUNT_BY_NAME)?;

    let mut payloads = Vec::new();
    for rows in [&[("A", 1), ("B", 4)][..], &[("A", 2), ("C", 8), ("A", 5)][..]] {
        let mut index = FieldIndex::new();
        let store = factory.create("q", "part", &settings, &mut index, None)?;
        add_named_rows(&store, &index, rows)?;
        finish(&store)?;
        let mut payload = Vec::new();
        store.write_payload(&mut payload)?;
        payloads.push(payload);
    }

    let mut merged = Vec::new();
    for order in [[0, 1], [1, 0]] {
        let mut index = FieldIndex::new();
        let store = factory.create("q", "merged", &settings, &mut index, None)?;
        for position in order {
            store.read_payload(&mut payloads[position].as_slice())?;
        }
        finish(&store)?;
        merged.push(counts_by_name(&store)?);
    }

    assert_eq!(merged[0], merged[1]);
    assert_eq!(merged[0]["A"], (Val::Long(3), Val::Double(8.0)));
    assert_eq!(merged[0].len(), 3);
    Ok(())
}

#[test]
fn ungrouped_rows_from_payloads_get_fresh_ids() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let settings = table(
        r#"
[[fields]]
name = "value"
"#,
    )?;

    let mut payloads = Vec::new();
    for offset in [0i64, 100] {
        let mut index = FieldIndex::new();
        let store = factory.create("q", "part", &settings, &mut index, None)?;
        for value in 0..10i64 {
            store.add(&[Val::from(offset + value)])?;
        }
        finish(&store)?;
        let mut payload = Vec::new();
        store.write_payload(&mut payload)?;
        payloads.push(payload);
    }

    let mut index = FieldIndex::new();
    let store = factory.create("q", "merged", &settings, &mut index, None)?;
    for payload in &payloads {
        store.read_payload(&mut payload.as_slice())?;
    }
    finish(&store)?;

    let items = store.get(&Key::root())?;
    assert_eq!(items.len(), 20);
    let mut ids: Vec<String> = items.iter().map(|item| item.key().to_string()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    Ok(())
}

#[test]
fn clear_is_idempotent_and_drops_the_table() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &table(COUNT_BY_NAME)?, &mut index, None)?;
    add_named_rows(&store, &index, &[("A", 1), ("B", 1)])?;

    let name = store.table_name().to_string();
    store.clear()?;
    store.clear()?;
    store.await_completion()?;
    store.clear()?;

    assert!(!factory.environment().table_names().contains(&name));
    assert_eq!(store.size(), 0);
    assert_eq!(store.total_size(), 0);
    assert!(store.get(&Key::root())?.is_empty());
    Ok(())
}

#[test]
fn cleared_stores_read_as_empty_while_the_worker_winds_down() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &table(COUNT_BY_NAME)?, &mut index, None)?;
    add_named_rows(&store, &index, &[("A", 1), ("B", 1)])?;

    // Wait for the timed commit so the rows are visible to readers.
    let deadline = Instant::now() + Duration::from_secs(15);
    while store.get(&Key::root())?.len() < 2 {
        assert!(Instant::now() < deadline, "rows were never committed");
        thread::sleep(Duration::from_millis(50));
    }

    let name = store.table_name().to_string();
    store.clear()?;
    assert!(store.get(&Key::root())?.is_empty());
    assert_eq!(store.size(), 0);
    assert_eq!(store.total_size(), 0);

    store.clear()?;
    assert!(store.get(&Key::root())?.is_empty());
    assert_eq!(store.size(), 0);

    store.await_completion()?;
    assert!(!factory.environment().table_names().contains(&name));
    Ok(())
}

fn payload_count(payload: &[u8]) -> Result<i32> {
    Ok(i32::from_be_bytes(payload[..4].try_into()?))
}

#[test]
fn budgeted_payloads_stream_before_completion() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |config| config.payload_limit = 1)?;
    let settings = table(COUNT_BY_NAME)?;

    let mut index = FieldIndex::new();
    let source = factory.create("q", "source", &settings, &mut index, None)?;
    add_named_rows(&source, &index, &[("A", 1), ("B", 2), ("A", 3), ("C", 4)])?;

    // The first request only asks the worker to start buffering.
    let mut payloads = Vec::new();
    let mut first = Vec::new();
    source.write_payload(&mut first)?;
    assert_eq!(payload_count(&first)?, 0);
    payloads.push(first);

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let mut payload = Vec::new();
        source.write_payload(&mut payload)?;
        let count = payload_count(&payload)?;
        payloads.push(payload);
        if count > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "no payload was buffered");
        thread::sleep(Duration::from_millis(50));
    }

    finish(&source)?;
    let mut last = Vec::new();
    source.write_payload(&mut last)?;
    assert!(payload_count(&last)? >= 1);
    payloads.push(last);
    assert!(source.get(&Key::root())?.is_empty());

    let mut target_index = FieldIndex::new();
    let target = factory.create("q", "target", &settings, &mut target_index, None)?;
    for payload in &payloads {
        target.read_payload(&mut payload.as_slice())?;
    }
    finish(&target)?;

    let counts = counts_by_name(&target)?;
    assert_eq!(counts.len(), 3);
    assert_eq!(counts["A"], (Val::Long(2), Val::Double(4.0)));
    assert_eq!(counts["B"], (Val::Long(1), Val::Double(2.0)));
    assert_eq!(counts["C"], (Val::Long(1), Val::Double(4.0)));
    Ok(())
}

#[test]
fn unsorted_ungrouped_stores_stop_at_the_result_limit() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let settings = table(
        r#"
[[fields]]
name = "value"
"#,
    )?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &settings, &mut index, Some("100".parse::<Sizes>()?))?;

    for value in 0..1000 {
        store.add(&[Val::from(value as i64)])?;
    }
    assert!(store.has_enough_data());
    assert_eq!(store.total_size(), 100);

    finish(&store)?;
    assert_eq!(store.get(&Key::root())?.len(), 100);
    Ok(())
}

#[test]
fn more_readers_than_permits_all_complete() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |config| config.max_readers = 2)?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &table(COUNT_BY_NAME)?, &mut index, None)?;
    add_named_rows(&store, &index, &[("A", 1), ("B", 2), ("C", 3)])?;
    finish(&store)?;

    let lengths: Vec<usize> = thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| scope.spawn(|| store.get(&Key::root()).map(|items| items.len())))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("reader thread panicked"))
            .collect::<resultdbx::Result<Vec<usize>>>()
    })?;

    assert_eq!(lengths, vec![3, 3, 3]);
    assert_eq!(factory.environment().available_read_permits(), 2);
    Ok(())
}

#[test]
fn selectors_pick_from_sorted_children() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let settings = table(
        r#"
show_detail = true

[[fields]]
name = "name"
group = 0

[[fields]]
name = "value"
sort = { order = 0, direction = "ascending" }

[[fields]]
name = "first"
expression = "first(${value})"

[[fields]]
name = "last"
expression = "last(${value})"

[[fields]]
name = "second"
expression = "nth(${value}, 2)"

[[fields]]
name = "top"
expression = "top(${value}, ',', 2)"
"#,
    )?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &settings, &mut index, None)?;
    let name = index.get("name").expect("name field registered");
    let value = index.get("value").expect("value field registered");
    for (group, number) in [("A", 5), ("A", 3), ("A", 8), ("B", 4)] {
        let mut row = vec![Val::Null; index.len()];
        row[name] = Val::from(group);
        row[value] = Val::from(number as i64);
        store.add(&row)?;
    }
    finish(&store)?;

    let groups = store.get(&Key::root())?;
    assert_eq!(groups.len(), 2);
    let a = groups
        .iter()
        .find(|item| item.value(0).map(|v| v == Val::from("A")).unwrap_or(false))
        .expect("group A present");

    assert_eq!(a.value(2)?, Val::Long(3));
    assert_eq!(a.value(3)?, Val::Long(8));
    assert_eq!(a.value(4)?, Val::Long(5));
    assert_eq!(a.value(5)?, Val::from("3,5"));

    let children = store.get(a.key())?;
    let values: Vec<Val> = children
        .iter()
        .map(|child| child.value(1))
        .collect::<resultdbx::Result<_>>()?;
    assert_eq!(values, vec![Val::Long(3), Val::Long(5), Val::Long(8)]);
    Ok(())
}

#[test]
fn filtered_rows_are_never_stored() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let settings = table(
        r#"
[[fields]]
name = "name"
group = 0
filter = { includes = "A|B" }

[[fields]]
name = "count"
expression = "count()"
"#,
    )?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &settings, &mut index, None)?;
    for name in ["A", "C", "B", "Cat", "A"] {
        store.add(&[Val::from(name)])?;
    }
    finish(&store)?;

    let mut names: Vec<String> = store
        .get(&Key::root())?
        .iter()
        .map(|item| item.value(0).map(|value| value.to_string()))
        .collect::<resultdbx::Result<_>>()?;
    names.sort();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(store.total_size(), 3);
    Ok(())
}

#[test]
fn interrupted_stores_refuse_to_wait() -> Result<()> {
    let temp = tempdir()?;
    let factory = factory(temp.path(), |_| {})?;
    let mut index = FieldIndex::new();
    let store = factory.create("q", "c", &table(COUNT_BY_NAME)?, &mut index, None)?;

    store.interrupt();
    assert!(store.is_interrupted());
    add_named_rows(&store, &index, &[("A", 1)])?;
    assert_eq!(store.total_size(), 0);

    let err = store.get(&Key::root()).unwrap_err();
    assert!(err.is_interrupted());
    store.clear()?;
    Ok(())
}
