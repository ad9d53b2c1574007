// Record store: page chains, splits, links and free page reuse
use domstore::core::constants::{NO_PAGE, UNUSED};
use domstore::core::dom_page::DomPage;
use domstore::core::item_id;
use domstore::{
    page_from_pointer, tid_from_pointer, Error, NodeIterator, PagedStore, RawNodeIterator,
    RecordStore, StoreOptions, Value, WriterSession,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn cleanup(path: &str) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{}.lock", path));
    let _ = std::fs::remove_file(format!("{}.journal", path));
}

/// 200 byte working area per page.
fn options() -> StoreOptions {
    StoreOptions {
        page_size: 264,
        page_header_size: 64,
        recovery_enabled: false,
        ..Default::default()
    }
}

fn record(fill: u8, len: usize) -> Vec<u8> {
    vec![fill; len]
}

fn document(store: &RecordStore, first: u64) -> Vec<Vec<u8>> {
    NodeIterator::new(store, first)
        .unwrap()
        .map(|v| v.unwrap().into_bytes())
        .collect()
}

#[test]
fn test_append_spills_to_linked_pages() {
    let path = "/tmp/test_store_append_chain.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let mut session = WriterSession::new();
    let pointers: Vec<u64> = (0..5)
        .map(|i| store.add(None, &mut session, &record(i as u8, 50)).unwrap())
        .collect();

    for (i, p) in pointers.iter().enumerate() {
        assert_eq!(store.get(*p).unwrap().unwrap().into_bytes(), record(i as u8, 50));
    }

    let chain = store.page_chain(page_from_pointer(pointers[0])).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1], page_from_pointer(pointers[4]));
    assert_eq!(session.page_count(), 2);
    assert_eq!(store.record_count(), 5);

    let dump = store.debug_page_contents(chain[0]).unwrap();
    assert!(dump.contains("[50 bytes]"));

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_insert_into_full_page_splits() {
    let path = "/tmp/test_store_split.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let mut session = WriterSession::new();
    let a = store.add(None, &mut session, &record(1, 50)).unwrap();
    let b = store.add(None, &mut session, &record(2, 50)).unwrap();
    let c = store.add(None, &mut session, &record(3, 50)).unwrap();
    let page = page_from_pointer(a);

    let x = store.insert_after(None, Some(&mut session), a, &record(9, 50)).unwrap();
    assert_eq!(session.split_count(), 1);
    assert_eq!(page_from_pointer(x), page);

    let raw: Vec<_> = RawNodeIterator::from_page(&store, page)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    let links: Vec<_> = raw.iter().filter(|r| r.is_link()).collect();
    assert_eq!(links.len(), 2);
    for link in &links {
        assert_eq!(link.page, page);
        let target = u64::from_be_bytes(link.data[..8].try_into().unwrap());
        let moved = store.find_record(target, false).unwrap().unwrap();
        assert!(moved.slot.is_relocated());
        assert_ne!(moved.page.num(), page);
        assert_eq!(moved.page.read_u64(moved.slot.back_link_offset().unwrap()), link.address());
    }

    let records = raw.iter().filter(|r| !r.is_link()).count();
    assert_eq!(records, 3 + 1);

    // old addresses resolve through the links
    assert_eq!(store.get(b).unwrap().unwrap().into_bytes(), record(2, 50));
    assert_eq!(store.get(c).unwrap().unwrap().into_bytes(), record(3, 50));
    assert_eq!(
        document(&store, a),
        vec![record(1, 50), record(9, 50), record(2, 50), record(3, 50)]
    );

    let chain = store.page_chain(page).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(store.stats().page_splits, 1);
    assert_eq!(store.stats().records_relocated, 2);

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_removing_every_record_frees_the_page() {
    let path = "/tmp/test_store_remove_page.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let mut session = WriterSession::new();
    let pointers: Vec<u64> = (0..6)
        .map(|i| store.add(None, &mut session, &record(i as u8, 50)).unwrap())
        .collect();
    let first = page_from_pointer(pointers[0]);
    let second = page_from_pointer(pointers[3]);
    assert_ne!(first, second);
    assert_eq!(store.page_chain(first).unwrap(), vec![first, second]);

    for p in &pointers[3..] {
        store.remove_node(None, *p).unwrap();
    }

    assert_eq!(store.page_chain(first).unwrap(), vec![first]);
    let head = DomPage::wrap(store.file().read_page(first).unwrap());
    assert_eq!(head.next_data_page(), NO_PAGE);
    assert!(store.file().free_pages().unwrap().contains(&second));
    assert!(store.get(pointers[3]).unwrap().is_none());
    assert_eq!(store.record_count(), 3);

    // freed pages come back first
    let reused = store.file().get_free_page(true).unwrap();
    assert_eq!(reused.num(), second);
    assert_eq!(reused.status(), UNUSED);

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_random_inserts_keep_document_order() {
    let path = "/tmp/test_store_random_inserts.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let mut session = WriterSession::new();
    let mut rng = StdRng::seed_from_u64(7);

    let first = store.add(None, &mut session, b"root").unwrap();
    let mut model: Vec<(u64, Vec<u8>)> = vec![(first, b"root".to_vec())];

    for step in 0..120u32 {
        if model.len() > 2 && rng.gen_bool(0.2) {
            let idx = rng.gen_range(1..model.len());
            let (pointer, _) = model.remove(idx);
            store.remove_node(None, pointer).unwrap();
        } else {
            let idx = rng.gen_range(0..model.len());
            let len = rng.gen_range(10..60);
            let value: Vec<u8> = (0..len).map(|i| (step as usize + i) as u8).collect();
            let pointer = store
                .insert_after(None, Some(&mut session), model[idx].0, &value)
                .unwrap();
            model.insert(idx + 1, (pointer, value));
        }

        let expected: Vec<Vec<u8>> = model.iter().map(|(_, v)| v.clone()).collect();
        assert_eq!(document(&store, first), expected, "document order after step {}", step);
    }

    for (pointer, value) in &model {
        let found = store.get(*pointer).unwrap().unwrap();
        assert_eq!(found.as_bytes(), &value[..]);
        assert_eq!(found.address(), *pointer);
    }
    assert!(store.stats().page_splits > 0);
    assert!(!session.needs_defrag());

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_remove_relocated_record_drops_its_link() {
    let path = "/tmp/test_store_remove_relocated.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let mut session = WriterSession::new();
    let a = store.add(None, &mut session, &record(1, 50)).unwrap();
    let b = store.add(None, &mut session, &record(2, 50)).unwrap();
    store.add(None, &mut session, &record(3, 50)).unwrap();
    store.insert_after(None, None, a, &record(9, 50)).unwrap();

    let links_before = RawNodeIterator::from_page(&store, page_from_pointer(a))
        .unwrap()
        .filter(|r| r.as_ref().unwrap().is_link())
        .count();
    store.remove_node(None, b).unwrap();
    let links_after = RawNodeIterator::from_page(&store, page_from_pointer(a))
        .unwrap()
        .filter(|r| r.as_ref().unwrap().is_link())
        .count();

    assert_eq!(links_before, 2);
    assert_eq!(links_after, 1);
    assert!(store.get(b).unwrap().is_none());
    assert!(matches!(store.remove_node(None, b), Err(Error::NotFound)));
    assert_eq!(
        document(&store, a),
        vec![record(1, 50), record(9, 50), record(3, 50)]
    );

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_removed_address_resolves_to_later_link_with_same_tid() {
    let path = "/tmp/test_store_stale_address.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let mut session = WriterSession::new();
    let a = store.add(None, &mut session, &record(1, 50)).unwrap();
    store.add(None, &mut session, &record(2, 50)).unwrap();
    let c = store.add(None, &mut session, &record(3, 50)).unwrap();
    // the next page hands out tids from zero again
    let d = store.add(None, &mut session, &record(4, 50)).unwrap();
    store.add(None, &mut session, &record(5, 50)).unwrap();
    let f = store.add(None, &mut session, &record(6, 50)).unwrap();
    let second = page_from_pointer(d);
    assert_ne!(second, page_from_pointer(a));
    assert_eq!(tid_from_pointer(f), tid_from_pointer(c));

    store.remove_node(None, c).unwrap();
    // plain records on later pages never answer for a missing tid
    assert!(store.get(c).unwrap().is_none());

    // moving f off the second page leaves a link there under c's tid
    store.insert_after(None, None, d, &record(7, 80)).unwrap();
    let value = store.get(c).unwrap().unwrap();
    assert_eq!(value.as_bytes(), record(6, 50).as_slice());
    assert_eq!(value.address(), f);
    assert!(store.get(f).unwrap().is_some());

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_remove_all_releases_chain() {
    let path = "/tmp/test_store_remove_all.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let mut session = WriterSession::new();
    let first = store.add(None, &mut session, &record(0, 60)).unwrap();
    for i in 1..10 {
        store.add(None, &mut session, &record(i, 60)).unwrap();
    }
    let chain = store.page_chain(page_from_pointer(first)).unwrap();
    assert!(chain.len() >= 3);

    assert_eq!(store.remove_all(None, first).unwrap(), chain.len());
    assert_eq!(store.record_count(), 0);
    let free = store.file().free_pages().unwrap();
    for page in &chain {
        assert!(free.contains(page));
    }
    assert!(store.get(first).unwrap().is_none());

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_binary_resources() {
    let path = "/tmp/test_store_binary.dbx";
    cleanup(path);

    let store = RecordStore::open(path, &options()).unwrap();
    let work = store.file().work_size();
    let data: Vec<u8> = (0..3 * work + 17).map(|i| (i % 253) as u8).collect();

    let (head, pages) = store.add_binary(None, &data).unwrap();
    assert_eq!(pages, 4);
    assert_eq!(store.get_binary(head).unwrap(), data);

    let (streamed, stream_pages) = store.add_binary_stream(None, &data[..work]).unwrap();
    assert_eq!(stream_pages, 1);
    let mut out = Vec::new();
    assert_eq!(store.read_binary(streamed, &mut out).unwrap(), work as u64);
    assert_eq!(out, &data[..work]);

    assert_eq!(store.remove_binary(None, head).unwrap(), 4);
    assert!(store.get_binary(head).is_err());
    assert_eq!(store.get_binary(streamed).unwrap(), &data[..work]);

    store.close().unwrap();
    cleanup(path);
}

#[test]
fn test_reopen_keeps_records_and_keys() {
    let path = "/tmp/test_store_reopen.dbx";
    cleanup(path);

    let big: Vec<u8> = (0..900u32).map(|i| (i % 200) as u8).collect();
    let (p1, p2) = {
        let store = RecordStore::open(path, &options()).unwrap();
        let mut session = WriterSession::new();
        let p1 = store
            .put(None, &mut session, &Value::from("doc/1"), b"small record")
            .unwrap();
        let p2 = store.put(None, &mut session, &Value::from("doc/2"), &big).unwrap();
        store.close().unwrap();
        (p1, p2)
    };

    let store = RecordStore::open(path, &options()).unwrap();
    assert_eq!(store.get(p1).unwrap().unwrap().as_bytes(), b"small record");
    assert_eq!(store.get(p2).unwrap().unwrap().into_bytes(), big);
    assert_eq!(store.find_value(&Value::from("doc/2")).unwrap(), Some(p2));
    assert_eq!(store.record_count(), 2);

    let mut session = WriterSession::resume_at(page_from_pointer(p2));
    let p3 = store.add(None, &mut session, b"appended later").unwrap();
    assert_eq!(
        document(&store, p1),
        vec![b"small record".to_vec(), big.clone(), b"appended later".to_vec()]
    );
    assert!(item_id::get_id(domstore::tid_from_pointer(p3)) > 0);

    store.close().unwrap();
    cleanup(path);
}
