//! Scenarios running a whole group inside one process.
use crate::config::Options;
use crate::error::{Error, ErrorCode, Result};
use crate::index::IndexKind;
use crate::key::{int_key, KeyType};
use crate::protocol::GetOp;
use crate::router::SecondaryKeys;
use crate::server::ServerState;
use crate::stats::StatValue;
use crate::storage::StoreType;
use crate::store::Store;
use crate::transport::MemoryNetwork;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;

fn options(max_recs_per_slice: u64) -> Options {
    Options {
        store_type: StoreType::Memory,
        key_type: KeyType::Int,
        server_factor: 1,
        max_recs_per_slice,
        ..Options::default()
    }
}

/// Opens every rank of a group at once, the way separate processes would.
async fn open_group(size: u32, options: Options) -> (Arc<MemoryNetwork>, Vec<Result<Store>>) {
    let (network, ranks) = MemoryNetwork::new(size, options.max_message_bytes);
    let opens = ranks
        .into_iter()
        .map(|(transport, inbound)| Store::open(options.clone(), transport, inbound));
    (network, join_all(opens).await)
}

async fn group(size: u32, options: Options) -> (Arc<MemoryNetwork>, Vec<Store>) {
    let (network, opened) = open_group(size, options).await;
    let stores = opened.into_iter().map(|res| res.unwrap()).collect();
    (network, stores)
}

async fn flush_primary(stores: &[Store]) {
    let flushes = stores.iter().map(|s| s.stat_flush(s.primary()));
    for res in join_all(flushes).await {
        res.unwrap();
    }
}

async fn close(stores: Vec<Store>) {
    for res in join_all(stores.into_iter().map(|s| s.close())).await {
        res.unwrap();
    }
}

fn value(s: &'static str) -> Bytes {
    Bytes::from_static(s.as_bytes())
}

#[tokio::test]
async fn single_server_put_get_delete() {
    let (_network, stores) = group(2, options(10)).await;
    assert_eq!(None, stores[0].server_state(0));
    assert_eq!(Some(ServerState::Serving), stores[1].server_state(0));

    let router = stores[0].router();
    let primary = stores[0].primary().clone();

    let receipt = router.put(&primary, int_key(100), int_key(500)).await.unwrap();
    assert_eq!(1, receipt.rank);
    assert_eq!(ErrorCode::Success, receipt.error);

    for receipt in router.commit(&primary).await.unwrap() {
        assert_eq!(ErrorCode::Success, receipt.error);
    }

    let found = router
        .get(&primary, GetOp::Equal, Some(int_key(100)))
        .await
        .unwrap();
    assert_eq!(ErrorCode::Success, found.error);
    assert_eq!(Some(int_key(500)), found.value);

    let receipt = router.del(&primary, int_key(100)).await.unwrap();
    assert_eq!(ErrorCode::Success, receipt.error);

    let missing = router
        .get(&primary, GetOp::Equal, Some(int_key(100)))
        .await
        .unwrap();
    assert_eq!(ErrorCode::NotFound, missing.error);
    assert_eq!(None, missing.value);

    close(stores).await;
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_network, stores) = group(2, options(10)).await;
    let router = stores[1].router();
    let primary = stores[1].primary().clone();

    router.put(&primary, int_key(7), value("seven")).await.unwrap();
    for _ in 0..2 {
        let receipt = router.del(&primary, int_key(7)).await.unwrap();
        assert_eq!(ErrorCode::Success, receipt.error);
    }
    let receipts = router
        .bdel(&primary, vec![int_key(7), int_key(8)])
        .await
        .unwrap();
    assert_eq!(1, receipts.len());
    assert_eq!(ErrorCode::Success, receipts[0].error);

    close(stores).await;
}

#[tokio::test]
async fn ordered_walk_across_servers() {
    let (_network, stores) = group(3, options(2)).await;
    assert_eq!(2, stores[0].primary().topology().num_servers());

    // every rank puts a share of the keys
    for key in 0..10 {
        let store = &stores[key as usize % stores.len()];
        let receipt = store
            .router()
            .put(store.primary(), int_key(key), int_key(key * 10))
            .await
            .unwrap();
        assert_eq!(ErrorCode::Success, receipt.error);
    }
    flush_primary(&stores).await;

    let router = stores[0].router();
    let primary = stores[0].primary().clone();
    let mut seen = Vec::new();
    let mut cursor = router
        .get(&primary, GetOp::First, Some(int_key(-1)))
        .await
        .unwrap();
    while cursor.error == ErrorCode::Success {
        let key = cursor.key.clone().unwrap();
        seen.push(KeyType::Int.format(&key));
        cursor = router.get(&primary, GetOp::Next, Some(key)).await.unwrap();
    }
    assert_eq!(ErrorCode::NotFound, cursor.error);
    let expected: Vec<String> = (0..10).map(|k| k.to_string()).collect();
    assert_eq!(expected, seen);

    let last = router.get(&primary, GetOp::Last, None).await.unwrap();
    assert_eq!(Some(int_key(9)), last.key);
    let prev = router
        .get(&primary, GetOp::Prev, Some(int_key(5)))
        .await
        .unwrap();
    assert_eq!(Some(int_key(4)), prev.key);

    // both servers hold keys past 2, each answers with its own successor
    let results = router
        .bget(&primary, GetOp::Next, vec![int_key(2)])
        .await
        .unwrap();
    assert_eq!(2, results.len());
    let mut successors: Vec<String> = results
        .iter()
        .flat_map(|r| r.found().map(|(k, _)| KeyType::Int.format(k)))
        .collect();
    successors.sort();
    assert_eq!(vec!["3".to_string(), "5".to_string()], successors);

    close(stores).await;
}

#[tokio::test]
async fn string_keys_sharing_a_position() {
    let options = Options {
        key_type: KeyType::String,
        ..options(1000)
    };
    let (_network, stores) = group(2, options).await;
    let router = stores[0].router();
    let primary = stores[0].primary().clone();

    // the suffix is past the precision of the slice position
    let keys = ["aaaaaaaaaaaa1", "aaaaaaaaaaaa2", "aaaaaaaaaaaa3"];
    let records = keys.iter().map(|&k| (value(k), value("v"))).collect();
    router.bput(&primary, records).await.unwrap();
    flush_primary(&stores).await;

    let first = router.get(&primary, GetOp::First, None).await.unwrap();
    assert_eq!(Some(value(keys[0])), first.key);
    let next = router
        .get(&primary, GetOp::Next, Some(value(keys[0])))
        .await
        .unwrap();
    assert_eq!(Some(value(keys[1])), next.key);
    let prev = router
        .get(&primary, GetOp::Prev, Some(value(keys[2])))
        .await
        .unwrap();
    assert_eq!(Some(value(keys[1])), prev.key);
    let end = router
        .get(&primary, GetOp::Next, Some(value(keys[2])))
        .await
        .unwrap();
    assert_eq!(ErrorCode::NotFound, end.error);

    let walk = router
        .bget_op(&primary, GetOp::Next, Some(value(keys[0])), 5)
        .await
        .unwrap();
    let walked: Vec<Bytes> = walk.found().map(|(k, _)| k.clone()).collect();
    assert_eq!(vec![value(keys[1]), value(keys[2])], walked);

    close(stores).await;
}

#[tokio::test]
async fn closest_record_across_tied_rows() {
    let (_network, stores) = group(3, options(2)).await;
    let router = stores[0].router();
    let primary = stores[0].primary().clone();

    // slice 1 holds 1..=2 on one server, slice 2 holds 3..=4 on the other
    // and slice 3 holds 5 back on the first
    let records = (1..=5).map(|k| (int_key(k), int_key(k))).collect();
    router.bput(&primary, records).await.unwrap();
    flush_primary(&stores).await;

    // the row ending at 2 is asked first and answers 5 from slice 3
    let next = router
        .get(&primary, GetOp::Next, Some(int_key(2)))
        .await
        .unwrap();
    assert_eq!(Some(int_key(3)), next.key);
    let walk = router
        .bget_op(&primary, GetOp::Next, Some(int_key(2)), 2)
        .await
        .unwrap();
    let walked: Vec<Bytes> = walk.found().map(|(k, _)| k.clone()).collect();
    assert_eq!(vec![int_key(3), int_key(4)], walked);

    close(stores).await;
}

#[tokio::test]
async fn statistics_count_distinct_keys() {
    for &value_append in &[false, true] {
        let options = Options {
            value_append,
            ..options(10)
        };
        let (_network, stores) = group(2, options).await;
        let router = stores[0].router();
        let primary = stores[0].primary().clone();

        router.put(&primary, int_key(5), value("a")).await.unwrap();
        router.put(&primary, int_key(5), value("b")).await.unwrap();
        let records = vec![(int_key(3), value("c")), (int_key(5), value("d"))];
        router.bput(&primary, records).await.unwrap();
        flush_primary(&stores).await;

        for store in &stores {
            let rows = store.primary().stat_rows();
            assert_eq!(1, rows.len());
            assert_eq!(1, rows[0].slice);
            assert_eq!(2, rows[0].stat.num);
            assert_eq!(StatValue::Int(3), rows[0].stat.min);
            assert_eq!(StatValue::Int(5), rows[0].stat.max);
        }
        close(stores).await;
    }
}

#[tokio::test]
async fn bulk_get_sequence() {
    let (_network, stores) = group(2, options(100)).await;
    let router = stores[0].router();
    let primary = stores[0].primary().clone();

    let records = (1..=5).map(|k| (int_key(k), int_key(k * 2))).collect();
    router.bput(&primary, records).await.unwrap();
    flush_primary(&stores).await;

    let result = router
        .bget_op(&primary, GetOp::Next, Some(int_key(1)), 3)
        .await
        .unwrap();
    assert_eq!(ErrorCode::Success, result.error);
    let keys: Vec<Bytes> = result.found().map(|(k, _)| k.clone()).collect();
    assert_eq!(vec![int_key(2), int_key(3), int_key(4)], keys);

    let result = router
        .bget_op(&primary, GetOp::Last, None, 2)
        .await
        .unwrap();
    let keys: Vec<Bytes> = result.found().map(|(k, _)| k.clone()).collect();
    assert_eq!(vec![int_key(5), int_key(4)], keys);

    close(stores).await;
}

#[tokio::test]
async fn one_message_per_destination() {
    let (network, stores) = group(3, options(1)).await;
    let router = stores[1].router();
    let primary = stores[1].primary().clone();

    // slices 1..=4 alternate between server 2 (rank 2) and server 1 (rank 1)
    let records = (1..=4).map(|k| (int_key(k), int_key(k))).collect();
    let receipts = router.bput(&primary, records).await.unwrap();
    assert_eq!(1, network.requests_sent());
    assert_eq!(vec![1, 2], receipts.iter().map(|r| r.rank).collect::<Vec<_>>());
    assert!(receipts.iter().all(|r| r.error.is_success()));

    let results = router
        .bget(&primary, GetOp::Equal, (1..=4).map(int_key).collect())
        .await
        .unwrap();
    assert_eq!(2, network.requests_sent());
    assert_eq!(vec![1, 2], results.iter().map(|r| r.rank).collect::<Vec<_>>());
    assert_eq!(4, results.iter().map(|r| r.found().count()).sum::<usize>());

    close(stores).await;
}

#[tokio::test]
async fn oversized_bulk_put_sends_nothing() {
    let options = Options {
        max_message_bytes: 256,
        ..options(10)
    };
    let (network, stores) = group(2, options).await;
    let router = stores[0].router();
    let primary = stores[0].primary().clone();

    let records = (0..32)
        .map(|k| (int_key(k), Bytes::from(vec![0u8; 64])))
        .collect();
    match router.bput(&primary, records).await {
        Err(Error::MessageTooLarge { max: 256, .. }) => {}
        res => panic!("unexpected result {:?}", res),
    }
    assert_eq!(0, network.frames_sent());

    close(stores).await;
}

#[tokio::test]
async fn too_many_records() {
    let options = Options {
        max_bulk_ops: 2,
        ..options(10)
    };
    let (network, stores) = group(2, options).await;
    let router = stores[0].router();
    let keys = (0..3).map(int_key).collect();
    match router.bget(stores[0].primary(), GetOp::Equal, keys).await {
        Err(Error::TooManyRecords { count: 3, max: 2 }) => {}
        res => panic!("unexpected result {:?}", res),
    }
    assert_eq!(0, network.frames_sent());
    close(stores).await;
}

#[tokio::test]
async fn invalid_keys_fail_before_sending() {
    let (network, stores) = group(2, options(10)).await;
    let router = stores[0].router();
    let primary = stores[0].primary().clone();

    assert!(router
        .put(&primary, int_key(-4), value("negative"))
        .await
        .is_err());
    assert!(router
        .put(&primary, value("abc"), value("wrong width"))
        .await
        .is_err());
    assert!(router.get(&primary, GetOp::Equal, None).await.is_err());
    assert_eq!(0, network.frames_sent());

    // no statistics yet, nothing can match
    let first = router.get(&primary, GetOp::First, None).await.unwrap();
    assert_eq!(ErrorCode::NotFound, first.error);
    assert_eq!(0, network.frames_sent());

    close(stores).await;
}

#[tokio::test]
async fn value_append() {
    let options = Options {
        value_append: true,
        ..options(10)
    };
    let (_network, stores) = group(2, options).await;
    let router = stores[0].router();
    let primary = stores[0].primary().clone();

    router.put(&primary, int_key(1), value("ab")).await.unwrap();
    router.put(&primary, int_key(1), value("cd")).await.unwrap();
    let found = router
        .get(&primary, GetOp::Equal, Some(int_key(1)))
        .await
        .unwrap();
    assert_eq!(Some(value("abcd")), found.value);

    close(stores).await;
}

#[tokio::test]
async fn secondary_local_index() {
    let (_network, stores) = group(3, options(1)).await;
    let creates = stores
        .iter()
        .map(|s| s.create_index(IndexKind::SecondaryLocal { primary: 0 }, KeyType::Int));
    let secondaries: Vec<_> = join_all(creates)
        .await
        .into_iter()
        .map(|res| res.unwrap())
        .collect();
    assert!(secondaries.iter().all(|i| i.id() == 1));

    let router = stores[0].router();
    let primary = stores[0].primary().clone();
    for k in 1..=4 {
        let secondary = SecondaryKeys {
            index: secondaries[0].clone(),
            keys: vec![int_key(k * 100)],
        };
        let receipt = router
            .put_with(&primary, int_key(k), int_key(k * 10), &[secondary])
            .await
            .unwrap();
        assert!(receipt.error.is_success());
    }

    let flushes = stores
        .iter()
        .zip(&secondaries)
        .map(|(s, index)| s.stat_flush(index));
    for res in join_all(flushes).await {
        res.unwrap();
    }

    // the entry of primary key 3 lives on the server of primary key 3
    let results = router
        .bget(&secondaries[0], GetOp::Equal, vec![int_key(300)])
        .await
        .unwrap();
    let found: Vec<_> = results
        .iter()
        .flat_map(|r| r.found().map(move |(_, v)| (r.rank, v.clone())))
        .collect();
    let owner = primary.route(&int_key(3)).unwrap().rank;
    assert_eq!(vec![(owner, int_key(3))], found);

    let records = router
        .bget_primary(&secondaries[0], GetOp::Equal, vec![int_key(200), int_key(400)])
        .await
        .unwrap();
    let mut values: Vec<Bytes> = records
        .iter()
        .flat_map(|r| r.found().map(|(_, v)| v.clone()))
        .collect();
    values.sort();
    let mut expected = vec![int_key(20), int_key(40)];
    expected.sort();
    assert_eq!(expected, values);

    close(stores).await;
}

#[tokio::test]
async fn secondary_global_index_waits_for_peers() {
    let (_network, stores) = group(3, options(10)).await;
    let index = stores[0]
        .create_index(IndexKind::SecondaryGlobal { primary: 0 }, KeyType::Int)
        .await
        .unwrap();

    // the owner has not created the index yet, the put is held until it does
    let router = stores[0].router();
    let put_index = index.clone();
    let put = tokio::spawn(async move { router.put(&put_index, int_key(15), int_key(1)).await });
    tokio::task::yield_now().await;

    for store in &stores[1..] {
        store
            .create_index(IndexKind::SecondaryGlobal { primary: 0 }, KeyType::Int)
            .await
            .unwrap();
    }
    assert!(put.await.unwrap().unwrap().error.is_success());

    let results = stores[2]
        .router()
        .bget_primary(&index, GetOp::Equal, vec![int_key(15)])
        .await
        .unwrap();
    assert_eq!(ErrorCode::NotFound, results[0].error);

    close(stores).await;
}

#[tokio::test]
async fn local_index_stays_local() {
    let (network, stores) = group(2, options(10)).await;
    let local = stores[0]
        .create_index(IndexKind::Local, KeyType::Int)
        .await
        .unwrap();
    assert_eq!(Some(ServerState::Serving), stores[0].server_state(local.id()));

    let router = stores[0].router();
    router.put(&local, int_key(3), value("three")).await.unwrap();
    router.put(&local, int_key(1), value("one")).await.unwrap();
    stores[0].stat_flush(&local).await.unwrap();

    let first = router.get(&local, GetOp::First, None).await.unwrap();
    assert_eq!(Some(int_key(1)), first.key);
    let next = router
        .get(&local, GetOp::Next, Some(int_key(1)))
        .await
        .unwrap();
    assert_eq!(Some(value("three")), next.value);
    assert_eq!(0, network.frames_sent());

    close(stores).await;
}

#[tokio::test]
async fn statistics_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        path: dir.path().to_string_lossy().into_owned(),
        store_type: StoreType::FlatLog,
        ..options(10)
    };

    let (_network, stores) = group(2, options.clone()).await;
    let router = stores[0].router();
    let primary = stores[0].primary().clone();
    let records = (1..=20).map(|k| (int_key(k), int_key(k))).collect();
    router.bput(&primary, records).await.unwrap();
    router.commit(&primary).await.unwrap();
    close(stores).await;

    let reopen = Options {
        create_new: false,
        ..options.clone()
    };
    let (_network, stores) = group(2, reopen.clone()).await;
    flush_primary(&stores).await;
    let rows = stores[0].primary().stat_rows();
    assert_eq!(2, rows.len());
    assert_eq!(20, rows.iter().map(|r| r.stat.num).sum::<u64>());

    let router = stores[0].router();
    let last = router
        .get(stores[0].primary(), GetOp::Last, None)
        .await
        .unwrap();
    assert_eq!(Some(int_key(20)), last.key);
    close(stores).await;

    // a different slice size would route keys elsewhere, every rank fails
    let mismatched = Options {
        max_recs_per_slice: 5,
        ..reopen
    };
    let (_network, opened) = open_group(2, mismatched).await;
    assert_eq!(2, opened.len());
    for res in opened {
        match res {
            Err(Error::Manifest(_)) => {}
            res => panic!("unexpected result {:?}", res.map(|_| ())),
        }
    }
}
