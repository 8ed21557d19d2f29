//! End-to-end scenarios: restarts, bulk deletion, concurrent writers.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tempfile::TempDir;

use level_cache::cache::item::MIN_SEG_SIZE;
use level_cache::{
    AuxSlot, Auxiliary, Cache, CacheConfig, Error, MapAuxiliary, NoPromotion, ObjectId, TierConfig,
};

const SEG: u64 = MIN_SEG_SIZE;

type TestCache = Cache<MapAuxiliary<String>>;

fn config(tmp: &TempDir) -> CacheConfig {
    CacheConfig {
        meta_dir: tmp.path().join("meta"),
        action_parallel: 3,
        tiers: vec![
            TierConfig::disk("hdd", tmp.path().join("hdd"), 0).with_compression(1),
            TierConfig::disk("ssd", tmp.path().join("ssd"), 0),
            TierConfig::memory("ram", tmp.path().join("ram"), 0),
        ],
    }
}

async fn open(tmp: &TempDir) -> TestCache {
    Cache::open(config(tmp), &|_| MapAuxiliary::new()).await.unwrap()
}

fn fill(byte: u8, len: u64) -> Bytes {
    Bytes::from(vec![byte; len as usize])
}

#[tokio::test]
async fn test_state_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let id = ObjectId::new_random();
    {
        let cache = open(&tmp).await;
        cache.add_item(id, 1234, 2 * SEG, "movie".into()).await.unwrap();
        cache.add_segment(&id, 0, fill(7, 2 * SEG)).await.unwrap();
        // Two reads: hdd -> ssd -> ram.
        cache.get(&id, 0, None).await.unwrap();
        cache.get(&id, 0, None).await.unwrap();
        cache.dump().await.unwrap();
        cache.close().await.unwrap();
    }

    let cache = open(&tmp).await;
    let item = cache.item(&id).await.unwrap();
    assert_eq!(item.expire, 1234);
    assert!(item.is_complete());
    assert_eq!(
        cache.registry().auxiliary().get(&id).as_deref(),
        Some("movie")
    );

    let fetched = cache.get(&id, 0, None).await.unwrap().unwrap();
    assert_eq!(fetched.hit_tiers, vec!["ram", "ram"]);
    assert_eq!(fetched.chunks, vec![fill(7, SEG), fill(7, SEG)]);
    for stats in cache.tier_stats().await {
        assert_eq!(stats.segment_count, 2, "tier {}", stats.name);
    }
}

#[tokio::test]
async fn test_unknown_ids_are_reclaimed_on_open() {
    let tmp = TempDir::new().unwrap();
    let known = ObjectId::new_random();
    let deleted = ObjectId::new_random();
    {
        let cache = open(&tmp).await;
        for id in [known, deleted] {
            cache.add_item(id, 0, SEG, String::new()).await.unwrap();
            cache.add_segment(&id, 0, fill(1, SEG)).await.unwrap();
            cache.get(&id, 0, None).await.unwrap();
        }
        cache.dump().await.unwrap();
        // Registry forgets `deleted` after the tiers were persisted.
        cache.registry().del(&deleted).await;
        cache.registry().dump(2).await.unwrap();
    }

    let cache = open(&tmp).await;
    // One read each: resident in hdd and ssd, never promoted to ram.
    for tier in &cache.tiers()[..2] {
        assert!(tier.ids().await.contains(&known), "tier {}", tier.name());
    }
    for tier in cache.tiers() {
        assert!(!tier.ids().await.contains(&deleted), "tier {}", tier.name());
    }
}

#[tokio::test]
async fn test_del_batch_by_payload() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;

    let mut stale = Vec::new();
    let mut fresh = Vec::new();
    for i in 0..10u8 {
        let id = ObjectId::from_bytes([i; 16]);
        let tag = if i % 2 == 0 { "stale" } else { "fresh" };
        cache.add_item(id, 0, SEG, tag.into()).await.unwrap();
        cache.add_segment(&id, 0, fill(i, SEG)).await.unwrap();
        cache.get(&id, 0, None).await.unwrap();
        if i % 2 == 0 {
            stale.push(id);
        } else {
            fresh.push(id);
        }
    }

    let deleted = cache
        .del_batch(&|aux: &MapAuxiliary<String>| aux.select(|_, tag| tag == "stale"))
        .await
        .unwrap();
    assert_eq!(deleted, stale.len());

    for id in &stale {
        assert!(cache.get(id, 0, None).await.unwrap().is_none());
        for tier in cache.tiers() {
            assert!(!tier.contains(id, 0).await.unwrap());
        }
    }
    for id in &fresh {
        assert!(cache.get(id, 0, None).await.unwrap().unwrap().is_complete());
    }
    assert_eq!(cache.registry().auxiliary().len(), fresh.len());

    // Nothing left to match.
    let again = cache
        .del_batch(&|aux: &MapAuxiliary<String>| aux.select(|_, tag| tag == "stale"))
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_concurrent_disjoint_writes() {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(open(&tmp).await);
    let id = ObjectId::new_random();
    cache.add_item(id, 0, 8 * SEG, String::new()).await.unwrap();

    let writers = (0..8u64).map(|i| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.add_segment(&id, i * SEG, fill(i as u8, SEG)).await })
    });
    for result in join_all(writers).await {
        assert_eq!(result.unwrap().unwrap().written.len(), 1);
    }

    let item = cache.item(&id).await.unwrap();
    assert!(item.is_complete());
    let fetched = cache.get(&id, 0, None).await.unwrap().unwrap();
    for (i, chunk) in fetched.chunks.iter().enumerate() {
        assert_eq!(chunk, &fill(i as u8, SEG));
    }
}

#[tokio::test]
async fn test_no_promotion_policy_keeps_data_cold() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await.with_policy(NoPromotion);
    let id = ObjectId::new_random();
    cache.add_item(id, 0, SEG, String::new()).await.unwrap();
    cache.add_segment(&id, 0, fill(3, SEG)).await.unwrap();

    for _ in 0..3 {
        let fetched = cache.get(&id, 0, None).await.unwrap().unwrap();
        assert_eq!(fetched.hit_tiers, vec!["hdd"]);
    }
    assert_eq!(cache.metrics().hits("hdd"), 3);
}

#[tokio::test]
async fn test_each_slot_gets_its_own_auxiliary() {
    let tmp = TempDir::new().unwrap();
    let slots = std::sync::Mutex::new(Vec::new());
    let factory = |slot: AuxSlot| {
        slots.lock().unwrap().push(slot);
        MapAuxiliary::<String>::new()
    };
    let cache = Cache::open(config(&tmp), &factory).await.unwrap();

    assert_eq!(
        *slots.lock().unwrap(),
        vec![
            AuxSlot::Registry,
            AuxSlot::Tier(0),
            AuxSlot::Tier(1),
            AuxSlot::Tier(2)
        ]
    );

    let id = ObjectId::new_random();
    cache.add_item(id, 0, 1, "registry".into()).await.unwrap();
    cache.tier(1).unwrap().auxiliary().add(id, "ssd".into());
    assert_eq!(
        cache.registry().auxiliary().get(&id).as_deref(),
        Some("registry")
    );
    assert!(cache.tier(0).unwrap().auxiliary().get(&id).is_none());
}

#[tokio::test]
async fn test_open_rejects_invalid_config() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp);
    cfg.tiers.clear();
    let err = Cache::<MapAuxiliary<String>>::open(cfg, &|_| MapAuxiliary::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_metrics_render() {
    let tmp = TempDir::new().unwrap();
    let cache = open(&tmp).await;
    let id = ObjectId::new_random();
    cache.add_item(id, 0, SEG, String::new()).await.unwrap();
    cache.get(&id, 0, None).await.unwrap();

    let text = cache.metrics().render().unwrap();
    assert!(text.contains("levelcache_misses_total 1"));
}
