//! Channel router integration scenarios

use aes67::{Aes67Error, ChannelMapping, ChannelRouter, StreamId};

fn mapping(start: u16, count: u16) -> ChannelMapping {
    ChannelMapping::sequential(StreamId::generate(), "integration", start, count)
}

#[test]
fn overlap_refusal_leaves_state_untouched() {
    let router = ChannelRouter::new();

    let a = mapping(0, 8);
    let a_id = a.stream_id;
    router.add(a).unwrap();

    let snapshot_before: Vec<_> = (0..128).map(|c| router.owner_of(c)).collect();

    // B claims [4, 12) which collides with A on [4, 8)
    let b = mapping(4, 8);
    assert!(matches!(
        router.add(b),
        Err(Aes67Error::ChannelOverlap { channel: 4, owner }) if owner == a_id
    ));

    let snapshot_after: Vec<_> = (0..128).map(|c| router.owner_of(c)).collect();
    assert_eq!(snapshot_before, snapshot_after);
    assert_eq!(router.used_count(), 8);
    assert_eq!(router.all().len(), 1);
}

#[test]
fn auto_allocation_reuses_freed_block() {
    let router = ChannelRouter::new();

    let a = mapping(0, 8);
    let b = mapping(8, 8);
    let c = mapping(16, 8);
    let b_id = b.stream_id;

    router.add(a).unwrap();
    router.add(b).unwrap();
    router.add(c).unwrap();
    assert_eq!(router.used_count(), 24);

    router.remove(b_id).unwrap();

    let d = router
        .default_mapping(StreamId::generate(), "refill", 8)
        .unwrap();
    assert_eq!(d.device_channel_start, 8);
}

#[test]
fn allocation_walks_past_partial_holes() {
    let router = ChannelRouter::new();

    router.add(mapping(0, 4)).unwrap();
    router.add(mapping(6, 4)).unwrap();

    // The hole at [4, 6) is too small for 4 channels
    assert_eq!(router.find_free_block(2), Some(4));
    assert_eq!(router.find_free_block(4), Some(10));
}

#[test]
fn single_owner_invariant_across_random_ops() {
    let router = ChannelRouter::new();
    let mut live: Vec<StreamId> = Vec::new();

    // A deterministic churn of adds and removes
    for round in 0..50u16 {
        let count = (round % 7) + 1;
        if round % 3 == 2 {
            if let Some(id) = live.pop() {
                router.remove(id).unwrap();
            }
        } else if let Ok(m) = router.default_mapping(
            StreamId::generate(),
            &format!("churn-{round}"),
            count,
        ) {
            let id = m.stream_id;
            if router.add(m).is_ok() {
                live.push(id);
            }
        }

        // Invariant: every channel has at most one claimant
        let mappings = router.all();
        for channel in 0..128u16 {
            let claimants = mappings
                .iter()
                .filter(|m| m.contains_device_channel(channel))
                .count();
            assert!(claimants <= 1, "channel {channel} claimed {claimants} times");
        }

        // Bookkeeping is consistent
        let claimed: usize = mappings
            .iter()
            .map(|m| usize::from(m.device_channel_count))
            .sum();
        assert_eq!(claimed, router.used_count());
        assert_eq!(router.free_channels(), 128 - claimed);
    }
}

#[test]
fn full_device_refuses_further_allocation() {
    let router = ChannelRouter::new();
    router.add(mapping(0, 128)).unwrap();

    assert_eq!(router.free_channels(), 0);
    assert!(matches!(
        router.default_mapping(StreamId::generate(), "overflow", 1),
        Err(Aes67Error::NoChannelsAvailable { requested: 1 })
    ));
}
