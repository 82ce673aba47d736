use proptest::prelude::*;

use replhub_core::config::{ScalingConfig, MAX_PARTS};
use replhub_core::model::{append_prefix, map_dest_key, remove_prefix};
use replhub_pipeline::transfer::effective_chunk_size;
use replhub_pipeline::{split_parts, ScalingController, StepPolicy};

fn key_segment() -> impl Strategy<Value = String> {
    "[a-z0-9_.-]{1,8}"
}

proptest! {
    #[test]
    fn prop_parts_cover_object_exactly(size in 1u64..200_000_000_000, chunk in 1u64..64_000_000) {
        let parts = split_parts(size, chunk);
        prop_assert!(!parts.is_empty());
        prop_assert!(parts.len() as u64 <= MAX_PARTS);

        let mut next = 0u64;
        for (i, part) in parts.iter().enumerate() {
            prop_assert_eq!(part.part_number as usize, i + 1);
            prop_assert_eq!(part.range.start, next);
            prop_assert!(!part.range.is_empty());
            next = part.range.end;
        }
        prop_assert_eq!(next, size);
    }

    #[test]
    fn prop_chunk_never_shrinks(size in 0u64..u64::MAX / 2, chunk in 1u64..1_000_000_000) {
        prop_assert!(effective_chunk_size(size, chunk) >= chunk);
    }

    #[test]
    fn prop_scaling_target_within_bounds(depth in any::<u64>(), current in 0usize..64, min in 1usize..5, extra in 0usize..30) {
        let config = ScalingConfig {
            min_capacity: min,
            max_capacity: min + extra,
            desired_capacity: min,
            ..ScalingConfig::default()
        };
        let decision = ScalingController::new(&config).evaluate(depth, current);
        prop_assert!(decision.target >= min && decision.target <= min + extra);
        prop_assert_eq!(decision.delta, StepPolicy::default().delta_for(depth));
    }

    #[test]
    fn prop_step_delta_monotonic_above_zero(a in 1u64..50_000, b in 1u64..50_000) {
        let policy = StepPolicy::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(policy.delta_for(lo) <= policy.delta_for(hi));
    }

    #[test]
    fn prop_prefix_round_trip(prefix in prop::collection::vec(key_segment(), 0..3), rest in prop::collection::vec(key_segment(), 1..4)) {
        let prefix = prefix.join("/");
        let rest = rest.join("/");
        let key = append_prefix(&rest, &prefix);
        prop_assert_eq!(remove_prefix(&key, &prefix), rest);
    }

    #[test]
    fn prop_dest_key_rerooted(src in prop::collection::vec(key_segment(), 1..3), dest in prop::collection::vec(key_segment(), 0..3), rel in prop::collection::vec(key_segment(), 1..3), marker in any::<bool>()) {
        let src_prefix = src.join("/");
        let dest_prefix = dest.join("/");
        let mut relative = rel.join("/");
        if marker {
            relative.push('/');
        }
        let key = format!("{}/{}", src_prefix, relative);
        let mapped = map_dest_key(&key, &src_prefix, &dest_prefix);
        prop_assert!(mapped.starts_with(&dest_prefix));
        prop_assert!(mapped.ends_with(&relative));
        prop_assert_eq!(mapped.ends_with('/'), marker);
    }
}

#[test]
fn test_queue_depth_3000_scales_by_five() {
    let controller = ScalingController::new(&ScalingConfig::default());
    let decision = controller.evaluate(3_000, 3);
    assert_eq!(decision.delta, 5);
    assert_eq!(decision.target, 8);
    assert_eq!(controller.evaluate(3_000, 19).target, 20);
}
