//! Property-based tests using proptest
//!
//! Allocator accounting and the quantization error bound must hold for all
//! inputs within the supported domain.

use proptest::prelude::*;

use kv_cache_sched::cache::allocator::{NoReclaim, PagePool};
use kv_cache_sched::cache::page::PageId;
use kv_cache_sched::cache::quantizer::{self, QuantParams};
use kv_cache_sched::config::AcquireMode;
use kv_cache_sched::sequence::SequenceId;

// ============================================================================
// Page allocator
// ============================================================================

#[derive(Debug, Clone)]
enum PoolOp {
    Acquire(u64),
    Release(usize),
    ReleaseForeign(usize),
}

fn op_strategy() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        (0u64..4).prop_map(PoolOp::Acquire),
        (0usize..64).prop_map(PoolOp::Release),
        (0usize..64).prop_map(PoolOp::ReleaseForeign),
    ]
}

proptest! {
    // Property: pages in use stay within [0, capacity] and match what callers hold
    #[test]
    fn test_pool_accounting_bounded(
        capacity in 1usize..32,
        ops in prop::collection::vec(op_strategy(), 0..200)
    ) {
        let pool = PagePool::new(capacity, AcquireMode::FailFast);
        let mut held: Vec<(PageId, SequenceId)> = Vec::new();

        for op in ops {
            match op {
                PoolOp::Acquire(owner) => {
                    let owner = SequenceId(owner);
                    match pool.acquire(owner, &NoReclaim) {
                        Ok(page) => {
                            prop_assert!(held.iter().all(|(p, _)| *p != page), "page handed out twice");
                            held.push((page, owner));
                        }
                        Err(_) => prop_assert_eq!(held.len(), capacity),
                    }
                }
                PoolOp::Release(i) if !held.is_empty() => {
                    let (page, owner) = held.remove(i % held.len());
                    prop_assert!(pool.release(page, owner));
                    // A second release is a no-op.
                    prop_assert!(!pool.release(page, owner));
                }
                PoolOp::ReleaseForeign(i) if !held.is_empty() => {
                    let (page, owner) = held[i % held.len()];
                    prop_assert!(!pool.release(page, SequenceId(owner.0 + 100)));
                }
                _ => {}
            }
            prop_assert_eq!(pool.in_use(), held.len());
            prop_assert!(pool.in_use() <= pool.capacity());
            prop_assert_eq!(pool.in_use() + pool.available(), capacity);
        }
    }
}

// ============================================================================
// Quantization
// ============================================================================

fn magnitude_strategy() -> impl Strategy<Value = f32> {
    prop_oneof![Just(50.0f32), Just(1e6f32), Just(quantizer::MAX_MAGNITUDE)]
}

fn chunk_strategy() -> impl Strategy<Value = (f32, Vec<Vec<f32>>)> {
    magnitude_strategy().prop_flat_map(|m| {
        let chunks = prop::collection::vec(prop::collection::vec(-1.0f32..=1.0f32, 1..24), 1..8)
            .prop_map(move |chunks| {
                chunks
                    .into_iter()
                    .map(|c| c.into_iter().map(|v| v * m).collect::<Vec<_>>())
                    .collect::<Vec<_>>()
            });
        (Just(m), chunks)
    })
}

proptest! {
    // Property: one quantization is within half a step
    #[test]
    fn test_single_quantization_within_half_step(
        data in prop::collection::vec(-quantizer::MAX_MAGNITUDE..=quantizer::MAX_MAGNITUDE, 1..256)
    ) {
        let (lo, hi) = quantizer::value_range(&data).unwrap();
        let params = QuantParams::for_range(lo, hi);
        let tolerance = 1e-4 * (1.0 + lo.abs().max(hi.abs()));
        for &v in &data {
            let back = params.dequantize(params.quantize(v));
            prop_assert!(
                back.is_finite() && (v - back).abs() <= params.scale / 2.0 + tolerance,
                "{} read back as {} (scale {})", v, back, params.scale
            );
        }
    }

    // Property: writes that widen a page and requantize its earlier codes stay
    // within one final step of the original values
    #[test]
    fn test_requantized_page_within_final_scale((magnitude, chunks) in chunk_strategy()) {
        let mut params = QuantParams::EMPTY;
        let mut codes: Vec<u8> = Vec::new();
        let mut originals: Vec<f32> = Vec::new();

        for chunk in &chunks {
            let (lo, hi) = quantizer::value_range(chunk).unwrap();
            let was_empty = codes.is_empty();
            if was_empty || !params.covers(lo, hi) {
                let next = params.widened(lo, hi, was_empty);
                quantizer::requantize(&mut codes, &params, &next);
                params = next;
            }
            let start = codes.len();
            codes.resize(start + chunk.len(), 0);
            quantizer::quantize_into(&mut codes[start..], chunk, &params);
            originals.extend_from_slice(chunk);
        }

        let mut restored = Vec::new();
        quantizer::dequantize_into(&mut restored, &codes, &params);
        prop_assert_eq!(restored.len(), originals.len());
        for (v, back) in originals.iter().zip(restored.iter()) {
            prop_assert!(
                back.is_finite() && (v - back).abs() <= params.scale + 1e-5 * magnitude,
                "{} read back as {} (final scale {})", v, back, params.scale
            );
        }
    }

    // Property: values past the supported magnitude are never storable
    #[test]
    fn test_beyond_max_magnitude_unsupported(v in 1.0001e30f32..f32::MAX) {
        prop_assert!(!quantizer::is_supported(v));
        prop_assert!(!quantizer::is_supported(-v));
    }

    // Property: non-finite input has no range
    #[test]
    fn test_non_finite_rejected(mut data in prop::collection::vec(-1.0f32..1.0f32, 1..32), at in 0usize..32) {
        let i = at % data.len();
        data[i] = f32::NAN;
        prop_assert!(quantizer::value_range(&data).is_none());
    }
}
