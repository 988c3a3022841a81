//! Property tests for DecodeCache update semantics.

use candle_core::{Device, Tensor};
use proptest::prelude::*;
use soma_decode::{DecodeCache, DecodeCacheConfig, WriteStrategy};

const MAX_SEQ_LEN: usize = 16;

fn cache(strategy: WriteStrategy) -> DecodeCache {
    let config = DecodeCacheConfig::new(2, 2, MAX_SEQ_LEN, 3);
    DecodeCache::with_strategy(&config, &Device::Cpu, strategy).unwrap()
}

fn step_tensor(seed: u32) -> Tensor {
    let data: Vec<f32> = (0..12).map(|i| seed as f32 * 100.0 + i as f32).collect();
    Tensor::from_vec(data, (2, 2, 1, 3), &Device::Cpu).unwrap()
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

fn write_strategy() -> impl Strategy<Value = WriteStrategy> {
    prop_oneof![
        Just(WriteStrategy::IndexedScatter),
        Just(WriteStrategy::SliceAssign)
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replaying any sequence of single-step writes leaves each position
    /// holding its last write and untouched positions at zero.
    #[test]
    fn property_matches_last_write_model(
        strategy in write_strategy(),
        writes in prop::collection::vec((0usize..MAX_SEQ_LEN, 1u32..1000), 1..24),
    ) {
        let mut cache = cache(strategy);
        let mut model: Vec<Option<u32>> = vec![None; MAX_SEQ_LEN];

        for &(pos, seed) in &writes {
            let k = step_tensor(seed);
            let v = step_tensor(seed + 1000);
            cache.update(pos, &k, &v).unwrap();
            model[pos] = Some(seed);
        }

        for (pos, expected) in model.iter().enumerate() {
            let (k, v) = cache.read_position(pos).unwrap();
            match expected {
                Some(seed) => {
                    prop_assert_eq!(flat(&k), flat(&step_tensor(*seed)));
                    prop_assert_eq!(flat(&v), flat(&step_tensor(seed + 1000)));
                }
                None => {
                    prop_assert!(flat(&k).iter().all(|&x| x == 0.0));
                    prop_assert!(flat(&v).iter().all(|&x| x == 0.0));
                }
            }
        }

        let highest = writes.iter().map(|&(pos, _)| pos).max().unwrap();
        prop_assert_eq!(cache.filled_len(), highest + 1);
    }

    /// Out-of-range positions are always rejected and never mutate.
    #[test]
    fn property_out_of_range_rejected(
        strategy in write_strategy(),
        pos in MAX_SEQ_LEN..MAX_SEQ_LEN * 4,
    ) {
        let mut cache = cache(strategy);
        let k = step_tensor(1);

        prop_assert!(cache.update(pos, &k, &k).is_err());
        prop_assert!(flat(cache.keys()).iter().all(|&x| x == 0.0));
        prop_assert_eq!(cache.filled_len(), 0);
    }

    /// A prefill run writes exactly `[start, start + len)` on both strategies.
    #[test]
    fn property_prefill_run(
        strategy in write_strategy(),
        start in 0usize..MAX_SEQ_LEN,
        len in 1usize..MAX_SEQ_LEN,
    ) {
        prop_assume!(start + len <= MAX_SEQ_LEN);
        let mut cache = cache(strategy);
        let data: Vec<f32> = (0..2 * 2 * len * 3).map(|i| i as f32 + 1.0).collect();
        let k = Tensor::from_vec(data, (2, 2, len, 3), &Device::Cpu).unwrap();

        cache.update(start..start + len, &k, &k).unwrap();

        let written = cache.keys().narrow(2, start, len).unwrap();
        prop_assert_eq!(flat(&written), flat(&k));
        prop_assert_eq!(cache.filled_len(), start + len);
    }
}
