#![cfg(test)]
use std::collections::HashSet;

use proptest::prelude::*;
use v6seek_common::network::{Address, AddressRange, NetworkPrefix};
use v6seek_core::blacklist::BlacklistRegistry;
use v6seek_core::cluster::ClusterRegistry;
use v6seek_core::corpus::AddressCorpus;
use v6seek_core::model::{AddressModel, Exclusion, GenerationRequest, ModelParams};

/// Hosts spread over a handful of /64 networks with small interface ids.
fn corpus_strategy() -> impl Strategy<Value = Vec<Address>> {
    prop::collection::vec((0u128..6, 0u128..0x400), 8..120).prop_map(|hosts| {
        hosts
            .into_iter()
            .map(|(net, iid)| Address::from_u128((0x2001_0db8u128 << 96) | (net << 64) | iid))
            .collect()
    })
}

fn params(prefix_len: u8) -> ModelParams {
    ModelParams {
        prefix_len,
        min_cluster_size: 4,
        smoothing: 0.05,
        density_exponent: 1.0,
    }
}

fn trained(records: Vec<Address>, prefix_len: u8) -> (AddressCorpus, AddressModel) {
    let (corpus, _) = AddressCorpus::from_records(records);
    let params = params(prefix_len);
    let clusters = ClusterRegistry::build(prefix_len, &corpus);
    let model = AddressModel::train(1, &corpus, &clusters, &params);
    (corpus, model)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn batches_respect_exclusions(
        records in corpus_strategy(),
        blocked_net in 0u128..6,
        seed in any::<u64>(),
        prefix_len in prop::sample::select(vec![48u8, 64, 112]),
    ) {
        let (corpus, model) = trained(records, prefix_len);
        let blocked = NetworkPrefix::new(
            Address::from_u128((0x2001_0db8u128 << 96) | (blocked_net << 64)),
            64,
        );
        let blacklist = BlacklistRegistry::from_ranges([AddressRange::from(blocked)]);
        let exclusion = Exclusion::new(&corpus, &blacklist);
        let request = GenerationRequest { count: 200, seed, attempts_per_candidate: 8 };

        let batch = model.generate(&request, &exclusion);
        prop_assert!(batch.len() <= 200);

        let unique: HashSet<_> = batch.addresses.iter().collect();
        prop_assert_eq!(unique.len(), batch.len());
        for addr in &batch.addresses {
            prop_assert!(!corpus.contains(addr));
            prop_assert!(!blacklist.contains(addr));
        }

        let again = model.generate(&request, &exclusion);
        prop_assert_eq!(&again.addresses, &batch.addresses);
    }

    #[test]
    fn streams_respect_exclusions(records in corpus_strategy(), seed in any::<u64>()) {
        let (corpus, model) = trained(records, 64);
        let blacklist = BlacklistRegistry::parse("2001:db8:0:1::/64").unwrap();
        let request = GenerationRequest { count: 100, seed, attempts_per_candidate: 8 };

        let first: Vec<Address> =
            model.candidates(&request, Exclusion::new(&corpus, &blacklist)).collect();
        let second: Vec<Address> =
            model.candidates(&request, Exclusion::new(&corpus, &blacklist)).collect();
        prop_assert_eq!(&first, &second);

        let mut seen = HashSet::new();
        for addr in &first {
            prop_assert!(seen.insert(*addr));
            prop_assert!(!corpus.contains(addr));
            prop_assert!(!blacklist.contains(addr));
        }
    }
}

#[test]
fn candidates_stay_inside_observed_clusters() {
    let records = (0..4u128)
        .flat_map(|net| {
            (1..=6u128).map(move |iid| Address::from_u128((0x2001_0db8u128 << 96) | (net << 64) | iid))
        })
        .collect();
    let (corpus, model) = trained(records, 64);
    let blacklist = BlacklistRegistry::empty();
    let request = GenerationRequest { count: 500, seed: 11, attempts_per_candidate: 16 };

    let batch = model.generate(&request, &Exclusion::new(&corpus, &blacklist));
    assert_eq!(batch.len(), 500);

    let observed: HashSet<NetworkPrefix> = corpus.iter().map(|a| a.prefix(64)).collect();
    assert!(batch.addresses.iter().all(|a| observed.contains(&a.prefix(64))));
}
