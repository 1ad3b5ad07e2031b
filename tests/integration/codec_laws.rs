#![allow(missing_docs)]

use std::fmt::Debug;

use bytes::Bytes;
use proptest::prelude::*;
use slicestore::{
    primitives::archive::{
        decode_for_version, deserialize_cluster_version, encode_for_version,
        serialize_cluster_version, serialized_size_for_version, Archive, ArchiveError,
        ClusterVersion, ReadStream, WriteMessage,
    },
    storage::{
        AddPolicy, AppendPrependKind, AppendPrependMutation, CasTime, DeleteMutation,
        GetCasMutation, GetResult, IncrDecrKind, IncrDecrMutation, IncrDecrResult, Mutation,
        MutationResult, ReplacePolicy, SarcMutation, SetResult,
    },
    types::{Bound, KeyRange, ReplTimestamp, StoreKey, MAX_KEY_SIZE},
};

fn check_laws<T: Archive + PartialEq + Debug>(value: &T) -> Result<(), TestCaseError> {
    for version in ClusterVersion::ALL {
        let bytes = encode_for_version(version, value);
        prop_assert_eq!(bytes.len(), serialized_size_for_version(version, value));
        let back: T = decode_for_version(version, &bytes)
            .map_err(|err| TestCaseError::fail(format!("{version}: {err}")))?;
        prop_assert_eq!(&back, value);
    }
    Ok(())
}

fn store_key() -> impl Strategy<Value = StoreKey> {
    proptest::collection::vec(any::<u8>(), 0..=MAX_KEY_SIZE)
        .prop_map(|bytes| StoreKey::new(bytes).expect("length within MAX_KEY_SIZE"))
}

fn value_bytes() -> impl Strategy<Value = Bytes> {
    proptest::collection::vec(any::<u8>(), 0..512).prop_map(Bytes::from)
}

fn bound() -> impl Strategy<Value = Bound> {
    prop_oneof![
        Just(Bound::Unbounded),
        store_key().prop_map(Bound::Open),
        store_key().prop_map(Bound::Closed),
    ]
}

fn castime() -> impl Strategy<Value = CasTime> {
    (any::<u64>(), any::<u32>()).prop_map(|(cas, ts)| CasTime::new(cas, ReplTimestamp(ts)))
}

fn mutation() -> impl Strategy<Value = Mutation> {
    let add = prop_oneof![Just(AddPolicy::Yes), Just(AddPolicy::No)];
    let replace = prop_oneof![
        Just(ReplacePolicy::Yes),
        Just(ReplacePolicy::IfCasMatches),
        Just(ReplacePolicy::No)
    ];
    prop_oneof![
        store_key().prop_map(|key| Mutation::GetCas(GetCasMutation { key })),
        (store_key(), value_bytes(), any::<u32>(), any::<u32>(), add, replace, any::<u64>()).prop_map(
            |(key, data, flags, exptime, add_policy, replace_policy, old_cas)| {
                Mutation::Sarc(SarcMutation {
                    key,
                    data,
                    flags,
                    exptime,
                    add_policy,
                    replace_policy,
                    old_cas,
                })
            }
        ),
        (store_key(), any::<bool>(), any::<u64>()).prop_map(|(key, incr, amount)| {
            Mutation::IncrDecr(IncrDecrMutation {
                kind: if incr { IncrDecrKind::Incr } else { IncrDecrKind::Decr },
                key,
                amount,
            })
        }),
        (store_key(), any::<bool>(), value_bytes()).prop_map(|(key, append, data)| {
            Mutation::AppendPrepend(AppendPrependMutation {
                kind: if append {
                    AppendPrependKind::Append
                } else {
                    AppendPrependKind::Prepend
                },
                key,
                data,
            })
        }),
        (store_key(), any::<bool>()).prop_map(|(key, dont_put_in_delete_queue)| {
            Mutation::Delete(DeleteMutation {
                key,
                dont_put_in_delete_queue,
            })
        }),
    ]
}

fn mutation_result() -> impl Strategy<Value = MutationResult> {
    prop_oneof![
        (proptest::option::of(value_bytes()), any::<u32>(), any::<u64>())
            .prop_map(|(value, flags, cas)| MutationResult::GetCas(GetResult { value, flags, cas })),
        Just(MutationResult::Sarc(SetResult::Stored)),
        Just(MutationResult::Sarc(SetResult::TooLarge)),
        any::<u64>().prop_map(|n| MutationResult::IncrDecr(IncrDecrResult::Success(n))),
        Just(MutationResult::IncrDecr(IncrDecrResult::NotNumeric)),
    ]
}

proptest! {
    #[test]
    fn timestamps_obey_codec_laws(ts in any::<u32>()) {
        check_laws(&ReplTimestamp(ts))?;
    }

    #[test]
    fn keys_and_ranges_obey_codec_laws(key in store_key(), left in bound(), right in bound()) {
        check_laws(&key)?;
        check_laws(&KeyRange::new(left, right))?;
    }

    #[test]
    fn castimes_obey_codec_laws(ct in castime()) {
        check_laws(&ct)?;
    }

    #[test]
    fn mutations_obey_codec_laws(m in mutation()) {
        check_laws(&m)?;
    }

    #[test]
    fn mutation_results_obey_codec_laws(r in mutation_result()) {
        check_laws(&r)?;
    }

    #[test]
    fn truncated_mutations_never_decode(m in mutation(), cut in any::<prop::sample::Index>()) {
        for version in ClusterVersion::ALL {
            let bytes = encode_for_version(version, &m);
            let len = cut.index(bytes.len());
            prop_assert!(decode_for_version::<Mutation>(version, &bytes[..len]).is_err());
        }
    }
}

#[test]
fn cluster_version_tags_round_trip() {
    for version in ClusterVersion::ALL {
        let mut wm = WriteMessage::with_capacity(1);
        serialize_cluster_version(&mut wm, version);
        let bytes = wm.into_vec();
        let mut s = ReadStream::new(&bytes);
        assert_eq!(deserialize_cluster_version(&mut s).unwrap(), version);
    }
}

#[test]
fn every_out_of_range_tag_is_a_range_error() {
    let valid: Vec<i8> = ClusterVersion::ALL.iter().map(|v| v.tag()).collect();
    for tag in i8::MIN..=i8::MAX {
        let bytes = [tag as u8];
        let mut s = ReadStream::new(&bytes);
        let decoded = deserialize_cluster_version(&mut s);
        if valid.contains(&tag) {
            assert_eq!(decoded.unwrap().tag(), tag);
        } else {
            assert!(
                matches!(decoded, Err(ArchiveError::RangeError { tag: t }) if t == tag),
                "tag {tag} decoded as {decoded:?}"
            );
        }
    }
}

#[test]
fn disk_and_cluster_targets_are_distinct_constants() {
    assert_eq!(ClusterVersion::OLDEST, ClusterVersion::ALL[0]);
    assert_eq!(ClusterVersion::LATEST_OVERALL, ClusterVersion::ALL[ClusterVersion::ALL.len() - 1]);
    assert!(ClusterVersion::LATEST_DISK <= ClusterVersion::LATEST_OVERALL);
    assert!(ClusterVersion::CLUSTER <= ClusterVersion::LATEST_OVERALL);
}
