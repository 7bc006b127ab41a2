//! Fuzz target for Merkle roots.

#![no_main]

use hiera_types::{merkle_root, Hash};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let ids: Vec<Hash> = data.chunks(8).map(Hash::digest).collect();
    let root = merkle_root(&ids);
    assert_eq!(root, merkle_root(&ids));
    assert_eq!(root.is_zero(), ids.is_empty());

    if let Some((last, rest)) = ids.split_last() {
        let mut changed = rest.to_vec();
        changed.push(Hash::digest(last.as_bytes()));
        assert_ne!(merkle_root(&changed), root);
    }
});
