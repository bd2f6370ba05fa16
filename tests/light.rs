//! Handle-level tests against the real epoch-0 cache, including the
//! cross-implementation light-client vector for block 22.

use std::sync::OnceLock;

use ethereum_types::{H256, U256};
use hex_literal::hex;

fn epoch0() -> &'static ethash::LightDAG {
    static LIGHT: OnceLock<ethash::LightDAG> = OnceLock::new();
    LIGHT.get_or_init(|| ethash::LightDAG::new(0).expect("epoch 0 parameters are valid"))
}

#[test]
fn handle_carries_epoch0_parameters() {
    let light = epoch0();
    assert_eq!(light.epoch(), 0);
    assert_eq!(light.block_number(), 0);
    assert_eq!(
        light.cache().len() as u64,
        ethash::get_cache_size(0).unwrap()
    );
    assert_eq!(light.full_size(), ethash::get_full_size(0).unwrap());
    assert!(light.is_valid_for(29_999));
    assert!(!light.is_valid_for(30_000));
}

#[test]
fn light_client_vector_block_22() {
    let light = epoch0();
    let header_hash = H256::from(hex!(
        "372eca2454ead349c3df0ab5d00b0b706b23e49d469387db91811cee0358fc6d"
    ));
    let nonce = 0x495732e0ed7a801c;

    let (mix_hash, result) = light.compute(header_hash, nonce);
    assert_eq!(
        mix_hash,
        H256::from(hex!(
            "2f74cdeb198af0b9abe65d22d372e22fb2d474371774a9583c1cc427a07939f5"
        ))
    );
    assert_eq!(
        result,
        H256::from(hex!(
            "00000b184f1fdd88bfd94c86c39e65db0c36144d5e43f745f722196e730cb614"
        ))
    );

    // The same seal passes verification under a difficulty its result meets.
    let difficulty = U256::from(1_000_000);
    light
        .verify(22, header_hash, nonce, mix_hash, difficulty)
        .unwrap();

    assert!(matches!(
        light.verify(30_000, header_hash, nonce, mix_hash, difficulty),
        Err(ethash::Error::EpochMismatch { .. })
    ));
    assert!(matches!(
        light.verify(22, header_hash, nonce, H256::zero(), difficulty),
        Err(ethash::Error::MixMismatch { .. })
    ));
    assert!(matches!(
        light.verify(22, header_hash, nonce, mix_hash, U256::max_value()),
        Err(ethash::Error::DifficultyNotMet)
    ));
}

#[test]
fn zero_header_zero_nonce_is_stable() {
    let light = epoch0();
    let first = light.compute(H256::zero(), 0);
    let second = light.compute(H256::zero(), 0);
    assert_eq!(first, second);
    assert_ne!(first.0, H256::zero());
}

#[test]
fn full_build_aborts_before_committing_memory() {
    let light = epoch0();
    let res = ethash::FullDAG::new(light, |_| 1);
    assert!(matches!(res, Err(ethash::Error::Aborted)));
}
