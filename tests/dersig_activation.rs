//! Strict DER signatures become mandatory at the activation height

mod common;

use admission_node::config::ChainParams;
use admission_node::core::block::XField;
use admission_node::core::transaction::COIN;
use admission_node::core::RejectCode;
use common::{un_derify, Harness};

const DERSIG_HEIGHT: u32 = 110;

fn params() -> ChainParams {
    ChainParams {
        dersig_height: DERSIG_HEIGHT,
        cltv_height: DERSIG_HEIGHT + 100,
        ..ChainParams::default()
    }
}

const SPEND_VALUE: i64 = 50 * COIN - 100_000;

#[test]
fn test_non_der_signature_is_only_nonstandard_before_activation() {
    let mut h = Harness::new(params());
    let blocks = h.mine(101);

    let mut spend = h.spend_coinbase(&blocks[0], SPEND_VALUE);
    un_derify(&mut spend);

    let result = h.mempool.test_admit(&[spend.clone()], &h.chain, false);
    assert_eq!(
        result[&spend.txid()].reject_reason.as_deref(),
        Some("64: non-mandatory-script-verify-flag (Non-canonical DER signature)")
    );

    // Consensus still accepts it in a block
    let block = h.block_with(vec![spend], XField::None);
    let hash = h.chain.submit_block(block).unwrap();
    assert_eq!(h.chain.tip().hash(), hash);
}

#[test]
fn test_non_der_signature_rejected_from_activation_height() {
    let mut h = Harness::new(params());
    let blocks = h.mine(DERSIG_HEIGHT as usize - 1);
    assert_eq!(h.chain.next_height(), DERSIG_HEIGHT);

    let mut spend = h.spend_coinbase(&blocks[0], SPEND_VALUE);
    un_derify(&mut spend);

    // The pool judges against the next block, where the rule already binds
    let result = h.mempool.test_admit(&[spend.clone()], &h.chain, true);
    let admit = &result[&spend.txid()];
    assert!(!admit.allowed);
    assert_eq!(
        admit.reject_reason.as_deref(),
        Some("16: mandatory-script-verify-flag-failed (Non-canonical DER signature)")
    );

    let tip = h.chain.tip().hash();
    let block = h.block_with(vec![spend], XField::None);
    let rejection = h.chain.submit_block(block).unwrap_err();
    assert_eq!(rejection.code, Some(RejectCode::Invalid));
    assert_eq!(
        rejection.reason,
        "mandatory-script-verify-flag-failed (Non-canonical DER signature)"
    );
    assert_eq!(h.chain.tip().hash(), tip);

    // The same spend with a compliant signature connects
    let good = h.spend_coinbase(&blocks[0], SPEND_VALUE);
    let block = h.block_with(vec![good], XField::None);
    assert!(h.chain.submit_block(block).is_ok());
    assert_eq!(h.chain.height(), DERSIG_HEIGHT);
}

#[test]
fn test_parallel_script_checks_report_generic_failure() {
    let mut h = Harness::new(params());
    let blocks = h.mine(DERSIG_HEIGHT as usize - 1);

    let mut spend = h.spend_coinbase(&blocks[0], SPEND_VALUE);
    un_derify(&mut spend);
    let block = h.block_with(vec![spend], XField::None);

    // Replay the same history on a node checking scripts on a worker pool
    let mut parallel = admission_node::core::Blockchain::new(params(), 4).unwrap();
    for mined in &blocks {
        parallel.submit_block(mined.clone()).unwrap();
    }
    let rejection = parallel.submit_block(block).unwrap_err();
    assert_eq!(rejection.code, Some(RejectCode::Invalid));
    assert_eq!(rejection.reason, "block-validation-failed");
}
