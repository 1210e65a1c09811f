//! Blocks above the default ceiling need a size declaration in the header

mod common;

use admission_node::config::ChainParams;
use admission_node::core::block::{XField, DEFAULT_MAX_BLOCK_SIZE, MIN_BLOCK_SIZE_FIELD};
use admission_node::core::script::Script;
use admission_node::core::transaction::COIN;
use admission_node::core::{Block, Blockchain, RejectCode, Transaction};
use admission_node::crypto::hash160;
use admission_node::mining::Miner;
use common::{federation_key, spend_coinbase_to, Harness};

const RAISED_SIZE: u32 = 2_000_000;
const FANOUT: usize = 2800;
const FEE: i64 = 200_000;

/// Spend the coinbase of `block` into `FANOUT` P2SH outputs, ~90 kB
fn fan_out(h: &Harness, block: &Block, salt: u8) -> Transaction {
    let value = (50 * COIN - FEE) / FANOUT as i64;
    let outputs = (0..FANOUT)
        .map(|i| {
            let redeem = [salt, (i >> 8) as u8, i as u8];
            (value, Script::new_p2sh(&hash160(&redeem)))
        })
        .collect();
    spend_coinbase_to(&h.key, block, outputs)
}

fn fill_mempool(h: &mut Harness, blocks: &[Block]) -> Vec<Transaction> {
    let txs: Vec<Transaction> = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| fan_out(h, block, i as u8))
        .collect();
    for tx in &txs {
        h.mempool.broadcast(tx.clone(), &h.chain, false).unwrap();
    }
    txs
}

/// A signed block on the tip carrying `txs` whose size is its declared
/// ceiling plus `excess`. The proof length varies with the header, so
/// the time is bumped until the declaration and the size agree.
fn block_declaring(h: &Harness, txs: Vec<Transaction>, excess: usize) -> Block {
    let coinbase = Transaction::new_coinbase(
        h.chain.next_height(),
        h.payout(),
        h.chain.params().block_reward,
    );
    let mut transactions = vec![coinbase];
    transactions.extend(txs);
    let now = chrono::Utc::now().timestamp();
    let start = now.max(h.chain.median_time_past() + 1) as u32;

    for bump in 0..64 {
        let build = |size: u32| {
            let mut block = Block::new(
                h.chain.tip().hash(),
                start + bump,
                XField::MaxBlockSize(size),
                transactions.clone(),
            );
            block.sign(&h.key).unwrap();
            block
        };
        let size = build(MIN_BLOCK_SIZE_FIELD).size() - excess;
        let block = build(size as u32);
        if block.size() == size + excess {
            return block;
        }
    }
    panic!("no header gave a proof of the expected length");
}

#[test]
fn test_oversized_block_without_declaration_is_rejected() {
    let mut h = Harness::new(ChainParams::default());
    let blocks = h.mine(112);
    let txs = fill_mempool(&mut h, &blocks[..12]);
    let tip = h.chain.tip().hash();

    let block = h.block_with(txs, XField::None);
    assert!(block.size() > DEFAULT_MAX_BLOCK_SIZE as usize);

    let rejection = h.chain.submit_block(block).unwrap_err();
    assert_eq!(rejection.code, Some(RejectCode::Invalid));
    assert_eq!(rejection.reason, "bad-blk-length");
    assert_eq!(h.chain.tip().hash(), tip);
}

#[test]
fn test_declared_size_admits_large_block() {
    let mut h = Harness::new(ChainParams::default());
    let blocks = h.mine(112);
    fill_mempool(&mut h, &blocks[..12]);
    assert_eq!(h.mempool.len(), 12);

    let miner = Miner::new(federation_key(), RAISED_SIZE);
    let (block, stats) = miner.mine_block(&mut h.chain, &mut h.mempool).unwrap();

    assert_eq!(block.transactions.len(), 13);
    assert!(stats.size > DEFAULT_MAX_BLOCK_SIZE as usize);
    assert_eq!(block.header.xfield, XField::MaxBlockSize(RAISED_SIZE));
    assert_eq!(h.chain.tip().hash(), block.hash());
    assert!(h.mempool.is_empty());

    // A fresh node replaying the chain accepts it too
    let mut replica = Blockchain::new(ChainParams::default(), 1).unwrap();
    for b in h.chain.blocks_from(1, 200) {
        replica.submit_block(b).unwrap();
    }
    assert_eq!(replica.tip().hash(), block.hash());
}

#[test]
fn test_declaration_covers_only_its_own_block() {
    let mut h = Harness::new(ChainParams::default());
    let blocks = h.mine(112);

    let miner = Miner::new(federation_key(), RAISED_SIZE);
    let (raised, _) = miner.mine_block(&mut h.chain, &mut h.mempool).unwrap();
    assert_eq!(raised.header.xfield, XField::MaxBlockSize(RAISED_SIZE));

    // The next undeclared block is held to the default again
    let txs = fill_mempool(&mut h, &blocks[..12]);
    let block = h.block_with(txs, XField::None);
    assert_eq!(
        h.chain.submit_block(block).unwrap_err().reason,
        "bad-blk-length"
    );
}

#[test]
fn test_block_at_declared_size_is_accepted() {
    let mut h = Harness::new(ChainParams::default());
    let blocks = h.mine(101);
    let tx = fan_out(&h, &blocks[0], 0);
    let tip = h.chain.tip().hash();

    let over = block_declaring(&h, vec![tx.clone()], 1);
    assert_eq!(over.size(), over.declared_max_size().unwrap() as usize + 1);
    assert_eq!(
        h.chain.submit_block(over).unwrap_err().reason,
        "bad-blk-length"
    );
    assert_eq!(h.chain.tip().hash(), tip);

    let exact = block_declaring(&h, vec![tx], 0);
    assert_eq!(exact.size(), exact.declared_max_size().unwrap() as usize);
    let hash = exact.hash();
    h.chain.submit_block(exact).unwrap();
    assert_eq!(h.chain.tip().hash(), hash);
}
