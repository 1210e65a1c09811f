//! Shared fixtures for the integration scenarios

#![allow(dead_code)]

use admission_node::config::{ChainParams, PolicyConfig, REGTEST_FEDERATION_SECRET};
use admission_node::core::block::{XField, DEFAULT_MAX_BLOCK_SIZE};
use admission_node::core::script::{Script, ScriptBuilder};
use admission_node::core::transaction::{sign_p2pkh, OutPoint, TransactionBuilder};
use admission_node::core::{Block, Blockchain, Transaction};
use admission_node::crypto::KeyPair;
use admission_node::mining::{Mempool, Miner};

pub fn federation_key() -> KeyPair {
    KeyPair::from_private_key_hex(REGTEST_FEDERATION_SECRET).unwrap()
}

/// A chain, its mempool and a miner signing with the federation key
pub struct Harness {
    pub chain: Blockchain,
    pub mempool: Mempool,
    pub miner: Miner,
    pub key: KeyPair,
}

impl Harness {
    pub fn new(params: ChainParams) -> Self {
        Self::with_block_max_size(params, DEFAULT_MAX_BLOCK_SIZE)
    }

    pub fn with_block_max_size(params: ChainParams, block_max_size: u32) -> Self {
        let chain = Blockchain::new(params.clone(), 1).unwrap();
        let mempool = Mempool::new(PolicyConfig::default(), &params);
        Self {
            chain,
            mempool,
            miner: Miner::new(federation_key(), block_max_size),
            key: federation_key(),
        }
    }

    pub fn mine(&mut self, count: usize) -> Vec<Block> {
        self.miner
            .mine_blocks(&mut self.chain, &mut self.mempool, count)
            .unwrap()
    }

    pub fn payout(&self) -> Script {
        self.miner.payout().clone()
    }

    /// Spend the coinbase of `block` into one output of `value`
    pub fn spend_coinbase(&self, block: &Block, value: i64) -> Transaction {
        spend_coinbase_to(&self.key, block, vec![(value, self.payout())])
    }

    /// A signed block on the tip with `txs` after a fresh coinbase
    pub fn block_with(&self, txs: Vec<Transaction>, xfield: XField) -> Block {
        let height = self.chain.next_height();
        let coinbase = Transaction::new_coinbase(
            height,
            self.payout(),
            self.chain.params().block_reward,
        );
        let mut transactions = vec![coinbase];
        transactions.extend(txs);

        let now = chrono::Utc::now().timestamp();
        let time = now.max(self.chain.median_time_past() + 1) as u32;
        let mut block = Block::new(self.chain.tip().hash(), time, xfield, transactions);
        block.sign(&self.key).unwrap();
        block
    }
}

/// Spend output 0 of `block`'s coinbase, paid to `key`'s P2PKH script
pub fn spend_coinbase_to(key: &KeyPair, block: &Block, outputs: Vec<(i64, Script)>) -> Transaction {
    let prevout = OutPoint::new(block.transactions[0].txid(), 0);
    let mut builder = TransactionBuilder::new().add_input(prevout);
    for (value, script) in outputs {
        builder = builder.add_output(value, script);
    }
    let mut tx = builder.build();
    let prev_script = Script::new_p2pkh(&key.pubkey_hash());
    sign_p2pkh(&mut tx, 0, &prev_script, key).unwrap();
    tx
}

/// Pad the signature in input 0 after its S value, keeping the hash type
/// byte last. Lax parsing still accepts it; strict DER does not.
pub fn un_derify(tx: &mut Transaction) {
    let pushes: Vec<Vec<u8>> = tx.inputs[0]
        .script_sig
        .instructions()
        .map(|ins| ins.unwrap().data.unwrap().to_vec())
        .collect();

    let mut builder = ScriptBuilder::new();
    for (index, push) in pushes.iter().enumerate() {
        if index == 0 {
            let (body, hash_type) = push.split_at(push.len() - 1);
            let mut padded = body.to_vec();
            padded.push(0x00);
            padded.extend_from_slice(hash_type);
            builder = builder.push_slice(&padded);
        } else {
            builder = builder.push_slice(push);
        }
    }
    tx.inputs[0].script_sig = builder.into_script();
}
