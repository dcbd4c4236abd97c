use std::sync::Arc;

use smartd_chainstate::blockindex::BLOCK_VALID_TRANSACTIONS;
use smartd_chainstate::config::EngineConfig;
use smartd_chainstate::flatfiles::FlatFileStore;
use smartd_chainstate::state::{BlockAccept, ChainState, NullMempoolBridge};
use smartd_consensus::money::COIN;
use smartd_consensus::params::{chain_params, Network};
use smartd_consensus::{ChainParams, Hash256};
use smartd_pow::validation::check_proof_of_work;
use smartd_primitives::block::{Block, BlockHeader};
use smartd_primitives::merkle::merkle_root;
use smartd_primitives::outpoint::OutPoint;
use smartd_primitives::transaction::{Transaction, TxIn, TxOut};
use smartd_storage::memory::MemoryStore;

const REGTEST_BITS: u32 = 0x207f_ffff;
const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

fn coinbase(height: u32, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::null(),
            height.to_le_bytes().to_vec(),
            u32::MAX,
        )],
        vout: vec![TxOut::new(value, script_pubkey)],
        lock_time: 0,
    }
}

fn mine_block(params: &ChainParams, prev: Hash256, time: u32, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid()).collect();
    let (root, _) = merkle_root(&txids);
    let mut header = BlockHeader {
        version: 4,
        prev_block: prev,
        merkle_root: root,
        time,
        bits: REGTEST_BITS,
        nonce: 0,
    };
    while check_proof_of_work(&header, params).is_err() {
        header.nonce += 1;
    }
    Block {
        header,
        transactions: txs,
    }
}

struct Harness {
    chain: ChainState<MemoryStore>,
    params: ChainParams,
    genesis: Hash256,
    _dir: tempfile::TempDir,
}

fn harness(config: EngineConfig) -> Harness {
    let mut params = chain_params(Network::Regtest);
    let genesis_block = mine_block(
        &params,
        [0u8; 32],
        1_600_000_000,
        vec![coinbase(0, 0, vec![0x51])],
    );
    params.hash_genesis_block = genesis_block.header.hash();

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let blocks = FlatFileStore::blocks(dir.path(), MAGIC, 1 << 26).expect("block files");
    let undo = FlatFileStore::undo(dir.path(), MAGIC, 1 << 26).expect("undo files");
    let mut chain =
        ChainState::new(store, blocks, undo, params.clone(), config).expect("chain state");

    let genesis = genesis_block.header.hash();
    let outcome = chain
        .process_new_block(&genesis_block, None, true, &mut NullMempoolBridge)
        .expect("genesis accepted");
    assert_eq!(outcome, BlockAccept::Accepted);
    assert_eq!(chain.tip(), Some(genesis));

    Harness {
        chain,
        params,
        genesis,
        _dir: dir,
    }
}

fn extend_with(
    harness: &mut Harness,
    prev: Hash256,
    time: u32,
    txs: Vec<Transaction>,
) -> Hash256 {
    let block = mine_block(&harness.params, prev, time, txs);
    let hash = block.header.hash();
    let outcome = harness
        .chain
        .process_new_block(&block, None, true, &mut NullMempoolBridge)
        .expect("block accepted");
    assert_eq!(outcome, BlockAccept::Accepted);
    hash
}

#[test]
fn linear_extension_creates_coinbase_coin() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;

    let cb = coinbase(1, 5_000 * COIN, vec![0x51]);
    let cb_txid = cb.txid();
    let h1 = extend_with(&mut harness, genesis, 1_600_000_100, vec![cb]);

    assert_eq!(harness.chain.tip(), Some(h1));
    assert_eq!(harness.chain.tip_height(), 1);
    assert_eq!(harness.chain.utxo_best_block(), Some(h1));

    let coin = harness
        .chain
        .coin(&OutPoint::new(cb_txid, 0))
        .expect("view readable")
        .expect("coinbase coin exists");
    assert_eq!(coin.value, 5_000 * COIN);
    assert_eq!(coin.height, 1);
    assert!(coin.is_coinbase);
}

#[test]
fn heavier_fork_wins_and_loser_stays_indexed() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;

    let h1 = extend_with(
        &mut harness,
        genesis,
        1_600_000_100,
        vec![coinbase(1, 5_000 * COIN, vec![0x51])],
    );

    // Two competitors at height 2; the first arrival holds the tip.
    let block_2a = mine_block(
        &harness.params,
        h1,
        1_600_000_200,
        vec![coinbase(2, 5_000 * COIN, vec![0x51])],
    );
    let h2a = block_2a.header.hash();
    harness
        .chain
        .process_new_block(&block_2a, None, true, &mut NullMempoolBridge)
        .expect("2a accepted");

    let block_2b = mine_block(
        &harness.params,
        h1,
        1_600_000_201,
        vec![coinbase(2, 5_000 * COIN, vec![0x52, 0x75, 0x51])],
    );
    let h2b = block_2b.header.hash();
    harness
        .chain
        .process_new_block(&block_2b, None, true, &mut NullMempoolBridge)
        .expect("2b accepted");
    assert_eq!(harness.chain.tip(), Some(h2a), "first arrival keeps the tip");

    // A child of the later fork tips the scale.
    let h3b = extend_with(
        &mut harness,
        h2b,
        1_600_000_300,
        vec![coinbase(3, 5_000 * COIN, vec![0x51])],
    );

    assert_eq!(harness.chain.tip(), Some(h3b));
    assert_eq!(harness.chain.utxo_best_block(), Some(h3b));
    assert!(harness.chain.index().in_active_chain(&h2b));
    assert!(!harness.chain.index().in_active_chain(&h2a));

    // The losing block stays in the index, body intact, not failed.
    let loser = harness.chain.index().get(&h2a).expect("still indexed");
    assert!(loser.is_valid(BLOCK_VALID_TRANSACTIONS));
    assert!(loser.has_data());

    harness
        .chain
        .check_block_index_invariants()
        .expect("invariants hold after reorg");
}

#[test]
fn activation_is_idempotent_without_new_input() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;
    let h1 = extend_with(
        &mut harness,
        genesis,
        1_600_000_100,
        vec![coinbase(1, 5_000 * COIN, vec![0x51])],
    );

    harness
        .chain
        .activate_best_chain(&mut NullMempoolBridge, None)
        .expect("first run");
    assert_eq!(harness.chain.tip(), Some(h1));
    harness
        .chain
        .activate_best_chain(&mut NullMempoolBridge, None)
        .expect("second run is a no-op");
    assert_eq!(harness.chain.tip(), Some(h1));
    assert_eq!(harness.chain.utxo_best_block(), Some(h1));
}

#[test]
fn header_acceptance_is_idempotent() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;
    let block = mine_block(
        &harness.params,
        genesis,
        1_600_000_100,
        vec![coinbase(1, 0, vec![0x51])],
    );
    let first = harness
        .chain
        .accept_header(&block.header)
        .expect("accepted");
    let entry_before = harness.chain.index().get(&first).expect("entry").clone();
    let second = harness
        .chain
        .accept_header(&block.header)
        .expect("re-accepted");
    assert_eq!(first, second);
    let entry_after = harness.chain.index().get(&first).expect("entry");
    assert_eq!(entry_before.sequence_id, entry_after.sequence_id);
    assert_eq!(entry_before.status, entry_after.status);
}

#[test]
fn connect_then_disconnect_restores_coins() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;

    // Fund a spendable output.
    let funding_cb = coinbase(1, 5_000 * COIN, vec![0x51]);
    let funding_txid = funding_cb.txid();
    let h1 = extend_with(&mut harness, genesis, 1_600_000_100, vec![funding_cb]);

    // Mature it.
    let mut prev = h1;
    for height in 2..=101u32 {
        prev = extend_with(
            &mut harness,
            prev,
            1_600_000_100 + height * 60,
            vec![coinbase(height, 0, vec![0x51])],
        );
    }

    let spend = Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::new(funding_txid, 0),
            Vec::new(),
            u32::MAX,
        )],
        vout: vec![TxOut::new(4_999 * COIN, vec![0x51])],
        lock_time: 0,
    };
    let spend_txid = spend.txid();
    let fee = COIN;
    let h102 = extend_with(
        &mut harness,
        prev,
        1_600_010_000,
        vec![coinbase(102, fee, vec![0x51]), spend],
    );

    assert!(harness
        .chain
        .coin(&OutPoint::new(funding_txid, 0))
        .expect("view")
        .is_none());
    assert!(harness
        .chain
        .coin(&OutPoint::new(spend_txid, 0))
        .expect("view")
        .is_some());

    // Invalidate the spending block; its effects must fully unwind.
    harness
        .chain
        .invalidate_block(&h102, &mut NullMempoolBridge)
        .expect("invalidate");

    assert_eq!(harness.chain.tip(), Some(prev));
    let restored = harness
        .chain
        .coin(&OutPoint::new(funding_txid, 0))
        .expect("view")
        .expect("funding coin restored");
    assert_eq!(restored.value, 5_000 * COIN);
    assert_eq!(restored.height, 1);
    assert!(restored.is_coinbase);
    assert!(harness
        .chain
        .coin(&OutPoint::new(spend_txid, 0))
        .expect("view")
        .is_none());

    // Reconsidering reconnects the identical block.
    harness
        .chain
        .reconsider_block(&h102, &mut NullMempoolBridge)
        .expect("reconsider");
    assert_eq!(harness.chain.tip(), Some(h102));
    assert!(harness
        .chain
        .coin(&OutPoint::new(spend_txid, 0))
        .expect("view")
        .is_some());
}

#[test]
fn premature_coinbase_spend_rejected_in_block() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;

    let funding_cb = coinbase(1, 5_000 * COIN, vec![0x51]);
    let funding_txid = funding_cb.txid();
    let h1 = extend_with(&mut harness, genesis, 1_600_000_100, vec![funding_cb]);

    // 99 more blocks leave the coinbase one confirmation short at the
    // next height.
    let mut prev = h1;
    for height in 2..=99u32 {
        prev = extend_with(
            &mut harness,
            prev,
            1_600_000_100 + height * 60,
            vec![coinbase(height, 0, vec![0x51])],
        );
    }

    let spend = Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::new(funding_txid, 0),
            Vec::new(),
            u32::MAX,
        )],
        vout: vec![TxOut::new(5_000 * COIN, vec![0x51])],
        lock_time: 0,
    };
    let early = mine_block(
        &harness.params,
        prev,
        1_600_020_000,
        vec![coinbase(100, 0, vec![0x51]), spend.clone()],
    );
    let err = harness
        .chain
        .process_new_block(&early, None, true, &mut NullMempoolBridge)
        .expect_err("depth 99 is premature");
    assert_eq!(err.reject_reason, "bad-txns-premature-spend-of-coinbase");

    // One block later the spend is exactly mature.
    let filler = extend_with(
        &mut harness,
        prev,
        1_600_020_100,
        vec![coinbase(100, 0, vec![0x51, 0x51])],
    );
    let h101 = extend_with(
        &mut harness,
        filler,
        1_600_020_200,
        vec![coinbase(101, 0, vec![0x51]), spend],
    );
    assert_eq!(harness.chain.tip(), Some(h101));
}

#[test]
fn oversized_reward_rejected() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;
    let greedy = mine_block(
        &harness.params,
        genesis,
        1_600_000_100,
        vec![coinbase(1, 5_001 * COIN, vec![0x51])],
    );
    let err = harness
        .chain
        .process_new_block(&greedy, None, true, &mut NullMempoolBridge)
        .expect_err("reward above subsidy");
    assert_eq!(err.reject_reason, "bad-cb-amount");

    // The header stays indexed but the block is marked failed; a valid
    // sibling still activates.
    let hash = greedy.header.hash();
    assert!(harness.chain.index().get(&hash).expect("indexed").is_failed());
    let ok = extend_with(
        &mut harness,
        genesis,
        1_600_000_101,
        vec![coinbase(1, 5_000 * COIN, vec![0x51])],
    );
    assert_eq!(harness.chain.tip(), Some(ok));
}

#[test]
fn orphan_body_promoted_when_parent_arrives() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;

    let parent = mine_block(
        &harness.params,
        genesis,
        1_600_000_100,
        vec![coinbase(1, 0, vec![0x51])],
    );
    let child = mine_block(
        &harness.params,
        parent.header.hash(),
        1_600_000_200,
        vec![coinbase(2, 0, vec![0x51])],
    );

    let outcome = harness
        .chain
        .process_new_block(&child, None, true, &mut NullMempoolBridge)
        .expect("parked");
    assert_eq!(outcome, BlockAccept::Orphaned);
    assert_eq!(harness.chain.tip_height(), 0);

    harness
        .chain
        .process_new_block(&parent, None, true, &mut NullMempoolBridge)
        .expect("parent accepted");
    // The parked child followed its parent in.
    assert_eq!(harness.chain.tip(), Some(child.header.hash()));
    assert_eq!(harness.chain.tip_height(), 2);
}

#[test]
fn wrong_difficulty_bits_rejected() {
    let mut harness = harness(EngineConfig::default());
    let genesis = harness.genesis;
    // A valid proof of work against bits retargeting never asked for.
    let mut header = BlockHeader {
        version: 4,
        prev_block: genesis,
        merkle_root: [0u8; 32],
        time: 1_600_000_100,
        bits: 0x2007_ffff,
        nonce: 0,
    };
    while check_proof_of_work(&header, &harness.params).is_err() {
        header.nonce += 1;
    }
    let err = harness
        .chain
        .accept_header(&header)
        .expect_err("bits must match the retarget function");
    assert_eq!(err.reject_reason, "bad-diffbits");
}
