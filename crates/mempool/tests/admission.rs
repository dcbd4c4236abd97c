use std::sync::Arc;

use smartd_chainstate::config::EngineConfig;
use smartd_chainstate::flatfiles::FlatFileStore;
use smartd_chainstate::state::{ChainState, NullMempoolBridge};
use smartd_consensus::money::COIN;
use smartd_consensus::params::{chain_params, Network};
use smartd_consensus::{ChainParams, Hash256};
use smartd_mempool::{accept_to_memory_pool, AcceptOptions, Mempool, MempoolErrorKind};
use smartd_pow::validation::check_proof_of_work;
use smartd_primitives::block::{Block, BlockHeader};
use smartd_primitives::merkle::merkle_root;
use smartd_primitives::outpoint::OutPoint;
use smartd_primitives::transaction::{Transaction, TxIn, TxOut};
use smartd_storage::memory::MemoryStore;

const REGTEST_BITS: u32 = 0x207f_ffff;
const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

fn coinbase(height: u32, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::null(),
            height.to_le_bytes().to_vec(),
            u32::MAX,
        )],
        vout: vec![TxOut::new(value, vec![0x51])],
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
    pool: Mempool,
    params: ChainParams,
    /// A mature non-coinbase coin worth 4_000 * COIN.
    funded: OutPoint,
    funded_height: i32,
    _dir: tempfile::TempDir,
}

/// Builds a chain with a matured coinbase spent into a regular coin at
/// height 102.
fn harness() -> Harness {
    let mut params = chain_params(Network::Regtest);
    let genesis_block = mine_block(&params, [0u8; 32], 1_600_000_000, vec![coinbase(0, 0)]);
    params.hash_genesis_block = genesis_block.header.hash();

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let blocks = FlatFileStore::blocks(dir.path(), MAGIC, 1 << 26).expect("block files");
    let undo = FlatFileStore::undo(dir.path(), MAGIC, 1 << 26).expect("undo files");
    let config = EngineConfig {
        require_standard: false,
        ..EngineConfig::default()
    };
    let mut chain =
        ChainState::new(store, blocks, undo, params.clone(), config).expect("chain state");
    chain
        .process_new_block(&genesis_block, None, true, &mut NullMempoolBridge)
        .expect("genesis");

    let funding_cb = coinbase(1, 5_000 * COIN);
    let funding_txid = funding_cb.txid();
    let mut prev = genesis_block.header.hash();
    let block_1 = mine_block(&params, prev, 1_600_000_100, vec![funding_cb]);
    prev = block_1.header.hash();
    chain
        .process_new_block(&block_1, None, true, &mut NullMempoolBridge)
        .expect("block 1");

    for height in 2..=101u32 {
        let block = mine_block(
            &params,
            prev,
            1_600_000_100 + height * 60,
            vec![coinbase(height, 0)],
        );
        prev = block.header.hash();
        chain
            .process_new_block(&block, None, true, &mut NullMempoolBridge)
            .expect("filler block");
    }

    // Convert the matured coinbase into an ordinary coin.
    let fund = Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::new(funding_txid, 0),
            Vec::new(),
            u32::MAX,
        )],
        vout: vec![TxOut::new(4_000 * COIN, vec![0x51])],
        lock_time: 0,
    };
    let fund_txid = fund.txid();
    let block_102 = mine_block(
        &params,
        prev,
        1_600_010_000,
        vec![coinbase(102, 0), fund],
    );
    chain
        .process_new_block(&block_102, None, true, &mut NullMempoolBridge)
        .expect("funding block");
    assert_eq!(chain.tip_height(), 102);

    let pool = Mempool::new(1 << 22, 72);
    Harness {
        chain,
        pool,
        params,
        funded: OutPoint::new(fund_txid, 0),
        funded_height: 102,
        _dir: dir,
    }
}

fn extend_chain(harness: &mut Harness, count: u32) {
    let mut prev = harness.chain.tip().expect("tip");
    let start = harness.chain.tip_height() as u32;
    for offset in 1..=count {
        let height = start + offset;
        let block = mine_block(
            &harness.params,
            prev,
            1_600_010_000 + height * 60,
            vec![coinbase(height, 0)],
        );
        prev = block.header.hash();
        harness
            .chain
            .process_new_block(&block, None, true, &mut harness.pool)
            .expect("extension block");
    }
}

fn spend(prev: OutPoint, value: i64, sequence: u32, version: i32) -> Transaction {
    Transaction {
        version,
        vin: vec![TxIn::new(prev, Vec::new(), sequence)],
        vout: vec![TxOut::new(value, vec![0x51])],
        lock_time: 0,
    }
}

#[test]
fn coinbase_never_enters_the_pool() {
    let mut harness = harness();
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        coinbase(200, 0),
        AcceptOptions::default(),
    )
    .expect_err("coinbase refused");
    assert_eq!(err.kind, MempoolErrorKind::InvalidTransaction);
}

#[test]
fn admission_and_child_ordering() {
    let mut harness = harness();
    let parent = spend(harness.funded.clone(), 4_000 * COIN - 1_000, u32::MAX, 1);
    let parent_txid = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        parent,
        AcceptOptions::default(),
    )
    .expect("parent admitted");

    let child = spend(
        OutPoint::new(parent_txid, 0),
        4_000 * COIN - 2_000,
        u32::MAX,
        1,
    );
    let child_txid = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        child,
        AcceptOptions::default(),
    )
    .expect("child admitted against in-pool parent");

    let entry = harness.pool.get(&child_txid).expect("child entry");
    assert_eq!(entry.parents, vec![parent_txid]);
    let descendants = harness.pool.descendants_of(&parent_txid);
    assert!(descendants.contains(&child_txid));
    assert!(!harness.pool.get(&parent_txid).expect("parent").spends_coinbase);
}

#[test]
fn missing_inputs_reported() {
    let mut harness = harness();
    let orphan = spend(OutPoint::new([0xab; 32], 0), 1_000, u32::MAX, 1);
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        orphan,
        AcceptOptions::default(),
    )
    .expect_err("unknown input");
    assert_eq!(err.kind, MempoolErrorKind::MissingInputs);
}

#[test]
fn premature_coinbase_spend_refused() {
    let mut harness = harness();
    // The height-102 coinbase pays nothing, so mine one more block with a
    // real coinbase and try to spend it immediately.
    let young_cb = coinbase(103, 5_000 * COIN);
    let young_txid = young_cb.txid();
    let prev = harness.chain.tip().expect("tip");
    let block = mine_block(&harness.params, prev, 1_600_020_000, vec![young_cb]);
    harness
        .chain
        .process_new_block(&block, None, true, &mut NullMempoolBridge)
        .expect("block 103");

    let early = spend(OutPoint::new(young_txid, 0), 4_999 * COIN, u32::MAX, 1);
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        early,
        AcceptOptions::default(),
    )
    .expect_err("immature coinbase");
    assert_eq!(err.reason, "bad-txns-premature-spend-of-coinbase");
}

#[test]
fn opt_out_conflict_is_final() {
    let mut harness = harness();
    let t1 = spend(harness.funded.clone(), 4_000 * COIN - 1_000, u32::MAX, 1);
    accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        t1,
        AcceptOptions::default(),
    )
    .expect("first spend admitted");

    let t2 = spend(harness.funded.clone(), 4_000 * COIN - 2_000, u32::MAX, 1);
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        t2,
        AcceptOptions::default(),
    )
    .expect_err("opt-out conflict");
    assert_eq!(err.kind, MempoolErrorKind::Conflict);
    assert_eq!(err.reason, "txn-mempool-conflict");
}

#[test]
fn opt_in_replacement_requires_better_fees() {
    let mut harness = harness();
    // T1 signals replaceability.
    let t1 = spend(harness.funded.clone(), 4_000 * COIN - 1_000, 0xffff_fffd, 1);
    let t1_txid = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        t1,
        AcceptOptions::default(),
    )
    .expect("replaceable spend admitted");

    // A replacement that does not beat the old fees is refused.
    let weak = spend(harness.funded.clone(), 4_000 * COIN - 900, u32::MAX, 1);
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        weak,
        AcceptOptions::default(),
    )
    .expect_err("lower fee rate");
    assert_eq!(err.kind, MempoolErrorKind::InsufficientFee);
    assert!(harness.pool.contains(&t1_txid));

    // Strictly better fee rate and absolute fee replaces T1.
    let strong = spend(harness.funded.clone(), 4_000 * COIN - 2_000, u32::MAX, 1);
    let strong_txid = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        strong,
        AcceptOptions::default(),
    )
    .expect("replacement admitted");
    assert!(!harness.pool.contains(&t1_txid));
    assert!(harness.pool.contains(&strong_txid));
}

#[test]
fn replacement_may_not_spend_replaced_outputs() {
    let mut harness = harness();
    let t1 = spend(harness.funded.clone(), 4_000 * COIN - 1_000, 0xffff_fffd, 1);
    let t1_txid = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        t1,
        AcceptOptions::default(),
    )
    .expect("replaceable spend admitted");

    // Spends both the conflicted outpoint and T1's own output.
    let crossing = Transaction {
        version: 1,
        vin: vec![
            TxIn::new(harness.funded.clone(), Vec::new(), u32::MAX),
            TxIn::new(OutPoint::new(t1_txid, 0), Vec::new(), u32::MAX),
        ],
        vout: vec![TxOut::new(8_000 * COIN - 6_000, vec![0x51])],
        lock_time: 0,
    };
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        crossing,
        AcceptOptions::default(),
    )
    .expect_err("self-referential replacement");
    assert_eq!(err.kind, MempoolErrorKind::Conflict);
}

#[test]
fn sequence_locks_gate_admission() {
    let mut harness = harness();
    // Version-2 spend with a 10-block relative lock on a coin confirmed
    // at height 102.
    let locked = spend(harness.funded.clone(), 4_000 * COIN - 1_000, 10, 2);
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        locked.clone(),
        AcceptOptions::default(),
    )
    .expect_err("lock not yet satisfied");
    assert_eq!(err.reason, "non-BIP68-final");

    // Eight more blocks still leave the next block one short.
    extend_chain(&mut harness, 8);
    assert_eq!(harness.chain.tip_height(), 110);
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        locked.clone(),
        AcceptOptions::default(),
    )
    .expect_err("still one block short");
    assert_eq!(err.reason, "non-BIP68-final");

    // At tip 111 the next block is 112 > 102 + 10 - 1.
    extend_chain(&mut harness, 1);
    assert_eq!(harness.chain.tip_height(), harness.funded_height + 9);
    accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        locked,
        AcceptOptions::default(),
    )
    .expect("lock satisfied");
}

#[test]
fn absurd_fee_guard() {
    let mut harness = harness();
    // Fee of 4000 COIN dwarfs any plausible relay cost.
    let burn = spend(harness.funded.clone(), 1, u32::MAX, 1);
    let err = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        burn.clone(),
        AcceptOptions::default(),
    )
    .expect_err("absurd fee");
    assert_eq!(err.kind, MempoolErrorKind::AbsurdFee);

    let txid = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        burn,
        AcceptOptions {
            allow_absurd_fee: true,
            ..AcceptOptions::default()
        },
    )
    .expect("explicit override");
    assert!(harness.pool.contains(&txid));
}

#[test]
fn included_transactions_leave_the_pool() {
    let mut harness = harness();
    let tx = spend(harness.funded.clone(), 4_000 * COIN - 1_000, u32::MAX, 1);
    let txid = accept_to_memory_pool(
        &mut harness.chain,
        &mut harness.pool,
        tx.clone(),
        AcceptOptions::default(),
    )
    .expect("admitted");
    assert!(harness.pool.contains(&txid));

    let prev = harness.chain.tip().expect("tip");
    let height = harness.chain.tip_height() as u32 + 1;
    let block = mine_block(
        &harness.params,
        prev,
        1_600_030_000,
        vec![coinbase(height, 0), tx],
    );
    harness
        .chain
        .process_new_block(&block, None, true, &mut harness.pool)
        .expect("block with pool tx");
    assert!(!harness.pool.contains(&txid));
}
