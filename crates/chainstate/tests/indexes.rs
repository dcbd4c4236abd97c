use std::sync::Arc;

use smartd_chainstate::config::EngineConfig;
use smartd_chainstate::flatfiles::FlatFileStore;
use smartd_chainstate::indexes::{
    address_delta_key, address_unspent_key, spent_index_key, AddressUnspentValue,
    SpentIndexValue, TxLocation, ADDRESS_TYPE_P2PKH,
};
use smartd_chainstate::state::{ChainState, NullMempoolBridge};
use smartd_consensus::money::COIN;
use smartd_consensus::params::{chain_params, Network};
use smartd_consensus::{ChainParams, Hash256};
use smartd_pow::validation::check_proof_of_work;
use smartd_primitives::block::{Block, BlockHeader};
use smartd_primitives::merkle::merkle_root;
use smartd_primitives::outpoint::OutPoint;
use smartd_primitives::transaction::{Transaction, TxIn, TxOut};
use smartd_storage::memory::MemoryStore;
use smartd_storage::{Column, KeyValueStore};

const REGTEST_BITS: u32 = 0x207f_ffff;
const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn coinbase(height: u32, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::null(),
            height.to_le_bytes().to_vec(),
            u32::MAX,
        )],
        vout: outputs,
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
    store: Arc<MemoryStore>,
    params: ChainParams,
    genesis: Hash256,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let mut params = chain_params(Network::Regtest);
    let genesis_block = mine_block(
        &params,
        [0u8; 32],
        1_600_000_000,
        vec![coinbase(0, vec![TxOut::new(0, vec![0x51])])],
    );
    params.hash_genesis_block = genesis_block.header.hash();

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let blocks = FlatFileStore::blocks(dir.path(), MAGIC, 1 << 26).expect("block files");
    let undo = FlatFileStore::undo(dir.path(), MAGIC, 1 << 26).expect("undo files");
    let mut chain = ChainState::new(
        Arc::clone(&store),
        blocks,
        undo,
        params.clone(),
        EngineConfig::all_indexes(),
    )
    .expect("chain state");

    let genesis = genesis_block.header.hash();
    chain
        .process_new_block(&genesis_block, None, true, &mut NullMempoolBridge)
        .expect("genesis accepted");

    Harness {
        chain,
        store,
        params,
        genesis,
        _dir: dir,
    }
}

fn push_block(harness: &mut Harness, prev: Hash256, time: u32, txs: Vec<Transaction>) -> Hash256 {
    let block = mine_block(&harness.params, prev, time, txs);
    let hash = block.header.hash();
    harness
        .chain
        .process_new_block(&block, None, true, &mut NullMempoolBridge)
        .expect("block accepted");
    hash
}

#[test]
fn disconnect_erases_address_rows() {
    let mut harness = harness();
    let genesis = harness.genesis;
    let address_script = p2pkh_script(0x11);

    // A block paying two outputs to the same address.
    let paying = coinbase(
        1,
        vec![
            TxOut::new(3_000 * COIN, address_script.clone()),
            TxOut::new(2_000 * COIN, address_script.clone()),
        ],
    );
    let paying_txid = paying.txid();
    let h1 = push_block(&mut harness, genesis, 1_600_000_100, vec![paying]);

    let unspent_key_0 = address_unspent_key(
        ADDRESS_TYPE_P2PKH,
        &[0x11; 20],
        &OutPoint::new(paying_txid, 0),
    );
    let unspent_key_1 = address_unspent_key(
        ADDRESS_TYPE_P2PKH,
        &[0x11; 20],
        &OutPoint::new(paying_txid, 1),
    );
    let delta_key_0 =
        address_delta_key(ADDRESS_TYPE_P2PKH, &[0x11; 20], 1, 0, &paying_txid, 0, false);

    let row = harness
        .store
        .get(Column::AddressUnspent, &unspent_key_0)
        .expect("store")
        .expect("unspent row written");
    let value = AddressUnspentValue::decode(&row)
        .expect("decodes")
        .expect("live row");
    assert_eq!(value.amount, 3_000 * COIN);
    assert_eq!(value.height, 1);
    assert!(harness
        .store
        .get(Column::AddressIndex, &delta_key_0)
        .expect("store")
        .is_some());

    // Disconnect the block; the rows must clear, with the unspent rows
    // blanked into tombstones rather than deleted.
    harness
        .chain
        .invalidate_block(&h1, &mut NullMempoolBridge)
        .expect("invalidate");
    assert_eq!(harness.chain.tip(), Some(genesis));

    for key in [unspent_key_0, unspent_key_1] {
        let row = harness
            .store
            .get(Column::AddressUnspent, &key)
            .expect("store")
            .expect("tombstone row still present");
        assert!(row.is_empty(), "tombstone rows are empty values");
        assert!(AddressUnspentValue::decode(&row).expect("decodes").is_none());
    }
    assert!(harness
        .store
        .get(Column::AddressIndex, &delta_key_0)
        .expect("store")
        .is_none());
}

#[test]
fn spent_index_tracks_and_untracks_spends() {
    let mut harness = harness();
    let genesis = harness.genesis;
    let address_script = p2pkh_script(0x22);

    let funding = coinbase(1, vec![TxOut::new(5_000 * COIN, vec![0x51])]);
    let funding_txid = funding.txid();
    let h1 = push_block(&mut harness, genesis, 1_600_000_100, vec![funding]);

    let mut prev = h1;
    for height in 2..=101u32 {
        prev = push_block(
            &mut harness,
            prev,
            1_600_000_100 + height * 60,
            vec![coinbase(height, vec![TxOut::new(0, vec![0x51])])],
        );
    }

    let spend = Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::new(funding_txid, 0),
            Vec::new(),
            u32::MAX,
        )],
        vout: vec![TxOut::new(5_000 * COIN, address_script)],
        lock_time: 0,
    };
    let spend_txid = spend.txid();
    let h102 = push_block(
        &mut harness,
        prev,
        1_600_010_000,
        vec![coinbase(102, vec![TxOut::new(0, vec![0x51])]), spend],
    );

    let key = spent_index_key(&OutPoint::new(funding_txid, 0));
    let row = harness
        .store
        .get(Column::SpentIndex, &key)
        .expect("store")
        .expect("spent row written");
    let value = SpentIndexValue::decode(&row).expect("decodes");
    assert_eq!(value.spending_txid, spend_txid);
    assert_eq!(value.input_index, 0);
    assert_eq!(value.height, 102);
    assert_eq!(value.amount, 5_000 * COIN);

    harness
        .chain
        .invalidate_block(&h102, &mut NullMempoolBridge)
        .expect("invalidate");
    assert!(harness
        .store
        .get(Column::SpentIndex, &key)
        .expect("store")
        .is_none());
}

#[test]
fn tx_index_locates_transactions_on_disk() {
    let mut harness = harness();
    let genesis = harness.genesis;

    let cb = coinbase(1, vec![TxOut::new(0, vec![0x51])]);
    let txid = cb.txid();
    push_block(&mut harness, genesis, 1_600_000_100, vec![cb]);

    let row = harness
        .store
        .get(Column::TxIndex, &txid)
        .expect("store")
        .expect("tx index row");
    let location = TxLocation::decode(&row).expect("decodes");
    assert_eq!(location.tx_offset, 0);

    // The referenced block really contains the transaction.
    let hash = harness.chain.tip().expect("tip");
    let block = harness.chain.read_block(&hash).expect("read");
    assert_eq!(block.transactions[location.tx_offset as usize].txid(), txid);
}

#[test]
fn timestamp_index_follows_connect_and_disconnect() {
    let mut harness = harness();
    let genesis = harness.genesis;
    let time = 1_600_000_100u32;
    let h1 = push_block(
        &mut harness,
        genesis,
        time,
        vec![coinbase(1, vec![TxOut::new(0, vec![0x51])])],
    );

    let rows = harness
        .store
        .scan_prefix(Column::TimestampIndex, &time.to_be_bytes())
        .expect("scan");
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0].0[4..], h1.as_slice());

    harness
        .chain
        .invalidate_block(&h1, &mut NullMempoolBridge)
        .expect("invalidate");
    let rows = harness
        .store
        .scan_prefix(Column::TimestampIndex, &time.to_be_bytes())
        .expect("scan");
    assert!(rows.is_empty());
}

#[test]
fn state_survives_restart() {
    let mut params = chain_params(Network::Regtest);
    let genesis_block = mine_block(
        &params,
        [0u8; 32],
        1_600_000_000,
        vec![coinbase(0, vec![TxOut::new(0, vec![0x51])])],
    );
    params.hash_genesis_block = genesis_block.header.hash();

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let cb1 = coinbase(1, vec![TxOut::new(5_000 * COIN, vec![0x51])]);
    let cb1_txid = cb1.txid();
    let tip;
    {
        let blocks = FlatFileStore::blocks(dir.path(), MAGIC, 1 << 26).expect("block files");
        let undo = FlatFileStore::undo(dir.path(), MAGIC, 1 << 26).expect("undo files");
        let mut chain = ChainState::new(
            Arc::clone(&store),
            blocks,
            undo,
            params.clone(),
            EngineConfig::default(),
        )
        .expect("chain state");
        chain
            .process_new_block(&genesis_block, None, true, &mut NullMempoolBridge)
            .expect("genesis");
        let block_1 = mine_block(&params, genesis_block.header.hash(), 1_600_000_100, vec![cb1]);
        tip = block_1.header.hash();
        chain
            .process_new_block(&block_1, None, true, &mut NullMempoolBridge)
            .expect("block 1");
        chain
            .flush(smartd_chainstate::state::FlushMode::Always)
            .expect("flush");
    }

    // A fresh engine over the same store and files resumes at the tip.
    let blocks = FlatFileStore::blocks(dir.path(), MAGIC, 1 << 26).expect("block files");
    let undo = FlatFileStore::undo(dir.path(), MAGIC, 1 << 26).expect("undo files");
    let chain = ChainState::new(store, blocks, undo, params, EngineConfig::default())
        .expect("reloaded chain state");
    assert_eq!(chain.tip(), Some(tip));
    assert_eq!(chain.tip_height(), 1);
    assert_eq!(chain.utxo_best_block(), Some(tip));
    let coin = chain
        .coin(&OutPoint::new(cb1_txid, 0))
        .expect("view")
        .expect("coin persisted");
    assert_eq!(coin.value, 5_000 * COIN);
    chain
        .check_block_index_invariants()
        .expect("invariants hold after reload");
}
