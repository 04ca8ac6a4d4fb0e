#![cfg(any(test, feature = "test"))]

mod backend;
mod edges;
mod ledger;

pub use backend::MockBackend;
pub use edges::mandatory_bisection_height;
pub use ledger::{
    compute_assertion_hash,
    RollupParams,
};

use crate::{
    assertion::Assertion,
    chain::AssertionChain,
    config::ChainConfig,
    primitives::{
        keccak256,
        Address,
        AssertionHash,
        ExecutionState,
        FixedBytes,
        GlobalState,
        MachineStatus,
        B256,
    },
};

use tokio_util::sync::CancellationToken;

use std::sync::Arc;

pub const ROLLUP_ADDRESS: Address = Address::new([0x10; 20]);
pub const BRIDGE_ADDRESS: Address = Address::new([0x11; 20]);
pub const STAKE_TOKEN_ADDRESS: Address = Address::new([0x12; 20]);
pub const CHALLENGE_MANAGER_ADDRESS: Address = Address::new([0x13; 20]);
pub const OSP_ADDRESS: Address = Address::new([0x14; 20]);
pub const SAFE_ADDRESS: Address = Address::new([0x15; 20]);

pub const HONEST_STAKER: Address = Address::new([0xa1; 20]);
pub const EVIL_STAKER: Address = Address::new([0xe1; 20]);

pub const CONFIRM_PERIOD_BLOCKS: u64 = 20;
pub const CHALLENGE_GRACE_PERIOD_BLOCKS: u64 = 5;
pub const CHALLENGE_PERIOD_BLOCKS: u64 = 50;
pub const LAYER_ZERO_BLOCK_EDGE_HEIGHT: u64 = 8;
pub const LAYER_ZERO_BIG_STEP_EDGE_HEIGHT: u64 = 4;
pub const LAYER_ZERO_SMALL_STEP_EDGE_HEIGHT: u64 = 4;
pub const NUM_BIG_STEP_LEVELS: u8 = 1;
pub const INITIAL_INBOX_BATCHES: u64 = 16;

/// Returns a random FixedBytes of length N
pub fn random_bytes<const N: usize>() -> FixedBytes<N> {
    let mut value = [0u8; N];
    for byte in value.iter_mut() {
        *byte = rand::random();
    }
    FixedBytes::new(value)
}

/// Config with intervals short enough for tests.
pub fn test_config() -> ChainConfig {
    ChainConfig {
        parent_chain_block_time_ms: 10,
        receipt_poll_interval_ms: 5,
        retry_interval_ms: 5,
        tx_mined_timeout_secs: 5,
        ..Default::default()
    }
}

/// A post state at `batch` whose hashes are derived from `seed`.
pub fn post_state(batch: u64, seed: u8) -> ExecutionState {
    ExecutionState {
        global_state: GlobalState {
            block_hash: B256::repeat_byte(seed),
            send_root: keccak256([seed]),
            batch,
            pos_in_batch: 0,
        },
        machine_status: MachineStatus::Finished,
        end_history_root: keccak256([seed, seed]),
    }
}

/// History root both sides of a test challenge commit to at `height`. Roots agree up to
/// `agree_until` and diverge after it.
pub fn history_root(side: Address, level: u8, height: u64, agree_until: u64) -> B256 {
    if height <= agree_until {
        keccak256(
            <(alloy_sol_types::sol_data::String, alloy_sol_types::sol_data::Uint<8>, alloy_sol_types::sol_data::Uint<64>) as alloy_sol_types::SolType>::abi_encode(
                &("common", level, height),
            ),
        )
    } else {
        keccak256(
            <(alloy_sol_types::sol_data::Address, alloy_sol_types::sol_data::Uint<8>, alloy_sol_types::sol_data::Uint<64>) as alloy_sol_types::SolType>::abi_encode(
                &(side, level, height),
            ),
        )
    }
}

/// Prefix proof accepted by the mock challenge manager for an edge starting at `start_root`.
pub fn prefix_proof(start_root: B256) -> crate::primitives::Bytes {
    let mut proof = start_root.to_vec();
    proof.extend_from_slice(random_bytes::<32>().as_slice());
    proof.into()
}

pub async fn setup_chain_with_config(
    mock: &Arc<MockBackend>,
    staker: Address,
    config: ChainConfig,
) -> AssertionChain<MockBackend> {
    let chain = AssertionChain::new(
        mock.clone(),
        ROLLUP_ADDRESS,
        CHALLENGE_MANAGER_ADDRESS,
        staker,
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    chain.approve_allowances().await.unwrap();
    chain
}

/// Chain handle for `staker` with allowances approved.
pub async fn setup_chain(mock: &Arc<MockBackend>, staker: Address) -> AssertionChain<MockBackend> {
    setup_chain_with_config(mock, staker, test_config()).await
}

/// Two stakers disagreeing on the first assertion after genesis.
pub struct ForkSetup {
    pub mock: Arc<MockBackend>,
    pub honest: AssertionChain<MockBackend>,
    pub evil: AssertionChain<MockBackend>,
    pub honest_assertion: Assertion<MockBackend>,
    pub evil_assertion: Assertion<MockBackend>,
}

pub async fn setup_fork() -> ForkSetup {
    let mock = Arc::new(MockBackend::new());
    let honest = setup_chain(&mock, HONEST_STAKER).await;
    let evil = setup_chain(&mock, EVIL_STAKER).await;
    let genesis = honest
        .read_assertion_creation_info(AssertionHash::ZERO)
        .await
        .unwrap();
    let honest_assertion = honest
        .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
        .await
        .unwrap();
    let evil_assertion = evil
        .new_stake_on_new_assertion(&genesis, &post_state(1, 0x22))
        .await
        .unwrap();
    ForkSetup {
        mock,
        honest,
        evil,
        honest_assertion,
        evil_assertion,
    }
}
