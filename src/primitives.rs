pub use alloy_primitives::{
    address,
    b256,
    keccak256,
    Address,
    Bytes,
    FixedBytes,
    TxHash,
    B256,
    U256,
};

use crate::bindings::{
    AssertionState,
    ConfigData,
    ExecutionStateData,
    GlobalState as SolGlobalState,
};

use serde::{
    Deserialize,
    Serialize,
};

use std::fmt;

/// Declares a 32 byte identifier wrapping a [`B256`].
macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub B256);

        impl $name {
            pub const ZERO: Self = Self(B256::ZERO);

            pub fn is_zero(&self) -> bool {
                self.0 == B256::ZERO
            }
        }

        impl From<B256> for $name {
            fn from(hash: B256) -> Self {
                Self(hash)
            }
        }

        impl From<$name> for B256 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

hash_newtype!(
    /// Unique identifier of an assertion, the keccak256 hash of its parent hash, post state and
    /// inbox accumulator.
    AssertionHash
);
hash_newtype!(
    /// Unique identifier of an edge, covering its level, origin, and start/end commitments.
    EdgeId
);
hash_newtype!(
    /// Identifier shared by all rival edges: level, origin, start commitment and end height.
    MutualId
);
hash_newtype!(
    /// Id of the item that originated the challenge an edge belongs to. For block challenges it
    /// is the parent assertion hash; for subchallenges it is the mutual id of the one step fork
    /// source one level up.
    OriginId
);
hash_newtype!(
    /// The assertion (block level) or the higher level edge (subchallenges) a level zero edge
    /// claims.
    ClaimId
);

/// Height of a history commitment. Heights are 0-indexed.
pub type Height = u64;

/// Status of an assertion as recorded by the rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssertionStatus {
    NoAssertion,
    Pending,
    Confirmed,
}

impl AssertionStatus {
    pub fn from_u8(status: u8) -> Option<Self> {
        match status {
            0 => Some(Self::NoAssertion),
            1 => Some(Self::Pending),
            2 => Some(Self::Confirmed),
            _ => None,
        }
    }
}

impl fmt::Display for AssertionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAssertion => write!(f, "no_assertion"),
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Status of a challenge edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeStatus {
    Pending,
    Confirmed,
}

impl EdgeStatus {
    pub fn from_u8(status: u8) -> Option<Self> {
        match status {
            0 => Some(Self::Pending),
            1 => Some(Self::Confirmed),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Challenge level of an edge. 0 is the block challenge, the last level is the small step
/// challenge and everything in between is a big step level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChallengeLevel(pub u8);

impl ChallengeLevel {
    pub const BLOCK: Self = Self(0);

    pub fn is_block_challenge_level(&self) -> bool {
        self.0 == 0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ChallengeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "block_challenge_edge")
        } else {
            write!(f, "challenge_level_{}_edge", self.0)
        }
    }
}

/// Heights of the block challenge edges that originated the subchallenge an edge is part of,
/// ordered from the block level downwards.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginHeights {
    pub challenge_origin_heights: Vec<Height>,
}

/// Layer zero edge heights configured in the challenge manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LayerZeroHeights {
    pub block_challenge_height: Height,
    pub big_step_challenge_height: Height,
    pub small_step_challenge_height: Height,
}

/// A history commitment as produced by the state provider.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct History {
    pub height: Height,
    pub merkle: B256,
    pub first_leaf: B256,
    pub last_leaf: B256,
    pub last_leaf_proof: Vec<B256>,
}

/// Data needed to confirm an edge by one step proof.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OneStepData {
    pub before_hash: B256,
    pub after_hash: B256,
    pub proof: Bytes,
}

/// Status of the machine at the end of an assertion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineStatus {
    #[default]
    Running,
    Finished,
    Errored,
}

impl MachineStatus {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Finished => 1,
            Self::Errored => 2,
        }
    }

    pub fn from_u8(status: u8) -> Self {
        match status {
            1 => Self::Finished,
            2 => Self::Errored,
            _ => Self::Running,
        }
    }
}

/// Global state of the layer 2 chain after executing some inbox messages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalState {
    pub block_hash: B256,
    pub send_root: B256,
    pub batch: u64,
    pub pos_in_batch: u64,
}

impl From<&SolGlobalState> for GlobalState {
    fn from(state: &SolGlobalState) -> Self {
        Self {
            block_hash: state.bytes32Vals[0],
            send_root: state.bytes32Vals[1],
            batch: state.u64Vals[0],
            pos_in_batch: state.u64Vals[1],
        }
    }
}

impl From<&GlobalState> for SolGlobalState {
    fn from(state: &GlobalState) -> Self {
        Self {
            bytes32Vals: [state.block_hash, state.send_root],
            u64Vals: [state.batch, state.pos_in_batch],
        }
    }
}

/// A proposed post-state for an assertion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionState {
    pub global_state: GlobalState,
    pub machine_status: MachineStatus,
    pub end_history_root: B256,
}

impl ExecutionState {
    pub fn to_sol(&self) -> AssertionState {
        AssertionState {
            globalState: (&self.global_state).into(),
            machineStatus: self.machine_status.as_u8(),
            endHistoryRoot: self.end_history_root,
        }
    }
}

impl From<&AssertionState> for ExecutionState {
    fn from(state: &AssertionState) -> Self {
        Self {
            global_state: (&state.globalState).into(),
            machine_status: MachineStatus::from_u8(state.machineStatus),
            end_history_root: state.endHistoryRoot,
        }
    }
}

/// Information about an assertion reconstructed from its creation event.
///
/// The config fields (`wasm_module_root`, `confirm_period_blocks`, `required_stake`,
/// `challenge_manager`, `inbox_max_count`) are the values recorded when the assertion was
/// created. Children of this assertion are created and confirmed under them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionCreatedInfo {
    pub confirm_period_blocks: u64,
    pub required_stake: U256,
    pub parent_assertion_hash: AssertionHash,
    pub before_state: AssertionState,
    pub after_state: AssertionState,
    pub inbox_max_count: U256,
    pub after_inbox_batch_acc: B256,
    pub assertion_hash: AssertionHash,
    pub wasm_module_root: B256,
    pub challenge_manager: Address,
    pub transaction_hash: TxHash,
    pub creation_parent_block: u64,
    pub creation_l1_block: u64,
}

impl AssertionCreatedInfo {
    /// Config under which the children of this assertion are created and confirmed.
    pub fn config_data(&self, next_inbox_position: u64) -> ConfigData {
        ConfigData {
            wasmModuleRoot: self.wasm_module_root,
            requiredStake: self.required_stake,
            challengeManager: self.challenge_manager,
            confirmPeriodBlocks: self.confirm_period_blocks,
            nextInboxPosition: next_inbox_position,
        }
    }

    /// State data of this assertion as consumed by the challenge manager.
    pub fn execution_state_data(&self) -> ExecutionStateData {
        ExecutionStateData {
            executionState: self.after_state.clone(),
            prevAssertionHash: self.parent_assertion_hash.0,
            inboxAcc: self.after_inbox_batch_acc,
        }
    }
}
