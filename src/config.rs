use crate::primitives::Address;

use alloy_rpc_types::{
    BlockId,
    BlockNumberOrTag,
};
use clap::{
    ArgAction,
    Parser,
    ValueEnum,
};
use serde::{
    Deserialize,
    Serialize,
};

use std::time::Duration;

/// Block used as the head of the chain for reads and for deciding when a transaction is final.
#[derive(ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadBlockPolicy {
    #[default]
    Latest,
    Safe,
    Finalized,
}

impl HeadBlockPolicy {
    pub fn block_tag(&self) -> BlockNumberOrTag {
        match self {
            Self::Latest => BlockNumberOrTag::Latest,
            Self::Safe => BlockNumberOrTag::Safe,
            Self::Finalized => BlockNumberOrTag::Finalized,
        }
    }

    pub fn block_id(&self) -> BlockId {
        BlockId::Number(self.block_tag())
    }
}

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(author, version, about, long_about = None)]
pub struct ChainConfig {
    /// Address receiving withdrawn stake. Defaults to the staker.
    #[arg(long)]
    pub withdrawal_address: Option<Address>,
    /// Wrap native currency into the stake token when the staker lacks funds to stake.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub auto_deposit: bool,
    /// Fast confirm assertions, directly or through the rollup's fast confirmer multisig.
    #[arg(long, default_value_t = false)]
    pub enable_fast_confirmation: bool,
    /// Block considered the head of the parent chain.
    #[arg(long, value_enum, default_value_t = HeadBlockPolicy::Latest)]
    pub rpc_head_block: HeadBlockPolicy,
    /// Average parent chain block time in milliseconds, defaults to 12s.
    #[arg(long, default_value_t = 12_000)]
    pub parent_chain_block_time_ms: u64,
    /// Gas added on top of every estimate.
    #[arg(long, default_value_t = 500_000)]
    pub gas_buffer: u64,
    /// Interval between receipt and head polls in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    pub receipt_poll_interval_ms: u64,
    /// Time to wait for a submitted transaction to be mined, in seconds.
    #[arg(long, default_value_t = 60)]
    pub tx_mined_timeout_secs: u64,
    /// Number of completed challenges remembered by parent assertion hash.
    #[arg(long, default_value_t = 1_000)]
    pub confirmed_challenge_cache_size: u64,
    /// Number of transactions that may wait on the submission gate.
    #[arg(long, default_value_t = 1_000)]
    pub tx_queue_capacity: usize,
    /// Delay between retries of transient rpc failures, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    pub retry_interval_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            withdrawal_address: None,
            auto_deposit: true,
            enable_fast_confirmation: false,
            rpc_head_block: HeadBlockPolicy::Latest,
            parent_chain_block_time_ms: 12_000,
            gas_buffer: 500_000,
            receipt_poll_interval_ms: 1_000,
            tx_mined_timeout_secs: 60,
            confirmed_challenge_cache_size: 1_000,
            tx_queue_capacity: 1_000,
            retry_interval_ms: 1_000,
        }
    }
}

impl ChainConfig {
    pub fn parent_chain_block_time(&self) -> Duration {
        Duration::from_millis(self.parent_chain_block_time_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn tx_mined_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_mined_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli() {
        let parsed = ChainConfig::parse_from(["assertion-chain"]);
        assert_eq!(parsed, ChainConfig::default());
    }

    #[test]
    fn test_parse_overrides() {
        let parsed = ChainConfig::parse_from([
            "assertion-chain",
            "--auto-deposit",
            "false",
            "--enable-fast-confirmation",
            "--rpc-head-block",
            "safe",
            "--withdrawal-address",
            "0x0000000000000000000000000000000000000042",
        ]);
        assert!(!parsed.auto_deposit);
        assert!(parsed.enable_fast_confirmation);
        assert_eq!(parsed.rpc_head_block, HeadBlockPolicy::Safe);
        assert_eq!(parsed.rpc_head_block.block_tag(), BlockNumberOrTag::Safe);
        assert_eq!(
            parsed.withdrawal_address,
            Some(Address::with_last_byte(0x42))
        );
    }
}
