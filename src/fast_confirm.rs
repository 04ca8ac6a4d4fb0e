//! Fast confirmation through a multisig fast confirmer.
//!
//! Every owner approves the multisig transaction hash of the rollup's `fastConfirmAssertion`
//! call. Once enough owners approved, any of them executes it with pre-approved hash
//! signatures.

use crate::{
    backend::ChainBackend,
    bindings::{
        IRollupCore,
        ISafe,
    },
    chain::{
        AssertionChain,
        ContractCaller,
    },
    error::{
        ChainError,
        ChainResult,
    },
    primitives::{
        Address,
        AssertionCreatedInfo,
        Bytes,
        B256,
        U256,
    },
};

use alloy_sol_types::SolCall;
use tracing::{
    debug,
    info,
    instrument,
};

/// `v` of a signature standing for a hash approved on chain through `approveHash`.
const APPROVED_HASH_SIGNATURE_TYPE: u8 = 1;

/// Multisig acting as the rollup's fast confirmer, with the staker as one of its owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastConfirmSafe {
    address: Address,
    /// Ascending, as signatures must be ordered by owner.
    owners: Vec<Address>,
    threshold: u64,
}

impl FastConfirmSafe {
    pub(crate) async fn load<B: ChainBackend>(
        caller: &ContractCaller<'_, B>,
        safe: Address,
        staker: Address,
    ) -> ChainResult<Self> {
        let mut owners = caller.call(safe, &ISafe::getOwnersCall {}).await?._0;
        owners.sort();
        let threshold = caller.call(safe, &ISafe::getThresholdCall {}).await?._0;
        let threshold = u64::try_from(threshold).map_err(|_| {
            ChainError::Config(format!("fast confirm safe {safe} has threshold {threshold}"))
        })?;
        let is_owner = caller
            .call(safe, &ISafe::isOwnerCall { owner: staker })
            .await?
            ._0;
        if !is_owner {
            return Err(ChainError::Config(format!(
                "staker {staker} is not an owner of the fast confirm safe {safe}"
            )));
        }
        debug!(
            target: "assertion_chain::fast_confirm",
            %safe,
            owners = owners.len(),
            threshold,
            "Loaded fast confirm safe"
        );
        Ok(Self {
            address: safe,
            owners,
            threshold,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owners(&self) -> &[Address] {
        &self.owners
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Multisig transaction hash of fast confirming `info` at the multisig's current nonce,
    /// along with the rollup calldata it covers.
    pub async fn transaction_hash<B: ChainBackend>(
        &self,
        chain: &AssertionChain<B>,
        info: &AssertionCreatedInfo,
    ) -> ChainResult<(B256, Bytes)> {
        let data: Bytes = IRollupCore::fastConfirmAssertionCall {
            assertionHash: info.assertion_hash.0,
            parentAssertionHash: info.parent_assertion_hash.0,
            confirmState: info.after_state.clone(),
            inboxAcc: info.after_inbox_batch_acc,
        }
        .abi_encode()
        .into();
        let nonce = chain.call(self.address, &ISafe::nonceCall {}).await?._0;
        let hash = chain
            .call(
                self.address,
                &ISafe::getTransactionHashCall {
                    to: chain.rollup_address(),
                    value: U256::ZERO,
                    data: data.clone(),
                    operation: 0,
                    safeTxGas: U256::ZERO,
                    baseGas: U256::ZERO,
                    gasPrice: U256::ZERO,
                    gasToken: Address::ZERO,
                    refundReceiver: Address::ZERO,
                    safeNonce: nonce,
                },
            )
            .await?
            ._0;
        Ok((hash, data))
    }

    async fn is_approved<B: ChainBackend>(
        &self,
        chain: &AssertionChain<B>,
        owner: Address,
        hash: B256,
    ) -> ChainResult<bool> {
        let approved = chain
            .call(self.address, &ISafe::approvedHashesCall { owner, hash })
            .await?
            ._0;
        Ok(approved != U256::ZERO)
    }

    /// Approves the fast confirmation of `info` and executes it once enough owners approved.
    ///
    /// Returns `Ok(false)` while the approvals are below the threshold.
    #[instrument(skip_all, fields(assertion = %info.assertion_hash, safe = %self.address), target = "assertion_chain::fast_confirm")]
    pub async fn fast_confirm<B: ChainBackend>(
        &self,
        chain: &AssertionChain<B>,
        info: &AssertionCreatedInfo,
    ) -> ChainResult<bool> {
        let staker = chain.staker();
        let (hash, data) = self.transaction_hash(chain, info).await?;
        if !self.is_approved(chain, staker, hash).await? {
            chain
                .send(self.address, &ISafe::approveHashCall { hashToApprove: hash })
                .await?;
            debug!(target: "assertion_chain::fast_confirm", %hash, "Approved fast confirmation");
        }

        let mut signatures = Vec::with_capacity(self.owners.len() * 65);
        let mut approvals = 0u64;
        for owner in &self.owners {
            if *owner != staker && !self.is_approved(chain, *owner, hash).await? {
                continue;
            }
            signatures.extend_from_slice(&[0u8; 12]);
            signatures.extend_from_slice(owner.as_slice());
            signatures.extend_from_slice(&[0u8; 32]);
            signatures.push(APPROVED_HASH_SIGNATURE_TYPE);
            approvals += 1;
        }
        if approvals < self.threshold {
            info!(
                target: "assertion_chain::fast_confirm",
                approvals,
                threshold = self.threshold,
                "Not enough approvals to fast confirm yet"
            );
            return Ok(false);
        }

        chain
            .send(
                self.address,
                &ISafe::execTransactionCall {
                    to: chain.rollup_address(),
                    value: U256::ZERO,
                    data,
                    operation: 0,
                    safeTxGas: U256::ZERO,
                    baseGas: U256::ZERO,
                    gasPrice: U256::ZERO,
                    gasToken: Address::ZERO,
                    refundReceiver: Address::ZERO,
                    signatures: signatures.into(),
                },
            )
            .await?;
        info!(target: "assertion_chain::fast_confirm", approvals, "Fast confirmed assertion through safe");
        Ok(true)
    }
}
