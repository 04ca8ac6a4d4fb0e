use super::SpecChallengeManager;
use crate::{
    backend::ChainBackend,
    bindings::{
        ChallengeEdge,
        IEdgeChallengeManager::{
            self,
            EdgeBisected,
        },
    },
    error::{
        ChainError,
        ChainResult,
    },
    primitives::{
        Address,
        AssertionHash,
        Bytes,
        ChallengeLevel,
        ClaimId,
        EdgeId,
        EdgeStatus,
        Height,
        MutualId,
        OriginHeights,
        OriginId,
        B256,
        U256,
    },
    utils::{
        trunc,
        WriteOnce,
    },
};

use alloy_sol_types::SolEvent;
use tracing::{
    debug,
    info,
    instrument,
};

/// View over one challenge edge.
///
/// Commitments, origin and claim are fixed at creation and read once. Rival, confirmation and
/// child fields only move in one direction on the ledger, so they are cached once observed.
pub struct SpecEdge<B> {
    manager: SpecChallengeManager<B>,
    id: EdgeId,
    mutual_id: MutualId,
    inner: ChallengeEdge,
    start_height: Height,
    end_height: Height,
    assertion_hash: WriteOnce<AssertionHash>,
    has_rival: WriteOnce<bool>,
    time_unrivaled: WriteOnce<u64>,
    confirmed_at_block: WriteOnce<u64>,
    lower_child: WriteOnce<EdgeId>,
    upper_child: WriteOnce<EdgeId>,
    has_length_one_rival: WriteOnce<bool>,
}

impl<B> Clone for SpecEdge<B> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            id: self.id,
            mutual_id: self.mutual_id,
            inner: self.inner.clone(),
            start_height: self.start_height,
            end_height: self.end_height,
            assertion_hash: self.assertion_hash.clone(),
            has_rival: self.has_rival.clone(),
            time_unrivaled: self.time_unrivaled.clone(),
            confirmed_at_block: self.confirmed_at_block.clone(),
            lower_child: self.lower_child.clone(),
            upper_child: self.upper_child.clone(),
            has_length_one_rival: self.has_length_one_rival.clone(),
        }
    }
}

impl<B> std::fmt::Debug for SpecEdge<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecEdge")
            .field("id", &self.id)
            .field("level", &self.inner.level)
            .field("start_height", &self.start_height)
            .field("end_height", &self.end_height)
            .finish_non_exhaustive()
    }
}

fn edge_height(value: U256, id: EdgeId) -> ChainResult<Height> {
    u64::try_from(value)
        .map_err(|_| ChainError::Internal(format!("edge {id} has height {value} beyond u64")))
}

impl<B: ChainBackend> SpecEdge<B> {
    pub(crate) fn new(
        manager: SpecChallengeManager<B>,
        id: EdgeId,
        mutual_id: MutualId,
        inner: ChallengeEdge,
    ) -> ChainResult<Self> {
        let edge = Self {
            start_height: edge_height(inner.startHeight, id)?,
            end_height: edge_height(inner.endHeight, id)?,
            manager,
            id,
            mutual_id,
            inner: ChallengeEdge::default(),
            assertion_hash: WriteOnce::new(),
            has_rival: WriteOnce::new(),
            time_unrivaled: WriteOnce::new(),
            confirmed_at_block: WriteOnce::new(),
            lower_child: WriteOnce::new(),
            upper_child: WriteOnce::new(),
            has_length_one_rival: WriteOnce::new(),
        };
        edge.observe(&inner)?;
        Ok(Self { inner, ..edge })
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn mutual_id(&self) -> MutualId {
        self.mutual_id
    }

    pub fn origin_id(&self) -> OriginId {
        OriginId(self.inner.originId)
    }

    /// Assertion (block level) or higher level edge this layer zero edge claims. `None` for
    /// edges created by bisection.
    pub fn claim_id(&self) -> Option<ClaimId> {
        (!self.inner.claimId.is_zero()).then_some(ClaimId(self.inner.claimId))
    }

    pub fn level(&self) -> ChallengeLevel {
        ChallengeLevel(self.inner.level)
    }

    /// Level counted from the small step level, which is 0.
    pub fn reversed_level(&self) -> ChallengeLevel {
        ChallengeLevel(self.total_levels() - 1 - self.inner.level)
    }

    pub fn total_levels(&self) -> u8 {
        self.manager.constants().total_levels()
    }

    /// Staker of a block level layer zero edge. Other edges are not backed by stake.
    pub fn mini_staker(&self) -> Option<Address> {
        (self.inner.staker != Address::ZERO).then_some(self.inner.staker)
    }

    pub fn start_commitment(&self) -> (Height, B256) {
        (self.start_height, self.inner.startHistoryRoot)
    }

    pub fn end_commitment(&self) -> (Height, B256) {
        (self.end_height, self.inner.endHistoryRoot)
    }

    pub fn created_at_block(&self) -> u64 {
        self.inner.createdAtBlock
    }

    /// Caches whatever a fresh read settles for good.
    fn observe(&self, edge: &ChallengeEdge) -> ChainResult<()> {
        if edge.status == 1 {
            self.confirmed_at_block.set(edge.confirmedAtBlock)?;
        }
        if !edge.lowerChildId.is_zero() && !edge.upperChildId.is_zero() {
            self.lower_child.set(EdgeId(edge.lowerChildId))?;
            self.upper_child.set(EdgeId(edge.upperChildId))?;
        }
        Ok(())
    }

    async fn refresh(&self) -> ChainResult<ChallengeEdge> {
        let edge = self.manager.read_edge(self.id).await?;
        self.observe(&edge)?;
        Ok(edge)
    }

    /// Parent assertion of the fork the challenge containing this edge decides.
    pub async fn assertion_hash(&self) -> ChainResult<AssertionHash> {
        if let Some(hash) = self.assertion_hash.get() {
            return Ok(hash);
        }
        let hash = self
            .manager
            .call(&IEdgeChallengeManager::getPrevAssertionHashCall { edgeId: self.id.0 })
            .await?
            ._0;
        self.assertion_hash.set(AssertionHash(hash))
    }

    /// Blocks this edge spent without a rival. Stops growing once a rival appears.
    pub async fn time_unrivaled(&self) -> ChainResult<u64> {
        if let Some(time) = self.time_unrivaled.get() {
            return Ok(time);
        }
        // Checked first so a value read before the rival landed is never cached.
        let rivaled = self.has_rival().await?;
        let time = self
            .manager
            .call(&IEdgeChallengeManager::timeUnrivaledCall { edgeId: self.id.0 })
            .await?
            ._0;
        let time = time.saturating_to::<u64>();
        if rivaled {
            return self.time_unrivaled.set(time);
        }
        Ok(time)
    }

    /// Cumulative unrivaled time last written to the edge's timer cache.
    pub async fn latest_inherited_timer(&self) -> ChainResult<u64> {
        Ok(self.refresh().await?.totalTimeUnrivaledCache)
    }

    pub async fn has_rival(&self) -> ChainResult<bool> {
        if self.has_rival.get() == Some(true) {
            return Ok(true);
        }
        let rivaled = self
            .manager
            .call(&IEdgeChallengeManager::hasRivalCall { edgeId: self.id.0 })
            .await?
            ._0;
        if rivaled {
            self.has_rival.set(true)?;
        }
        Ok(rivaled)
    }

    /// Whether any edge sharing this edge's mutual id has been confirmed, including this one.
    pub async fn has_confirmed_rival(&self) -> ChainResult<bool> {
        let confirmed = self
            .manager
            .call(&IEdgeChallengeManager::confirmedRivalCall {
                mutualId: self.mutual_id.0,
            })
            .await?
            ._0;
        Ok(!confirmed.is_zero())
    }

    /// Whether this edge is of length one and has a rival, i.e. it is a one step fork.
    pub async fn has_length_one_rival(&self) -> ChainResult<bool> {
        if self.has_length_one_rival.get() == Some(true) {
            return Ok(true);
        }
        let result = self
            .manager
            .call(&IEdgeChallengeManager::hasLengthOneRivalCall { edgeId: self.id.0 })
            .await;
        match result {
            Ok(ret) if ret._0 => self.has_length_one_rival.set(true),
            Ok(_) => Ok(false),
            Err(err)
                if err
                    .revert_reason()
                    .is_some_and(|r| r.contains("not length 1") || r.contains("is unrivaled")) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn status(&self) -> ChainResult<EdgeStatus> {
        if self.confirmed_at_block.get().is_some() {
            return Ok(EdgeStatus::Confirmed);
        }
        let edge = self.refresh().await?;
        EdgeStatus::from_u8(edge.status).ok_or_else(|| {
            ChainError::Internal(format!("edge {} has unknown status {}", self.id, edge.status))
        })
    }

    pub async fn confirmed_at_block(&self) -> ChainResult<Option<u64>> {
        if let Some(block) = self.confirmed_at_block.get() {
            return Ok(Some(block));
        }
        self.refresh().await?;
        Ok(self.confirmed_at_block.get())
    }

    async fn children(&self) -> ChainResult<Option<(EdgeId, EdgeId)>> {
        if let (Some(lower), Some(upper)) = (self.lower_child.get(), self.upper_child.get()) {
            return Ok(Some((lower, upper)));
        }
        self.refresh().await?;
        Ok(self.lower_child.get().zip(self.upper_child.get()))
    }

    pub async fn has_children(&self) -> ChainResult<bool> {
        Ok(self.children().await?.is_some())
    }

    pub async fn lower_child(&self) -> ChainResult<Option<EdgeId>> {
        Ok(self.children().await?.map(|(lower, _)| lower))
    }

    pub async fn upper_child(&self) -> ChainResult<Option<EdgeId>> {
        Ok(self.children().await?.map(|(_, upper)| upper))
    }

    /// Start heights of the one step forks that originated this edge's challenge, from the
    /// block level down. A block level edge reports its own start height.
    pub async fn top_level_claim_heights(&self) -> ChainResult<OriginHeights> {
        if self.level().is_block_challenge_level() {
            return Ok(OriginHeights {
                challenge_origin_heights: vec![self.start_height],
            });
        }
        let mut heights = Vec::with_capacity(self.inner.level as usize);
        let mut origin_id = self.inner.originId;
        for _ in 0..self.inner.level {
            let rival = self
                .manager
                .call(&IEdgeChallengeManager::firstRivalCall { mutualId: origin_id })
                .await?
                ._0;
            let source = self.manager.read_edge(EdgeId(rival)).await.map_err(|err| {
                ChainError::Internal(format!(
                    "one step fork source {rival:#x} of origin {origin_id:#x} unreadable: {err}"
                ))
            })?;
            heights.push(edge_height(source.startHeight, EdgeId(rival))?);
            origin_id = source.originId;
        }
        heights.reverse();
        Ok(OriginHeights {
            challenge_origin_heights: heights,
        })
    }

    async fn child_edges(&self, lower: EdgeId, upper: EdgeId) -> ChainResult<(Self, Self)> {
        let fetch = |id: EdgeId| async move {
            self.manager
                .get_edge(id)
                .await?
                .ok_or_else(|| ChainError::NotFound(format!("child edge {id} of {}", self.id)))
        };
        Ok((fetch(lower).await?, fetch(upper).await?))
    }

    /// Bisects at the mandatory bisection height, committing to `bisection_root` there.
    ///
    /// Returns the lower and upper children. If the edge was already bisected, the existing
    /// children are returned without submitting anything.
    #[instrument(skip(self, prefix_proof), fields(edge = %self.id), target = "assertion_chain::challenge")]
    pub async fn bisect(
        &self,
        bisection_root: B256,
        prefix_proof: Bytes,
    ) -> ChainResult<(Self, Self)> {
        if let Some((lower, upper)) = self.children().await? {
            debug!(target: "assertion_chain::challenge", "Edge already bisected");
            return self.child_edges(lower, upper).await;
        }
        let receipt = self
            .manager
            .send(&IEdgeChallengeManager::bisectEdgeCall {
                edgeId: self.id.0,
                bisectionHistoryRoot: bisection_root,
                prefixProof: prefix_proof,
            })
            .await?;
        let bisected = receipt
            .logs
            .iter()
            .filter(|log| log.inner.address == self.manager.address())
            .find_map(|log| EdgeBisected::decode_log_data(&log.inner.data, true).ok());
        let (lower, upper) = match bisected {
            Some(event) => (EdgeId(event.lowerChildId), EdgeId(event.upperChildId)),
            None => self.children().await?.ok_or_else(|| {
                ChainError::Internal(format!("edge {} has no children after bisection", self.id))
            })?,
        };
        self.lower_child.set(lower)?;
        self.upper_child.set(upper)?;
        info!(
            target: "assertion_chain::challenge",
            lower = %trunc(&lower.0),
            upper = %trunc(&upper.0),
            level = self.inner.level,
            "Bisected edge"
        );
        self.child_edges(lower, upper).await
    }

    /// Confirms the edge once its cumulative unrivaled time covers the challenge period.
    /// `claimed_assertion` is the assertion the block level edge of this challenge claims.
    #[instrument(skip(self), fields(edge = %self.id), target = "assertion_chain::challenge")]
    pub async fn confirm_by_timer(&self, claimed_assertion: AssertionHash) -> ChainResult<()> {
        if self.status().await? == EdgeStatus::Confirmed {
            return Ok(());
        }
        let info = self
            .manager
            .chain()
            .read_assertion_creation_info(claimed_assertion)
            .await?;
        self.manager
            .send(&IEdgeChallengeManager::confirmEdgeByTimeCall {
                edgeId: self.id.0,
                claimStateData: info.execution_state_data(),
            })
            .await?;
        self.refresh().await?;
        info!(target: "assertion_chain::challenge", level = self.inner.level, "Confirmed edge by time");
        Ok(())
    }
}
