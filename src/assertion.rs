use crate::{
    backend::ChainBackend,
    bindings::AssertionNode,
    chain::AssertionChain,
    error::{
        ChainError,
        ChainResult,
    },
    primitives::{
        AssertionHash,
        AssertionStatus,
    },
    utils::WriteOnce,
};

/// View over one assertion of the rollup.
///
/// Fields that cannot change once set on the ledger are cached after they are first observed.
/// Two lookups of the same hash produce independent instances.
pub struct Assertion<B> {
    id: AssertionHash,
    created_at_block: u64,
    chain: AssertionChain<B>,
    prev_id: WriteOnce<AssertionHash>,
    is_first_child: WriteOnce<bool>,
    first_child_block: WriteOnce<u64>,
    second_child_block: WriteOnce<u64>,
    confirmed: WriteOnce<bool>,
}

impl<B> Clone for Assertion<B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            created_at_block: self.created_at_block,
            chain: self.chain.clone(),
            prev_id: self.prev_id.clone(),
            is_first_child: self.is_first_child.clone(),
            first_child_block: self.first_child_block.clone(),
            second_child_block: self.second_child_block.clone(),
            confirmed: self.confirmed.clone(),
        }
    }
}

impl<B> std::fmt::Debug for Assertion<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assertion")
            .field("id", &self.id)
            .field("created_at_block", &self.created_at_block)
            .finish_non_exhaustive()
    }
}

impl<B: ChainBackend> Assertion<B> {
    pub(crate) fn from_node(chain: AssertionChain<B>, id: AssertionHash, node: &AssertionNode) -> Self {
        let (first, second) = (node.firstChildBlock, node.secondChildBlock);
        let known_if_set = |block: u64, set: bool| {
            if set {
                WriteOnce::known(block)
            } else {
                WriteOnce::new()
            }
        };
        Self {
            id,
            created_at_block: node.createdAtBlock,
            chain,
            prev_id: WriteOnce::new(),
            is_first_child: WriteOnce::known(node.isFirstChild),
            first_child_block: known_if_set(first, first > 0),
            // Out of order reads are left for `observe_children` to report.
            second_child_block: known_if_set(second, second > 0 && first > 0 && first <= second),
            confirmed: if node.status == 2 {
                WriteOnce::known(true)
            } else {
                WriteOnce::new()
            },
        }
    }

    pub fn id(&self) -> AssertionHash {
        self.id
    }

    pub fn created_at_block(&self) -> u64 {
        self.created_at_block
    }

    async fn node(&self) -> ChainResult<AssertionNode> {
        let node = self.chain.assertion_node(self.id).await?;
        if node.status == 0 {
            return Err(ChainError::NotFound(format!("assertion with id {}", self.id)));
        }
        Ok(node)
    }

    /// Hash of the parent assertion. Zero for genesis.
    pub async fn prev_id(&self) -> ChainResult<AssertionHash> {
        if let Some(prev) = self.prev_id.get() {
            return Ok(prev);
        }
        let info = self.chain.read_assertion_creation_info(self.id).await?;
        self.prev_id.set(info.parent_assertion_hash)
    }

    pub async fn is_first_child(&self) -> ChainResult<bool> {
        if let Some(first) = self.is_first_child.get() {
            return Ok(first);
        }
        let node = self.node().await?;
        self.is_first_child.set(node.isFirstChild)
    }

    /// Block the first child of this assertion was created in, zero if there is none yet.
    pub async fn first_child_creation_block(&self) -> ChainResult<u64> {
        if let Some(block) = self.first_child_block.get() {
            return Ok(block);
        }
        let node = self.node().await?;
        self.observe_children(&node)?;
        Ok(node.firstChildBlock)
    }

    /// Block the second child of this assertion was created in, zero if there is none yet.
    pub async fn second_child_creation_block(&self) -> ChainResult<u64> {
        if let Some(block) = self.second_child_block.get() {
            return Ok(block);
        }
        let node = self.node().await?;
        self.observe_children(&node)?;
        Ok(node.secondChildBlock)
    }

    pub async fn has_second_child(&self) -> ChainResult<bool> {
        Ok(self.second_child_creation_block().await? > 0)
    }

    /// Caches the child blocks of a fresh read, rejecting reads that break their ordering.
    fn observe_children(&self, node: &AssertionNode) -> ChainResult<()> {
        let (first, second) = (node.firstChildBlock, node.secondChildBlock);
        if second > 0 && (first == 0 || first > second) {
            return Err(ChainError::Internal(format!(
                "assertion {} has first child block {first} and second child block {second}",
                self.id
            )));
        }
        if first > 0 {
            self.first_child_block.set(first)?;
        }
        if second > 0 {
            self.second_child_block.set(second)?;
        }
        Ok(())
    }

    pub async fn status(&self) -> ChainResult<AssertionStatus> {
        if self.confirmed.get() == Some(true) {
            return Ok(AssertionStatus::Confirmed);
        }
        let status = self.chain.assertion_status(self.id).await?;
        if status == AssertionStatus::Confirmed {
            self.confirmed.set(true)?;
        }
        Ok(status)
    }

    pub async fn is_confirmed(&self) -> ChainResult<bool> {
        Ok(self.status().await? == AssertionStatus::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    use std::sync::Arc;

    #[tokio::test]
    async fn test_child_blocks_are_cached_once_set() {
        let fork = setup_fork().await;
        let genesis = fork
            .honest
            .get_assertion(AssertionHash(fork.mock.genesis_hash()))
            .await
            .unwrap();
        assert_eq!(
            genesis.first_child_creation_block().await.unwrap(),
            fork.honest_assertion.created_at_block()
        );
        assert_eq!(
            genesis.second_child_creation_block().await.unwrap(),
            fork.evil_assertion.created_at_block()
        );
        assert!(genesis.has_second_child().await.unwrap());
        assert!(genesis.is_confirmed().await.unwrap());

        // Cached values are served without touching the backend.
        fork.mock.fail_next_calls(u64::MAX);
        assert!(genesis.has_second_child().await.unwrap());
        assert!(genesis.is_confirmed().await.unwrap());
    }

    #[tokio::test]
    async fn test_unset_child_blocks_are_refreshed() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis_info = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let genesis = chain.get_assertion(genesis_info.assertion_hash).await.unwrap();
        assert_eq!(genesis.first_child_creation_block().await.unwrap(), 0);
        assert!(!genesis.has_second_child().await.unwrap());

        let child = chain
            .new_stake_on_new_assertion(&genesis_info, &post_state(1, 0x11))
            .await
            .unwrap();
        assert_eq!(
            genesis.first_child_creation_block().await.unwrap(),
            child.created_at_block()
        );
        assert!(child.is_first_child().await.unwrap());
        assert_eq!(child.prev_id().await.unwrap(), genesis.id());
        assert_eq!(
            child.status().await.unwrap(),
            AssertionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_second_child_flags() {
        let fork = setup_fork().await;
        assert!(fork.honest_assertion.is_first_child().await.unwrap());
        assert!(!fork.evil_assertion.is_first_child().await.unwrap());
        assert_eq!(
            fork.evil_assertion.prev_id().await.unwrap(),
            fork.honest_assertion.prev_id().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_genesis_prev_id_is_zero() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain.latest_confirmed().await.unwrap();
        assert!(genesis.prev_id().await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_out_of_order_child_blocks_rejected() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let node = AssertionNode {
            firstChildBlock: 0,
            secondChildBlock: 5,
            createdAtBlock: 1,
            status: 1,
            ..Default::default()
        };
        let assertion = Assertion::from_node(chain.clone(), AssertionHash::ZERO, &node);
        let bad = AssertionNode {
            firstChildBlock: 9,
            ..node.clone()
        };
        assert!(matches!(
            assertion.observe_children(&bad),
            Err(ChainError::Internal(_))
        ));
        assert!(matches!(
            assertion.observe_children(&node),
            Err(ChainError::Internal(_))
        ));
        let ok = AssertionNode {
            firstChildBlock: 3,
            ..node
        };
        assertion.observe_children(&ok).unwrap();
        assert_eq!(assertion.first_child_block.get(), Some(3));
    }
}
