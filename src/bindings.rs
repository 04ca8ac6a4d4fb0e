//! Call and event surface of the rollup contracts consumed by this crate.

use alloy_sol_types::sol;

sol! {
    #[derive(Debug, Default, PartialEq, Eq)]
    struct GlobalState {
        bytes32[2] bytes32Vals;
        uint64[2] u64Vals;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct AssertionState {
        GlobalState globalState;
        uint8 machineStatus;
        bytes32 endHistoryRoot;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct ConfigData {
        bytes32 wasmModuleRoot;
        uint256 requiredStake;
        address challengeManager;
        uint64 confirmPeriodBlocks;
        uint64 nextInboxPosition;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct BeforeStateData {
        bytes32 prevPrevAssertionHash;
        bytes32 sequencerBatchAcc;
        ConfigData configData;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct AssertionInputs {
        BeforeStateData beforeStateData;
        AssertionState beforeState;
        AssertionState afterState;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct AssertionNode {
        uint64 firstChildBlock;
        uint64 secondChildBlock;
        uint64 createdAtBlock;
        bool isFirstChild;
        uint8 status;
        bytes32 configHash;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct ExecutionStateData {
        AssertionState executionState;
        bytes32 prevAssertionHash;
        bytes32 inboxAcc;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct ChallengeEdge {
        bytes32 originId;
        bytes32 startHistoryRoot;
        uint256 startHeight;
        bytes32 endHistoryRoot;
        uint256 endHeight;
        bytes32 lowerChildId;
        bytes32 upperChildId;
        bytes32 claimId;
        address staker;
        uint64 createdAtBlock;
        uint64 confirmedAtBlock;
        uint8 status;
        uint8 level;
        bool refunded;
        uint64 totalTimeUnrivaledCache;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct CreateEdgeArgs {
        uint8 level;
        bytes32 endHistoryRoot;
        uint256 endHeight;
        bytes32 claimId;
        bytes prefixProof;
        bytes proof;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct OneStepData {
        bytes32 beforeHash;
        bytes proof;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct ExecutionContext {
        uint256 maxInboxMessagesRead;
        address bridge;
        bytes32 initialWasmModuleRoot;
    }

    #[derive(Debug)]
    interface IRollupCore {
        event AssertionCreated(
            bytes32 indexed assertionHash,
            bytes32 indexed parentAssertionHash,
            AssertionInputs assertion,
            bytes32 afterInboxBatchAcc,
            uint256 inboxMaxCount,
            bytes32 wasmModuleRoot,
            uint256 requiredStake,
            address challengeManager,
            uint64 confirmPeriodBlocks
        );

        event AssertionConfirmed(bytes32 indexed assertionHash, bytes32 blockHash, bytes32 sendRoot);

        function getAssertion(bytes32 assertionHash) external view returns (AssertionNode);
        function getAssertionCreationBlockForLogLookup(bytes32 assertionHash) external view returns (uint256);
        function latestConfirmed() external view returns (bytes32);
        function isStaked(address staker) external view returns (bool);
        function stakeToken() external view returns (address);
        function bridge() external view returns (address);
        function minimumAssertionPeriod() external view returns (uint256);
        function genesisAssertionHash() external pure returns (bytes32);
        function rollupDeploymentBlock() external view returns (uint256);
        function anyTrustFastConfirmer() external view returns (address);
        function computeAssertionHash(bytes32 prevAssertionHash, AssertionState state, bytes32 inboxAcc) external pure returns (bytes32);

        function newStake(uint256 tokenAmount, address withdrawalAddress) external;
        function newStakeOnNewAssertion(uint256 tokenAmount, AssertionInputs assertion, bytes32 expectedAssertionHash, address withdrawalAddress) external;
        function stakeOnNewAssertion(AssertionInputs assertion, bytes32 expectedAssertionHash) external;
        function confirmAssertion(
            bytes32 assertionHash,
            bytes32 prevAssertionHash,
            AssertionState confirmState,
            bytes32 winningEdgeId,
            ConfigData prevConfig,
            bytes32 inboxAcc
        ) external;
        function fastConfirmAssertion(bytes32 assertionHash, bytes32 parentAssertionHash, AssertionState confirmState, bytes32 inboxAcc) external;
    }

    #[derive(Debug)]
    interface IBridge {
        function sequencerInboxAccs(uint256 index) external view returns (bytes32);
    }

    #[derive(Debug)]
    interface IStakeToken {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function deposit() external payable;
    }

    #[derive(Debug)]
    interface IEdgeChallengeManager {
        event EdgeAdded(
            bytes32 indexed edgeId,
            bytes32 indexed mutualId,
            bytes32 indexed originId,
            bytes32 claimId,
            uint256 length,
            uint8 level,
            bool hasRival,
            bool isLayerZero
        );

        event EdgeBisected(bytes32 indexed edgeId, bytes32 indexed lowerChildId, bytes32 indexed upperChildId, bool lowerChildAlreadyExists);
        event EdgeConfirmedByTime(bytes32 indexed edgeId, bytes32 indexed mutualId, uint256 totalTimeUnrivaled);
        event EdgeConfirmedByOneStepProof(bytes32 indexed edgeId, bytes32 indexed mutualId);
        event TimerCacheUpdated(bytes32 indexed edgeId, uint256 newValue);

        function LAYERZERO_BLOCKEDGE_HEIGHT() external view returns (uint256);
        function LAYERZERO_BIGSTEPEDGE_HEIGHT() external view returns (uint256);
        function LAYERZERO_SMALLSTEPEDGE_HEIGHT() external view returns (uint256);
        function NUM_BIGSTEP_LEVEL() external view returns (uint8);
        function challengePeriodBlocks() external view returns (uint64);
        function oneStepProofEntry() external view returns (address);

        function getEdge(bytes32 edgeId) external view returns (ChallengeEdge);
        function calculateEdgeId(uint8 level, bytes32 originId, uint256 startHeight, bytes32 startHistoryRoot, uint256 endHeight, bytes32 endHistoryRoot) external pure returns (bytes32);
        function calculateMutualId(uint8 level, bytes32 originId, uint256 startHeight, bytes32 startHistoryRoot, uint256 endHeight) external pure returns (bytes32);
        function confirmedRival(bytes32 mutualId) external view returns (bytes32);
        function firstRival(bytes32 mutualId) external view returns (bytes32);
        function hasRival(bytes32 edgeId) external view returns (bool);
        function hasLengthOneRival(bytes32 edgeId) external view returns (bool);
        function timeUnrivaled(bytes32 edgeId) external view returns (uint256);
        function getPrevAssertionHash(bytes32 edgeId) external view returns (bytes32);

        function createLayerZeroEdge(CreateEdgeArgs args) external returns (bytes32);
        function bisectEdge(bytes32 edgeId, bytes32 bisectionHistoryRoot, bytes prefixProof) external returns (bytes32, bytes32);
        function confirmEdgeByTime(bytes32 edgeId, ExecutionStateData claimStateData) external;
        function confirmEdgeByOneStepProof(
            bytes32 edgeId,
            OneStepData oneStepData,
            ConfigData prevConfig,
            bytes32[] beforeHistoryInclusionProof,
            bytes32[] afterHistoryInclusionProof
        ) external;
        function multiUpdateTimeCacheByChildren(bytes32[] edgeIds, uint256 maximumCachedTime) external;
    }

    #[derive(Debug)]
    interface IOneStepProofEntry {
        function proveOneStep(ExecutionContext execCtx, uint256 machineStep, bytes32 beforeHash, bytes proof) external view returns (bytes32);
    }

    #[derive(Debug)]
    interface ISafe {
        function getOwners() external view returns (address[]);
        function getThreshold() external view returns (uint256);
        function nonce() external view returns (uint256);
        function isOwner(address owner) external view returns (bool);
        function approvedHashes(address owner, bytes32 hash) external view returns (uint256);
        function approveHash(bytes32 hashToApprove) external;
        function getTransactionHash(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            uint256 safeNonce
        ) external view returns (bytes32);
        function execTransaction(
            address to,
            uint256 value,
            bytes data,
            uint8 operation,
            uint256 safeTxGas,
            uint256 baseGas,
            uint256 gasPrice,
            address gasToken,
            address refundReceiver,
            bytes signatures
        ) external payable returns (bool);
    }
}
