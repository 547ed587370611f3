//! Solidity bindings for the relayer contract, ERC-20 tokens and the
//! Chainlink aggregator.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    struct MetaTransfer {
        address owner;
        address token;
        address recipient;
        uint256 amount;
        uint256 fee;
        uint256 deadline;
        uint256 nonce;
    }

    struct PermitData {
        uint256 value;
        uint256 deadline;
        uint8 v;
        bytes32 r;
        bytes32 s;
    }

    #[sol(rpc)]
    interface IGaslessRelayer {
        function getNonce(address user) external view returns (uint256);
        function isTokenWhitelisted(address token) external view returns (bool);
        function isRecipientContractAllowed(address recipient) external view returns (bool);
        function maxTransferAmount() external view returns (uint256);
        function maxFeeAmount() external view returns (uint256);
        function paused() external view returns (bool);
        function feeWallet() external view returns (address);
        function executeMetaTransfer(
            MetaTransfer calldata metaTx,
            PermitData calldata permit,
            bytes calldata signature
        ) external;
    }

    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }

    #[sol(rpc)]
    interface AggregatorV3Interface {
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
    }
}

impl From<&crate::types::MetaTransfer> for MetaTransfer {
    fn from(mt: &crate::types::MetaTransfer) -> Self {
        Self {
            owner: mt.owner,
            token: mt.token,
            recipient: mt.recipient,
            amount: mt.amount,
            fee: mt.fee,
            deadline: mt.deadline,
            nonce: mt.nonce,
        }
    }
}

impl From<&crate::types::PermitData> for PermitData {
    fn from(p: &crate::types::PermitData) -> Self {
        Self {
            value: p.value,
            deadline: p.deadline,
            v: p.v,
            r: p.r,
            s: p.s,
        }
    }
}
