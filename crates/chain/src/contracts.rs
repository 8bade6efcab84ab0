//! Typed contract bindings for the lending pool, price feeds and Multicall3.
//!
//! All on-chain interfaces used by the bot live here: the pool subset needed
//! for liquidation monitoring and execution, the protocol data provider for
//! per-reserve balances, Chainlink-style aggregators and Multicall3.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};

sol! {
    /// Lending pool interface (Aave v3 style, liquidation subset).
    #[sol(rpc)]
    interface IPool {
        event Supply(address indexed reserve, address user, address indexed onBehalfOf, uint256 amount, uint16 indexed referralCode);
        event Withdraw(address indexed reserve, address indexed user, address indexed to, uint256 amount);
        event Borrow(address indexed reserve, address user, address indexed onBehalfOf, uint256 amount, uint8 interestRateMode, uint256 borrowRate, uint16 indexed referralCode);
        event Repay(address indexed reserve, address indexed user, address indexed repayer, uint256 amount, bool useATokens);
        event LiquidationCall(address indexed collateralAsset, address indexed debtAsset, address indexed user, uint256 debtToCover, uint256 liquidatedCollateralAmount, address liquidator, bool receiveAToken);
        event ReserveDataUpdated(address indexed reserve, uint256 liquidityRate, uint256 stableBorrowRate, uint256 variableBorrowRate, uint256 liquidityIndex, uint256 variableBorrowIndex);

        function getUserAccountData(address user) external view returns (
            uint256 totalCollateralBase,
            uint256 totalDebtBase,
            uint256 availableBorrowsBase,
            uint256 currentLiquidationThreshold,
            uint256 ltv,
            uint256 healthFactor
        );

        function liquidationCall(
            address collateralAsset,
            address debtAsset,
            address user,
            uint256 debtToCover,
            bool receiveAToken
        ) external;
    }
}

sol! {
    /// Protocol data provider (per-reserve user balances).
    #[sol(rpc)]
    interface IPoolDataProvider {
        function getUserReserveData(address asset, address user) external view returns (
            uint256 currentATokenBalance,
            uint256 currentStableDebt,
            uint256 currentVariableDebt,
            uint256 principalStableDebt,
            uint256 scaledVariableDebt,
            uint40 stableRateLastUpdated,
            bool usageAsCollateralEnabled
        );
    }
}

sol! {
    /// Chainlink-style price aggregator.
    #[sol(rpc)]
    interface IAggregatorV3 {
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
        function decimals() external view returns (uint8);
        function description() external view returns (string memory);
    }
}

sol! {
    /// Multicall3 aggregate interface.
    #[sol(rpc)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }
        struct Result {
            bool success;
            bytes returnData;
        }
        function aggregate3(Call3[] calldata calls) external payable returns (Result[] memory returnData);
    }
}

/// Canonical Multicall3 deployment (same address on every major EVM chain).
pub const MULTICALL3_ADDRESS: Address = Address::new([
    0xca, 0x11, 0xbd, 0xe0, 0x59, 0x77, 0xb3, 0x63, 0x11, 0x67, 0x02, 0x88, 0x62, 0xbe, 0x2a,
    0x17, 0x39, 0x76, 0xca, 0x11,
]);

/// Pool event topic hashes, derived from the `sol!` event definitions.
pub mod pool_signatures {
    use super::*;

    pub const SUPPLY: B256 = IPool::Supply::SIGNATURE_HASH;
    pub const WITHDRAW: B256 = IPool::Withdraw::SIGNATURE_HASH;
    pub const BORROW: B256 = IPool::Borrow::SIGNATURE_HASH;
    pub const REPAY: B256 = IPool::Repay::SIGNATURE_HASH;
    pub const LIQUIDATION_CALL: B256 = IPool::LiquidationCall::SIGNATURE_HASH;
    pub const RESERVE_DATA_UPDATED: B256 = IPool::ReserveDataUpdated::SIGNATURE_HASH;

    /// All pool event topics the bot subscribes to.
    pub fn all() -> Vec<B256> {
        vec![
            SUPPLY,
            WITHDRAW,
            BORROW,
            REPAY,
            LIQUIDATION_CALL,
            RESERVE_DATA_UPDATED,
        ]
    }
}

/// Byte offset of the borrower address inside encoded `liquidationCall`
/// calldata. Layout: 4-byte selector, then five 32-byte words
/// (collateralAsset, debtAsset, user, debtToCover, receiveAToken). The
/// address occupies the low 20 bytes of the third word.
pub const LIQUIDATION_USER_OFFSET: usize = 4 + 2 * 32 + 12;

/// Byte offset of the 32-byte big-endian debtToCover word.
pub const LIQUIDATION_REPAY_OFFSET: usize = 4 + 3 * 32;

/// Total length of encoded `liquidationCall` calldata.
pub const LIQUIDATION_CALLDATA_LEN: usize = 4 + 5 * 32;

/// Encode `liquidationCall` calldata for the pool.
pub fn encode_liquidation_call(
    collateral_asset: Address,
    debt_asset: Address,
    user: Address,
    debt_to_cover: U256,
    receive_atoken: bool,
) -> Bytes {
    let call = IPool::liquidationCallCall {
        collateralAsset: collateral_asset,
        debtAsset: debt_asset,
        user,
        debtToCover: debt_to_cover,
        receiveAToken: receive_atoken,
    };
    Bytes::from(call.abi_encode())
}

/// Encode a `getUserAccountData` inner call for multicall batching.
pub fn encode_get_user_account_data(user: Address) -> Bytes {
    Bytes::from(IPool::getUserAccountDataCall { user }.abi_encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_signatures_present() {
        let sigs = pool_signatures::all();
        assert_eq!(sigs.len(), 6);
        assert!(sigs.iter().all(|s| !s.is_zero()));
    }

    #[test]
    fn test_known_topic_hashes() {
        // keccak256("Supply(address,address,address,uint256,uint16)")
        assert_eq!(
            format!("{:x}", pool_signatures::SUPPLY),
            "2b627736bca15cd5381dcf80b0bf11fd197d01a037c52b927a881a10fb73ba61"
        );
        // keccak256("LiquidationCall(address,address,address,uint256,uint256,address,bool)")
        assert_eq!(
            format!("{:x}", pool_signatures::LIQUIDATION_CALL),
            "e413a321e8681d831f4dbccbca790d2952b56f977908e45be37335533e005286"
        );
        // keccak256("ReserveDataUpdated(address,uint256,uint256,uint256,uint256,uint256)")
        assert_eq!(
            format!("{:x}", pool_signatures::RESERVE_DATA_UPDATED),
            "804c9b842b2748a22bb64b345453a3de7ca54a6ca45ce00d415894979e22897a"
        );
    }

    #[test]
    fn test_liquidation_calldata_layout() {
        let user = Address::repeat_byte(0xAB);
        let calldata = encode_liquidation_call(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            user,
            U256::from(123456u64),
            false,
        );

        assert_eq!(calldata.len(), LIQUIDATION_CALLDATA_LEN);
        assert_eq!(
            &calldata[LIQUIDATION_USER_OFFSET..LIQUIDATION_USER_OFFSET + 20],
            user.as_slice()
        );

        let mut repay = [0u8; 32];
        repay.copy_from_slice(
            &calldata[LIQUIDATION_REPAY_OFFSET..LIQUIDATION_REPAY_OFFSET + 32],
        );
        assert_eq!(U256::from_be_bytes(repay), U256::from(123456u64));
    }
}
