use alloy::sol;

sol! {
    #[sol(all_derives)]
    #[derive(Debug, PartialEq, Eq)]
    event PairCreated(address indexed token0, address indexed token1, address pair, uint256 pairCount);

    #[sol(rpc)]
    interface IFactory {
        function allPairsLength() external view returns (uint256);
        function allPairs(uint256 index) external view returns (address);
    }
}
