use alloy::sol;

sol! {
    #[sol(all_derives)]
    #[derive(Debug, PartialEq, Eq)]
    event LiquidityAdded(address indexed provider, uint256 amountA, uint256 amountB, uint256 liquidity);
    #[sol(all_derives)]
    #[derive(Debug, PartialEq, Eq)]
    event LiquidityRemoved(address indexed provider, uint256 amountA, uint256 amountB, uint256 liquidity, address indexed to);
    #[sol(all_derives)]
    #[derive(Debug, PartialEq, Eq)]
    event Swap(address indexed sender, bool zeroForOne, uint256 amountIn, uint256 amountOut, address indexed to);

    #[sol(rpc)]
    interface IPair {
        function token0() external view returns (address);
        function token1() external view returns (address);
        function getReserves() external view returns (uint256 reserve0, uint256 reserve1, uint32 blockTimestampLast);
        function totalSupply() external view returns (uint256);
    }
}
