//! Position state.

use {
    crate::{math, state::perpetuals::Perpetuals},
    anchor_lang::prelude::*,
};

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Debug)]
pub enum Side {
    None,
    Long,
    Short,
}

impl Default for Side {
    fn default() -> Self {
        Self::None
    }
}

/// Margin classification of an open position against the liquidation floor.
#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Debug)]
pub enum LiquidationState {
    /// Margin above the floor plus the liquidation buffer.
    None,
    /// Margin inside the liquidation buffer.
    CanBeLiquidated,
    /// Margin below the floor.
    MustBeLiquidated,
}

impl Default for LiquidationState {
    fn default() -> Self {
        Self::None
    }
}

#[account]
#[derive(Default, Debug)]
pub struct Position {
    pub owner: Pubkey,
    pub pool: Pubkey,
    pub custody: Pubkey,
    pub collateral_custody: Pubkey,

    pub open_time: i64,
    pub update_time: i64,

    pub side: Side,
    // payoff exponent; 1 is a linear perp, 2 trades the squared price, etc.
    pub power: u8,
    pub price: u64,
    pub size_usd: u64,
    pub collateral_usd: u64,
    pub unrealized_profit_usd: u64,
    pub unrealized_loss_usd: u64,
    pub cumulative_interest_snapshot: u128,
    pub locked_amount: u64,
    pub collateral_amount: u64,

    pub bump: u8,
}

impl Position {
    pub const LEN: usize = 8 + std::mem::size_of::<Position>();

    /// Leverage at entry in bps, before fees and price movement.
    pub fn get_initial_leverage(&self) -> Result<u64> {
        math::checked_as_u64(math::checked_div(
            math::checked_mul(self.size_usd as u128, Perpetuals::BPS_POWER)?,
            self.collateral_usd as u128,
        )?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_initial_leverage() {
        let position = Position {
            size_usd: 100_000_000000,
            collateral_usd: 25_000_000000,
            ..Position::default()
        };
        // 4x
        assert_eq!(position.get_initial_leverage().unwrap(), 40_000);

        let no_collateral = Position {
            size_usd: 100_000_000000,
            ..Position::default()
        };
        assert!(no_collateral.get_initial_leverage().is_err());
    }
}
