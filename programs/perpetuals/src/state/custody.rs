//! Per-asset custody state: configuration, balances, borrow rate, and
//! per-side position aggregates.

use {
    crate::{
        error::PerpetualsError,
        math,
        state::{
            oracle::{OracleParams, OracleType},
            perpetuals::{Permissions, Perpetuals},
            position::{Position, Side},
        },
    },
    anchor_lang::prelude::*,
};

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Debug)]
pub enum FeesMode {
    Fixed,
    Linear,
    Optimal,
}

impl Default for FeesMode {
    fn default() -> Self {
        Self::Linear
    }
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct Fees {
    pub mode: FeesMode,
    // fees have implied BPS_DECIMALS decimals
    pub ratio_mult: u64,
    pub utilization_mult: u64,
    pub swap_in: u64,
    pub swap_out: u64,
    pub stable_swap_in: u64,
    pub stable_swap_out: u64,
    pub add_liquidity: u64,
    pub remove_liquidity: u64,
    pub open_position: u64,
    pub close_position: u64,
    pub liquidation: u64,
    pub protocol_share: u64,
    // Optimal mode coefficients
    pub fee_max: u64,
    pub fee_optimal: u64,
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct FeesStats {
    pub swap_usd: u64,
    pub add_liquidity_usd: u64,
    pub remove_liquidity_usd: u64,
    pub open_position_usd: u64,
    pub close_position_usd: u64,
    pub liquidation_usd: u64,
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct VolumeStats {
    pub swap_usd: u64,
    pub add_liquidity_usd: u64,
    pub remove_liquidity_usd: u64,
    pub open_position_usd: u64,
    pub close_position_usd: u64,
    pub liquidation_usd: u64,
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct TradeStats {
    pub profit_usd: u64,
    pub loss_usd: u64,
    // open interest
    pub oi_long_usd: u64,
    pub oi_short_usd: u64,
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct Assets {
    // backed by deposited user collateral
    pub collateral: u64,
    // fees reserved for the protocol
    pub protocol_fees: u64,
    // owned = total_assets - collateral - protocol_fees
    pub owned: u64,
    // funds reserved to pay out position profits
    pub locked: u64,
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct PricingParams {
    pub use_ema: bool,
    pub use_unrealized_pnl_in_aum: bool,
    // pricing params have implied BPS_DECIMALS decimals
    pub trade_spread_long: u64,
    pub trade_spread_short: u64,
    pub swap_spread: u64,
    pub min_initial_leverage: u64,
    pub max_initial_leverage: u64,
    pub max_leverage: u64,
    // margin floor and the buffer above it where liquidation turns optional
    pub min_collateral_bps: u64,
    pub liquidation_fee_bps: u64,
    // bounds the payout the pool can owe, as a multiple of position size
    pub max_payoff_mult: u64,
    // max_utilization has implied RATE_DECIMALS decimals
    pub max_utilization: u64,
    pub max_position_locked_usd: u64,
    pub max_total_locked_usd: u64,
}

/// Kinked utilization curve parameters, all at implied RATE_DECIMALS.
#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct BorrowRateParams {
    pub base_rate: u64,
    pub slope1: u64,
    pub slope2: u64,
    pub optimal_utilization: u64,
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct BorrowRateState {
    // per-second rate at implied RATE_DECIMALS
    pub current_rate: u64,
    pub cumulative_interest: u128,
    pub last_update: i64,
}

/// Running aggregates over one side's open positions.
#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct PositionStats {
    pub open_positions: u64,
    pub collateral_usd: u64,
    pub size_usd: u64,
    pub locked_amount: u64,
    // size-weighted entry price accumulator
    pub weighted_price: u128,
    pub total_quantity: u128,
    pub cumulative_interest_usd: u64,
    pub cumulative_interest_snapshot: u128,
}

#[account]
#[derive(Default, Debug)]
pub struct Custody {
    pub pool: Pubkey,
    pub mint: Pubkey,
    pub token_account: Pubkey,
    pub decimals: u8,
    pub is_stable: bool,
    pub is_virtual: bool,
    pub oracle: OracleParams,
    pub pricing: PricingParams,
    pub permissions: Permissions,
    pub fees: Fees,
    pub borrow_rate: BorrowRateParams,
    pub borrow_rate_state: BorrowRateState,

    pub assets: Assets,
    pub collected_fees: FeesStats,
    pub volume_stats: VolumeStats,
    pub trade_stats: TradeStats,

    pub long_positions: PositionStats,
    pub short_positions: PositionStats,

    pub bump: u8,
    pub token_account_bump: u8,
}

impl Fees {
    pub fn validate(&self) -> bool {
        self.swap_in as u128 <= Perpetuals::BPS_POWER
            && self.swap_out as u128 <= Perpetuals::BPS_POWER
            && self.stable_swap_in as u128 <= Perpetuals::BPS_POWER
            && self.stable_swap_out as u128 <= Perpetuals::BPS_POWER
            && self.add_liquidity as u128 <= Perpetuals::BPS_POWER
            && self.remove_liquidity as u128 <= Perpetuals::BPS_POWER
            && self.open_position as u128 <= Perpetuals::BPS_POWER
            && self.close_position as u128 <= Perpetuals::BPS_POWER
            && self.liquidation as u128 <= Perpetuals::BPS_POWER
            && self.protocol_share as u128 <= Perpetuals::BPS_POWER
    }
}

impl PricingParams {
    pub fn validate(&self) -> bool {
        self.min_initial_leverage <= self.max_initial_leverage
            && self.max_initial_leverage <= self.max_leverage
            && (self.trade_spread_long as u128) < Perpetuals::BPS_POWER
            && (self.trade_spread_short as u128) < Perpetuals::BPS_POWER
            && (self.swap_spread as u128) < Perpetuals::BPS_POWER
            && (self.min_collateral_bps.saturating_add(self.liquidation_fee_bps) as u128)
                < Perpetuals::BPS_POWER
            && self.max_payoff_mult > 0
            && (self.max_utilization as u128) <= Perpetuals::RATE_POWER
    }
}

impl BorrowRateParams {
    pub fn validate(&self) -> bool {
        self.optimal_utilization as u128 <= Perpetuals::RATE_POWER
    }
}

impl Custody {
    pub const LEN: usize = 8 + std::mem::size_of::<Custody>();

    pub fn validate(&self) -> bool {
        self.token_account != Pubkey::default()
            && self.mint != Pubkey::default()
            && (self.is_virtual || self.oracle.oracle_type != OracleType::None)
            && self.pricing.validate()
            && self.fees.validate()
            && self.borrow_rate.validate()
    }

    /// Tokens to reserve against the position's maximum payout.
    pub fn get_locked_amount(&self, size: u64) -> Result<u64> {
        math::checked_mul_div(
            size,
            self.pricing.max_payoff_mult,
            Perpetuals::BPS_POWER as u64,
        )
    }

    pub fn lock_funds(&mut self, amount: u64) -> Result<()> {
        self.assets.locked = math::checked_add(self.assets.locked, amount)?;

        if self.pricing.max_utilization > 0
            && (self.pricing.max_utilization as u128) < Perpetuals::RATE_POWER
            && self.assets.owned > 0
        {
            let utilization = math::checked_div(
                math::checked_mul(self.assets.locked as u128, Perpetuals::RATE_POWER)?,
                self.assets.owned as u128,
            )?;
            require!(
                utilization <= self.pricing.max_utilization as u128,
                PerpetualsError::MaxUtilization
            );
        }

        if self.assets.owned < self.assets.locked {
            err!(PerpetualsError::CustodyAmountLimit)
        } else {
            Ok(())
        }
    }

    pub fn unlock_funds(&mut self, amount: u64) -> Result<()> {
        if amount > self.assets.locked {
            self.assets.locked = 0;
        } else {
            self.assets.locked = math::checked_sub(self.assets.locked, amount)?;
        }
        Ok(())
    }

    /// Interest owed by the position since its snapshot, in USD.
    pub fn get_interest_amount_usd(&self, position: &Position, curtime: i64) -> Result<u64> {
        if position.size_usd == 0 {
            return Ok(0);
        }
        let cumulative_interest = self.get_cumulative_interest(curtime)?;
        let position_interest =
            cumulative_interest.saturating_sub(position.cumulative_interest_snapshot);
        math::checked_as_u64(math::checked_div(
            math::checked_mul(position_interest, position.size_usd as u128)?,
            Perpetuals::RATE_POWER,
        )?)
    }

    pub fn get_cumulative_interest(&self, curtime: i64) -> Result<u128> {
        if curtime > self.borrow_rate_state.last_update {
            let time_diff = math::checked_sub(curtime, self.borrow_rate_state.last_update)? as u128;
            math::checked_add(
                self.borrow_rate_state.cumulative_interest,
                math::checked_mul(self.borrow_rate_state.current_rate as u128, time_diff)?,
            )
        } else {
            Ok(self.borrow_rate_state.cumulative_interest)
        }
    }

    /// Accrues interest at the rate in effect since the last update, then
    /// recomputes the rate from the kinked utilization curve. Must run before
    /// any open, close, or liquidation touching this custody.
    pub fn update_borrow_rate(&mut self, curtime: i64) -> Result<()> {
        if curtime > self.borrow_rate_state.last_update {
            self.borrow_rate_state.cumulative_interest = self.get_cumulative_interest(curtime)?;
            self.borrow_rate_state.last_update = curtime;
        }

        let utilization = if self.assets.owned > 0 {
            math::checked_div(
                math::checked_mul(self.assets.locked as u128, Perpetuals::RATE_POWER)?,
                self.assets.owned as u128,
            )?
        } else {
            0
        };

        let optimal = self.borrow_rate.optimal_utilization as u128;
        let rate = if utilization < optimal || optimal >= Perpetuals::RATE_POWER {
            // rate = base + slope1 * u / u*
            math::checked_add(
                self.borrow_rate.base_rate as u128,
                math::checked_div(
                    math::checked_mul(self.borrow_rate.slope1 as u128, utilization)?,
                    optimal,
                )?,
            )?
        } else {
            // rate = base + slope1 + slope2 * (u - u*) / (1 - u*)
            math::checked_add(
                math::checked_add(
                    self.borrow_rate.base_rate as u128,
                    self.borrow_rate.slope1 as u128,
                )?,
                math::checked_div(
                    math::checked_mul(
                        self.borrow_rate.slope2 as u128,
                        math::checked_sub(utilization, optimal)?,
                    )?,
                    math::checked_sub(Perpetuals::RATE_POWER, optimal)?,
                )?,
            )?
        };
        self.borrow_rate_state.current_rate = math::checked_as_u64(rate)?;

        Ok(())
    }

    /// Folds a newly opened position into the side aggregates. For shorts the
    /// interest snapshot follows the collateral custody's borrow state.
    pub fn add_position_stats(
        &mut self,
        position: &Position,
        collateral_custody: Option<&Custody>,
        curtime: i64,
    ) -> Result<()> {
        let cumulative_interest = match collateral_custody {
            Some(collateral_custody) => collateral_custody.get_cumulative_interest(curtime)?,
            None => self.get_cumulative_interest(curtime)?,
        };

        let stats = if position.side == Side::Long {
            &mut self.long_positions
        } else {
            &mut self.short_positions
        };
        Self::roll_aggregate_interest(stats, cumulative_interest)?;

        stats.open_positions = math::checked_add(stats.open_positions, 1)?;
        stats.collateral_usd = math::checked_add(stats.collateral_usd, position.collateral_usd)?;
        stats.size_usd = math::checked_add(stats.size_usd, position.size_usd)?;
        stats.locked_amount = math::checked_add(stats.locked_amount, position.locked_amount)?;
        stats.weighted_price = math::checked_add(
            stats.weighted_price,
            math::checked_mul(position.price as u128, position.size_usd as u128)?,
        )?;
        stats.total_quantity =
            math::checked_add(stats.total_quantity, position.size_usd as u128)?;

        Ok(())
    }

    /// Removes a closed position (or the closed slice of one) from the side
    /// aggregates. Pass the amounts actually being closed.
    pub fn remove_position_stats(
        &mut self,
        position: &Position,
        collateral_custody: Option<&Custody>,
        curtime: i64,
    ) -> Result<()> {
        let cumulative_interest = match collateral_custody {
            Some(collateral_custody) => collateral_custody.get_cumulative_interest(curtime)?,
            None => self.get_cumulative_interest(curtime)?,
        };
        let position_interest = math::checked_as_u64(math::checked_div(
            math::checked_mul(
                cumulative_interest.saturating_sub(position.cumulative_interest_snapshot),
                position.size_usd as u128,
            )?,
            Perpetuals::RATE_POWER,
        )?)?;

        let stats = if position.side == Side::Long {
            &mut self.long_positions
        } else {
            &mut self.short_positions
        };
        Self::roll_aggregate_interest(stats, cumulative_interest)?;

        stats.open_positions = math::checked_sub(stats.open_positions, 1)?;
        if stats.open_positions == 0 {
            *stats = PositionStats {
                cumulative_interest_snapshot: cumulative_interest,
                ..PositionStats::default()
            };
            return Ok(());
        }

        stats.collateral_usd = math::checked_sub(stats.collateral_usd, position.collateral_usd)?;
        stats.size_usd = math::checked_sub(stats.size_usd, position.size_usd)?;
        stats.locked_amount = math::checked_sub(stats.locked_amount, position.locked_amount)?;
        stats.weighted_price = math::checked_sub(
            stats.weighted_price,
            math::checked_mul(position.price as u128, position.size_usd as u128)?,
        )?;
        stats.total_quantity =
            math::checked_sub(stats.total_quantity, position.size_usd as u128)?;
        stats.cumulative_interest_usd =
            stats.cumulative_interest_usd.saturating_sub(position_interest);

        Ok(())
    }

    /// Synthetic position standing in for one side's aggregate exposure.
    /// Linear payoff; used only for pool-level unrealized PnL estimates.
    pub fn get_collective_position(&self, side: Side) -> Result<Position> {
        let stats = if side == Side::Long {
            &self.long_positions
        } else {
            &self.short_positions
        };
        if stats.open_positions == 0 {
            return Ok(Position::default());
        }

        Ok(Position {
            side,
            power: 1,
            price: math::checked_as_u64(math::checked_div(
                stats.weighted_price,
                stats.total_quantity,
            )?)?,
            size_usd: stats.size_usd,
            collateral_usd: stats.collateral_usd,
            unrealized_loss_usd: stats.cumulative_interest_usd,
            cumulative_interest_snapshot: stats.cumulative_interest_snapshot,
            locked_amount: stats.locked_amount,
            ..Position::default()
        })
    }

    fn roll_aggregate_interest(stats: &mut PositionStats, cumulative_interest: u128) -> Result<()> {
        if stats.size_usd > 0 && cumulative_interest > stats.cumulative_interest_snapshot {
            let accrued = math::checked_as_u64(math::checked_div(
                math::checked_mul(
                    math::checked_sub(cumulative_interest, stats.cumulative_interest_snapshot)?,
                    stats.size_usd as u128,
                )?,
                Perpetuals::RATE_POWER,
            )?)?;
            stats.cumulative_interest_usd =
                math::checked_add(stats.cumulative_interest_usd, accrued)?;
        }
        stats.cumulative_interest_snapshot = cumulative_interest;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn get_custody() -> Custody {
        Custody {
            decimals: 9,
            pricing: PricingParams {
                max_payoff_mult: 10_000,
                max_utilization: 0,
                ..PricingParams::default()
            },
            borrow_rate: BorrowRateParams {
                base_rate: 5_000_000,
                slope1: 10_000_000,
                slope2: 50_000_000,
                optimal_utilization: 500_000_000,
            },
            ..Custody::default()
        }
    }

    #[test]
    fn test_borrow_rate_below_kink() {
        let mut custody = get_custody();
        custody.assets.owned = 1_000;
        custody.assets.locked = 250;
        custody.update_borrow_rate(10).unwrap();
        // base + slope1 * 0.25 / 0.5
        assert_eq!(custody.borrow_rate_state.current_rate, 10_000_000);
    }

    #[test]
    fn test_borrow_rate_above_kink() {
        let mut custody = get_custody();
        custody.assets.owned = 1_000;
        custody.assets.locked = 750;
        custody.update_borrow_rate(10).unwrap();
        // base + slope1 + slope2 * 0.25 / 0.5
        assert_eq!(custody.borrow_rate_state.current_rate, 40_000_000);
    }

    #[test]
    fn test_borrow_rate_at_kink_is_continuous() {
        let mut custody = get_custody();
        custody.assets.owned = 1_000;
        custody.assets.locked = 500;
        custody.update_borrow_rate(10).unwrap();
        assert_eq!(custody.borrow_rate_state.current_rate, 15_000_000);
    }

    #[test]
    fn test_cumulative_interest_accrual() {
        let mut custody = get_custody();
        custody.borrow_rate_state.current_rate = 10_000_000;
        custody.borrow_rate_state.last_update = 100;

        assert_eq!(custody.get_cumulative_interest(100).unwrap(), 0);
        assert_eq!(custody.get_cumulative_interest(160).unwrap(), 600_000_000);

        custody.update_borrow_rate(160).unwrap();
        assert_eq!(custody.borrow_rate_state.cumulative_interest, 600_000_000);
        assert_eq!(custody.borrow_rate_state.last_update, 160);

        // delta t of zero changes nothing
        let before = custody.borrow_rate_state;
        custody.update_borrow_rate(160).unwrap();
        assert_eq!(custody.borrow_rate_state, before);
    }

    #[test]
    fn test_cumulative_interest_monotone() {
        let mut custody = get_custody();
        custody.assets.owned = 1_000;
        custody.assets.locked = 900;
        let mut prev = 0u128;
        for t in [10i64, 20, 50, 51, 400] {
            custody.update_borrow_rate(t).unwrap();
            assert!(custody.borrow_rate_state.cumulative_interest >= prev);
            prev = custody.borrow_rate_state.cumulative_interest;
        }
    }

    #[test]
    fn test_position_interest() {
        let mut custody = get_custody();
        custody.borrow_rate_state.current_rate = 10_000_000; // 0.01/s
        custody.borrow_rate_state.last_update = 0;

        let position = Position {
            size_usd: 1_000_000000,
            cumulative_interest_snapshot: 0,
            ..Position::default()
        };
        // 100s at 0.01/s = 1.0 rate units on $1000
        assert_eq!(
            custody.get_interest_amount_usd(&position, 100).unwrap(),
            1_000_000000
        );
        assert_eq!(custody.get_interest_amount_usd(&position, 0).unwrap(), 0);
    }

    #[test]
    fn test_lock_unlock_funds() {
        let mut custody = get_custody();
        custody.assets.owned = 1_000;

        custody.lock_funds(600).unwrap();
        assert_eq!(custody.assets.locked, 600);
        // exceeding owned fails
        assert!(custody.lock_funds(500).is_err());

        custody.unlock_funds(400).unwrap();
        assert_eq!(custody.assets.locked, 700);
        // unlock saturates at zero
        custody.unlock_funds(10_000).unwrap();
        assert_eq!(custody.assets.locked, 0);
    }

    #[test]
    fn test_lock_funds_max_utilization() {
        let mut custody = get_custody();
        custody.assets.owned = 1_000;
        custody.pricing.max_utilization = 500_000_000; // 50%

        custody.lock_funds(500).unwrap();
        assert!(custody.lock_funds(1).is_err());
    }

    #[test]
    fn test_get_locked_amount() {
        let mut custody = get_custody();
        custody.pricing.max_payoff_mult = 10_000;
        assert_eq!(custody.get_locked_amount(123_456).unwrap(), 123_456);
        custody.pricing.max_payoff_mult = 25_000;
        assert_eq!(custody.get_locked_amount(1_000).unwrap(), 2_500);
    }

    #[test]
    fn test_position_stats_aggregation() {
        let mut custody = get_custody();

        let position1 = Position {
            side: Side::Long,
            price: 100_000000,
            size_usd: 1_000_000000,
            collateral_usd: 500_000000,
            locked_amount: 10,
            ..Position::default()
        };
        let position2 = Position {
            side: Side::Long,
            price: 200_000000,
            size_usd: 3_000_000000,
            collateral_usd: 1_000_000000,
            locked_amount: 30,
            ..Position::default()
        };

        custody.add_position_stats(&position1, None, 0).unwrap();
        custody.add_position_stats(&position2, None, 0).unwrap();
        assert_eq!(custody.long_positions.open_positions, 2);
        assert_eq!(custody.long_positions.size_usd, 4_000_000000);
        assert_eq!(custody.long_positions.locked_amount, 40);

        // collective entry price is size weighted: (100*1000 + 200*3000) / 4000
        let collective = custody.get_collective_position(Side::Long).unwrap();
        assert_eq!(collective.price, 175_000000);
        assert_eq!(collective.size_usd, 4_000_000000);
        assert_eq!(collective.power, 1);

        custody.remove_position_stats(&position2, None, 0).unwrap();
        assert_eq!(custody.long_positions.open_positions, 1);
        assert_eq!(custody.long_positions.size_usd, 1_000_000000);
        let collective = custody.get_collective_position(Side::Long).unwrap();
        assert_eq!(collective.price, 100_000000);

        custody.remove_position_stats(&position1, None, 0).unwrap();
        assert_eq!(custody.long_positions.open_positions, 0);
        assert_eq!(custody.long_positions.size_usd, 0);
        let collective = custody.get_collective_position(Side::Long).unwrap();
        assert_eq!(collective.size_usd, 0);
        assert_eq!(collective.price, 0);

        // short side untouched
        assert_eq!(custody.short_positions.open_positions, 0);
    }
}
