//! Pool state: pricing, fees, PnL, leverage and liquidation checks over a
//! set of custodies.

use {
    crate::{
        error::PerpetualsError,
        math,
        state::{
            custody::{Custody, FeesMode},
            oracle::OraclePrice,
            perpetuals::Perpetuals,
            position::{LiquidationState, Position, Side},
        },
    },
    anchor_lang::prelude::*,
    std::cmp::Ordering,
};

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Debug)]
pub enum AumCalcMode {
    Min,
    Max,
    Last,
    EMA,
}

/// Per-custody share bounds of the pool's AUM, in bps.
#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct TokenRatios {
    pub target: u64,
    pub min: u64,
    pub max: u64,
}

#[account]
#[derive(Default, Debug)]
pub struct Pool {
    pub name: String,
    pub custodies: Vec<Pubkey>,
    // parallel to custodies
    pub ratios: Vec<TokenRatios>,
    pub aum_usd: u128,

    pub bump: u8,
    pub lp_token_bump: u8,
    pub inception_time: i64,
}

impl TokenRatios {
    pub fn validate(&self) -> bool {
        (self.target as u128) <= Perpetuals::BPS_POWER
            && (self.min as u128) <= Perpetuals::BPS_POWER
            && (self.max as u128) <= Perpetuals::BPS_POWER
            && self.min <= self.target
            && self.target <= self.max
    }
}

/// All returned prices are scaled to PRICE_DECIMALS. All returned amounts are
/// scaled to corresponding custody decimals.
impl Pool {
    pub const LEN: usize = 8 + 64 + std::mem::size_of::<Pool>();
    pub const MAX_CUSTODIES: usize = 8;

    const LIQUIDATION_PRICE_ITERATIONS: u32 = 64;

    pub fn validate(&self) -> bool {
        for ratio in &self.ratios {
            if !ratio.validate() {
                return false;
            }
        }

        // target ratios must add up to 1
        if !self.ratios.is_empty()
            && self
                .ratios
                .iter()
                .map(|&x| (x.target as u128))
                .sum::<u128>()
                != Perpetuals::BPS_POWER
        {
            return false;
        }

        for i in 1..self.custodies.len() {
            if self.custodies[i..].contains(&self.custodies[i - 1]) {
                return false;
            }
        }

        !self.name.is_empty()
            && self.name.len() <= 64
            && self.custodies.len() <= Self::MAX_CUSTODIES
            && self.custodies.len() == self.ratios.len()
    }

    pub fn get_token_id(&self, custody: &Pubkey) -> Result<usize> {
        self.custodies
            .iter()
            .position(|&k| k == *custody)
            .ok_or_else(|| PerpetualsError::UnsupportedToken.into())
    }

    pub fn get_entry_price(
        &self,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        side: Side,
        custody: &Custody,
    ) -> Result<u64> {
        let price = self.get_price(
            token_price,
            token_ema_price,
            side,
            if side == Side::Long {
                custody.pricing.trade_spread_long
            } else {
                custody.pricing.trade_spread_short
            },
        )?;
        require_gt!(price.price, 0, PerpetualsError::MaxPriceSlippage);

        Ok(price
            .scale_to_exponent(-(Perpetuals::PRICE_DECIMALS as i32))?
            .price)
    }

    pub fn get_exit_price(
        &self,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        side: Side,
        custody: &Custody,
    ) -> Result<u64> {
        let price = self.get_price(
            token_price,
            token_ema_price,
            if side == Side::Long {
                Side::Short
            } else {
                Side::Long
            },
            if side == Side::Long {
                custody.pricing.trade_spread_long
            } else {
                custody.pricing.trade_spread_short
            },
        )?;

        Ok(price
            .scale_to_exponent(-(Perpetuals::PRICE_DECIMALS as i32))?
            .price)
    }

    /// Entry fee with a utilization surcharge once the lock pushes the
    /// custody past its optimal utilization.
    pub fn get_entry_fee(
        &self,
        base_fee: u64,
        size: u64,
        locked_amount: u64,
        collateral_custody: &Custody,
    ) -> Result<u64> {
        let mut size_fee = Self::get_fee_amount(base_fee, size)?;

        let new_utilization = if collateral_custody.assets.owned > 0 {
            std::cmp::min(
                Perpetuals::RATE_POWER,
                math::checked_div(
                    math::checked_mul(
                        math::checked_add(collateral_custody.assets.locked, locked_amount)? as u128,
                        Perpetuals::RATE_POWER,
                    )?,
                    collateral_custody.assets.owned as u128,
                )?,
            )
        } else {
            Perpetuals::RATE_POWER
        };

        if new_utilization > collateral_custody.borrow_rate.optimal_utilization as u128 {
            let utilization_fee = math::checked_add(
                Perpetuals::BPS_POWER,
                math::checked_div(
                    math::checked_mul(
                        collateral_custody.fees.utilization_mult as u128,
                        math::checked_sub(
                            new_utilization,
                            collateral_custody.borrow_rate.optimal_utilization as u128,
                        )?,
                    )?,
                    math::checked_sub(
                        Perpetuals::RATE_POWER,
                        collateral_custody.borrow_rate.optimal_utilization as u128,
                    )?,
                )?,
            )?;
            size_fee = math::checked_as_u64(math::checked_div(
                math::checked_mul(size_fee as u128, utilization_fee)?,
                Perpetuals::BPS_POWER,
            )?)?;
        }

        Ok(size_fee)
    }

    pub fn get_exit_fee(&self, size: u64, custody: &Custody) -> Result<u64> {
        Self::get_fee_amount(custody.fees.close_position, size)
    }

    pub fn get_liquidation_fee(&self, size: u64, custody: &Custody) -> Result<u64> {
        Self::get_fee_amount(custody.fees.liquidation, size)
    }

    /// Settlement amounts for closing the given position (or slice of one):
    /// (close_amount, fee_amount, profit_usd, loss_usd).
    #[allow(clippy::too_many_arguments)]
    pub fn get_close_amount(
        &self,
        position: &Position,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        custody: &Custody,
        collateral_token_price: &OraclePrice,
        collateral_token_ema_price: &OraclePrice,
        collateral_custody: &Custody,
        curtime: i64,
        liquidation: bool,
    ) -> Result<(u64, u64, u64, u64)> {
        let (profit_usd, loss_usd, fee_amount) = self.get_pnl_usd(
            position,
            token_price,
            token_ema_price,
            custody,
            collateral_token_price,
            collateral_token_ema_price,
            collateral_custody,
            curtime,
            liquidation,
        )?;

        let available_amount_usd = if profit_usd > 0 {
            math::checked_add(position.collateral_usd, profit_usd)?
        } else if loss_usd < position.collateral_usd {
            math::checked_sub(position.collateral_usd, loss_usd)?
        } else {
            0
        };

        // returned tokens are valued at the max collateral price so the
        // payout rounds down
        let max_collateral_price = if collateral_token_price > collateral_token_ema_price {
            collateral_token_price
        } else {
            collateral_token_ema_price
        };
        let close_amount = max_collateral_price
            .get_token_amount(available_amount_usd, collateral_custody.decimals)?;
        let max_amount = math::checked_add(
            position.locked_amount.saturating_sub(fee_amount),
            position.collateral_amount,
        )?;

        Ok((
            std::cmp::min(max_amount, close_amount),
            fee_amount,
            profit_usd,
            loss_usd,
        ))
    }

    pub fn get_swap_price(
        &self,
        token_in_price: &OraclePrice,
        token_in_ema_price: &OraclePrice,
        token_out_price: &OraclePrice,
        token_out_ema_price: &OraclePrice,
        custody_in: &Custody,
    ) -> Result<OraclePrice> {
        let min_price = if token_in_price < token_in_ema_price {
            token_in_price
        } else {
            token_in_ema_price
        };

        let max_price = if token_out_price > token_out_ema_price {
            token_out_price
        } else {
            token_out_ema_price
        };

        let pair_price = min_price.checked_div(max_price)?;

        self.get_price(
            &pair_price,
            &pair_price,
            Side::Short,
            custody_in.pricing.swap_spread,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_swap_amount(
        &self,
        token_in_price: &OraclePrice,
        token_in_ema_price: &OraclePrice,
        token_out_price: &OraclePrice,
        token_out_ema_price: &OraclePrice,
        custody_in: &Custody,
        custody_out: &Custody,
        amount_in: u64,
    ) -> Result<u64> {
        let swap_price = self.get_swap_price(
            token_in_price,
            token_in_ema_price,
            token_out_price,
            token_out_ema_price,
            custody_in,
        )?;

        math::checked_decimal_mul(
            amount_in,
            -(custody_in.decimals as i32),
            swap_price.price,
            swap_price.exponent,
            -(custody_out.decimals as i32),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_swap_fees(
        &self,
        token_id_in: usize,
        token_id_out: usize,
        amount_in: u64,
        amount_out: u64,
        custody_in: &Custody,
        token_price_in: &OraclePrice,
        custody_out: &Custody,
        token_price_out: &OraclePrice,
    ) -> Result<(u64, u64)> {
        let stable_swap = custody_in.is_stable && custody_out.is_stable;

        let swap_in_fee = self.get_fee(
            token_id_in,
            if stable_swap {
                custody_in.fees.stable_swap_in
            } else {
                custody_in.fees.swap_in
            },
            amount_in,
            0u64,
            custody_in,
            token_price_in,
        )?;

        let swap_out_fee = self.get_fee(
            token_id_out,
            if stable_swap {
                custody_out.fees.stable_swap_out
            } else {
                custody_out.fees.swap_out
            },
            0u64,
            amount_out,
            custody_out,
            token_price_out,
        )?;

        Ok((swap_in_fee, swap_out_fee))
    }

    pub fn get_add_liquidity_fee(
        &self,
        token_id: usize,
        amount: u64,
        custody: &Custody,
        token_price: &OraclePrice,
    ) -> Result<u64> {
        self.get_fee(
            token_id,
            custody.fees.add_liquidity,
            amount,
            0u64,
            custody,
            token_price,
        )
    }

    pub fn get_remove_liquidity_fee(
        &self,
        token_id: usize,
        amount: u64,
        custody: &Custody,
        token_price: &OraclePrice,
    ) -> Result<u64> {
        self.get_fee(
            token_id,
            custody.fees.remove_liquidity,
            0u64,
            amount,
            custody,
            token_price,
        )
    }

    /// An add or remove passes if it keeps the custody's ratio in bounds, or
    /// at least moves it toward the target.
    pub fn check_token_ratio(
        &self,
        token_id: usize,
        amount_add: u64,
        amount_remove: u64,
        custody: &Custody,
        token_price: &OraclePrice,
    ) -> Result<bool> {
        let new_ratio = self.get_new_ratio(amount_add, amount_remove, custody, token_price)?;

        if new_ratio < self.ratios[token_id].min {
            Ok(new_ratio >= self.get_current_ratio(custody, token_price)?)
        } else if new_ratio > self.ratios[token_id].max {
            Ok(new_ratio <= self.get_current_ratio(custody, token_price)?)
        } else {
            Ok(true)
        }
    }

    pub fn check_available_amount(&self, amount: u64, custody: &Custody) -> Result<bool> {
        let available_amount = math::checked_sub(
            math::checked_add(custody.assets.owned, custody.assets.collateral)?,
            custody.assets.locked,
        )?;
        Ok(available_amount >= amount)
    }

    /// Current leverage in bps, with unrealized PnL counted into the margin.
    #[allow(clippy::too_many_arguments)]
    pub fn get_leverage(
        &self,
        position: &Position,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        custody: &Custody,
        collateral_token_price: &OraclePrice,
        collateral_token_ema_price: &OraclePrice,
        collateral_custody: &Custody,
        curtime: i64,
    ) -> Result<u64> {
        let (profit_usd, loss_usd, _) = self.get_pnl_usd(
            position,
            token_price,
            token_ema_price,
            custody,
            collateral_token_price,
            collateral_token_ema_price,
            collateral_custody,
            curtime,
            false,
        )?;

        let current_margin_usd = if profit_usd > 0 {
            math::checked_add(position.collateral_usd, profit_usd)?
        } else if loss_usd <= position.collateral_usd {
            math::checked_sub(position.collateral_usd, loss_usd)?
        } else {
            0
        };

        if current_margin_usd > 0 {
            math::checked_as_u64(math::checked_div(
                math::checked_mul(position.size_usd as u128, Perpetuals::BPS_POWER)?,
                current_margin_usd as u128,
            )?)
        } else {
            Ok(u64::MAX)
        }
    }

    /// Leverage caps for the payoff exponent, min'ed with the custody
    /// defaults. Higher exponents amplify price moves, so the caps tighten
    /// accordingly: (max_initial_leverage, max_leverage) in bps.
    pub fn get_power_leverage_limits(&self, power: u8, custody: &Custody) -> Result<(u64, u64)> {
        let (power_max_initial, power_max) = match power {
            1 => (u64::MAX, u64::MAX),
            2 => (200_000, 400_000),
            3 => (100_000, 200_000),
            4 => (50_000, 100_000),
            5 => (30_000, 60_000),
            _ => return err!(PerpetualsError::InvalidPositionPower),
        };
        Ok((
            std::cmp::min(custody.pricing.max_initial_leverage, power_max_initial),
            std::cmp::min(custody.pricing.max_leverage, power_max),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn check_leverage(
        &self,
        position: &Position,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        custody: &Custody,
        collateral_token_price: &OraclePrice,
        collateral_token_ema_price: &OraclePrice,
        collateral_custody: &Custody,
        curtime: i64,
        initial: bool,
    ) -> Result<bool> {
        let (max_initial_leverage, max_leverage) =
            self.get_power_leverage_limits(position.power, custody)?;

        let current_leverage = self.get_leverage(
            position,
            token_price,
            token_ema_price,
            custody,
            collateral_token_price,
            collateral_token_ema_price,
            collateral_custody,
            curtime,
        )?;
        if current_leverage > max_leverage {
            return Ok(false);
        }

        if initial {
            // entry bounds are checked on the raw size/collateral ratio
            let initial_leverage = position.get_initial_leverage()?;
            if initial_leverage < custody.pricing.min_initial_leverage
                || initial_leverage > max_initial_leverage
            {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Classifies the position's margin against the liquidation floor. The
    /// exit fee and accrued interest are already folded into the loss side.
    #[allow(clippy::too_many_arguments)]
    pub fn get_liquidation_state(
        &self,
        position: &Position,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        custody: &Custody,
        collateral_token_price: &OraclePrice,
        collateral_token_ema_price: &OraclePrice,
        collateral_custody: &Custody,
        curtime: i64,
    ) -> Result<LiquidationState> {
        if position.size_usd == 0 {
            return Ok(LiquidationState::None);
        }

        let (profit_usd, loss_usd, _) = self.get_pnl_usd(
            position,
            token_price,
            token_ema_price,
            custody,
            collateral_token_price,
            collateral_token_ema_price,
            collateral_custody,
            curtime,
            true,
        )?;

        let remaining_collateral_usd = math::checked_add(position.collateral_usd, profit_usd)?
            .saturating_sub(loss_usd);
        let margin_bps = math::checked_as_u64(math::checked_div(
            math::checked_mul(remaining_collateral_usd as u128, Perpetuals::BPS_POWER)?,
            position.size_usd as u128,
        )?)?;

        let min_collateral_bps = custody.pricing.min_collateral_bps;
        let liquidation_bps =
            math::checked_add(min_collateral_bps, custody.pricing.liquidation_fee_bps)?;

        if margin_bps >= liquidation_bps {
            Ok(LiquidationState::None)
        } else if margin_bps >= min_collateral_bps {
            Ok(LiquidationState::CanBeLiquidated)
        } else {
            Ok(LiquidationState::MustBeLiquidated)
        }
    }

    /// Price at which the position's margin hits the liquidation floor.
    ///
    /// The power payoff makes the margin non-linear in price, so the root is
    /// found by bisection over a monotone bracket instead of in closed form.
    /// Returns (price, approximate); approximate is set when the root lies
    /// outside the bracket and the nearest endpoint is returned instead.
    pub fn get_liquidation_price(
        &self,
        position: &Position,
        token_ema_price: &OraclePrice,
        custody: &Custody,
        collateral_custody: &Custody,
        curtime: i64,
    ) -> Result<(u64, bool)> {
        if position.size_usd == 0 || position.price == 0 {
            return Ok((0, false));
        }

        // price independent carrying costs
        let size = token_ema_price.get_token_amount(position.size_usd, custody.decimals)?;
        let exit_fee_tokens = self.get_exit_fee(size, custody)?;
        let exit_fee_usd =
            token_ema_price.get_asset_amount_usd(exit_fee_tokens, custody.decimals)?;
        let interest_usd = collateral_custody.get_interest_amount_usd(position, curtime)?;
        let fixed_loss_usd = math::checked_add(
            math::checked_add(exit_fee_usd, interest_usd)?,
            position.unrealized_loss_usd,
        )?;

        let threshold_bps = math::checked_add(
            custody.pricing.min_collateral_bps,
            custody.pricing.liquidation_fee_bps,
        )? as u128;

        // longs get liquidated by falling prices, shorts by rising prices
        let (mut low, mut high) = if position.side == Side::Long {
            (1u64, math::checked_mul(position.price, 10)?)
        } else {
            (position.price, math::checked_mul(position.price, 10)?)
        };

        let safe_low = Self::is_margin_above(position, low, fixed_loss_usd, threshold_bps)?;
        let safe_high = Self::is_margin_above(position, high, fixed_loss_usd, threshold_bps)?;
        if safe_low == safe_high {
            // no sign change inside the bracket; settle for the endpoint
            // nearest to the root
            return if position.side == Side::Long {
                Ok((if safe_low { low } else { high }, true))
            } else {
                Ok((if safe_low { high } else { low }, true))
            };
        }

        let mut iterations = 0u32;
        while math::checked_sub(high, low)? > 1
            && iterations < Self::LIQUIDATION_PRICE_ITERATIONS
        {
            let mid = math::checked_add(low, math::checked_div(math::checked_sub(high, low)?, 2)?)?;
            let safe_mid = Self::is_margin_above(position, mid, fixed_loss_usd, threshold_bps)?;
            // keep the sign change inside [low, high]
            if safe_mid == safe_low {
                low = mid;
            } else {
                high = mid;
            }
            iterations = math::checked_add(iterations, 1)?;
        }

        Ok((high, math::checked_sub(high, low)? > 1))
    }

    /// Profit and loss of the position at current prices, in USD.
    ///
    /// The loss side carries the exit (or liquidation) fee, accrued borrow
    /// interest, and any unrealized loss rolled into the position; profit is
    /// capped at the value of the locked amount, which is all the pool ever
    /// pays out. Returns (profit_usd, loss_usd, fee_amount in tokens).
    #[allow(clippy::too_many_arguments)]
    pub fn get_pnl_usd(
        &self,
        position: &Position,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        custody: &Custody,
        collateral_token_price: &OraclePrice,
        collateral_token_ema_price: &OraclePrice,
        collateral_custody: &Custody,
        curtime: i64,
        liquidation: bool,
    ) -> Result<(u64, u64, u64)> {
        if position.size_usd == 0 || position.price == 0 {
            return Ok((0, 0, 0));
        }

        let exit_price =
            self.get_exit_price(token_price, token_ema_price, position.side, custody)?;

        let size = token_ema_price.get_token_amount(position.size_usd, custody.decimals)?;

        let exit_fee = if liquidation {
            self.get_liquidation_fee(size, custody)?
        } else {
            self.get_exit_fee(size, custody)?
        };

        let exit_fee_usd = token_ema_price.get_asset_amount_usd(exit_fee, custody.decimals)?;
        let interest_usd = collateral_custody.get_interest_amount_usd(position, curtime)?;

        let (price_profit_usd, price_loss_usd) = if position.side == Side::Long {
            math::calc_power_pnl(exit_price, position.price, position.size_usd, position.power)?
        } else {
            math::calc_power_pnl(position.price, exit_price, position.size_usd, position.power)?
        };

        let potential_profit_usd =
            math::checked_add(price_profit_usd, position.unrealized_profit_usd)?;
        let potential_loss_usd = math::checked_add(
            price_loss_usd,
            math::checked_add(
                math::checked_add(exit_fee_usd, interest_usd)?,
                position.unrealized_loss_usd,
            )?,
        )?;

        if potential_profit_usd >= potential_loss_usd {
            let cur_profit_usd = math::checked_sub(potential_profit_usd, potential_loss_usd)?;

            let min_collateral_price = if collateral_custody.is_virtual {
                // pool level aggregation values stable collateral at par
                OraclePrice {
                    price: 10u64.pow(Perpetuals::USD_DECIMALS as u32),
                    exponent: -(Perpetuals::USD_DECIMALS as i32),
                }
            } else {
                collateral_token_price
                    .get_min_price(collateral_token_ema_price, collateral_custody.is_stable)?
            };
            let max_profit_usd = if curtime <= position.open_time {
                0
            } else {
                min_collateral_price
                    .get_asset_amount_usd(position.locked_amount, collateral_custody.decimals)?
            };

            Ok((
                std::cmp::min(max_profit_usd, cur_profit_usd),
                0u64,
                exit_fee,
            ))
        } else {
            Ok((
                0u64,
                math::checked_sub(potential_loss_usd, potential_profit_usd)?,
                exit_fee,
            ))
        }
    }

    /// Total value of pool assets in USD, with open long profits subtracted
    /// and open position losses added back.
    pub fn get_assets_under_management_usd<'info>(
        &self,
        aum_calc_mode: AumCalcMode,
        accounts: &'info [AccountInfo<'info>],
        curtime: i64,
    ) -> Result<u128> {
        let mut pool_amount_usd: u128 = 0;
        for (idx, &custody) in self.custodies.iter().enumerate() {
            let oracle_idx = idx + self.custodies.len();
            if oracle_idx >= accounts.len() {
                return Err(PerpetualsError::UnsupportedOracle.into());
            }

            require_keys_eq!(accounts[idx].key(), custody);
            let custody = Account::<Custody>::try_from(&accounts[idx])?;

            require_keys_eq!(accounts[oracle_idx].key(), custody.oracle.oracle_account);

            let token_price = OraclePrice::new_from_oracle(
                &accounts[oracle_idx],
                &custody.oracle,
                curtime,
                false,
            )?;

            let token_ema_price = OraclePrice::new_from_oracle(
                &accounts[oracle_idx],
                &custody.oracle,
                curtime,
                custody.pricing.use_ema,
            )?;

            let aum_token_price = match aum_calc_mode {
                AumCalcMode::Last => token_price,
                AumCalcMode::EMA => token_ema_price,
                AumCalcMode::Min => {
                    if token_price < token_ema_price {
                        token_price
                    } else {
                        token_ema_price
                    }
                }
                AumCalcMode::Max => {
                    if token_price > token_ema_price {
                        token_price
                    } else {
                        token_ema_price
                    }
                }
            };

            let token_amount_usd =
                aum_token_price.get_asset_amount_usd(custody.assets.owned, custody.decimals)?;

            pool_amount_usd = math::checked_add(pool_amount_usd, token_amount_usd as u128)?;

            if custody.pricing.use_unrealized_pnl_in_aum && !custody.is_stable {
                // aggregate unrealized pnl of both sides
                for side in [Side::Long, Side::Short] {
                    let collective_position = custody.get_collective_position(side)?;
                    let (profit_usd, loss_usd, _) = self.get_pnl_usd(
                        &collective_position,
                        &token_price,
                        &token_ema_price,
                        &custody,
                        &token_price,
                        &token_ema_price,
                        &custody,
                        curtime,
                        false,
                    )?;
                    pool_amount_usd = math::checked_add(pool_amount_usd, loss_usd as u128)?;
                    pool_amount_usd = pool_amount_usd.saturating_sub(profit_usd as u128);
                }
            }
        }

        Ok(pool_amount_usd)
    }

    /// Fee rounds up, always in the pool's favor.
    pub fn get_fee_amount(fee: u64, amount: u64) -> Result<u64> {
        if fee == 0 || amount == 0 {
            return Ok(0);
        }
        math::checked_as_u64(math::checked_ceil_div(
            math::checked_mul(amount as u128, fee as u128)?,
            Perpetuals::BPS_POWER,
        )?)
    }

    // private helpers

    fn is_margin_above(
        position: &Position,
        price: u64,
        fixed_loss_usd: u64,
        threshold_bps: u128,
    ) -> Result<bool> {
        let (profit_usd, loss_usd) = if position.side == Side::Long {
            math::calc_power_pnl(price, position.price, position.size_usd, position.power)?
        } else {
            math::calc_power_pnl(position.price, price, position.size_usd, position.power)?
        };
        let margin_usd = math::checked_add(
            math::checked_add(position.collateral_usd, position.unrealized_profit_usd)?,
            profit_usd,
        )?
        .saturating_sub(math::checked_add(fixed_loss_usd, loss_usd)?);
        let margin_bps = math::checked_div(
            math::checked_mul(margin_usd as u128, Perpetuals::BPS_POWER)?,
            position.size_usd as u128,
        )?;
        Ok(margin_bps >= threshold_bps)
    }

    fn get_current_ratio(&self, custody: &Custody, token_price: &OraclePrice) -> Result<u64> {
        if self.aum_usd == 0 || custody.is_virtual {
            return Ok(0);
        }
        let ratio = math::checked_as_u64(math::checked_div(
            math::checked_mul(
                token_price.get_asset_amount_usd(custody.assets.owned, custody.decimals)? as u128,
                Perpetuals::BPS_POWER,
            )?,
            self.aum_usd,
        )?)?;
        Ok(std::cmp::min(ratio, Perpetuals::BPS_POWER as u64))
    }

    fn get_new_ratio(
        &self,
        amount_add: u64,
        amount_remove: u64,
        custody: &Custody,
        token_price: &OraclePrice,
    ) -> Result<u64> {
        if custody.is_virtual {
            return Ok(0);
        }
        let (new_token_aum_usd, new_pool_aum_usd) = if amount_add > 0 && amount_remove > 0 {
            return Err(PerpetualsError::InvalidPositionState.into());
        } else if amount_add == 0 && amount_remove == 0 {
            (
                token_price.get_asset_amount_usd(custody.assets.owned, custody.decimals)? as u128,
                self.aum_usd,
            )
        } else if amount_add > 0 {
            let added_aum_usd =
                token_price.get_asset_amount_usd(amount_add, custody.decimals)? as u128;

            (
                token_price.get_asset_amount_usd(
                    math::checked_add(custody.assets.owned, amount_add)?,
                    custody.decimals,
                )? as u128,
                math::checked_add(self.aum_usd, added_aum_usd)?,
            )
        } else {
            let removed_aum_usd =
                token_price.get_asset_amount_usd(amount_remove, custody.decimals)? as u128;

            if removed_aum_usd >= self.aum_usd || amount_remove >= custody.assets.owned {
                (0, 0)
            } else {
                (
                    token_price.get_asset_amount_usd(
                        math::checked_sub(custody.assets.owned, amount_remove)?,
                        custody.decimals,
                    )? as u128,
                    math::checked_sub(self.aum_usd, removed_aum_usd)?,
                )
            }
        };
        if new_token_aum_usd == 0 || new_pool_aum_usd == 0 {
            return Ok(0);
        }

        let ratio = math::checked_as_u64(math::checked_div(
            math::checked_mul(new_token_aum_usd, Perpetuals::BPS_POWER)?,
            new_pool_aum_usd,
        )?)?;
        Ok(std::cmp::min(ratio, Perpetuals::BPS_POWER as u64))
    }

    /// Applies the trade spread on top of the worse of spot and ema for the
    /// given side, rounding against the user.
    fn get_price(
        &self,
        token_price: &OraclePrice,
        token_ema_price: &OraclePrice,
        side: Side,
        spread: u64,
    ) -> Result<OraclePrice> {
        if side == Side::Long {
            let max_price = if token_price > token_ema_price {
                token_price
            } else {
                token_ema_price
            };

            Ok(OraclePrice {
                price: math::checked_add(
                    max_price.price,
                    math::checked_decimal_ceil_mul(
                        max_price.price,
                        max_price.exponent,
                        spread,
                        -(Perpetuals::BPS_DECIMALS as i32),
                        max_price.exponent,
                    )?,
                )?,
                exponent: max_price.exponent,
            })
        } else {
            let min_price = if token_price < token_ema_price {
                token_price
            } else {
                token_ema_price
            };

            let spread = math::checked_decimal_mul(
                min_price.price,
                min_price.exponent,
                spread,
                -(Perpetuals::BPS_DECIMALS as i32),
                min_price.exponent,
            )?;

            let price = if spread < min_price.price {
                math::checked_sub(min_price.price, spread)?
            } else {
                0
            };

            Ok(OraclePrice {
                price,
                exponent: min_price.exponent,
            })
        }
    }

    fn get_fee(
        &self,
        token_id: usize,
        base_fee: u64,
        amount_add: u64,
        amount_remove: u64,
        custody: &Custody,
        token_price: &OraclePrice,
    ) -> Result<u64> {
        require!(!custody.is_virtual, PerpetualsError::InstructionNotAllowed);

        match custody.fees.mode {
            FeesMode::Fixed => {
                Self::get_fee_amount(base_fee, std::cmp::max(amount_add, amount_remove))
            }
            FeesMode::Linear => self.get_fee_linear(
                token_id,
                base_fee,
                amount_add,
                amount_remove,
                custody,
                token_price,
            ),
            FeesMode::Optimal => self.get_fee_optimal(
                token_id,
                base_fee,
                amount_add,
                amount_remove,
                custody,
                token_price,
            ),
        }
    }

    /// Fee scaled by how far the operation moves the custody's ratio from
    /// its target; improving operations get a discount.
    fn get_fee_linear(
        &self,
        token_id: usize,
        base_fee: u64,
        amount_add: u64,
        amount_remove: u64,
        custody: &Custody,
        token_price: &OraclePrice,
    ) -> Result<u64> {
        let ratios = &self.ratios[token_id];
        let current_ratio = self.get_current_ratio(custody, token_price)?;
        let new_ratio = self.get_new_ratio(amount_add, amount_remove, custody, token_price)?;

        let improved = match new_ratio.cmp(&ratios.target) {
            Ordering::Less => {
                new_ratio > current_ratio
                    || (current_ratio > ratios.target
                        && current_ratio - ratios.target > ratios.target - new_ratio)
            }
            Ordering::Greater => {
                new_ratio < current_ratio
                    || (current_ratio < ratios.target
                        && ratios.target - current_ratio > new_ratio - ratios.target)
            }
            Ordering::Equal => current_ratio != ratios.target,
        };

        let ratio_fee = if new_ratio <= ratios.target {
            if ratios.target == ratios.min {
                Perpetuals::BPS_POWER
            } else {
                math::checked_add(
                    Perpetuals::BPS_POWER,
                    math::checked_div(
                        math::checked_mul(
                            custody.fees.ratio_mult as u128,
                            math::checked_sub(ratios.target, new_ratio)? as u128,
                        )?,
                        math::checked_sub(ratios.target, ratios.min)? as u128,
                    )?,
                )?
            }
        } else if ratios.target == ratios.max {
            Perpetuals::BPS_POWER
        } else {
            math::checked_add(
                Perpetuals::BPS_POWER,
                math::checked_div(
                    math::checked_mul(
                        custody.fees.ratio_mult as u128,
                        math::checked_sub(new_ratio, ratios.target)? as u128,
                    )?,
                    math::checked_sub(ratios.max, ratios.target)? as u128,
                )?,
            )?
        };

        let fee = if improved {
            math::checked_div(
                math::checked_mul(base_fee as u128, Perpetuals::BPS_POWER)?,
                ratio_fee,
            )?
        } else {
            math::checked_div(
                math::checked_mul(base_fee as u128, ratio_fee)?,
                Perpetuals::BPS_POWER,
            )?
        };

        Self::get_fee_amount(
            math::checked_as_u64(fee)?,
            std::cmp::max(amount_add, amount_remove),
        )
    }

    fn get_fee_optimal(
        &self,
        token_id: usize,
        base_fee: u64,
        amount_add: u64,
        amount_remove: u64,
        custody: &Custody,
        token_price: &OraclePrice,
    ) -> Result<u64> {
        // slope can be negative, so this one runs in i64
        let fee_max: i64 = custody.fees.fee_max as i64;
        let fee_optimal: i64 = custody.fees.fee_optimal as i64;

        let target_ratio: i64 = self.ratios[token_id].target as i64;
        let min_ratio: i64 = self.ratios[token_id].min as i64;
        let max_ratio: i64 = self.ratios[token_id].max as i64;
        let post_lp_ratio: i64 =
            self.get_new_ratio(amount_add, amount_remove, custody, token_price)? as i64;

        let base_fee: i64 = base_fee as i64;

        let slope_denominator: i64 = if post_lp_ratio > target_ratio {
            math::checked_sub(max_ratio, target_ratio)?
        } else {
            math::checked_sub(target_ratio, min_ratio)?
        };

        let slope_numerator: i64 = if amount_add != 0 {
            if post_lp_ratio > max_ratio {
                return err!(PerpetualsError::TokenRatioOutOfRange);
            }
            fee_max - fee_optimal
        } else {
            if post_lp_ratio < min_ratio {
                return err!(PerpetualsError::TokenRatioOutOfRange);
            }
            fee_optimal - fee_max
        };

        // b = fee_optimal - target_ratio * slope; applying slope_denominator
        // only at the end keeps the intermediate precision
        let b: i64 = math::checked_sub(
            math::checked_mul(fee_optimal, slope_denominator)?,
            math::checked_mul(target_ratio, slope_numerator)?,
        )?;
        let lp_fee: i64 = math::checked_div(
            math::checked_add(math::checked_mul(slope_numerator, post_lp_ratio)?, b)?,
            slope_denominator,
        )?;

        Self::get_fee_amount(
            math::checked_as_u64(math::checked_add(lp_fee, base_fee)?)?,
            std::cmp::max(amount_add, amount_remove),
        )
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::state::{
            custody::{Assets, BorrowRateParams, Fees, FeesMode, PricingParams},
            perpetuals::Permissions,
        },
    };

    const SIZE_USD: u64 = 10_000_000000; // $10,000
    const ENTRY_PRICE: u64 = 100_000000; // $100

    // zero spreads and fees so payoff assertions stay exact; individual
    // tests turn them back on
    fn get_fixture() -> (Pool, Custody, Custody, Position, OraclePrice, OraclePrice) {
        let pricing = PricingParams {
            use_ema: true,
            use_unrealized_pnl_in_aum: true,
            min_initial_leverage: 10_000,
            max_initial_leverage: 1_000_000,
            max_leverage: 1_000_000,
            min_collateral_bps: 500,
            liquidation_fee_bps: 100,
            max_payoff_mult: 10_000,
            ..PricingParams::default()
        };

        let fees = Fees {
            mode: FeesMode::Fixed,
            ..Fees::default()
        };

        let custody = Custody {
            decimals: 9,
            pricing,
            permissions: Permissions::default(),
            fees,
            borrow_rate: BorrowRateParams {
                optimal_utilization: 500_000_000,
                ..BorrowRateParams::default()
            },
            assets: Assets {
                owned: 1_000_000_000_000,
                ..Assets::default()
            },
            ..Custody::default()
        };

        let stable_custody = Custody {
            decimals: 6,
            is_stable: true,
            pricing,
            fees,
            assets: Assets {
                owned: 1_000_000_000_000,
                ..Assets::default()
            },
            ..Custody::default()
        };

        let position = Position {
            side: Side::Long,
            power: 1,
            price: ENTRY_PRICE,
            size_usd: SIZE_USD,
            collateral_usd: 2_500_000000,
            collateral_amount: 25_000_000_000, // 25 tokens
            locked_amount: 100_000_000_000,    // 100 tokens
            open_time: 0,
            ..Position::default()
        };

        let token_price = OraclePrice::new(ENTRY_PRICE, -6);

        (
            Pool {
                name: "test pool".to_string(),
                ratios: vec![TokenRatios {
                    target: 10_000,
                    min: 0,
                    max: 10_000,
                }],
                ..Pool::default()
            },
            custody,
            stable_custody,
            position,
            token_price,
            token_price,
        )
    }

    fn stable_price() -> OraclePrice {
        OraclePrice::new(1_000000, -6)
    }

    #[test]
    fn test_entry_exit_price_with_spread() {
        let (pool, mut custody, _, _, token_price, token_ema_price) = get_fixture();
        custody.pricing.trade_spread_long = 100;
        custody.pricing.trade_spread_short = 100;

        assert_eq!(
            pool.get_entry_price(&token_price, &token_ema_price, Side::Long, &custody)
                .unwrap(),
            101_000000
        );
        assert_eq!(
            pool.get_exit_price(&token_price, &token_ema_price, Side::Long, &custody)
                .unwrap(),
            99_000000
        );
        assert_eq!(
            pool.get_entry_price(&token_price, &token_ema_price, Side::Short, &custody)
                .unwrap(),
            99_000000
        );
        assert_eq!(
            pool.get_exit_price(&token_price, &token_ema_price, Side::Short, &custody)
                .unwrap(),
            101_000000
        );
    }

    #[test]
    fn test_get_fee_amount_rounds_up() {
        assert_eq!(Pool::get_fee_amount(100, 10_000).unwrap(), 100);
        assert_eq!(Pool::get_fee_amount(1, 1).unwrap(), 1);
        assert_eq!(Pool::get_fee_amount(0, 10_000).unwrap(), 0);
        assert_eq!(Pool::get_fee_amount(100, 0).unwrap(), 0);
    }

    #[test]
    fn test_entry_fee_utilization_surcharge() {
        let (pool, mut custody, _, _, _, _) = get_fixture();
        custody.fees.utilization_mult = 20_000;

        // below the kink the base fee applies
        assert_eq!(
            pool.get_entry_fee(100, 100_000_000_000, 100_000_000_000, &custody)
                .unwrap(),
            1_000_000_000
        );
        // locking 80% of owned is 30% past the kink: fee * (1 + 2 * 0.3 / 0.5)
        assert_eq!(
            pool.get_entry_fee(100, 100_000_000_000, 800_000_000_000, &custody)
                .unwrap(),
            2_200_000_000
        );
    }

    #[test]
    fn test_pnl_power2_profit() {
        let (pool, custody, _, mut position, _, _) = get_fixture();
        position.power = 2;
        let price = OraclePrice::new(150_000000, -6);

        let (profit, loss, fee) = pool
            .get_pnl_usd(
                &position, &price, &price, &custody, &price, &price, &custody, 1, false,
            )
            .unwrap();
        assert_eq!((profit, loss, fee), (12_500_000000, 0, 0));
    }

    #[test]
    fn test_pnl_profit_capped_at_locked_value() {
        let (pool, custody, _, mut position, _, _) = get_fixture();
        position.power = 2;
        let price = OraclePrice::new(200_000000, -6);

        // raw payoff is $30,000 but only 100 locked tokens back the payout
        let (profit, loss, _) = pool
            .get_pnl_usd(
                &position, &price, &price, &custody, &price, &price, &custody, 1, false,
            )
            .unwrap();
        assert_eq!((profit, loss), (20_000_000000, 0));
    }

    #[test]
    fn test_pnl_power2_loss() {
        let (pool, custody, _, mut position, _, _) = get_fixture();
        position.power = 2;
        let price = OraclePrice::new(75_000000, -6);

        let (profit, loss, _) = pool
            .get_pnl_usd(
                &position, &price, &price, &custody, &price, &price, &custody, 1, false,
            )
            .unwrap();
        assert_eq!((profit, loss), (0, 4_375_000000));
    }

    #[test]
    fn test_pnl_short_power2() {
        let (pool, custody, stable_custody, mut position, _, _) = get_fixture();
        position.side = Side::Short;
        position.power = 2;
        position.locked_amount = 20_000_000000; // $20k of stable collateral
        let price = OraclePrice::new(75_000000, -6);
        let collateral_price = stable_price();

        let (profit, loss, _) = pool
            .get_pnl_usd(
                &position,
                &price,
                &price,
                &custody,
                &collateral_price,
                &collateral_price,
                &stable_custody,
                1,
                false,
            )
            .unwrap();
        assert_eq!(loss, 0);
        assert!((7_777_777_776..=7_777_777_778).contains(&profit));
    }

    #[test]
    fn test_pnl_carries_exit_fee_and_interest() {
        let (pool, mut custody, _, position, token_price, token_ema_price) = get_fixture();
        custody.fees.close_position = 100; // 1%
        custody.borrow_rate_state.current_rate = 1_000_000; // 0.001/s

        // flat price, so the whole loss is carry: $100 exit fee + $1,000
        // interest over 100s
        let (profit, loss, fee) = pool
            .get_pnl_usd(
                &position,
                &token_price,
                &token_ema_price,
                &custody,
                &token_price,
                &token_ema_price,
                &custody,
                100,
                false,
            )
            .unwrap();
        assert_eq!(profit, 0);
        assert_eq!(loss, 1_100_000000);
        assert_eq!(fee, 1_000_000_000);
    }

    #[test]
    fn test_get_leverage() {
        let (pool, custody, _, position, token_price, token_ema_price) = get_fixture();
        let leverage = pool
            .get_leverage(
                &position,
                &token_price,
                &token_ema_price,
                &custody,
                &token_price,
                &token_ema_price,
                &custody,
                1,
            )
            .unwrap();
        assert_eq!(leverage, 40_000);
    }

    #[test]
    fn test_power_leverage_limits() {
        let (pool, custody, _, _, _, _) = get_fixture();
        assert_eq!(
            pool.get_power_leverage_limits(1, &custody).unwrap(),
            (1_000_000, 1_000_000)
        );
        assert_eq!(
            pool.get_power_leverage_limits(2, &custody).unwrap(),
            (200_000, 400_000)
        );
        assert_eq!(
            pool.get_power_leverage_limits(5, &custody).unwrap(),
            (30_000, 60_000)
        );
        assert!(pool.get_power_leverage_limits(0, &custody).is_err());
        assert!(pool.get_power_leverage_limits(6, &custody).is_err());
    }

    #[test]
    fn test_check_leverage_power_boundaries() {
        let (pool, custody, _, mut position, token_price, token_ema_price) = get_fixture();
        position.power = 3;

        // exactly 10x: the cap for power 3
        position.collateral_usd = 1_000_000000;
        assert!(pool
            .check_leverage(
                &position,
                &token_price,
                &token_ema_price,
                &custody,
                &token_price,
                &token_ema_price,
                &custody,
                1,
                true,
            )
            .unwrap());

        // one bps over the cap
        position.collateral_usd = 999_990000;
        assert!(!pool
            .check_leverage(
                &position,
                &token_price,
                &token_ema_price,
                &custody,
                &token_price,
                &token_ema_price,
                &custody,
                1,
                true,
            )
            .unwrap());
    }

    #[test]
    fn test_check_leverage_max_bound_non_initial() {
        let (pool, custody, _, mut position, token_price, token_ema_price) = get_fixture();
        position.power = 5;

        // 5x margin leverage is within the 6x running cap for power 5
        position.collateral_usd = 2_000_000000;
        assert!(pool
            .check_leverage(
                &position,
                &token_price,
                &token_ema_price,
                &custody,
                &token_price,
                &token_ema_price,
                &custody,
                1,
                false,
            )
            .unwrap());

        // 8x breaches it
        position.collateral_usd = 1_250_000000;
        assert!(!pool
            .check_leverage(
                &position,
                &token_price,
                &token_ema_price,
                &custody,
                &token_price,
                &token_ema_price,
                &custody,
                1,
                false,
            )
            .unwrap());
    }

    #[test]
    fn test_liquidation_state_thresholds() {
        let (pool, custody, _, position, _, _) = get_fixture();
        // margin floor is 500 bps with a 100 bps liquidation buffer

        let state_at = |price: u64| {
            let price = OraclePrice::new(price, -6);
            pool.get_liquidation_state(
                &position, &price, &price, &custody, &price, &price, &custody, 1,
            )
            .unwrap()
        };

        // margin 600 bps: exactly at the buffer boundary
        assert_eq!(state_at(81_000000), LiquidationState::None);
        // margin 550 bps: inside the buffer
        assert_eq!(state_at(80_500000), LiquidationState::CanBeLiquidated);
        // margin 400 bps: below the floor
        assert_eq!(state_at(79_000000), LiquidationState::MustBeLiquidated);
    }

    #[test]
    fn test_liquidation_price_long_linear() {
        let (pool, custody, _, position, token_ema_price, _) = get_fixture();
        // closed form: 2500 + 10000 * (p / 100 - 1) = 600  =>  p = 81
        let (price, approximate) = pool
            .get_liquidation_price(&position, &token_ema_price, &custody, &custody, 1)
            .unwrap();
        assert!(!approximate);
        assert!(price.abs_diff(81_000000) <= 1);
    }

    #[test]
    fn test_liquidation_price_long_power2() {
        let (pool, custody, _, mut position, token_ema_price, _) = get_fixture();
        position.power = 2;
        // 2500 - 10000 * (1 - (p / 100)^2) = 600  =>  p = 90
        let (price, approximate) = pool
            .get_liquidation_price(&position, &token_ema_price, &custody, &custody, 1)
            .unwrap();
        assert!(!approximate);
        assert!(price.abs_diff(90_000000) <= 1);
    }

    #[test]
    fn test_liquidation_price_short() {
        let (pool, custody, stable_custody, mut position, token_ema_price, _) = get_fixture();
        position.side = Side::Short;
        // 2500 + 10000 * (100 / p - 1) = 600  =>  p = 100 / 0.81
        let (price, approximate) = pool
            .get_liquidation_price(&position, &token_ema_price, &custody, &stable_custody, 1)
            .unwrap();
        assert!(!approximate);
        assert!(price.abs_diff(123_456_791) <= 2);
    }

    #[test]
    fn test_liquidation_price_unreachable_flags_approximate() {
        let (pool, custody, _, mut position, token_ema_price, _) = get_fixture();
        // collateral exceeds the worst case loss, no root inside the bracket
        position.collateral_usd = 20_000_000000;
        let (price, approximate) = pool
            .get_liquidation_price(&position, &token_ema_price, &custody, &custody, 1)
            .unwrap();
        assert!(approximate);
        assert_eq!(price, 1);
    }

    #[test]
    fn test_check_available_amount() {
        let (pool, mut custody, _, _, _, _) = get_fixture();
        custody.assets.owned = 1_000;
        custody.assets.collateral = 200;
        custody.assets.locked = 700;
        assert!(pool.check_available_amount(500, &custody).unwrap());
        assert!(!pool.check_available_amount(501, &custody).unwrap());
    }

    #[test]
    fn test_get_close_amount_caps_payout() {
        let (pool, custody, _, mut position, _, _) = get_fixture();
        position.power = 2;
        let price = OraclePrice::new(200_000000, -6);

        let (close_amount, fee_amount, profit, loss) = pool
            .get_close_amount(
                &position, &price, &price, &custody, &price, &price, &custody, 1, false,
            )
            .unwrap();
        assert_eq!(loss, 0);
        assert_eq!(fee_amount, 0);
        assert_eq!(profit, 20_000_000000);
        // collateral ($2,500 -> 12.5 tokens at $200) plus capped profit
        // (100 tokens), limited by locked + collateral
        assert_eq!(close_amount, 112_500_000_000);
    }
}
