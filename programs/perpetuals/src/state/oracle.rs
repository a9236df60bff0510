//! Oracle price reads and normalization.

use {
    crate::{error::PerpetualsError, math, state::perpetuals::Perpetuals},
    anchor_lang::prelude::*,
    core::cmp::Ordering,
};

const ORACLE_EXPONENT_SCALE: i32 = -9;
const ORACLE_PRICE_SCALE: u64 = 1_000_000_000;
const ORACLE_MAX_PRICE: u64 = (1 << 28) - 1;

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Debug)]
pub enum OracleType {
    // valid only while a custody is being configured
    None,
    Custom,
    Pyth,
}

impl Default for OracleType {
    fn default() -> Self {
        Self::None
    }
}

/// Price value is price * 10^exponent.
#[derive(Copy, Clone, Eq, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct OraclePrice {
    pub price: u64,
    pub exponent: i32,
}

#[derive(Copy, Clone, PartialEq, AnchorSerialize, AnchorDeserialize, Default, Debug)]
pub struct OracleParams {
    pub oracle_account: Pubkey,
    pub oracle_type: OracleType,
    // max allowed confidence interval, in bps of the price
    pub max_price_error: u64,
    pub max_price_age_sec: u32,
}

/// On-chain price store for the custom oracle variant.
#[account]
#[derive(Default, Debug)]
pub struct CustomOracle {
    pub price: u64,
    pub expo: i32,
    pub conf: u64,
    pub ema: u64,
    pub publish_time: i64,
}

impl CustomOracle {
    pub const LEN: usize = 8 + std::mem::size_of::<CustomOracle>();

    pub fn set(&mut self, price: u64, expo: i32, conf: u64, ema: u64, publish_time: i64) {
        self.price = price;
        self.expo = expo;
        self.conf = conf;
        self.ema = ema;
        self.publish_time = publish_time;
    }
}

impl PartialOrd for OraclePrice {
    fn partial_cmp(&self, other: &OraclePrice) -> Option<Ordering> {
        let (lhs, rhs) = if self.exponent == other.exponent {
            (self.price, other.price)
        } else if self.exponent < other.exponent {
            if let Ok(scaled_price) = other.scale_to_exponent(self.exponent) {
                (self.price, scaled_price.price)
            } else {
                return None;
            }
        } else if let Ok(scaled_price) = self.scale_to_exponent(other.exponent) {
            (scaled_price.price, other.price)
        } else {
            return None;
        };
        lhs.partial_cmp(&rhs)
    }
}

#[allow(dead_code)]
impl OraclePrice {
    pub fn new(price: u64, exponent: i32) -> Self {
        Self { price, exponent }
    }

    pub fn new_from_token(amount_and_decimals: (u64, u8)) -> Self {
        Self {
            price: amount_and_decimals.0,
            exponent: -(amount_and_decimals.1 as i32),
        }
    }

    pub fn new_from_oracle(
        oracle_account: &AccountInfo,
        oracle_params: &OracleParams,
        current_time: i64,
        use_ema: bool,
    ) -> Result<Self> {
        match oracle_params.oracle_type {
            OracleType::Custom => Self::get_custom_price(
                oracle_account,
                oracle_params.max_price_error,
                oracle_params.max_price_age_sec,
                current_time,
                use_ema,
            ),
            OracleType::Pyth => Self::get_pyth_price(
                oracle_account,
                oracle_params.max_price_error,
                oracle_params.max_price_age_sec,
                current_time,
                use_ema,
            ),
            _ => err!(PerpetualsError::UnsupportedOracle),
        }
    }

    /// Returns token_amount * price, scaled to USD_DECIMALS.
    pub fn get_asset_amount_usd(&self, token_amount: u64, token_decimals: u8) -> Result<u64> {
        if token_amount == 0 || self.price == 0 {
            return Ok(0);
        }
        math::checked_decimal_mul(
            token_amount,
            -(token_decimals as i32),
            self.price,
            self.exponent,
            -(Perpetuals::USD_DECIMALS as i32),
        )
    }

    /// Returns asset_amount_usd / price, scaled to token decimals.
    pub fn get_token_amount(&self, asset_amount_usd: u64, token_decimals: u8) -> Result<u64> {
        if asset_amount_usd == 0 || self.price == 0 {
            return Ok(0);
        }
        math::checked_decimal_div(
            asset_amount_usd,
            -(Perpetuals::USD_DECIMALS as i32),
            self.price,
            self.exponent,
            -(token_decimals as i32),
        )
    }

    /// Shrinks the mantissa below ORACLE_MAX_PRICE to keep downstream
    /// products inside u128.
    pub fn normalize(&self) -> Result<OraclePrice> {
        let mut p = self.price;
        let mut e = self.exponent;

        while p > ORACLE_MAX_PRICE {
            p = math::checked_div(p, 10)?;
            e = math::checked_add(e, 1)?;
        }

        Ok(OraclePrice {
            price: p,
            exponent: e,
        })
    }

    pub fn checked_div(&self, other: &OraclePrice) -> Result<OraclePrice> {
        let base = self.normalize()?;
        let other = other.normalize()?;

        Ok(OraclePrice {
            price: math::checked_div(
                math::checked_mul(base.price, ORACLE_PRICE_SCALE)?,
                other.price,
            )?,
            exponent: math::checked_sub(
                math::checked_add(base.exponent, ORACLE_EXPONENT_SCALE)?,
                other.exponent,
            )?,
        })
    }

    pub fn checked_mul(&self, other: &OraclePrice) -> Result<OraclePrice> {
        Ok(OraclePrice {
            price: math::checked_mul(self.price, other.price)?,
            exponent: math::checked_add(self.exponent, other.exponent)?,
        })
    }

    pub fn scale_to_exponent(&self, target_exponent: i32) -> Result<OraclePrice> {
        if target_exponent == self.exponent {
            return Ok(*self);
        }
        Ok(OraclePrice {
            price: math::scale_to_exponent(self.price, self.exponent, target_exponent)?,
            exponent: target_exponent,
        })
    }

    /// Min of the two prices. Stablecoin prices are additionally capped at
    /// 1 USD so a depegged stable never values collateral above par.
    pub fn get_min_price(&self, other: &OraclePrice, is_stable: bool) -> Result<OraclePrice> {
        let min_price = if self < other { self } else { other };
        if is_stable {
            if min_price.exponent > 0 {
                if min_price.price == 0 {
                    return Ok(*min_price);
                } else {
                    return Ok(OraclePrice {
                        price: 1_000_000u64,
                        exponent: -6,
                    });
                }
            }
            let one_usd = math::checked_pow(10u64, (-min_price.exponent) as usize)?;
            if min_price.price > one_usd {
                Ok(OraclePrice {
                    price: one_usd,
                    exponent: min_price.exponent,
                })
            } else {
                Ok(*min_price)
            }
        } else {
            Ok(*min_price)
        }
    }

    fn get_custom_price<'info>(
        custom_price_info: &'info AccountInfo<'info>,
        max_price_error: u64,
        max_price_age_sec: u32,
        current_time: i64,
        use_ema: bool,
    ) -> Result<OraclePrice> {
        require!(
            !Perpetuals::is_empty_account(custom_price_info)?,
            PerpetualsError::InvalidOracleAccount
        );

        let oracle_acc = Account::<CustomOracle>::try_from(custom_price_info)?;

        let last_update_age_sec = math::checked_sub(current_time, oracle_acc.publish_time)?;
        if last_update_age_sec > max_price_age_sec as i64 {
            msg!("Error: Custom oracle price is stale");
            return err!(PerpetualsError::StaleOraclePrice);
        }

        // fall back to the spot price if no ema has been published
        let price = if use_ema && oracle_acc.ema > 0 {
            oracle_acc.ema
        } else {
            oracle_acc.price
        };

        if price == 0
            || math::checked_div(
                math::checked_mul(oracle_acc.conf as u128, Perpetuals::BPS_POWER)?,
                price as u128,
            )? > max_price_error as u128
        {
            msg!("Error: Custom oracle price is out of bounds");
            return err!(PerpetualsError::InvalidOraclePrice);
        }

        Ok(OraclePrice {
            price,
            exponent: oracle_acc.expo,
        })
    }

    fn get_pyth_price(
        pyth_price_info: &AccountInfo,
        max_price_error: u64,
        max_price_age_sec: u32,
        current_time: i64,
        use_ema: bool,
    ) -> Result<OraclePrice> {
        require!(
            !Perpetuals::is_empty_account(pyth_price_info)?,
            PerpetualsError::InvalidOracleAccount
        );
        let price_feed = pyth_sdk_solana::load_price_feed_from_account_info(pyth_price_info)
            .map_err(|_| PerpetualsError::InvalidOracleAccount)?;
        let pyth_price = if use_ema {
            price_feed.get_ema_price_unchecked()
        } else {
            price_feed.get_price_unchecked()
        };

        let last_update_age_sec = math::checked_sub(current_time, pyth_price.publish_time)?;
        if last_update_age_sec > max_price_age_sec as i64 {
            msg!("Error: Pyth oracle price is stale");
            return err!(PerpetualsError::StaleOraclePrice);
        }

        if pyth_price.price <= 0
            || math::checked_div(
                math::checked_mul(pyth_price.conf as u128, Perpetuals::BPS_POWER)?,
                pyth_price.price as u128,
            )? > max_price_error as u128
        {
            msg!("Error: Pyth oracle price is out of bounds");
            return err!(PerpetualsError::InvalidOraclePrice);
        }

        Ok(OraclePrice {
            // price is i64 and > 0 per check above
            price: pyth_price.price as u64,
            exponent: pyth_price.expo,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scale_to_exponent() {
        let price = OraclePrice::new(123_000, -3);
        assert_eq!(
            price.scale_to_exponent(-6).unwrap(),
            OraclePrice::new(123_000_000, -6)
        );
        assert_eq!(
            price.scale_to_exponent(0).unwrap(),
            OraclePrice::new(123, 0)
        );
        assert_eq!(price.scale_to_exponent(-3).unwrap(), price);
    }

    #[test]
    fn test_ordering_across_exponents() {
        let a = OraclePrice::new(25_000_000, -3);
        let b = OraclePrice::new(25_300_000_000, -6);
        assert!(a < b);
        assert!(b > a);
        assert!(a < OraclePrice::new(25_001, 0));
    }

    #[test]
    fn test_asset_amount_usd_round_trip() {
        let price = OraclePrice::new(25_000_000, -3);
        // 2 tokens with 9 decimals at $25,000
        let usd = price.get_asset_amount_usd(2_000_000_000, 9).unwrap();
        assert_eq!(usd, 50_000_000000);
        assert_eq!(price.get_token_amount(usd, 9).unwrap(), 2_000_000_000);
        assert_eq!(price.get_asset_amount_usd(0, 9).unwrap(), 0);
    }

    #[test]
    fn test_min_price_stable_capped_at_one_usd() {
        let above_par = OraclePrice::new(1_050_000, -6);
        let below_par = OraclePrice::new(990_000, -6);

        let capped = above_par.get_min_price(&above_par, true).unwrap();
        assert_eq!(capped, OraclePrice::new(1_000_000, -6));

        let uncapped = above_par.get_min_price(&below_par, true).unwrap();
        assert_eq!(uncapped, below_par);

        let not_stable = above_par.get_min_price(&above_par, false).unwrap();
        assert_eq!(not_stable, above_par);
    }

    #[test]
    fn test_normalize_bounds_mantissa() {
        let price = OraclePrice::new(123_456_789_012, -9);
        let normalized = price.normalize().unwrap();
        assert!(normalized.price <= (1 << 28) - 1);
        // same value within truncation error
        assert_eq!(normalized.price, 123_456_789);
        assert_eq!(normalized.exponent, -6);
    }

    #[test]
    fn test_checked_div_prices() {
        let a = OraclePrice::new(50_000_000, -3);
        let b = OraclePrice::new(25_000_000, -3);
        let ratio = a.checked_div(&b).unwrap();
        assert_eq!(
            ratio.scale_to_exponent(-6).unwrap(),
            OraclePrice::new(2_000_000, -6)
        );
    }
}
