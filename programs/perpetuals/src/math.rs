//! Common math routines.

use {crate::error::PerpetualsError, anchor_lang::prelude::*, std::fmt::Display};

/// Internal scale for power payoff ratios. Finer than PRICE_DECIMALS so that
/// repeated multiply-and-rescale keeps sub-cent precision for power <= 5.
pub const POWER_SCALE: u128 = 1_000_000_000_000;

/// Highest supported payoff exponent.
pub const MAX_POWER: u8 = 5;

pub fn checked_add<T>(arg1: T, arg2: T) -> Result<T>
where
    T: num_traits::PrimInt + Display,
{
    if let Some(res) = arg1.checked_add(&arg2) {
        Ok(res)
    } else {
        msg!("Error: Overflow in {} + {}", arg1, arg2);
        err!(PerpetualsError::MathOverflow)
    }
}

pub fn checked_sub<T>(arg1: T, arg2: T) -> Result<T>
where
    T: num_traits::PrimInt + Display,
{
    if let Some(res) = arg1.checked_sub(&arg2) {
        Ok(res)
    } else {
        msg!("Error: Overflow in {} - {}", arg1, arg2);
        err!(PerpetualsError::MathOverflow)
    }
}

pub fn checked_mul<T>(arg1: T, arg2: T) -> Result<T>
where
    T: num_traits::PrimInt + Display,
{
    if let Some(res) = arg1.checked_mul(&arg2) {
        Ok(res)
    } else {
        msg!("Error: Overflow in {} * {}", arg1, arg2);
        err!(PerpetualsError::MathOverflow)
    }
}

pub fn checked_div<T>(arg1: T, arg2: T) -> Result<T>
where
    T: num_traits::PrimInt + Display,
{
    if let Some(res) = arg1.checked_div(&arg2) {
        Ok(res)
    } else {
        msg!("Error: Overflow in {} / {}", arg1, arg2);
        err!(PerpetualsError::MathOverflow)
    }
}

pub fn checked_ceil_div<T>(arg1: T, arg2: T) -> Result<T>
where
    T: num_traits::PrimInt + Display,
{
    if arg2 == T::zero() {
        msg!("Error: Overflow in {} / {}", arg1, arg2);
        return err!(PerpetualsError::MathOverflow);
    }
    if arg1 == T::zero() {
        return Ok(T::zero());
    }
    checked_add((arg1 - T::one()) / arg2, T::one())
}

/// Computes arg1 * arg2 / divisor with a 128-bit intermediate, truncating
/// toward zero.
pub fn checked_mul_div(arg1: u64, arg2: u64, divisor: u64) -> Result<u64> {
    checked_as_u64(checked_div(
        checked_mul(arg1 as u128, arg2 as u128)?,
        divisor as u128,
    )?)
}

pub fn checked_pow<T>(arg: T, exp: usize) -> Result<T>
where
    T: num_traits::PrimInt + Display,
{
    if let Some(res) = num_traits::checked_pow(arg, exp) {
        Ok(res)
    } else {
        msg!("Error: Overflow in {} ^ {}", arg, exp);
        err!(PerpetualsError::MathOverflow)
    }
}

/// Multiplies two fixed-point values and rescales the product to
/// target_exponent, truncating toward zero.
pub fn checked_decimal_mul(
    coefficient1: u64,
    exponent1: i32,
    coefficient2: u64,
    exponent2: i32,
    target_exponent: i32,
) -> Result<u64> {
    if coefficient1 == 0 || coefficient2 == 0 {
        return Ok(0);
    }
    let target_power = checked_sub(checked_add(exponent1, exponent2)?, target_exponent)?;
    if target_power >= 0 {
        checked_as_u64(checked_mul(
            checked_mul(coefficient1 as u128, coefficient2 as u128)?,
            checked_pow(10u128, target_power as usize)?,
        )?)
    } else {
        checked_as_u64(checked_div(
            checked_mul(coefficient1 as u128, coefficient2 as u128)?,
            checked_pow(10u128, (-target_power) as usize)?,
        )?)
    }
}

/// Same as checked_decimal_mul but rounds the result up. Used for fees so
/// rounding always favors the pool.
pub fn checked_decimal_ceil_mul(
    coefficient1: u64,
    exponent1: i32,
    coefficient2: u64,
    exponent2: i32,
    target_exponent: i32,
) -> Result<u64> {
    if coefficient1 == 0 || coefficient2 == 0 {
        return Ok(0);
    }
    let target_power = checked_sub(checked_add(exponent1, exponent2)?, target_exponent)?;
    if target_power >= 0 {
        checked_as_u64(checked_mul(
            checked_mul(coefficient1 as u128, coefficient2 as u128)?,
            checked_pow(10u128, target_power as usize)?,
        )?)
    } else {
        checked_as_u64(checked_ceil_div(
            checked_mul(coefficient1 as u128, coefficient2 as u128)?,
            checked_pow(10u128, (-target_power) as usize)?,
        )?)
    }
}

/// Divides two fixed-point values and rescales the quotient to
/// target_exponent, truncating toward zero.
pub fn checked_decimal_div(
    coefficient1: u64,
    exponent1: i32,
    coefficient2: u64,
    exponent2: i32,
    target_exponent: i32,
) -> Result<u64> {
    if coefficient2 == 0 {
        msg!("Error: Overflow in {} / {}", coefficient1, coefficient2);
        return err!(PerpetualsError::MathOverflow);
    }
    if coefficient1 == 0 {
        return Ok(0);
    }
    // res = coefficient1 * 10^(exponent1 - exponent2 - target_exponent) / coefficient2
    let target_power = checked_sub(checked_sub(exponent1, exponent2)?, target_exponent)?;
    if target_power >= 0 {
        checked_as_u64(checked_div(
            checked_mul(
                coefficient1 as u128,
                checked_pow(10u128, target_power as usize)?,
            )?,
            coefficient2 as u128,
        )?)
    } else {
        checked_as_u64(checked_div(
            coefficient1 as u128,
            checked_mul(
                coefficient2 as u128,
                checked_pow(10u128, (-target_power) as usize)?,
            )?,
        )?)
    }
}

pub fn scale_to_exponent(arg: u64, exponent: i32, target_exponent: i32) -> Result<u64> {
    if target_exponent == exponent {
        return Ok(arg);
    }
    let delta = checked_sub(target_exponent, exponent)?;
    if delta > 0 {
        checked_div(arg, checked_pow(10u64, delta as usize)?)
    } else {
        checked_mul(arg, checked_pow(10u64, (-delta) as usize)?)
    }
}

pub fn checked_as_u64<T>(arg: T) -> Result<u64>
where
    T: TryInto<u64> + Display + Copy,
{
    arg.try_into().map_err(|_| {
        msg!("Error: Overflow casting {} to u64", arg);
        error!(PerpetualsError::MathOverflow)
    })
}

/// Power payoff of a position of the given notional size.
///
/// Computes size_usd * ((exit_price / entry_price)^power - 1) as a
/// (profit_usd, loss_usd) pair; at most one side is non-zero. Prices share
/// an arbitrary fixed-point scale since only their ratio matters. Short
/// positions reuse the same primitive with the price arguments swapped.
///
/// The ratio is raised to the exponent by iterated multiply-and-rescale at
/// POWER_SCALE, which bounds intermediates well inside u128 for any
/// realistic price ratio. Losses round up, profits round down.
pub fn calc_power_pnl(
    exit_price: u64,
    entry_price: u64,
    size_usd: u64,
    power: u8,
) -> Result<(u64, u64)> {
    if entry_price == 0 || power == 0 || power > MAX_POWER {
        return Ok((0, 0));
    }
    let ratio = checked_div(
        checked_mul(exit_price as u128, POWER_SCALE)?,
        entry_price as u128,
    )?;
    let mut ratio_pow = ratio;
    for _ in 1..power {
        ratio_pow = checked_div(checked_mul(ratio_pow, ratio)?, POWER_SCALE)?;
    }
    if ratio_pow >= POWER_SCALE {
        let profit_usd = checked_as_u64(checked_div(
            checked_mul(size_usd as u128, checked_sub(ratio_pow, POWER_SCALE)?)?,
            POWER_SCALE,
        )?)?;
        Ok((profit_usd, 0))
    } else {
        let loss_usd = checked_as_u64(checked_ceil_div(
            checked_mul(size_usd as u128, checked_sub(POWER_SCALE, ratio_pow)?)?,
            POWER_SCALE,
        )?)?;
        Ok((0, loss_usd))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIZE_USD: u64 = 10_000_000_000; // $10,000 at 6 decimals
    const ENTRY: u64 = 100_000000;

    #[test]
    fn test_checked_mul_div() {
        assert_eq!(checked_mul_div(10, 3, 4).unwrap(), 7);
        assert_eq!(checked_mul_div(0, 3, 4).unwrap(), 0);
        assert_eq!(
            checked_mul_div(u64::MAX, u64::MAX, u64::MAX).unwrap(),
            u64::MAX
        );
        assert!(checked_mul_div(1, 1, 0).is_err());
        // product needs the widened intermediate
        assert_eq!(
            checked_mul_div(u64::MAX, 1_000_000, 2_000_000).unwrap(),
            u64::MAX / 2
        );
    }

    #[test]
    fn test_checked_ceil_div() {
        assert_eq!(checked_ceil_div(9u64, 3).unwrap(), 3);
        assert_eq!(checked_ceil_div(10u64, 3).unwrap(), 4);
        assert_eq!(checked_ceil_div(0u64, 3).unwrap(), 0);
        assert!(checked_ceil_div(1u64, 0).is_err());
    }

    #[test]
    fn test_checked_decimal_mul() {
        // 12.3 * 2 at -6
        assert_eq!(
            checked_decimal_mul(12_300, -3, 2_000_000, -6, -6).unwrap(),
            24_600_000
        );
        assert_eq!(checked_decimal_mul(0, -3, 2_000_000, -6, -6).unwrap(), 0);
        // truncation vs ceil
        assert_eq!(checked_decimal_mul(1, -6, 1, -6, -6).unwrap(), 0);
        assert_eq!(checked_decimal_ceil_mul(1, -6, 1, -6, -6).unwrap(), 1);
    }

    #[test]
    fn test_checked_decimal_div() {
        // 25000 / 2.5 at -6
        assert_eq!(
            checked_decimal_div(25_000_000000, -6, 2_500_000, -6, -6).unwrap(),
            10_000_000000
        );
        assert!(checked_decimal_div(1, -6, 0, -6, -6).is_err());
    }

    #[test]
    fn test_scale_to_exponent() {
        assert_eq!(scale_to_exponent(1_000_000, -6, -3).unwrap(), 1_000);
        assert_eq!(scale_to_exponent(1_000, -3, -6).unwrap(), 1_000_000);
        assert_eq!(scale_to_exponent(123, -6, -6).unwrap(), 123);
    }

    #[test]
    fn test_power_pnl_long_linear() {
        let (profit, loss) = calc_power_pnl(150_000000, ENTRY, SIZE_USD, 1).unwrap();
        assert_eq!((profit, loss), (5_000_000_000, 0));
    }

    #[test]
    fn test_power_pnl_long_squared() {
        let (profit, loss) = calc_power_pnl(150_000000, ENTRY, SIZE_USD, 2).unwrap();
        assert_eq!((profit, loss), (12_500_000_000, 0));
    }

    #[test]
    fn test_power_pnl_long_cubed() {
        let (profit, loss) = calc_power_pnl(150_000000, ENTRY, SIZE_USD, 3).unwrap();
        assert_eq!((profit, loss), (23_750_000_000, 0));
    }

    #[test]
    fn test_power_pnl_long_squared_loss() {
        let (profit, loss) = calc_power_pnl(75_000000, ENTRY, SIZE_USD, 2).unwrap();
        assert_eq!((profit, loss), (0, 4_375_000_000));
    }

    #[test]
    fn test_power_pnl_short_squared() {
        // short payoff swaps the arguments
        let (profit, loss) = calc_power_pnl(ENTRY, 75_000000, SIZE_USD, 2).unwrap();
        assert_eq!(loss, 0);
        assert!((7_777_777_776..=7_777_777_778).contains(&profit));
    }

    #[test]
    fn test_power_pnl_long_fifth() {
        let (profit, loss) = calc_power_pnl(120_000000, ENTRY, SIZE_USD, 5).unwrap();
        assert_eq!(loss, 0);
        assert!(profit.abs_diff(14_883_200_000) <= 5);
    }

    #[test]
    fn test_power_pnl_guards() {
        assert_eq!(calc_power_pnl(150_000000, 0, SIZE_USD, 2).unwrap(), (0, 0));
        assert_eq!(
            calc_power_pnl(150_000000, ENTRY, SIZE_USD, 0).unwrap(),
            (0, 0)
        );
        assert_eq!(
            calc_power_pnl(150_000000, ENTRY, SIZE_USD, 6).unwrap(),
            (0, 0)
        );
    }

    #[test]
    fn test_power_pnl_exclusive_sides() {
        for power in 1..=MAX_POWER {
            for exit in [50_000000u64, 99_999999, 100_000000, 100_000001, 250_000000] {
                let (profit, loss) = calc_power_pnl(exit, ENTRY, SIZE_USD, power).unwrap();
                assert!(profit == 0 || loss == 0, "power {} exit {}", power, exit);
            }
        }
    }

    #[test]
    fn test_power_pnl_linear_matches_price_diff() {
        for exit in [80_000000u64, 100_000000, 137_000000] {
            let (profit, loss) = calc_power_pnl(exit, ENTRY, SIZE_USD, 1).unwrap();
            let expected = (SIZE_USD as i128) * (exit as i128 - ENTRY as i128) / ENTRY as i128;
            let got = profit as i128 - loss as i128;
            assert!((got - expected).abs() <= 1, "exit {}", exit);
        }
    }
}
