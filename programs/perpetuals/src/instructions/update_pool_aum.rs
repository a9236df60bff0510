//! UpdatePoolAum instruction handler

use {
    crate::state::{
        perpetuals::Perpetuals,
        pool::{AumCalcMode, Pool},
    },
    anchor_lang::prelude::*,
};

#[derive(Accounts)]
pub struct UpdatePoolAum<'info> {
    #[account(mut)]
    pub payer: Signer<'info>,

    #[account(
        seeds = [b"perpetuals"],
        bump = perpetuals.perpetuals_bump
    )]
    pub perpetuals: Box<Account<'info, Perpetuals>>,

    #[account(
        mut,
        seeds = [b"pool",
                 pool.name.as_bytes()],
        bump = pool.bump
    )]
    pub pool: Box<Account<'info, Pool>>,
    // remaining accounts:
    //   pool.custodies.len() custody accounts (read-only, unsigned)
    //   pool.custodies.len() oracle accounts (read-only, unsigned)
}

#[derive(AnchorSerialize, AnchorDeserialize)]
pub struct UpdatePoolAumParams {}

pub fn update_pool_aum<'info>(
    ctx: Context<'_, 'info, '_, 'info, UpdatePoolAum<'info>>,
    _params: &UpdatePoolAumParams,
) -> Result<u128> {
    let curtime = ctx.accounts.perpetuals.get_time()?;
    let pool = ctx.accounts.pool.as_mut();

    // refresh the cached aum
    pool.aum_usd =
        pool.get_assets_under_management_usd(AumCalcMode::EMA, ctx.remaining_accounts, curtime)?;

    Ok(pool.aum_usd)
}
