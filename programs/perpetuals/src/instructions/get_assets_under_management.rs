//! GetAssetsUnderManagement instruction handler

use {
    crate::state::{
        perpetuals::Perpetuals,
        pool::{AumCalcMode, Pool},
    },
    anchor_lang::prelude::*,
};

#[derive(Accounts)]
pub struct GetAssetsUnderManagement<'info> {
    #[account(
        seeds = [b"perpetuals"],
        bump = perpetuals.perpetuals_bump
    )]
    pub perpetuals: Box<Account<'info, Perpetuals>>,

    #[account(
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
pub struct GetAssetsUnderManagementParams {}

pub fn get_assets_under_management<'info>(
    ctx: Context<'_, 'info, '_, 'info, GetAssetsUnderManagement<'info>>,
    _params: &GetAssetsUnderManagementParams,
) -> Result<u128> {
    let curtime = ctx.accounts.perpetuals.get_time()?;

    ctx.accounts.pool.get_assets_under_management_usd(
        AumCalcMode::Last,
        ctx.remaining_accounts,
        curtime,
    )
}
