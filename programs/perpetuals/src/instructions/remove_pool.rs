//! RemovePool instruction handler

use {
    crate::{
        error::PerpetualsError,
        state::{
            multisig::{AdminInstruction, Multisig},
            perpetuals::Perpetuals,
            pool::Pool,
        },
    },
    anchor_lang::{prelude::*, AccountsClose},
};

#[derive(Accounts)]
pub struct RemovePool<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(
        mut,
        seeds = [b"multisig"],
        bump = multisig.load()?.bump
    )]
    pub multisig: AccountLoader<'info, Multisig>,

    #[account(
        mut,
        seeds = [b"perpetuals"],
        bump = perpetuals.perpetuals_bump
    )]
    pub perpetuals: Box<Account<'info, Perpetuals>>,

    // must hold no custodies to be removed
    #[account(
        mut,
        seeds = [b"pool",
                 pool.name.as_bytes()],
        bump = pool.bump
    )]
    pub pool: Box<Account<'info, Pool>>,

    system_program: Program<'info, System>,
}

#[derive(AnchorSerialize, AnchorDeserialize)]
pub struct RemovePoolParams {}

pub fn remove_pool<'info>(
    ctx: Context<'_, '_, '_, 'info, RemovePool<'info>>,
    params: &RemovePoolParams,
) -> Result<u8> {
    // validate inputs
    require!(
        ctx.accounts.pool.custodies.is_empty(),
        PerpetualsError::InvalidPoolState
    );

    // validate signatures
    let mut multisig = ctx.accounts.multisig.load_mut()?;

    let signatures_left = multisig.sign_multisig(
        &ctx.accounts.admin,
        &Multisig::get_account_infos(&ctx)[1..],
        &Multisig::get_instruction_data(AdminInstruction::RemovePool, params)?,
    )?;
    if signatures_left > 0 {
        msg!(
            "Instruction has been signed but more signatures are required: {}",
            signatures_left
        );
        return Ok(signatures_left);
    }

    // remove pool from the registry
    let perpetuals = ctx.accounts.perpetuals.as_mut();
    let pool_key = ctx.accounts.pool.key();
    let idx = perpetuals
        .pools
        .iter()
        .position(|&k| k == pool_key)
        .ok_or(PerpetualsError::InvalidPoolState)?;
    perpetuals.pools.remove(idx);

    // return rent to the admin only once the quorum is reached
    ctx.accounts.pool.close(ctx.accounts.admin.to_account_info())?;

    Ok(0)
}
