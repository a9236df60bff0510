//! Multisig state and routines.

use {
    crate::{error::PerpetualsError, math},
    anchor_lang::prelude::*,
    std::hash::Hasher,
};

/// Signature accumulator for admin instructions. An instruction executes only
/// after min_signatures distinct admins have signed the same instruction hash.
#[repr(C, packed)]
#[account(zero_copy)]
#[derive(Default)]
pub struct Multisig {
    pub num_signers: u8,
    pub num_signed: u8,
    pub min_signatures: u8,
    pub instruction_accounts_len: u8,
    pub instruction_data_len: u16,
    pub instruction_hash: u64,
    pub signers: [Pubkey; 6], // Multisig::MAX_SIGNERS
    pub signed: [u8; 6],      // Multisig::MAX_SIGNERS
    pub bump: u8,
}

/// Admin instructions requiring multisig approval.
#[derive(Debug, Clone, Copy)]
pub enum AdminInstruction {
    AddPool,
    RemovePool,
    AddCustody,
    RemoveCustody,
    SetAdminSigners,
    SetCustodyConfig,
    SetPermissions,
    WithdrawFees,
    SetCustomOraclePrice,
    SetTestTime,
}

impl Multisig {
    pub const MAX_SIGNERS: usize = 6;
    pub const LEN: usize = 8 + std::mem::size_of::<Multisig>();

    /// Hash over instruction account keys and serialized params. All admins
    /// must sign the exact same accounts and data for a signature to count.
    pub fn get_instruction_hash(
        instruction_accounts: &[AccountInfo],
        instruction_data: &[u8],
    ) -> u64 {
        use core::hash::BuildHasher;
        let build_hasher = ahash::RandomState::with_seeds(
            86133906935911,
            303381791903293,
            0,
            0,
        );
        let mut hasher = build_hasher.build_hasher();
        for account in instruction_accounts {
            hasher.write(account.key.as_ref());
        }
        if !instruction_data.is_empty() {
            hasher.write(instruction_data);
        }
        hasher.finish()
    }

    pub fn get_account_infos<'info, T: ToAccountInfos<'info> + anchor_lang::Bumps>(
        ctx: &Context<'_, '_, '_, 'info, T>,
    ) -> Vec<AccountInfo<'info>> {
        let mut infos = ctx.accounts.to_account_infos();
        infos.extend_from_slice(ctx.remaining_accounts);
        infos
    }

    pub fn get_instruction_data<T: AnchorSerialize>(
        instruction_type: AdminInstruction,
        params: &T,
    ) -> Result<Vec<u8>> {
        let mut res = vec![];
        AnchorSerialize::serialize(&params, &mut res)
            .map_err(|_| ProgramError::InvalidInstructionData)?;
        res.push(instruction_type as u8);
        Ok(res)
    }

    /// Replaces the signer set and resets signature tracking.
    pub fn set_signers(&mut self, admin_signers: &[AccountInfo], min_signatures: u8) -> Result<()> {
        if admin_signers.is_empty() || min_signatures == 0 {
            msg!("Error: At least one signer is required");
            return Err(ProgramError::MissingRequiredSignature.into());
        }
        if (min_signatures as usize) > admin_signers.len() {
            msg!(
                "Error: Number of min signatures ({}) exceeded number of signers ({})",
                min_signatures,
                admin_signers.len(),
            );
            return Err(ProgramError::InvalidArgument.into());
        }
        if admin_signers.len() > Multisig::MAX_SIGNERS {
            msg!(
                "Error: Number of signers ({}) exceeded max ({})",
                admin_signers.len(),
                Multisig::MAX_SIGNERS
            );
            return Err(ProgramError::InvalidArgument.into());
        }

        let mut signers: [Pubkey; Multisig::MAX_SIGNERS] = Default::default();
        let mut signed: [u8; Multisig::MAX_SIGNERS] = Default::default();

        for idx in 0..admin_signers.len() {
            if signers.contains(admin_signers[idx].key) {
                msg!("Error: Duplicate signer {}", admin_signers[idx].key);
                return Err(ProgramError::InvalidArgument.into());
            }
            signers[idx] = *admin_signers[idx].key;
            signed[idx] = 0;
        }

        *self = Multisig {
            num_signers: admin_signers.len() as u8,
            num_signed: 0,
            min_signatures,
            instruction_accounts_len: 0,
            instruction_data_len: 0,
            instruction_hash: 0,
            signers,
            signed,
            bump: self.bump,
        };

        Ok(())
    }

    /// Records the admin's signature for the given instruction.
    ///
    /// Returns the number of signatures still required, so 0 means quorum was
    /// reached and the caller may proceed. A different instruction hash
    /// restarts collection from this signature.
    pub fn sign_multisig(
        &mut self,
        signer_account: &AccountInfo,
        instruction_accounts: &[AccountInfo],
        instruction_data: &[u8],
    ) -> Result<u8> {
        if !signer_account.is_signer {
            return Err(ProgramError::MissingRequiredSignature.into());
        }

        let signer_idx = if let Ok(idx) = self.get_signer_index(signer_account.key) {
            idx
        } else {
            return err!(PerpetualsError::MultisigAccountNotAuthorized);
        };

        // single admin setups execute immediately
        if self.num_signers <= 1 {
            return Ok(0);
        }

        let instruction_hash =
            Multisig::get_instruction_hash(instruction_accounts, instruction_data);
        if instruction_hash != self.instruction_hash
            || instruction_accounts.len() != self.instruction_accounts_len as usize
            || instruction_data.len() != self.instruction_data_len as usize
        {
            // new instruction, restart collection
            self.num_signed = 1;
            self.instruction_accounts_len = instruction_accounts.len() as u8;
            self.instruction_data_len = instruction_data.len() as u16;
            self.instruction_hash = instruction_hash;
            self.signed.fill(0);
            self.signed[signer_idx] = 1;

            math::checked_sub(self.min_signatures, 1)
        } else if self.signed[signer_idx] == 1 {
            err!(PerpetualsError::MultisigAlreadySigned)
        } else if self.num_signed < self.min_signatures {
            self.num_signed = math::checked_add(self.num_signed, 1)?;
            self.signed[signer_idx] = 1;

            if self.num_signed == self.min_signatures {
                Ok(0)
            } else {
                math::checked_sub(self.min_signatures, self.num_signed)
            }
        } else {
            err!(PerpetualsError::MultisigAlreadyExecuted)
        }
    }

    /// Revokes a previously recorded signature before execution.
    pub fn unsign_multisig(&mut self, signer_account: &AccountInfo) -> Result<()> {
        if !signer_account.is_signer {
            return Err(ProgramError::MissingRequiredSignature.into());
        }

        if self.num_signers <= 1 || self.num_signed == 0 {
            return Ok(());
        }

        let signer_idx = if let Ok(idx) = self.get_signer_index(signer_account.key) {
            idx
        } else {
            return err!(PerpetualsError::MultisigAccountNotAuthorized);
        };

        if self.signed[signer_idx] == 0 {
            return Ok(());
        }

        self.num_signed = math::checked_sub(self.num_signed, 1)?;
        self.signed[signer_idx] = 0;

        Ok(())
    }

    pub fn get_signer_index(&self, signer: &Pubkey) -> Result<usize> {
        for i in 0..self.num_signers as usize {
            if &self.signers[i] == signer {
                return Ok(i);
            }
        }
        err!(PerpetualsError::MultisigAccountNotAuthorized)
    }

    pub fn is_signer(&self, key: &Pubkey) -> Result<bool> {
        Ok(self.get_signer_index(key).is_ok())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn signer_account<'a>(
        key: &'a Pubkey,
        is_signer: bool,
        lamports: &'a mut u64,
        owner: &'a Pubkey,
    ) -> AccountInfo<'a> {
        AccountInfo::new(key, is_signer, false, lamports, &mut [], owner, false, 0)
    }

    #[test]
    fn test_set_signers_validation() {
        let owner = Pubkey::default();
        let key1 = Pubkey::new_unique();
        let key2 = Pubkey::new_unique();
        let (mut lamports1, mut lamports2) = (0u64, 0u64);
        let admin1 = signer_account(&key1, false, &mut lamports1, &owner);
        let admin2 = signer_account(&key2, false, &mut lamports2, &owner);

        let mut multisig = Multisig::default();
        assert!(multisig.set_signers(&[], 1).is_err());
        assert!(multisig
            .set_signers(&[admin1.clone(), admin2.clone()], 0)
            .is_err());
        assert!(multisig
            .set_signers(&[admin1.clone(), admin2.clone()], 3)
            .is_err());
        assert!(multisig
            .set_signers(&[admin1.clone(), admin1.clone()], 1)
            .is_err());

        multisig
            .set_signers(&[admin1.clone(), admin2.clone()], 2)
            .unwrap();
        let num_signers = multisig.num_signers;
        let min_signatures = multisig.min_signatures;
        assert_eq!(num_signers, 2);
        assert_eq!(min_signatures, 2);
        assert!(multisig.is_signer(&key1).unwrap());
        assert!(!multisig.is_signer(&Pubkey::new_unique()).unwrap());
    }

    #[test]
    fn test_sign_multisig_quorum() {
        let owner = Pubkey::default();
        let key1 = Pubkey::new_unique();
        let key2 = Pubkey::new_unique();
        let key3 = Pubkey::new_unique();
        let (mut lamports1, mut lamports2, mut lamports3) = (0u64, 0u64, 0u64);
        let admin1 = signer_account(&key1, true, &mut lamports1, &owner);
        let admin2 = signer_account(&key2, true, &mut lamports2, &owner);
        let admin3 = signer_account(&key3, true, &mut lamports3, &owner);

        let mut multisig = Multisig::default();
        multisig
            .set_signers(&[admin1.clone(), admin2.clone(), admin3.clone()], 2)
            .unwrap();

        let accounts = [admin1.clone(), admin2.clone()];
        let data = [1u8, 2, 3];

        // first signature starts collection
        assert_eq!(multisig.sign_multisig(&admin1, &accounts, &data).unwrap(), 1);
        // double signing is rejected
        assert!(multisig.sign_multisig(&admin1, &accounts, &data).is_err());
        // second signature reaches quorum
        assert_eq!(multisig.sign_multisig(&admin2, &accounts, &data).unwrap(), 0);
        // further signatures of an executed instruction are rejected
        assert!(multisig.sign_multisig(&admin3, &accounts, &data).is_err());
    }

    #[test]
    fn test_sign_multisig_restarts_on_new_instruction() {
        let owner = Pubkey::default();
        let key1 = Pubkey::new_unique();
        let key2 = Pubkey::new_unique();
        let (mut lamports1, mut lamports2) = (0u64, 0u64);
        let admin1 = signer_account(&key1, true, &mut lamports1, &owner);
        let admin2 = signer_account(&key2, true, &mut lamports2, &owner);

        let mut multisig = Multisig::default();
        multisig
            .set_signers(&[admin1.clone(), admin2.clone()], 2)
            .unwrap();

        let accounts = [admin1.clone(), admin2.clone()];
        assert_eq!(
            multisig.sign_multisig(&admin1, &accounts, &[1]).unwrap(),
            1
        );
        // different instruction data resets the accumulator to this signature
        assert_eq!(
            multisig.sign_multisig(&admin2, &accounts, &[2]).unwrap(),
            1
        );
        let num_signed = multisig.num_signed;
        assert_eq!(num_signed, 1);
        assert_eq!(
            multisig.sign_multisig(&admin1, &accounts, &[2]).unwrap(),
            0
        );

        // unknown signers are rejected
        let stranger_key = Pubkey::new_unique();
        let mut stranger_lamports = 0u64;
        let stranger = signer_account(&stranger_key, true, &mut stranger_lamports, &owner);
        assert!(multisig.sign_multisig(&stranger, &accounts, &[2]).is_err());

        // unsign removes a recorded signature
        assert_eq!(
            multisig.sign_multisig(&admin1, &accounts, &[3]).unwrap(),
            1
        );
        multisig.unsign_multisig(&admin1).unwrap();
        let num_signed = multisig.num_signed;
        assert_eq!(num_signed, 0);
    }
}
