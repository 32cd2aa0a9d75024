//! Solana RPC balance and transfer adapters

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solana_account_decoder::UiAccountData;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use tracing::{debug, info};

use crate::config::RpcConfig;
use crate::error::{Error, Result};

use super::balance::{BalanceProvider, TokenBalance};
use super::executor::{SweepAsset, TransferProvider};

/// Shared nonblocking client at `confirmed` commitment
pub fn rpc_client(config: &RpcConfig) -> Arc<RpcClient> {
    Arc::new(RpcClient::new_with_timeout_and_commitment(
        config.endpoint.clone(),
        Duration::from_millis(config.timeout_ms),
        CommitmentConfig::confirmed(),
    ))
}

/// Live balances over RPC
pub struct RpcBalanceProvider {
    client: Arc<RpcClient>,
}

impl RpcBalanceProvider {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BalanceProvider for RpcBalanceProvider {
    async fn native_balance(&self, owner: &Pubkey) -> Result<u64> {
        self.client
            .get_balance(owner)
            .await
            .map_err(|e| Error::Rpc(format!("Failed to get balance: {}", e)))
    }

    async fn token_balances(&self, owner: &Pubkey) -> Result<Vec<TokenBalance>> {
        let accounts = self
            .client
            .get_token_accounts_by_owner(owner, TokenAccountsFilter::ProgramId(spl_token::id()))
            .await
            .map_err(|e| Error::Rpc(format!("Failed to get token accounts: {}", e)))?;

        let balances: Vec<TokenBalance> = accounts
            .iter()
            .filter_map(|keyed| parse_token_account(&keyed.pubkey, &keyed.account.data))
            .collect();

        debug!(owner = %owner, accounts = balances.len(), "Token balances read");
        Ok(balances)
    }
}

/// Read mint, amount and decimals out of a jsonParsed token account
pub fn parse_token_account(pubkey: &str, data: &UiAccountData) -> Option<TokenBalance> {
    let UiAccountData::Json(parsed) = data else {
        return None;
    };
    let info = parsed.parsed.get("info")?;
    let amount = info.get("tokenAmount")?;

    Some(TokenBalance {
        mint: Pubkey::from_str(info.get("mint")?.as_str()?).ok()?,
        account: Pubkey::from_str(pubkey).ok()?,
        amount: amount.get("amount")?.as_str()?.parse().ok()?,
        decimals: u8::try_from(amount.get("decimals")?.as_u64()?).ok()?,
    })
}

/// Signs and sends sweep transfers over RPC
pub struct RpcTransferProvider {
    client: Arc<RpcClient>,
}

impl RpcTransferProvider {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    async fn send(&self, signer: &Keypair, instructions: &[Instruction]) -> Result<Signature> {
        let blockhash = self
            .client
            .get_latest_blockhash()
            .await
            .map_err(|e| Error::TransactionBuild(format!("Failed to get blockhash: {}", e)))?;

        let transaction = Transaction::new_signed_with_payer(
            instructions,
            Some(&signer.pubkey()),
            &[signer],
            blockhash,
        );

        self.client
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|e| Error::Rpc(format!("Send failed: {}", e)))
    }
}

#[async_trait]
impl TransferProvider for RpcTransferProvider {
    async fn transfer(
        &self,
        signer: &Keypair,
        destination: &Pubkey,
        asset: &SweepAsset,
        amount: u64,
    ) -> Result<Signature> {
        let instructions = build_transfer_instructions(&signer.pubkey(), destination, asset, amount)?;
        let signature = self.send(signer, &instructions).await?;
        info!("Transfer complete: {} of {} to {} (sig: {})", amount, asset, destination, signature);
        Ok(signature)
    }

    async fn unwrap_native(&self, signer: &Keypair, account: &Pubkey) -> Result<Signature> {
        let owner = signer.pubkey();
        let instruction =
            spl_token::instruction::close_account(&spl_token::id(), account, &owner, &owner, &[])
                .map_err(|e| Error::TransactionBuild(format!("close_account: {}", e)))?;
        self.send(signer, &[instruction]).await
    }
}

/// Instructions moving `amount` of `asset` from `owner` to `destination`
///
/// Tokens go to the destination's associated token account, created on the
/// fly when missing.
pub fn build_transfer_instructions(
    owner: &Pubkey,
    destination: &Pubkey,
    asset: &SweepAsset,
    amount: u64,
) -> Result<Vec<Instruction>> {
    match asset {
        SweepAsset::Native => Ok(vec![system_instruction::transfer(owner, destination, amount)]),
        SweepAsset::Token {
            mint,
            decimals,
            source_account,
        } => {
            let destination_ata = get_associated_token_address(destination, mint);
            let create = create_associated_token_account_idempotent(
                owner,
                destination,
                mint,
                &spl_token::id(),
            );
            let transfer = spl_token::instruction::transfer_checked(
                &spl_token::id(),
                source_account,
                mint,
                &destination_ata,
                owner,
                &[],
                amount,
                *decimals,
            )
            .map_err(|e| Error::TransactionBuild(format!("transfer_checked: {}", e)))?;
            Ok(vec![create, transfer])
        }
    }
}
