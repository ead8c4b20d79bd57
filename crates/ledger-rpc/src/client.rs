//! HTTP client for a running ledger node

use crate::{
    error::LedgerError,
    types::{
        decode_response, AccountBalance, AccountCreateResponse, AccountHistoryResponse,
        AccountListResponse, BlockCreateResponse, BlockKind, CreatedBlock, HashResponse,
        LedgerRequest, PendingResponse, WalletBalancesResponse,
    },
    LedgerRpc, CONNECT_RETRY_SECS, DEFAULT_RPC_URL,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

/// JSON-over-HTTP ledger client bound to one wallet
pub struct HttpLedgerClient {
    http: reqwest::Client,
    url: String,
    wallet: String,
    retry_interval: Duration,
    /// Set after the first successful exchange; connect errors are fatal from then on
    established: AtomicBool,
}

impl HttpLedgerClient {
    /// Create a client for `wallet` against the default endpoint
    pub fn new(wallet: &str) -> Self {
        Self::with_url(DEFAULT_RPC_URL, wallet)
    }

    /// Create a client for `wallet` against a specific endpoint
    pub fn with_url(url: &str, wallet: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            wallet: wallet.to_string(),
            retry_interval: Duration::from_secs(CONNECT_RETRY_SECS),
            established: AtomicBool::new(false),
        }
    }

    /// Override the retry interval used while the node is unreachable
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    async fn post(&self, request: &LedgerRequest<'_>) -> Result<Value, LedgerError> {
        let response = loop {
            match self.http.post(&self.url).json(request).send().await {
                Ok(response) => break response,
                Err(e) if e.is_connect() && !self.established.load(Ordering::SeqCst) => {
                    tracing::warn!(
                        "Ledger node at {} unreachable ({}), trying again in {}s",
                        self.url,
                        e,
                        self.retry_interval.as_secs()
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.established.store(true, Ordering::SeqCst);

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LedgerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: LedgerRequest<'_>,
    ) -> Result<T, LedgerError> {
        tracing::trace!("ledger request: {}", request.action());
        let value = self.post(&request).await?;
        decode_response(request.action(), value)
    }
}

#[async_trait]
impl LedgerRpc for HttpLedgerClient {
    async fn create_account(&self) -> Result<String, LedgerError> {
        let resp: AccountCreateResponse = self
            .call(LedgerRequest::AccountCreate {
                wallet: &self.wallet,
            })
            .await?;
        Ok(resp.account)
    }

    async fn list_accounts(&self) -> Result<Vec<String>, LedgerError> {
        let resp: AccountListResponse = self
            .call(LedgerRequest::AccountList {
                wallet: &self.wallet,
            })
            .await?;
        Ok(resp.accounts)
    }

    async fn account_head(&self, account: &str) -> Result<Option<String>, LedgerError> {
        let resp: AccountHistoryResponse = self
            .call(LedgerRequest::AccountHistory {
                account,
                count: "1".to_string(),
            })
            .await?;
        Ok(resp.history.into_iter().next().map(|entry| entry.hash))
    }

    async fn account_balance(&self, account: &str) -> Result<AccountBalance, LedgerError> {
        self.call(LedgerRequest::AccountBalance { account }).await
    }

    async fn wallet_balances(&self) -> Result<HashMap<String, AccountBalance>, LedgerError> {
        let resp: WalletBalancesResponse = self
            .call(LedgerRequest::WalletBalances {
                wallet: &self.wallet,
            })
            .await?;
        Ok(resp.balances)
    }

    async fn create_send_block(
        &self,
        account: &str,
        destination: &str,
        balance: u128,
        amount: u128,
        previous: &str,
    ) -> Result<CreatedBlock, LedgerError> {
        let resp: BlockCreateResponse = self
            .call(LedgerRequest::BlockCreate {
                kind: BlockKind::Send,
                wallet: &self.wallet,
                account,
                destination: Some(destination),
                source: None,
                balance: Some(balance.to_string()),
                amount: Some(amount.to_string()),
                previous,
            })
            .await?;
        Ok(resp.into_created())
    }

    async fn create_receive_block(
        &self,
        account: &str,
        source: &str,
        previous: &str,
    ) -> Result<CreatedBlock, LedgerError> {
        let resp: BlockCreateResponse = self
            .call(LedgerRequest::BlockCreate {
                kind: BlockKind::Receive,
                wallet: &self.wallet,
                account,
                destination: None,
                source: Some(source),
                balance: None,
                amount: None,
                previous,
            })
            .await?;
        Ok(resp.into_created())
    }

    async fn process(&self, payload: &str) -> Result<String, LedgerError> {
        let resp: HashResponse = self.call(LedgerRequest::Process { block: payload }).await?;
        Ok(resp.hash)
    }

    async fn send(
        &self,
        source: &str,
        destination: &str,
        amount: u128,
    ) -> Result<String, LedgerError> {
        let resp: HashResponse = self
            .call(LedgerRequest::Send {
                wallet: &self.wallet,
                source,
                destination,
                amount: amount.to_string(),
            })
            .await?;
        Ok(resp.hash)
    }

    async fn receive(&self, account: &str, block: &str) -> Result<String, LedgerError> {
        let resp: HashResponse = self
            .call(LedgerRequest::Receive {
                wallet: &self.wallet,
                account,
                block,
            })
            .await?;
        Ok(resp.hash)
    }

    async fn pending(&self, account: &str, count: usize) -> Result<Vec<String>, LedgerError> {
        let resp: PendingResponse = self
            .call(LedgerRequest::Pending {
                account,
                count: count.to_string(),
            })
            .await?;
        Ok(resp.blocks)
    }
}
