//! In-memory stand-in for the payment-channel settlement contract.
//!
//! Balances, escrows and the clock live in one shared [SimulatedLedger];
//! each participant talks to it through a [LedgerAccount] bound to their
//! address, just as a wallet-backed contract handle would.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use super::{Ledger, LedgerError, OpenedChannel};
use crate::{
    config::SimulatedLedgerConfig,
    types::{Address, Signature, U256},
    voucher::{self, packed},
};

/// On-chain state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowChannel {
    pub sender: Address,
    pub recipient: Address,
    pub expiration: u64,
    pub balance: U256,
}

#[derive(Debug)]
struct State {
    now: u64,
    balances: HashMap<Address, U256>,
    channels: HashMap<Address, EscrowChannel>,
    nonces: HashMap<Address, u64>,
}

impl State {
    fn balance(&self, account: Address) -> U256 {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    fn credit(&mut self, account: Address, amount: U256) {
        let balance = self.balances.entry(account).or_default();
        *balance = balance.saturating_add(amount);
    }

    /// Take `amount` from `account`, failing without side effects.
    fn debit(&mut self, account: Address, amount: U256) -> Result<(), LedgerError> {
        let available = self.balance(account);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                available,
                required: amount,
            });
        }
        self.balances.insert(account, available - amount);
        Ok(())
    }

    fn channel(&self, address: Address) -> Result<EscrowChannel, LedgerError> {
        self.channels
            .get(&address)
            .copied()
            .ok_or(LedgerError::UnknownChannel(address))
    }

    /// `keccak256(abi.encodePacked(sender, nonce))[12..]`
    fn next_channel_address(&mut self, sender: Address) -> Address {
        let nonce = self.nonces.entry(sender).or_default();
        let hash = packed::to_hash(&(sender, U256::from(*nonce)));
        *nonce += 1;

        let mut address = Address::default();
        address.0.copy_from_slice(&hash.0[12..]);
        address
    }
}

fn revert<T>(reason: &str) -> Result<T, LedgerError> {
    Err(LedgerError::Reverted(reason.to_string()))
}

#[derive(Debug, Clone)]
pub struct SimulatedLedger {
    state: Arc<Mutex<State>>,
    config: Arc<SimulatedLedgerConfig>,
}

impl SimulatedLedger {
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        let state = State {
            now: config.start_time,
            balances: HashMap::new(),
            channels: HashMap::new(),
            nonces: HashMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Every mutation validates before it writes, so a poisoned lock
        // still guards consistent state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mint funds for `account`.
    pub fn fund(&self, account: Address, amount: U256) {
        self.state().credit(account, amount);
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.state().balance(account)
    }

    pub fn now(&self) -> u64 {
        self.state().now
    }

    /// Move the ledger clock forward.
    pub fn advance(&self, secs: u64) {
        let mut state = self.state();
        state.now = state.now.saturating_add(secs);
    }

    pub fn channel(&self, address: Address) -> Option<EscrowChannel> {
        self.state().channels.get(&address).copied()
    }

    /// A handle acting as `account`.
    pub fn account(&self, account: Address) -> LedgerAccount {
        LedgerAccount {
            ledger: self.clone(),
            account,
        }
    }

    async fn confirm(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    fn open_channel(
        &self,
        sender: Address,
        recipient: Address,
        expiry_secs: u64,
        amount: U256,
    ) -> Result<OpenedChannel, LedgerError> {
        let mut state = self.state();
        let required = amount.saturating_add(self.config.fee);
        state.debit(sender, required)?;

        let address = state.next_channel_address(sender);
        let expiration = state.now.saturating_add(expiry_secs);
        state.channels.insert(
            address,
            EscrowChannel {
                sender,
                recipient,
                expiration,
                balance: amount,
            },
        );
        tracing::debug!(channel = %address, %sender, %recipient, %amount, expiration, "escrow opened");
        Ok(OpenedChannel {
            address,
            expiration,
        })
    }

    fn extend_expiration(
        &self,
        caller: Address,
        address: Address,
        new_expiry: u64,
    ) -> Result<u64, LedgerError> {
        let mut state = self.state();
        let channel = state.channel(address)?;
        if caller != channel.sender {
            return revert("only the sender can extend the expiration");
        }
        if new_expiry <= channel.expiration {
            return revert("new expiration must be later");
        }
        state.debit(caller, self.config.fee)?;
        if let Some(c) = state.channels.get_mut(&address) {
            c.expiration = new_expiry;
        }
        Ok(new_expiry)
    }

    fn close_channel(
        &self,
        caller: Address,
        address: Address,
        amount: U256,
        signature: Signature,
    ) -> Result<(), LedgerError> {
        let mut state = self.state();
        let channel = state.channel(address)?;
        if caller != channel.recipient {
            return revert("only the recipient can close the channel");
        }
        // The contract re-derives the voucher message from the call
        // arguments, so a signature over anything else recovers to some
        // other address.
        let signer = voucher::recover_signer(voucher::message_hash(address, amount), signature)
            .or_else(|_| revert("invalid signature"))?;
        if signer != channel.sender {
            return revert("signature does not match the sender");
        }
        if amount > channel.balance {
            return revert("amount exceeds the escrow");
        }
        state.debit(caller, self.config.fee)?;

        state.channels.remove(&address);
        state.credit(channel.recipient, amount);
        state.credit(channel.sender, channel.balance - amount);
        tracing::debug!(channel = %address, %amount, "escrow settled");
        Ok(())
    }

    fn claim_timeout(&self, caller: Address, address: Address) -> Result<(), LedgerError> {
        let mut state = self.state();
        let channel = state.channel(address)?;
        if caller != channel.sender {
            return revert("only the sender can claim the timeout");
        }
        if state.now < channel.expiration {
            return revert("channel has not expired");
        }
        state.debit(caller, self.config.fee)?;

        state.channels.remove(&address);
        state.credit(channel.sender, channel.balance);
        tracing::debug!(channel = %address, "escrow reclaimed after timeout");
        Ok(())
    }
}

/// [SimulatedLedger] as seen by one account.
#[derive(Debug, Clone)]
pub struct LedgerAccount {
    ledger: SimulatedLedger,
    account: Address,
}


#[async_trait]
impl Ledger for LedgerAccount {
    fn account(&self) -> Address {
        self.account
    }

    async fn open_channel(
        &self,
        receiver: Address,
        expiry_secs: u64,
        amount: U256,
    ) -> Result<OpenedChannel, LedgerError> {
        self.ledger.confirm().await;
        self.ledger
            .open_channel(self.account, receiver, expiry_secs, amount)
    }

    async fn extend_expiration(
        &self,
        channel: Address,
        new_expiry: u64,
    ) -> Result<u64, LedgerError> {
        self.ledger.confirm().await;
        self.ledger
            .extend_expiration(self.account, channel, new_expiry)
    }

    async fn close_channel(
        &self,
        channel: Address,
        amount: U256,
        signature: Signature,
    ) -> Result<(), LedgerError> {
        self.ledger.confirm().await;
        self.ledger
            .close_channel(self.account, channel, amount, signature)
    }

    async fn claim_timeout(&self, channel: Address) -> Result<(), LedgerError> {
        self.ledger.confirm().await;
        self.ledger.claim_timeout(self.account, channel)
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        Ok(self.ledger.balance_of(address))
    }

    async fn now(&self) -> Result<u64, LedgerError> {
        Ok(SimulatedLedger::now(&self.ledger))
    }
}
