use std::collections::BTreeMap;

use super::{Channel, ChannelError, Phase, Role, Violation};
use crate::{
    client::Client,
    ledger::{
        LedgerCall, LedgerError, LedgerOperation, LedgerOutcome, LedgerReply, LedgerRequest,
        OpenedChannel, RequestId,
    },
    messages::{ChannelClose, ChannelCreate, ParticipantMessage},
    peers::{PeerId, PeerRecord},
    session::Notice,
    types::{Address, U256},
    voucher::Voucher,
    wire::MessageBus,
};

/// A ledger call whose reply has not arrived yet.
#[derive(Debug, Clone)]
struct Pending {
    /// Channel the call was made for, `None` for `openChannel`.
    channel: Option<Address>,
    request: LedgerRequest,
}

/// Owns the session's single [Channel] and drives it through its phases.
///
/// The machine performs no I/O. Every operation emits its messages, ledger
/// calls and notices to a [MessageBus] and returns immediately; ledger
/// results come back through [ChannelMachine::on_ledger_reply], matched by
/// [RequestId].
#[derive(Debug)]
pub struct ChannelMachine {
    client: Client,
    channel: Option<Channel>,
    phase: Phase,
    pending: BTreeMap<RequestId, Pending>,
    /// The settling or extending call currently in flight, at most one.
    in_flight: Option<(RequestId, LedgerOperation)>,
    next_request: u64,
}

impl ChannelMachine {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            channel: None,
            phase: Phase::Idle,
            pending: BTreeMap::new(),
            in_flight: None,
            next_request: 0,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Number of ledger calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn illegal(&self, operation: &'static str) -> ChannelError {
        Violation::IllegalPhase {
            operation,
            phase: self.phase,
        }
        .into()
    }

    fn active_address(&self) -> Option<Address> {
        self.channel.as_ref().and_then(|c| c.address)
    }

    fn call_ledger<B: MessageBus>(
        &mut self,
        bus: &mut B,
        channel: Option<Address>,
        request: LedgerRequest,
    ) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.pending.insert(
            id,
            Pending {
                channel,
                request: request.clone(),
            },
        );
        bus.send_to_ledger(LedgerCall { id, request });
        id
    }

    /// Start a settling or extending call; only one may run at a time.
    fn call_exclusive<B: MessageBus>(
        &mut self,
        bus: &mut B,
        channel: Address,
        request: LedgerRequest,
    ) -> Result<RequestId, ChannelError> {
        if let Some((_, operation)) = self.in_flight {
            return Err(Violation::CallInFlight(operation).into());
        }
        let operation = request.operation();
        let id = self.call_ledger(bus, Some(channel), request);
        self.in_flight = Some((id, operation));
        Ok(id)
    }

    fn clear(&mut self, phase: Phase) {
        self.channel = None;
        self.in_flight = None;
        self.phase = phase;
    }

    /// Escrow `amount` for `peer` (who becomes the receiver).
    ///
    /// The counterparty only learns about the channel once the ledger has
    /// confirmed it.
    pub fn create_channel<B: MessageBus>(
        &mut self,
        peer: &PeerRecord,
        amount: U256,
        expiry_secs: u64,
        bus: &mut B,
    ) -> Result<RequestId, ChannelError> {
        if !self.phase.is_vacant() {
            return Err(self.illegal("createChannel"));
        }

        self.channel = Some(Channel {
            address: None,
            counterparty: peer.peer_id.clone(),
            counterparty_address: peer.chain_address,
            role: Role::Sender,
            balance: amount,
            expiration: None,
            vouchers: Vec::new(),
        });
        self.phase = Phase::AwaitingOpenConfirmation;

        let id = self.call_ledger(
            bus,
            None,
            LedgerRequest::OpenChannel {
                receiver: peer.chain_address,
                expiry_secs,
                amount,
            },
        );
        tracing::info!(peer = %peer.peer_id, %amount, expiry_secs, request = %id, "opening channel");
        Ok(id)
    }

    /// Sign a voucher over the cumulative `amount` and send it to the
    /// receiver.
    pub fn authorize<B: MessageBus>(
        &mut self,
        amount: U256,
        bus: &mut B,
    ) -> Result<Voucher, ChannelError> {
        if self.phase != Phase::Open(Role::Sender) {
            return Err(self.illegal("authorize"));
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(self.illegal("authorize"));
        };
        let Some(address) = channel.address else {
            return Err(self.illegal("authorize"));
        };

        let last = channel.authorized();
        if amount < last {
            return Err(Violation::NonMonotonic {
                last,
                requested: amount,
            }
            .into());
        }

        let voucher = Voucher::new(&self.client.signer, address, amount);
        // Never hand out something the contract would refuse.
        let signer = voucher.signer()?;
        if signer != self.client.address() {
            return Err(Violation::WrongSigner {
                expected: self.client.address(),
                actual: signer,
            }
            .into());
        }

        channel.vouchers.push(voucher);
        bus.send_to_participant(&channel.counterparty, ParticipantMessage::Voucher(voucher));
        bus.notify(Notice::VoucherSigned(voucher));
        tracing::debug!(channel = %address, %amount, "voucher signed");
        Ok(voucher)
    }

    /// Settle on the ledger (receiver only), with the given voucher or the
    /// latest one received.
    pub fn close_channel<B: MessageBus>(
        &mut self,
        voucher: Option<Voucher>,
        bus: &mut B,
    ) -> Result<RequestId, ChannelError> {
        if self.phase != Phase::Open(Role::Receiver) {
            return Err(self.illegal("closeChannel"));
        }
        let Some(channel) = self.channel.as_ref() else {
            return Err(self.illegal("closeChannel"));
        };
        let Some(address) = channel.address else {
            return Err(self.illegal("closeChannel"));
        };

        let voucher = match voucher.or_else(|| channel.latest_voucher().copied()) {
            Some(v) => v,
            None => return Err(Violation::NoVoucher.into()),
        };
        if voucher.channel_address != address {
            return Err(Violation::ChannelMismatch {
                expected: address,
                actual: voucher.channel_address,
            }
            .into());
        }

        let id = self.call_exclusive(
            bus,
            address,
            LedgerRequest::CloseChannel {
                channel: address,
                amount: voucher.amount,
                signature: voucher.signature,
            },
        )?;
        self.phase = Phase::Closing(Role::Receiver);
        tracing::info!(channel = %address, amount = %voucher.amount, request = %id, "closing channel");
        Ok(id)
    }

    /// Reclaim the whole escrow after expiration (sender only).
    ///
    /// `now` is the ledger time as last reported by the ledger. The ledger
    /// still has the final say; if it refuses, the channel stays open.
    pub fn claim_timeout<B: MessageBus>(
        &mut self,
        now: u64,
        bus: &mut B,
    ) -> Result<RequestId, ChannelError> {
        if self.phase != Phase::Open(Role::Sender) {
            return Err(self.illegal("claimTimeout"));
        }
        let Some(channel) = self.channel.as_ref() else {
            return Err(self.illegal("claimTimeout"));
        };
        let (Some(address), Some(expiration)) = (channel.address, channel.expiration) else {
            return Err(self.illegal("claimTimeout"));
        };
        if now < expiration {
            return Err(Violation::NotExpired { now, expiration }.into());
        }

        let id = self.call_exclusive(bus, address, LedgerRequest::ClaimTimeout { channel: address })?;
        self.phase = Phase::Closing(Role::Sender);
        tracing::info!(channel = %address, request = %id, "claiming timeout");
        Ok(id)
    }

    /// Push the expiration to the later absolute time `new_expiry` (sender
    /// only).
    pub fn extend_expiration<B: MessageBus>(
        &mut self,
        new_expiry: u64,
        bus: &mut B,
    ) -> Result<RequestId, ChannelError> {
        if self.phase != Phase::Open(Role::Sender) {
            return Err(self.illegal("extendExpiration"));
        }
        let Some(channel) = self.channel.as_ref() else {
            return Err(self.illegal("extendExpiration"));
        };
        let (Some(address), Some(current)) = (channel.address, channel.expiration) else {
            return Err(self.illegal("extendExpiration"));
        };
        if new_expiry <= current {
            return Err(Violation::ExpirationNotLater {
                current,
                requested: new_expiry,
            }
            .into());
        }

        let id = self.call_exclusive(
            bus,
            address,
            LedgerRequest::ExtendExpiration {
                channel: address,
                new_expiry,
            },
        )?;
        tracing::info!(channel = %address, new_expiry, request = %id, "extending expiration");
        Ok(id)
    }

    /// Apply a protocol message from `from`.
    ///
    /// `peer` is the registry record of the sender, if it introduced
    /// itself. Messages that do not concern the active channel are ignored;
    /// errors are reserved for messages that do concern it but break the
    /// protocol. State is unchanged whenever an error is returned.
    pub fn handle_message<B: MessageBus>(
        &mut self,
        from: &PeerId,
        peer: Option<&PeerRecord>,
        msg: ParticipantMessage,
        bus: &mut B,
    ) -> Result<(), ChannelError> {
        if let (Some(active), Some(target)) = (self.active_address(), msg.channel_address()) {
            if active != target {
                tracing::debug!(peer = %from, channel = %target, kind = ?msg.kind(), "message for another channel");
                return Ok(());
            }
        }
        match msg {
            // Presence is the registry's business.
            ParticipantMessage::Introduction(_) => Ok(()),
            ParticipantMessage::ChannelCreate(create) => {
                self.handle_create(from, peer, create, bus);
                Ok(())
            }
            ParticipantMessage::Voucher(voucher) => self.handle_voucher(from, voucher, bus),
            ParticipantMessage::ChannelClose(close) => {
                self.handle_close(from, close, bus);
                Ok(())
            }
        }
    }

    fn handle_create<B: MessageBus>(
        &mut self,
        from: &PeerId,
        peer: Option<&PeerRecord>,
        msg: ChannelCreate,
        bus: &mut B,
    ) {
        if !self.phase.is_vacant() {
            if self.active_address() == Some(msg.channel_address) {
                tracing::debug!(peer = %from, channel = %msg.channel_address, "duplicate channel announcement");
            } else {
                tracing::warn!(peer = %from, channel = %msg.channel_address, phase = %self.phase, "ignoring channel announcement, a channel is already active");
            }
            return;
        }
        // Without an introduction we cannot verify any voucher.
        let Some(peer) = peer else {
            tracing::warn!(peer = %from, channel = %msg.channel_address, "ignoring channel announcement from unintroduced peer");
            return;
        };

        self.channel = Some(Channel {
            address: Some(msg.channel_address),
            counterparty: from.clone(),
            counterparty_address: peer.chain_address,
            role: Role::Receiver,
            balance: msg.channel_balance,
            expiration: msg.expiration,
            vouchers: Vec::new(),
        });
        self.phase = Phase::Open(Role::Receiver);
        tracing::info!(peer = %from, channel = %msg.channel_address, balance = %msg.channel_balance, "channel opened by counterparty");
        bus.notify(Notice::ChannelOpened {
            channel: msg.channel_address,
            counterparty: from.clone(),
            role: Role::Receiver,
            balance: msg.channel_balance,
            expiration: msg.expiration,
        });
    }

    /// A voucher arriving before its `ChannelCreate` is dropped, not
    /// buffered. Vouchers are cumulative, so the next one the sender signs
    /// supersedes it.
    fn handle_voucher<B: MessageBus>(
        &mut self,
        from: &PeerId,
        voucher: Voucher,
        bus: &mut B,
    ) -> Result<(), ChannelError> {
        let phase = self.phase;
        let Some(channel) = self.channel.as_mut() else {
            tracing::debug!(peer = %from, channel = %voucher.channel_address, "voucher without active channel");
            return Ok(());
        };
        if channel.address != Some(voucher.channel_address) {
            tracing::debug!(peer = %from, channel = %voucher.channel_address, "stale voucher");
            return Ok(());
        }
        if &channel.counterparty != from {
            tracing::warn!(peer = %from, channel = %voucher.channel_address, "voucher from a peer other than the counterparty");
            return Ok(());
        }
        if !matches!(phase, Phase::Open(Role::Receiver) | Phase::Closing(Role::Receiver)) {
            return Err(Violation::IllegalPhase {
                operation: "receiveVoucher",
                phase,
            }
            .into());
        }
        if channel.latest_voucher() == Some(&voucher) {
            tracing::debug!(peer = %from, amount = %voucher.amount, "duplicate voucher");
            return Ok(());
        }

        let last = channel.authorized();
        if voucher.amount < last {
            return Err(Violation::NonMonotonic {
                last,
                requested: voucher.amount,
            }
            .into());
        }
        let signer = voucher.signer()?;
        if signer != channel.counterparty_address {
            return Err(Violation::WrongSigner {
                expected: channel.counterparty_address,
                actual: signer,
            }
            .into());
        }

        channel.vouchers.push(voucher);
        tracing::debug!(peer = %from, channel = %voucher.channel_address, amount = %voucher.amount, "voucher received");
        bus.notify(Notice::VoucherReceived(voucher));
        Ok(())
    }

    fn handle_close<B: MessageBus>(&mut self, from: &PeerId, msg: ChannelClose, bus: &mut B) {
        let Some(channel) = self.channel.as_ref() else {
            tracing::debug!(peer = %from, channel = %msg.channel_address, "close without active channel");
            return;
        };
        if channel.address != Some(msg.channel_address) {
            tracing::debug!(peer = %from, channel = %msg.channel_address, "stale close");
            return;
        }
        if &channel.counterparty != from {
            tracing::warn!(peer = %from, channel = %msg.channel_address, "close from a peer other than the counterparty");
            return;
        }
        if !matches!(self.phase, Phase::Open(_) | Phase::Closing(_)) {
            return;
        }

        tracing::info!(peer = %from, channel = %msg.channel_address, "channel closed by counterparty");
        self.clear(Phase::Idle);
        bus.notify(Notice::ChannelReset {
            channel: msg.channel_address,
        });
    }

    /// Apply the result of an earlier ledger call.
    ///
    /// Replies for calls this machine did not make, or for a channel that is
    /// no longer active, are dropped.
    pub fn on_ledger_reply<B: MessageBus>(&mut self, reply: LedgerReply, bus: &mut B) {
        let Some(pending) = self.pending.remove(&reply.id) else {
            tracing::warn!(request = %reply.id, "reply to unknown ledger call");
            return;
        };
        if matches!(self.in_flight, Some((id, _)) if id == reply.id) {
            self.in_flight = None;
        }

        let stale = match pending.channel {
            None => self.phase != Phase::AwaitingOpenConfirmation,
            Some(address) => self.active_address() != Some(address),
        };
        if stale {
            tracing::warn!(request = %reply.id, operation = %reply.operation, "dropping ledger reply for a superseded channel");
            return;
        }

        match (pending.request, reply.result) {
            (LedgerRequest::OpenChannel { .. }, Ok(LedgerOutcome::Opened(opened))) => {
                self.on_opened(opened, bus)
            }
            (LedgerRequest::OpenChannel { .. }, Err(error)) => {
                tracing::warn!(request = %reply.id, %error, "channel creation failed");
                self.clear(Phase::Idle);
                bus.notify(Notice::LedgerCallFailed {
                    operation: reply.operation,
                    channel: None,
                    error: error.clone(),
                });
                bus.notify(Notice::ChannelCreationFailed { error });
            }
            (
                LedgerRequest::ExtendExpiration { channel, .. },
                Ok(LedgerOutcome::ExpirationExtended(expiration)),
            ) => {
                if let Some(c) = self.channel.as_mut() {
                    c.expiration = Some(expiration);
                }
                tracing::info!(%channel, expiration, "expiration extended");
                bus.notify(Notice::ExpirationExtended {
                    channel,
                    expiration,
                });
            }
            (LedgerRequest::CloseChannel { channel, amount, .. }, Ok(LedgerOutcome::Closed)) => {
                self.on_settled(channel, Phase::Closed, bus);
                bus.notify(Notice::ChannelClosed { channel, amount });
            }
            (LedgerRequest::CloseChannel { channel, .. }, Err(error)) => {
                tracing::warn!(%channel, %error, "settlement rejected");
                self.phase = Phase::Open(Role::Receiver);
                self.report_failure(reply.operation, channel, error.clone(), bus);
                bus.notify(Notice::SettlementRejected { channel, error });
            }
            (LedgerRequest::ClaimTimeout { channel }, Ok(LedgerOutcome::TimeoutClaimed)) => {
                self.on_settled(channel, Phase::Expired, bus);
                bus.notify(Notice::ChannelExpired { channel });
            }
            (LedgerRequest::ClaimTimeout { channel }, Err(error)) => {
                tracing::warn!(%channel, %error, "timeout claim failed");
                self.phase = Phase::Open(Role::Sender);
                self.report_failure(reply.operation, channel, error, bus);
            }
            (LedgerRequest::ExtendExpiration { channel, .. }, Err(error)) => {
                tracing::warn!(%channel, %error, "expiration extension failed");
                self.report_failure(reply.operation, channel, error, bus);
            }
            (request, result) => {
                tracing::warn!(request = %reply.id, ?request, ?result, "ledger reply does not match its request");
            }
        }
    }

    fn report_failure<B: MessageBus>(
        &self,
        operation: LedgerOperation,
        channel: Address,
        error: LedgerError,
        bus: &mut B,
    ) {
        bus.notify(Notice::LedgerCallFailed {
            operation,
            channel: Some(channel),
            error,
        });
    }

    fn on_opened<B: MessageBus>(&mut self, opened: OpenedChannel, bus: &mut B) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        channel.address = Some(opened.address);
        channel.expiration = Some(opened.expiration);
        self.phase = Phase::Open(Role::Sender);

        tracing::info!(channel = %opened.address, peer = %channel.counterparty, expiration = opened.expiration, "channel opened");
        bus.send_to_participant(
            &channel.counterparty,
            ParticipantMessage::ChannelCreate(ChannelCreate {
                channel_address: opened.address,
                channel_balance: channel.balance,
                expiration: Some(opened.expiration),
            }),
        );
        bus.notify(Notice::ChannelOpened {
            channel: opened.address,
            counterparty: channel.counterparty.clone(),
            role: Role::Sender,
            balance: channel.balance,
            expiration: Some(opened.expiration),
        });
    }

    /// The escrow is gone: tell the counterparty and forget the channel.
    fn on_settled<B: MessageBus>(&mut self, address: Address, phase: Phase, bus: &mut B) {
        if let Some(channel) = self.channel.as_ref() {
            bus.send_to_participant(
                &channel.counterparty,
                ParticipantMessage::ChannelClose(ChannelClose {
                    channel_address: address,
                }),
            );
        }
        tracing::info!(channel = %address, %phase, "channel settled");
        self.clear(phase);
    }
}
