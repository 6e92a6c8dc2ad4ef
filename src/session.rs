//! The session actor: one task owning the peer registry, the channel
//! machine, the transport and the ledger gateway.
//!
//! Transport events, ledger replies and user commands are funnelled into a
//! single loop and applied strictly one after another, so neither the
//! registry nor the channel is ever touched concurrently. Ledger calls run
//! in their own tasks (see [LedgerGateway]) and only report back through
//! the loop.


use std::sync::Arc;

use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    channel::{Channel, ChannelMachine, Phase, Role},
    client::Client,
    config::SessionConfig,
    error::Error,
    ledger::{Ledger, LedgerError, LedgerGateway, LedgerOperation, LedgerReply, RequestId},
    messages::ParticipantMessage,
    peers::{Introduced, PeerId, PeerRecord, PeerRegistry, UnknownPeer},
    sig::Signer,
    types::{Address, U256},
    voucher::Voucher,
    wire::{
        self, Effect, JsonEncodingLayer, MessageBus, Outbox, Transport, TransportEvent,
        TransportEvents,
    },
};

/// Something worth telling the user about. Delivered on the broadcast
/// channel returned by [SessionHandle::subscribe].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    PeerJoined {
        peer: PeerId,
        address: Address,
    },
    PeerLeft {
        peer: PeerId,
    },
    ChannelOpened {
        channel: Address,
        counterparty: PeerId,
        role: Role,
        balance: U256,
        expiration: Option<u64>,
    },
    ChannelCreationFailed {
        error: LedgerError,
    },
    VoucherSigned(Voucher),
    VoucherReceived(Voucher),
    ExpirationExtended {
        channel: Address,
        expiration: u64,
    },
    /// Settled by the receiver with a voucher over `amount`.
    ChannelClosed {
        channel: Address,
        amount: U256,
    },
    /// The sender reclaimed the escrow after expiration.
    ChannelExpired {
        channel: Address,
    },
    /// The counterparty announced the channel is gone.
    ChannelReset {
        channel: Address,
    },
    SettlementRejected {
        channel: Address,
        error: LedgerError,
    },
    LedgerCallFailed {
        operation: LedgerOperation,
        channel: Option<Address>,
        error: LedgerError,
    },
}

/// Read-only view of the session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub local: PeerRecord,
    pub peers: Vec<PeerRecord>,
    pub selected: Option<PeerId>,
    pub phase: Phase,
    pub channel: Option<Channel>,
}

type Reply<T> = oneshot::Sender<Result<T, Error>>;

#[derive(Debug)]
pub enum Command {
    CreateChannel {
        /// Defaults to the selected peer.
        peer: Option<PeerId>,
        amount: U256,
        /// Defaults to [SessionConfig::default_expiry_secs].
        expiry_secs: Option<u64>,
        reply: Reply<RequestId>,
    },
    Authorize {
        amount: U256,
        reply: Reply<Voucher>,
    },
    CloseChannel {
        voucher: Option<Voucher>,
        reply: Reply<RequestId>,
    },
    /// Claim with `now` as read from the ledger just before.
    ClaimTimeout {
        now: u64,
        reply: Reply<RequestId>,
    },
    LedgerTime {
        reply: oneshot::Sender<Result<u64, LedgerError>>,
    },
    ExtendExpiration {
        new_expiry: u64,
        reply: Reply<RequestId>,
    },
    SelectPeer {
        peer: PeerId,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum SessionEvent {
    Transport(TransportEvent),
    Ledger(LedgerReply),
    Command(Command),
}

pub struct Session<T: Transport, L: Ledger> {
    config: SessionConfig,
    wire: JsonEncodingLayer<T>,
    gateway: LedgerGateway<L>,
    registry: PeerRegistry,
    machine: ChannelMachine,
    notices: broadcast::Sender<Notice>,
    outbox: Outbox,
}

impl<T: Transport, L: Ledger> Session<T, L> {
    /// Join the configured room and start the session loop.
    ///
    /// `ledger` must act on behalf of `signer`'s address. The returned task
    /// finishes after [SessionHandle::shutdown] or once every handle is
    /// dropped.
    pub fn spawn(
        config: SessionConfig,
        signer: Signer,
        mut transport: T,
        ledger: L,
    ) -> Result<(SessionHandle, JoinHandle<()>), Error> {
        config.validate()?;
        if ledger.account() != signer.address() {
            tracing::warn!(
                signer = %signer.address(),
                account = %ledger.account(),
                "ledger account differs from the signing key"
            );
        }

        let events = transport.join(&config.room)?;
        let local = transport.local_peer_id();
        let (ledger_tx, ledger_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(config.mailbox_capacity);
        let (notices, _) = broadcast::channel(config.notice_capacity);

        let client = Client::new(signer, local.clone());
        tracing::info!(peer = %local, address = %client.address(), room = %config.room, "session started");

        let mut session = Session {
            config,
            wire: JsonEncodingLayer::new(transport),
            gateway: LedgerGateway::new(Arc::new(ledger), ledger_tx),
            registry: PeerRegistry::new(),
            machine: ChannelMachine::new(client),
            notices: notices.clone(),
            outbox: Outbox::default(),
        };
        session
            .machine
            .client()
            .broadcast_introduction(&mut session.outbox);
        session.flush();

        let handle = SessionHandle {
            commands: command_tx,
            notices,
            local,
        };
        let task = tokio::spawn(session.run(events, ledger_rx, command_rx));
        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut events: TransportEvents,
        mut ledger: mpsc::UnboundedReceiver<LedgerReply>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => SessionEvent::Transport(event),
                Some(reply) = ledger.recv() => SessionEvent::Ledger(reply),
                command = commands.recv() => match command {
                    Some(command) => SessionEvent::Command(command),
                    None => break,
                },
            };
            if !self.handle_event(event) {
                break;
            }
        }
        tracing::info!(peer = %self.machine.client().peer_id(), "session stopped");
    }

    /// Apply one event and execute its effects. Returns `false` when the
    /// session should stop.
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        let keep_running = match event {
            SessionEvent::Transport(event) => {
                self.on_transport_event(event);
                true
            }
            SessionEvent::Ledger(reply) => {
                self.machine.on_ledger_reply(reply, &mut self.outbox);
                true
            }
            SessionEvent::Command(command) => self.on_command(command),
        };
        self.flush();
        keep_running
    }

    fn local(&self) -> &PeerId {
        self.machine.client().peer_id()
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined(peer) if &peer == self.local() => {}
            TransportEvent::PeerJoined(peer) => {
                tracing::debug!(%peer, "peer joined, introducing ourselves");
                self.machine
                    .client()
                    .send_introduction(&mut self.outbox, &peer);
            }
            TransportEvent::PeerLeft(peer) => {
                if self.registry.on_peer_left(&peer) {
                    tracing::info!(%peer, "peer left");
                    self.outbox.notify(Notice::PeerLeft { peer });
                }
            }
            TransportEvent::Message { from, .. } if &from == self.local() => {
                tracing::trace!("dropping own message");
            }
            TransportEvent::Message { from, data } => match wire::decode(&data) {
                Ok(msg) => self.on_message(from, msg),
                Err(error) => tracing::warn!(peer = %from, %error, "dropping malformed message"),
            },
        }
    }

    fn on_message(&mut self, from: PeerId, msg: ParticipantMessage) {
        if let ParticipantMessage::Introduction(intro) = msg {
            if intro.id != from {
                tracing::warn!(peer = %from, claimed = %intro.id, "dropping malformed introduction for another peer");
                return;
            }
            match self.registry.on_introduction(&from, intro.address) {
                Introduced::New | Introduced::CameOnline => {
                    tracing::info!(peer = %from, address = %intro.address, "peer introduced");
                    self.outbox.notify(Notice::PeerJoined {
                        peer: from,
                        address: intro.address,
                    });
                }
                Introduced::AlreadyOnline => {
                    tracing::debug!(peer = %from, "repeated introduction");
                }
            }
            return;
        }

        let kind = msg.kind();
        let peer = self.registry.get(&from).cloned();
        if let Err(error) = self
            .machine
            .handle_message(&from, peer.as_ref(), msg, &mut self.outbox)
        {
            tracing::warn!(peer = %from, ?kind, %error, "rejected message");
        }
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::CreateChannel {
                peer,
                amount,
                expiry_secs,
                reply,
            } => {
                let result = self.resolve_peer(peer).and_then(|record| {
                    let expiry = expiry_secs.unwrap_or(self.config.default_expiry_secs);
                    Ok(self
                        .machine
                        .create_channel(&record, amount, expiry, &mut self.outbox)?)
                });
                let _ = reply.send(result);
            }
            Command::Authorize { amount, reply } => {
                let result = self.machine.authorize(amount, &mut self.outbox);
                let _ = reply.send(result.map_err(Error::from));
            }
            Command::CloseChannel { voucher, reply } => {
                let result = self.machine.close_channel(voucher, &mut self.outbox);
                let _ = reply.send(result.map_err(Error::from));
            }
            Command::ClaimTimeout { now, reply } => {
                let result = self.machine.claim_timeout(now, &mut self.outbox);
                let _ = reply.send(result.map_err(Error::from));
            }
            Command::LedgerTime { reply } => self.gateway.query_time(reply),
            Command::ExtendExpiration { new_expiry, reply } => {
                let result = self.machine.extend_expiration(new_expiry, &mut self.outbox);
                let _ = reply.send(result.map_err(Error::from));
            }
            Command::SelectPeer { peer, reply } => {
                let _ = reply.send(self.registry.select(&peer).map_err(Error::from));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn resolve_peer(&mut self, peer: Option<PeerId>) -> Result<PeerRecord, Error> {
        match peer {
            Some(id) => self
                .registry
                .get(&id)
                .cloned()
                .ok_or(Error::UnknownPeer(UnknownPeer(id))),
            None => {
                self.registry.select_default_peer();
                self.registry.selected().cloned().ok_or(Error::NoPeerSelected)
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let client = self.machine.client();
        Snapshot {
            local: PeerRecord {
                peer_id: client.peer_id().clone(),
                chain_address: client.address(),
                online: true,
            },
            peers: self.registry.iter().cloned().collect(),
            selected: self.registry.selected().map(|p| p.peer_id.clone()),
            phase: self.machine.phase(),
            channel: self.machine.channel().cloned(),
        }
    }

    /// Execute queued effects. Delivery failures are logged and dropped,
    /// nothing is retried.
    fn flush(&mut self) {
        for effect in self.outbox.drain() {
            match effect {
                Effect::Send { to, msg } => {
                    if let Err(error) = self.wire.send_to_participant(&to, &msg) {
                        tracing::warn!(peer = %to, kind = ?msg.kind(), %error, "failed to send message");
                    }
                }
                Effect::Broadcast(msg) => {
                    if let Err(error) = self.wire.broadcast(&msg) {
                        tracing::warn!(kind = ?msg.kind(), %error, "failed to broadcast message");
                    }
                }
                Effect::Ledger(call) => self.gateway.submit(call),
                Effect::Notify(notice) => {
                    // No subscribers is fine.
                    let _ = self.notices.send(notice);
                }
            }
        }
    }
}

/// Cloneable front door to a running [Session].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    notices: broadcast::Sender<Notice>,
    local: PeerId,
}

impl SessionHandle {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    /// Notices emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Escrow `amount` for `peer` (or the selected peer). Returns once the
    /// ledger call is submitted; the outcome arrives as
    /// [Notice::ChannelOpened] or [Notice::ChannelCreationFailed].
    pub async fn create_channel(
        &self,
        peer: Option<PeerId>,
        amount: U256,
        expiry_secs: Option<u64>,
    ) -> Result<RequestId, Error> {
        self.request(|reply| Command::CreateChannel {
            peer,
            amount,
            expiry_secs,
            reply,
        })
        .await?
    }

    pub async fn authorize(&self, amount: U256) -> Result<Voucher, Error> {
        self.request(|reply| Command::Authorize { amount, reply })
            .await?
    }

    pub async fn close_channel(&self, voucher: Option<Voucher>) -> Result<RequestId, Error> {
        self.request(|reply| Command::CloseChannel { voucher, reply })
            .await?
    }

    /// Current ledger time in seconds.
    pub async fn ledger_time(&self) -> Result<u64, Error> {
        Ok(self.request(|reply| Command::LedgerTime { reply }).await??)
    }

    /// Reclaim the escrow. Rejected locally until the ledger clock has
    /// reached the channel's expiration.
    pub async fn claim_timeout(&self) -> Result<RequestId, Error> {
        let now = self.ledger_time().await?;
        self.request(|reply| Command::ClaimTimeout { now, reply })
            .await?
    }

    pub async fn extend_expiration(&self, new_expiry: u64) -> Result<RequestId, Error> {
        self.request(|reply| Command::ExtendExpiration { new_expiry, reply })
            .await?
    }

    pub async fn select_peer(&self, peer: PeerId) -> Result<(), Error> {
        self.request(|reply| Command::SelectPeer { peer, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot, Error> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}
