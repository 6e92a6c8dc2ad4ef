use super::*;
use crate::{
    client::Client,
    ledger::{
        LedgerCall, LedgerError, LedgerOperation, LedgerOutcome, LedgerReply, LedgerRequest,
        OpenedChannel, RequestId,
    },
    messages::{ChannelClose, ChannelCreate, ParticipantMessage},
    peers::PeerRecord,
    session::Notice,
    sig::Signer,
    wire::{Effect, Outbox},
};
use rand::{rngs::StdRng, SeedableRng};

const CHANNEL: Address = Address([0xcc; 20]);
const EXPIRATION: u64 = 1_700_000_060;

#[derive(Debug, Default)]
struct Effects {
    sent: Vec<(PeerId, ParticipantMessage)>,
    ledger: Vec<LedgerCall>,
    notices: Vec<Notice>,
}

fn take(outbox: &mut Outbox) -> Effects {
    let mut fx = Effects::default();
    for effect in outbox.drain() {
        match effect {
            Effect::Send { to, msg } => fx.sent.push((to, msg)),
            Effect::Broadcast(msg) => panic!("unexpected broadcast {msg:?}"),
            Effect::Ledger(call) => fx.ledger.push(call),
            Effect::Notify(notice) => fx.notices.push(notice),
        }
    }
    fx
}

struct Party {
    machine: ChannelMachine,
    record: PeerRecord,
    out: Outbox,
}

impl Party {
    fn new(name: &str, rng: &mut StdRng) -> Self {
        let signer = Signer::new(rng);
        let record = PeerRecord {
            peer_id: PeerId::from(name),
            chain_address: signer.address(),
            online: true,
        };
        Party {
            machine: ChannelMachine::new(Client::new(signer, PeerId::from(name))),
            record,
            out: Outbox::default(),
        }
    }

    fn take(&mut self) -> Effects {
        take(&mut self.out)
    }

    fn reply(&mut self, call: &LedgerCall, result: Result<LedgerOutcome, LedgerError>) {
        self.machine.on_ledger_reply(
            LedgerReply {
                id: call.id,
                operation: call.request.operation(),
                result,
            },
            &mut self.out,
        );
    }

    /// Deliver messages sent by `from`.
    fn receive(
        &mut self,
        from: &Party,
        msgs: Vec<(PeerId, ParticipantMessage)>,
    ) -> Result<(), ChannelError> {
        for (to, msg) in msgs {
            assert_eq!(to, self.record.peer_id);
            self.machine
                .handle_message(&from.record.peer_id, Some(&from.record), msg, &mut self.out)?;
        }
        Ok(())
    }
}

fn parties() -> (Party, Party) {
    let mut rng = StdRng::seed_from_u64(0);
    let alice = Party::new("alice", &mut rng);
    let bob = Party::new("bob", &mut rng);
    (alice, bob)
}

/// Alice opens a channel of `amount` to Bob; both end up `Open`.
fn open(alice: &mut Party, bob: &mut Party, amount: u64) {
    let bob_record = bob.record.clone();
    alice
        .machine
        .create_channel(&bob_record, U256::from(amount), 60, &mut alice.out)
        .unwrap();
    let fx = alice.take();
    assert_eq!(fx.ledger.len(), 1);
    assert!(fx.sent.is_empty(), "nothing is announced before confirmation");
    alice.reply(
        &fx.ledger[0],
        Ok(LedgerOutcome::Opened(OpenedChannel {
            address: CHANNEL,
            expiration: EXPIRATION,
        })),
    );
    let fx = alice.take();
    bob.receive(alice, fx.sent).unwrap();
    bob.take();
}

fn authorize(alice: &mut Party, bob: &mut Party, amount: u64) -> Voucher {
    let voucher = alice
        .machine
        .authorize(U256::from(amount), &mut alice.out)
        .unwrap();
    let fx = alice.take();
    bob.receive(alice, fx.sent).unwrap();
    voucher
}

#[test]
fn create_waits_for_ledger_confirmation() {
    let (mut alice, mut bob) = parties();
    let bob_record = bob.record.clone();

    alice
        .machine
        .create_channel(&bob_record, U256::from(10), 60, &mut alice.out)
        .unwrap();
    assert_eq!(alice.machine.phase(), Phase::AwaitingOpenConfirmation);
    assert_eq!(alice.machine.channel().unwrap().address, None);

    let fx = alice.take();
    assert_eq!(
        fx.ledger[0].request,
        LedgerRequest::OpenChannel {
            receiver: bob.record.chain_address,
            expiry_secs: 60,
            amount: U256::from(10),
        }
    );

    alice.reply(
        &fx.ledger[0],
        Ok(LedgerOutcome::Opened(OpenedChannel {
            address: CHANNEL,
            expiration: EXPIRATION,
        })),
    );
    assert_eq!(alice.machine.phase(), Phase::Open(Role::Sender));
    let fx = alice.take();
    assert_eq!(
        fx.sent,
        vec![(
            bob.record.peer_id.clone(),
            ParticipantMessage::ChannelCreate(ChannelCreate {
                channel_address: CHANNEL,
                channel_balance: U256::from(10),
                expiration: Some(EXPIRATION),
            })
        )]
    );
    assert!(matches!(
        fx.notices[..],
        [Notice::ChannelOpened {
            role: Role::Sender,
            ..
        }]
    ));

    bob.receive(&alice, fx.sent).unwrap();
    assert_eq!(bob.machine.phase(), Phase::Open(Role::Receiver));
    let channel = bob.machine.channel().unwrap();
    assert_eq!(channel.address, Some(CHANNEL));
    assert_eq!(channel.counterparty_address, alice.record.chain_address);
    assert_eq!(channel.expiration, Some(EXPIRATION));
}

#[test]
fn full_lifecycle_with_cooperative_close() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);

    authorize(&mut alice, &mut bob, 1);
    authorize(&mut alice, &mut bob, 3);
    assert_eq!(bob.machine.channel().unwrap().vouchers.len(), 2);
    assert_eq!(bob.machine.channel().unwrap().authorized(), U256::from(3));

    bob.take();
    bob.machine.close_channel(None, &mut bob.out).unwrap();
    assert_eq!(bob.machine.phase(), Phase::Closing(Role::Receiver));
    let fx = bob.take();
    let LedgerRequest::CloseChannel { channel, amount, .. } = fx.ledger[0].request else {
        panic!("expected a close call");
    };
    assert_eq!((channel, amount), (CHANNEL, U256::from(3)));

    bob.reply(&fx.ledger[0], Ok(LedgerOutcome::Closed));
    assert_eq!(bob.machine.phase(), Phase::Closed);
    assert!(bob.machine.channel().is_none());
    let fx = bob.take();
    assert_eq!(
        fx.notices,
        vec![Notice::ChannelClosed {
            channel: CHANNEL,
            amount: U256::from(3)
        }]
    );

    alice.receive(&bob, fx.sent).unwrap();
    assert_eq!(alice.machine.phase(), Phase::Idle);
    assert!(alice.machine.channel().is_none());
    assert_eq!(
        alice.take().notices,
        vec![Notice::ChannelReset { channel: CHANNEL }]
    );

    // Both sides can start over.
    open(&mut alice, &mut bob, 5);
    assert_eq!(bob.machine.phase(), Phase::Open(Role::Receiver));
}

#[test]
fn authorized_amounts_never_decrease() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);

    authorize(&mut alice, &mut bob, 5);
    let err = alice
        .machine
        .authorize(U256::from(4), &mut alice.out)
        .unwrap_err();
    assert_eq!(
        err,
        ChannelError::ProtocolViolation(Violation::NonMonotonic {
            last: U256::from(5),
            requested: U256::from(4)
        })
    );
    assert!(alice.take().sent.is_empty());

    // Re-signing the same amount is harmless.
    authorize(&mut alice, &mut bob, 5);
    assert_eq!(alice.machine.channel().unwrap().vouchers.len(), 2);
}

#[test]
fn receiver_verifies_vouchers() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);
    authorize(&mut alice, &mut bob, 5);
    bob.take();

    // Lower than what was already accepted.
    let lower = Voucher::new(&alice.machine.client().signer, CHANNEL, U256::from(4));
    assert!(matches!(
        bob.receive(&alice, vec![(bob.record.peer_id.clone(), ParticipantMessage::Voucher(lower))]),
        Err(ChannelError::ProtocolViolation(Violation::NonMonotonic { .. }))
    ));

    // Signed by somebody other than the sender.
    let forged = Voucher::new(&bob.machine.client().signer, CHANNEL, U256::from(9));
    assert!(matches!(
        bob.receive(&alice, vec![(bob.record.peer_id.clone(), ParticipantMessage::Voucher(forged))]),
        Err(ChannelError::ProtocolViolation(Violation::WrongSigner { .. }))
    ));

    // Structurally broken signature.
    let broken = Voucher {
        signature: crate::types::Signature([0; 65]),
        ..forged
    };
    assert!(matches!(
        bob.receive(&alice, vec![(bob.record.peer_id.clone(), ParticipantMessage::Voucher(broken))]),
        Err(ChannelError::InvalidSignature(_))
    ));

    assert_eq!(bob.machine.channel().unwrap().authorized(), U256::from(5));
    assert!(bob.take().notices.is_empty());
}

#[test]
fn irrelevant_vouchers_are_ignored() {
    let (mut alice, mut bob) = parties();
    let mut rng = StdRng::seed_from_u64(9);
    let mallory = Party::new("mallory", &mut rng);
    open(&mut alice, &mut bob, 10);
    let voucher = authorize(&mut alice, &mut bob, 2);
    bob.take();

    // Duplicate delivery.
    bob.receive(&alice, vec![(bob.record.peer_id.clone(), ParticipantMessage::Voucher(voucher))])
        .unwrap();

    // For another channel.
    let other = Voucher::new(&alice.machine.client().signer, Address([1; 20]), U256::from(7));
    bob.receive(&alice, vec![(bob.record.peer_id.clone(), ParticipantMessage::Voucher(other))])
        .unwrap();

    // Relayed by a third party.
    let relayed = Voucher::new(&alice.machine.client().signer, CHANNEL, U256::from(7));
    bob.receive(&mallory, vec![(bob.record.peer_id.clone(), ParticipantMessage::Voucher(relayed))])
        .unwrap();

    assert_eq!(bob.machine.channel().unwrap().vouchers, vec![voucher]);
    assert!(bob.take().notices.is_empty());
}

#[test]
fn illegal_phases_are_rejected() {
    let (mut alice, mut bob) = parties();
    let bob_record = bob.record.clone();

    assert!(matches!(
        alice.machine.authorize(U256::one(), &mut alice.out),
        Err(ChannelError::ProtocolViolation(Violation::IllegalPhase { phase: Phase::Idle, .. }))
    ));
    assert!(alice.machine.claim_timeout(EXPIRATION, &mut alice.out).is_err());

    alice
        .machine
        .create_channel(&bob_record, U256::from(10), 60, &mut alice.out)
        .unwrap();
    assert!(matches!(
        alice
            .machine
            .create_channel(&bob_record, U256::from(10), 60, &mut alice.out),
        Err(ChannelError::ProtocolViolation(Violation::IllegalPhase {
            phase: Phase::AwaitingOpenConfirmation,
            ..
        }))
    ));
    alice.take();

    let mut alice2 = parties().0;
    open(&mut alice2, &mut bob, 10);
    // Roles are not interchangeable.
    assert!(alice2.machine.close_channel(None, &mut alice2.out).is_err());
    assert!(bob.machine.claim_timeout(EXPIRATION, &mut bob.out).is_err());
    assert!(bob.machine.authorize(U256::one(), &mut bob.out).is_err());
    assert!(bob.machine.extend_expiration(EXPIRATION + 1, &mut bob.out).is_err());
    assert!(alice2.take().ledger.is_empty());
    assert!(bob.take().ledger.is_empty());
}

#[test]
fn failed_open_returns_to_idle() {
    let (mut alice, bob) = parties();
    alice
        .machine
        .create_channel(&bob.record, U256::from(1000), 60, &mut alice.out)
        .unwrap();
    let fx = alice.take();
    let error = LedgerError::InsufficientFunds {
        available: U256::from(100),
        required: U256::from(1000),
    };
    alice.reply(&fx.ledger[0], Err(error.clone()));

    assert_eq!(alice.machine.phase(), Phase::Idle);
    assert!(alice.machine.channel().is_none());
    let fx = alice.take();
    assert!(fx.sent.is_empty());
    assert_eq!(
        fx.notices,
        vec![
            Notice::LedgerCallFailed {
                operation: LedgerOperation::OpenChannel,
                channel: None,
                error: error.clone(),
            },
            Notice::ChannelCreationFailed { error },
        ]
    );
}

#[test]
fn close_needs_a_voucher() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);
    assert_eq!(
        bob.machine.close_channel(None, &mut bob.out),
        Err(ChannelError::ProtocolViolation(Violation::NoVoucher))
    );

    let foreign = Voucher::new(&alice.machine.client().signer, Address([1; 20]), U256::one());
    assert!(matches!(
        bob.machine.close_channel(Some(foreign), &mut bob.out),
        Err(ChannelError::ProtocolViolation(Violation::ChannelMismatch { .. }))
    ));
    assert_eq!(bob.machine.phase(), Phase::Open(Role::Receiver));
}

#[test]
fn rejected_settlement_keeps_channel_open() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);
    authorize(&mut alice, &mut bob, 11);
    bob.take();

    bob.machine.close_channel(None, &mut bob.out).unwrap();
    let fx = bob.take();
    let error = LedgerError::Reverted("amount exceeds the escrow".into());
    bob.reply(&fx.ledger[0], Err(error.clone()));

    assert_eq!(bob.machine.phase(), Phase::Open(Role::Receiver));
    assert_eq!(bob.machine.channel().unwrap().authorized(), U256::from(11));
    let fx = bob.take();
    assert!(fx.sent.is_empty());
    assert_eq!(
        fx.notices,
        vec![
            Notice::LedgerCallFailed {
                operation: LedgerOperation::CloseChannel,
                channel: Some(CHANNEL),
                error: error.clone(),
            },
            Notice::SettlementRejected {
                channel: CHANNEL,
                error
            },
        ]
    );

    // Not retried, but may be retried by hand.
    assert!(bob.machine.close_channel(None, &mut bob.out).is_ok());
}

#[test]
fn close_for_other_channel_is_ignored() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);

    let stale = ParticipantMessage::ChannelClose(ChannelClose {
        channel_address: Address([1; 20]),
    });
    alice
        .receive(&bob, vec![(alice.record.peer_id.clone(), stale)])
        .unwrap();
    assert_eq!(alice.machine.phase(), Phase::Open(Role::Sender));
    assert_eq!(alice.machine.channel().unwrap().address, Some(CHANNEL));
    assert!(alice.take().notices.is_empty());
}

#[test]
fn reply_for_superseded_channel_is_dropped() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);
    authorize(&mut alice, &mut bob, 1);
    bob.take();

    bob.machine.close_channel(None, &mut bob.out).unwrap();
    let close_call = bob.take().ledger.remove(0);

    // Meanwhile the sender gives up on the channel.
    let reset = ParticipantMessage::ChannelClose(ChannelClose {
        channel_address: CHANNEL,
    });
    bob.receive(&alice, vec![(bob.record.peer_id.clone(), reset)])
        .unwrap();
    assert_eq!(bob.machine.phase(), Phase::Idle);
    bob.take();

    bob.reply(&close_call, Ok(LedgerOutcome::Closed));
    assert_eq!(bob.machine.phase(), Phase::Idle);
    let fx = bob.take();
    assert!(fx.sent.is_empty());
    assert!(fx.notices.is_empty());
    assert_eq!(bob.machine.pending_calls(), 0);

    // Replies nobody asked for are dropped as well.
    bob.reply(&close_call, Ok(LedgerOutcome::Closed));
    assert!(bob.take().notices.is_empty());
}

#[test]
fn expiration_only_moves_forward() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);

    assert_eq!(
        alice.machine.extend_expiration(EXPIRATION, &mut alice.out),
        Err(ChannelError::ProtocolViolation(Violation::ExpirationNotLater {
            current: EXPIRATION,
            requested: EXPIRATION
        }))
    );

    alice
        .machine
        .extend_expiration(EXPIRATION + 30, &mut alice.out)
        .unwrap();
    let extend = alice.take().ledger.remove(0);
    // One ledger call at a time.
    assert_eq!(
        alice.machine.claim_timeout(EXPIRATION, &mut alice.out),
        Err(ChannelError::ProtocolViolation(Violation::CallInFlight(
            LedgerOperation::ExtendExpiration
        )))
    );
    // Vouchers can still be signed meanwhile.
    authorize(&mut alice, &mut bob, 1);

    alice.reply(&extend, Ok(LedgerOutcome::ExpirationExtended(EXPIRATION + 30)));
    assert_eq!(alice.machine.channel().unwrap().expiration, Some(EXPIRATION + 30));
    assert_eq!(
        alice.take().notices,
        vec![Notice::ExpirationExtended {
            channel: CHANNEL,
            expiration: EXPIRATION + 30
        }]
    );
    assert!(alice.machine.claim_timeout(EXPIRATION + 30, &mut alice.out).is_ok());
}

#[test]
fn failed_extension_keeps_expiration() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);

    alice
        .machine
        .extend_expiration(EXPIRATION + 30, &mut alice.out)
        .unwrap();
    let extend = alice.take().ledger.remove(0);
    alice.reply(&extend, Err(LedgerError::Reverted("only the sender can extend".into())));

    assert_eq!(alice.machine.phase(), Phase::Open(Role::Sender));
    assert_eq!(alice.machine.channel().unwrap().expiration, Some(EXPIRATION));
    assert_eq!(
        alice.take().notices,
        vec![Notice::LedgerCallFailed {
            operation: LedgerOperation::ExtendExpiration,
            channel: Some(CHANNEL),
            error: LedgerError::Reverted("only the sender can extend".into()),
        }]
    );

    // The slot is free again.
    assert!(alice.machine.claim_timeout(EXPIRATION, &mut alice.out).is_ok());
    assert_eq!(alice.take().ledger.len(), 1);
}

#[test]
fn timeout_claim() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);

    // Too early by the last known ledger time: nothing is sent.
    assert_eq!(
        alice.machine.claim_timeout(EXPIRATION - 1, &mut alice.out),
        Err(ChannelError::ProtocolViolation(Violation::NotExpired {
            now: EXPIRATION - 1,
            expiration: EXPIRATION
        }))
    );
    assert_eq!(alice.machine.phase(), Phase::Open(Role::Sender));
    assert!(alice.take().ledger.is_empty());
    // No call is left in flight.
    alice
        .machine
        .extend_expiration(EXPIRATION + 1, &mut alice.out)
        .unwrap();
    let extend = alice.take().ledger.remove(0);
    alice.reply(&extend, Ok(LedgerOutcome::ExpirationExtended(EXPIRATION + 1)));
    alice.take();

    // The ledger may still refuse; the channel stays usable.
    alice.machine.claim_timeout(EXPIRATION + 1, &mut alice.out).unwrap();
    assert_eq!(alice.machine.phase(), Phase::Closing(Role::Sender));
    let fx = alice.take();
    alice.reply(
        &fx.ledger[0],
        Err(LedgerError::Reverted("channel has not expired".into())),
    );
    assert_eq!(alice.machine.phase(), Phase::Open(Role::Sender));
    assert!(matches!(
        alice.take().notices[..],
        [Notice::LedgerCallFailed {
            operation: LedgerOperation::ClaimTimeout,
            ..
        }]
    ));

    alice.machine.claim_timeout(EXPIRATION + 1, &mut alice.out).unwrap();
    let fx = alice.take();
    alice.reply(&fx.ledger[0], Ok(LedgerOutcome::TimeoutClaimed));
    assert_eq!(alice.machine.phase(), Phase::Expired);
    assert!(alice.machine.channel().is_none());

    let fx = alice.take();
    assert_eq!(fx.notices, vec![Notice::ChannelExpired { channel: CHANNEL }]);
    bob.receive(&alice, fx.sent).unwrap();
    assert_eq!(bob.machine.phase(), Phase::Idle);
}

#[test]
fn announcements_need_an_introduced_sender() {
    let (alice, mut bob) = parties();
    let create = ParticipantMessage::ChannelCreate(ChannelCreate {
        channel_address: CHANNEL,
        channel_balance: U256::from(10),
        expiration: None,
    });
    bob.machine
        .handle_message(&alice.record.peer_id, None, create.clone(), &mut bob.out)
        .unwrap();
    assert_eq!(bob.machine.phase(), Phase::Idle);

    bob.receive(&alice, vec![(bob.record.peer_id.clone(), create.clone())])
        .unwrap();
    assert_eq!(bob.machine.phase(), Phase::Open(Role::Receiver));
    assert_eq!(bob.take().notices.len(), 1);

    // Duplicates change nothing.
    bob.receive(&alice, vec![(bob.record.peer_id.clone(), create)])
        .unwrap();
    assert!(bob.take().notices.is_empty());
}

#[test]
fn request_ids_are_unique() {
    let (mut alice, mut bob) = parties();
    open(&mut alice, &mut bob, 10);
    let a = alice
        .machine
        .extend_expiration(EXPIRATION + 1, &mut alice.out)
        .unwrap();
    let call = alice.take().ledger.remove(0);
    alice.reply(&call, Ok(LedgerOutcome::ExpirationExtended(EXPIRATION + 1)));
    let b = alice.machine.claim_timeout(EXPIRATION + 1, &mut alice.out).unwrap();
    assert_ne!(a, b);
    assert!(a > RequestId(0));
}

#[test]
fn voucher_overtaking_announcement_is_superseded() {
    let (mut alice, mut bob) = parties();
    let bob_record = bob.record.clone();
    alice
        .machine
        .create_channel(&bob_record, U256::from(10), 60, &mut alice.out)
        .unwrap();
    let call = alice.take().ledger.remove(0);
    alice.reply(
        &call,
        Ok(LedgerOutcome::Opened(OpenedChannel {
            address: CHANNEL,
            expiration: EXPIRATION,
        })),
    );
    let announcement = alice.take().sent;
    alice.machine.authorize(U256::from(1), &mut alice.out).unwrap();
    let first = alice.take().sent;

    // Delivered out of order: the voucher is lost.
    bob.receive(&alice, first).unwrap();
    bob.receive(&alice, announcement).unwrap();
    assert!(bob.machine.channel().unwrap().vouchers.is_empty());
    bob.take();

    let second = authorize(&mut alice, &mut bob, 2);
    assert_eq!(bob.machine.channel().unwrap().latest_voucher(), Some(&second));
    bob.machine.close_channel(None, &mut bob.out).unwrap();
    let fx = bob.take();
    assert!(matches!(
        &fx.ledger[0].request,
        LedgerRequest::CloseChannel { amount, .. } if *amount == U256::from(2)
    ));
}
