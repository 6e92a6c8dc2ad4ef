//! Alice pays Bob three times over a channel and Bob settles.
//!
//! Both sessions share an in-memory room and a simulated ledger. Run with
//! `RUST_LOG=paychan=debug` to see the protocol traffic.

use paychan::{
    config::SimulatedLedgerConfig,
    ledger::SimulatedLedger,
    sig::Signer,
    wire::memory::MemoryNetwork,
    Notice, Session, SessionConfig, U256,
};
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

async fn wait_for(
    notices: &mut broadcast::Receiver<Notice>,
    pred: impl Fn(&Notice) -> bool,
) -> Result<Notice, broadcast::error::RecvError> {
    loop {
        let notice = notices.recv().await?;
        if pred(&notice) {
            return Ok(notice);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Do not use a seeded rng for real keys.
    let mut rng = StdRng::seed_from_u64(42);
    let alice_key = Signer::new(&mut rng);
    let bob_key = Signer::new(&mut rng);
    let (alice_addr, bob_addr) = (alice_key.address(), bob_key.address());

    let ledger = SimulatedLedger::new(SimulatedLedgerConfig {
        latency_ms: 200,
        ..Default::default()
    });
    ledger.fund(alice_addr, U256::from(100));

    let net = MemoryNetwork::new();
    let config = SessionConfig::default();
    let (alice, _) = Session::spawn(
        config.clone(),
        alice_key,
        net.transport("alice"),
        ledger.account(alice_addr),
    )?;
    let mut alice_notices = alice.subscribe();
    let (bob, _) = Session::spawn(config, bob_key, net.transport("bob"), ledger.account(bob_addr))?;
    let mut bob_notices = bob.subscribe();

    wait_for(&mut alice_notices, |n| matches!(n, Notice::PeerJoined { .. })).await?;
    wait_for(&mut bob_notices, |n| matches!(n, Notice::PeerJoined { .. })).await?;

    alice.create_channel(None, U256::from(10), Some(60)).await?;
    let opened = wait_for(&mut bob_notices, |n| matches!(n, Notice::ChannelOpened { .. })).await?;
    println!("Bob: {opened:?}");

    for amount in [1u64, 2, 3] {
        alice.authorize(U256::from(amount)).await?;
        wait_for(&mut bob_notices, |n| matches!(n, Notice::VoucherReceived(_))).await?;
    }

    bob.close_channel(None).await?;
    let closed = wait_for(&mut bob_notices, |n| matches!(n, Notice::ChannelClosed { .. })).await?;
    println!("Bob: {closed:?}");
    wait_for(&mut alice_notices, |n| matches!(n, Notice::ChannelReset { .. })).await?;

    println!(
        "balances: alice {}, bob {}",
        ledger.balance_of(alice_addr),
        ledger.balance_of(bob_addr)
    );

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}
