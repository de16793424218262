//! The assembled core against scripted collaborators: stream events land in
//! the caches and the tracker, gap refreshes resynchronize through the
//! snapshot source, balance reads coalesce, and shutdown is clean.

mod common;

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use common::{
    wait_until, NullRestTransport, ScriptedTransport, StaticBalanceSource, StaticSnapshotSource,
    TestAdapter,
};
use lanyard::{
    ConnectionState, ConnectivityConfig, ConnectivityHub, HubServices, MarketEvent, OrderStatus,
    RateReading, StreamChannel, SystemClock,
};

const WAIT: Duration = Duration::from_secs(5);

fn test_hub() -> (
    ConnectivityHub,
    tokio::sync::mpsc::UnboundedReceiver<common::ConnectionHandle>,
    Arc<StaticBalanceSource>,
) {
    test_hub_with(Some(Arc::new(StaticSnapshotSource {
        quantity: dec!(10),
        filled: dec!(5),
        sequence: 5,
    })))
}

fn test_hub_with(
    snapshot_source: Option<Arc<StaticSnapshotSource>>,
) -> (
    ConnectivityHub,
    tokio::sync::mpsc::UnboundedReceiver<common::ConnectionHandle>,
    Arc<StaticBalanceSource>,
) {
    let mut config = ConnectivityConfig::default();
    config.stream.public_url = "wss://exchange.test/public".to_string();
    config.stream.private_url = "wss://exchange.test/private".to_string();
    config.stream.reconnect_jitter = false;
    config.stream.reconnect_base_secs = 1;

    let (transport, handles) = ScriptedTransport::new();
    let balance_source = StaticBalanceSource::new();

    let services = HubServices {
        rest_transport: Arc::new(NullRestTransport),
        stream_transport: transport,
        adapter: Arc::new(TestAdapter),
        signer: None,
        clock: Arc::new(SystemClock),
        balance_source: balance_source.clone(),
        snapshot_source: snapshot_source
            .map(|s| s as Arc<dyn lanyard::SnapshotSource>),
    };

    (ConnectivityHub::start(config, services), handles, balance_source)
}

#[tokio::test]
async fn funding_events_land_in_the_cache() {
    let (hub, mut handles, _balances) = test_hub();
    hub.subscribe(StreamChannel::Funding, "ENAUSDT").await;

    let mut state = hub.spawn_public_stream().await;
    let conn = handles.recv().await.unwrap();
    while *state.borrow() != ConnectionState::Connected {
        state.changed().await.unwrap();
    }

    conn.inject(serde_json::json!({
        "op": "funding",
        "symbol": "ENAUSDT",
        "rate": "0.0005",
        "interval_secs": 3600,
    }));

    wait_until(WAIT, || hub.funding().get("ENAUSDT").is_some()).await;
    match hub.funding().get("ENAUSDT").unwrap() {
        RateReading::Fresh(sample) => assert_eq!(sample.rate, dec!(0.0005)),
        RateReading::Stale(_) => panic!("sample should be fresh"),
    }
}

#[tokio::test]
async fn out_of_bounds_streamed_funding_is_rejected() {
    let (hub, mut handles, _balances) = test_hub();
    hub.subscribe(StreamChannel::Funding, "ENAUSDT").await;

    let _state = hub.spawn_public_stream().await;
    let conn = handles.recv().await.unwrap();
    let mut diagnostics = hub.diagnostics();

    // 5% per hour against the default 0.1%/h bound.
    conn.inject(serde_json::json!({
        "op": "funding",
        "symbol": "ENAUSDT",
        "rate": "0.05",
        "interval_secs": 3600,
    }));

    loop {
        let diag = tokio::time::timeout(WAIT, diagnostics.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(diag.event, lanyard::DiagnosticEvent::FundingRejected { .. }) {
            break;
        }
    }
    assert!(hub.funding().get("ENAUSDT").is_none());
}

#[tokio::test]
async fn gap_triggers_snapshot_resync() {
    let (hub, mut handles, _balances) = test_hub();
    hub.subscribe(StreamChannel::UserOrders, "ENAUSDT").await;

    let _state = hub.spawn_public_stream().await;
    let conn = handles.recv().await.unwrap();

    // First observation is a streamed fill with a sequence ahead of
    // anything known: the tracker creates the record and asks for a
    // snapshot, which the scripted source answers at sequence 5.
    conn.inject(serde_json::json!({
        "op": "fill",
        "order_id": "o-7",
        "fill_id": "f-1",
        "qty": "2",
        "price": "1.1",
        "seq": 3,
    }));

    wait_until(WAIT, || {
        hub.orders()
            .status("o-7")
            .is_some_and(|r| !r.pending_refresh && r.quantity.is_some())
    })
    .await;

    let record = hub.orders().status("o-7").unwrap();
    assert_eq!(record.quantity, Some(dec!(10)));
    assert_eq!(record.filled_quantity, dec!(5));
    assert_eq!(record.status, OrderStatus::PartiallyFilled);
    assert_eq!(record.last_sequence, 5);
}

#[tokio::test]
async fn fills_and_terminal_status_reconcile() {
    // No snapshot source: reconciliation is driven by the stream alone.
    let (hub, mut handles, _balances) = test_hub_with(None);
    let _state = hub.spawn_public_stream().await;
    let conn = handles.recv().await.unwrap();

    conn.inject(serde_json::json!({
        "op": "fill", "order_id": "o-1", "fill_id": "f-1",
        "qty": "2", "price": "1.0", "seq": 1,
    }));
    conn.inject(serde_json::json!({
        "op": "fill", "order_id": "o-1", "fill_id": "f-1",
        "qty": "2", "price": "1.0", "seq": 1,
    }));
    conn.inject(serde_json::json!({
        "op": "status", "order_id": "o-1", "status": "cancelled", "seq": 2,
    }));
    // Late fill after the terminal status must be discarded.
    conn.inject(serde_json::json!({
        "op": "fill", "order_id": "o-1", "fill_id": "f-2",
        "qty": "3", "price": "1.0", "seq": 3,
    }));

    wait_until(WAIT, || {
        hub.orders()
            .status("o-1")
            .is_some_and(|r| r.status == OrderStatus::Cancelled)
    })
    .await;

    let record = hub.orders().status("o-1").unwrap();
    assert_eq!(record.filled_quantity, dec!(2));
}

#[tokio::test]
async fn market_data_fans_out_to_the_engine() {
    let (hub, mut handles, _balances) = test_hub();
    let mut market = hub.market_events();

    let _state = hub.spawn_public_stream().await;
    let conn = handles.recv().await.unwrap();

    conn.inject(serde_json::json!({
        "op": "trade",
        "symbol": "SOLUSDT",
        "price": "145.2",
        "qty": "3",
    }));

    let event = tokio::time::timeout(WAIT, market.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        MarketEvent::Trade { symbol, price, .. } => {
            assert_eq!(symbol, "SOLUSDT");
            assert_eq!(price, dec!(145.2));
        }
        other => panic!("unexpected market event {:?}", other),
    }
}

#[tokio::test]
async fn balance_reads_share_fetches() {
    let (hub, _handles, balances) = test_hub();

    hub.balances().get("USDT").await.unwrap();
    hub.balances().get("USDT").await.unwrap();
    assert_eq!(balances.count(), 1);

    hub.balances().get_refresh("USDT", true).await.unwrap();
    assert_eq!(balances.count(), 2);
}

#[tokio::test]
async fn stop_shuts_everything_down() {
    let (hub, mut handles, _balances) = test_hub();
    hub.subscribe(StreamChannel::Funding, "ENAUSDT").await;

    let mut state = hub.spawn_public_stream().await;
    let conn = handles.recv().await.unwrap();
    while *state.borrow() != ConnectionState::Connected {
        state.changed().await.unwrap();
    }

    hub.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Shutdown);

    // Writes after shutdown are refused.
    conn.inject(serde_json::json!({
        "op": "funding",
        "symbol": "SOLUSDT",
        "rate": "0.0005",
        "interval_secs": 3600,
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hub.funding().get("SOLUSDT").is_none());
}
