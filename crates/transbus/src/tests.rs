//! Tests for connections, the pending-call window and routing on a single bus.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot::error::TryRecvError;
use tracing_subscriber::EnvFilter;

use transpack::Header;
use transpack::ObjectId;
use transpack::Reference;
use transpack::RouteToken;
use transpack::TransverseId;

use crate::bus::Bus;
use crate::bus::BusConfig;
use crate::channel::ChannelTransport;
use crate::connection::Connection;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::exposed::CallKind;
use crate::exposed::ExposedCall;
use crate::exposed::TransverseMap;
use crate::exposed::handler;
use crate::filter::Filter;
use crate::filter::FilterElement;
use crate::filter::XorFilter;
use crate::master::BusMaster;
use crate::proxy::ObjectProxy;
use crate::proxy::ServiceProxy;
use crate::route::OpenRoute;
use crate::route::Route;
use crate::route::RouteError;
use crate::service::Interface;
use crate::service::ServiceError;
use crate::service::ServiceImplementation;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::value::Exposed;
use crate::value::Shared;
use crate::value::Type;
use crate::value::Value;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn seed(config: BusConfig) -> Result<(Bus, Connection)> {
    init_tracing();
    let bus = Bus::new(config);
    let serving = bus.bootstrap_on_local_master(BusMaster::new())?;
    Ok((bus, serving))
}

struct Counter {
    value: AtomicI32,
}

impl Exposed for Counter {
    fn interface(&self) -> Option<&str> {
        Some("Counter")
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

fn echo_interface() -> Arc<Interface> {
    Interface::new("Echo")
        .function("echo", vec![Type::String], vec![Type::String])
        .function("fail", vec![Type::Int32], vec![])
        .shared()
}

fn counter_interface() -> Arc<Interface> {
    Interface::new("Counter")
        .function("make", vec![], vec![Type::object("Counter")])
        .method("increment", vec![], vec![Type::Int32])
        .shared()
}

async fn offer_echo(serving: &Connection) -> Result<()> {
    let service = ServiceImplementation::new(echo_interface())
        .implement(
            "echo",
            handler(|_, args| async move { Ok(vec![Value::string(format!("echo: {}", args[0].as_str()?))]) }),
        )
        .implement(
            "fail",
            handler(|_, args| async move {
                match args[0].as_int32()? {
                    0 => Err(Error::Fault(Fault::Application("quota".into()))),
                    _ => Err(Error::Local("table 7 is corrupt".into())),
                }
            }),
        )
        .build()?;
    service.offer_on(serving, true).await
}

async fn offer_counter(serving: &Connection) -> Result<()> {
    let counter: Shared = Arc::new(Counter { value: AtomicI32::new(0) });
    let service = ServiceImplementation::new(counter_interface())
        .implement(
            "make",
            handler(move |_, _| {
                let counter = counter.clone();
                async move { Ok(vec![Value::local(counter)]) }
            }),
        )
        .implement(
            "increment",
            handler(|_, args| async move {
                let counter = args[0].as_local::<Counter>()?;
                Ok(vec![Value::Int32(counter.value.fetch_add(1, Ordering::SeqCst) + 1)])
            }),
        )
        .build()?;
    service.offer_on(serving, true).await
}

/// A second connection on the same bus, routed to `interface`.
async fn client_of(bus: &Bus, interface: Arc<Interface>) -> Result<(Connection, ServiceProxy)> {
    let client = bus.new_connection().await?;
    let proxy = ServiceProxy::on(&client, interface).await?;
    Ok((client, proxy))
}

// --- Test 1: Object identity ---

#[tokio::test]
async fn test_share_object_is_stable() -> Result<()> {
    let (_bus, serving) = seed(BusConfig::default())?;
    let a: Shared = Arc::new(Counter { value: AtomicI32::new(0) });
    let b: Shared = Arc::new(Counter { value: AtomicI32::new(0) });

    let first = serving.share_object(&a);
    assert_eq!(serving.share_object(&a), first);
    assert_ne!(serving.share_object(&b), first);
    assert_eq!(first.connection, serving.id());
    Ok(())
}

#[tokio::test]
async fn test_unshared_reference_is_unknown() -> Result<()> {
    let (_bus, serving) = seed(BusConfig::default())?;
    let bogus = Reference::new(serving.id(), ObjectId(999));
    let result = serving.resolve_local_reference(bogus, &crate::value::Capability::Any);
    assert!(matches!(result, Err(Error::Fault(Fault::UnknownObjectId(ObjectId(999))))));
    Ok(())
}

// --- Test 2: Calls across connections on one bus ---

#[tokio::test]
async fn test_echo_on_same_bus() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    offer_echo(&serving).await?;
    let (client, echo) = client_of(&bus, echo_interface()).await?;

    let reply = echo.call("echo", vec!["hi".into()]).await?;
    assert_eq!(reply[0].as_str()?, "echo: hi");

    let tid = echo_interface().transverse_id("echo")?;
    assert!(client.cached_reference(serving.id(), &tid).is_some());
    assert_eq!(bus.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_service_is_unknown() -> Result<()> {
    let (bus, _serving) = seed(BusConfig::default())?;
    let result = client_of(&bus, echo_interface()).await;
    assert!(matches!(result, Err(Error::Fault(Fault::UnknownTransverseId(_)))));
    Ok(())
}

#[tokio::test]
async fn test_unoffered_member_is_unknown_transverse_id() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    offer_echo(&serving).await?;
    let wider = Interface::new("Echo")
        .function("echo", vec![Type::String], vec![Type::String])
        .function("shout", vec![Type::String], vec![Type::String])
        .shared();
    let (_client, echo) = client_of(&bus, wider).await?;

    let result = echo.call("shout", vec!["hi".into()]).await;
    let expected = TransverseId::from_name("Echo::shout");
    assert!(matches!(result, Err(Error::Remote(Fault::UnknownTransverseId(tid))) if tid == expected));
    Ok(())
}

// --- Test 3: Faults crossing the wire ---

#[tokio::test]
async fn test_unknown_object_becomes_message_error() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    offer_counter(&serving).await?;
    let (_client, counters) = client_of(&bus, counter_interface()).await?;

    let bogus = ObjectProxy::new(counters.route().clone(), Reference::new(serving.id(), ObjectId(999)));
    let increment = counters.interface().member("increment")?;
    let result = bogus.bind(increment).eval(vec![]).await;
    assert!(matches!(result, Err(Error::Remote(Fault::UnknownObjectId(ObjectId(999))))));
    assert_eq!(bus.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_wrong_capability_is_type_mismatch() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    offer_counter(&serving).await?;
    let (client, counters) = client_of(&bus, counter_interface()).await?;

    // Resolving `make` hands us a reference to a call, not to a counter.
    counters.call("make", vec![]).await?;
    let make = counters.interface().transverse_id("make")?;
    let call = client.cached_reference(serving.id(), &make).ok_or(Error::Local("not cached".into()))?;

    let impostor = ObjectProxy::new(counters.route().clone(), call);
    let result = impostor.bind(counters.interface().member("increment")?).eval(vec![]).await;
    assert!(matches!(result, Err(Error::Remote(Fault::TypeMismatch(_)))));
    Ok(())
}

#[tokio::test]
async fn test_same_bus_objects_resolve_locally() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    offer_counter(&serving).await?;
    let (_client, counters) = client_of(&bus, counter_interface()).await?;

    let made = counters.call("make", vec![]).await?;
    let counter = made[0].as_local::<Counter>()?;
    counter.value.store(41, Ordering::SeqCst);

    let object = made[0].as_object()?.local().cloned().ok_or(Error::Local("not local".into()))?;
    let bound = crate::proxy::BoundCall::new(
        counters.route().clone(),
        counters.interface().member("increment")?.clone(),
        Some(Value::local(object)),
    );
    let result = bound.eval(vec![]).await?;
    assert_eq!(result[0].as_int32()?, 42);
    Ok(())
}

#[tokio::test]
async fn test_application_fault_passes_through() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    offer_echo(&serving).await?;
    let (_client, echo) = client_of(&bus, echo_interface()).await?;

    let result = echo.call("fail", vec![Value::Int32(0)]).await;
    assert!(matches!(result, Err(Error::Remote(Fault::Application(s))) if s == "quota"));
    Ok(())
}

#[tokio::test]
async fn test_local_error_is_withheld() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.set_local_exception_handler(move |e| {
        sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(e.to_string());
    });
    offer_echo(&serving).await?;
    let (_client, echo) = client_of(&bus, echo_interface()).await?;

    let result = echo.call("fail", vec![Value::Int32(1)]).await;
    assert!(matches!(result, Err(Error::Remote(Fault::UnknownError))));

    let seen = seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    assert!(seen.iter().any(|e| e.contains("table 7")));
    Ok(())
}

#[tokio::test]
async fn test_debug_errors_serialize_local_errors() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default().with_debug_errors(true))?;
    offer_echo(&serving).await?;
    let (_client, echo) = client_of(&bus, echo_interface()).await?;

    let result = echo.call("fail", vec![Value::Int32(1)]).await;
    assert!(matches!(result, Err(Error::Remote(Fault::SerializedError(s))) if s.contains("table 7")));
    Ok(())
}

#[tokio::test]
async fn test_malformed_message_raises_general_error() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.set_failure_handler(move |_, fault| {
        let _ = tx.send(fault.clone());
    });
    offer_echo(&serving).await?;
    let (_client, echo) = client_of(&bus, echo_interface()).await?;

    echo.route().send(vec![0xff, 0x00]).await?;
    let fault = rx.recv().await.ok_or(Error::Shutdown)?;
    assert!(matches!(fault, Fault::Decoding(_)));
    Ok(())
}

// --- Test 4: Reply correlation ---

#[tokio::test]
async fn test_reply_on_wrong_route_is_rejected() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (transport, _peer) = ChannelTransport::pair();
    let asked = Route::new(transport.clone(), &serving);
    let stranger = Route::new(transport, &serving);

    let (id, mut rx) = bus.await_reply(&asked);
    let spoofed = bus.resolve_reply(id, &stranger);
    assert!(matches!(spoofed, Err(Error::Fault(Fault::UnknownMessageId(m))) if m == id));
    assert_eq!(bus.pending_calls(), 1);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    let waiter = bus.resolve_reply(id, &asked)?;
    let _ = waiter.send(Ok(vec![7]));
    assert_eq!(rx.await.map_err(|_| Error::Shutdown)??, vec![7]);
    Ok(())
}

#[tokio::test]
async fn test_spoofed_reply_does_not_settle_call() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.set_local_exception_handler(move |e| {
        sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(e.clone());
    });

    let (transport, _peer) = ChannelTransport::pair();
    let asked = Route::new(transport.clone(), &serving);
    let stranger = Route::new(transport, &serving);
    let (id, mut rx) = bus.await_reply(&asked);

    let mut enc = transpack::Encoder::new();
    enc.header(Header::Reply);
    enc.id(id);
    serving.dispatch(stranger.clone(), enc.into_bytes()).await;

    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(bus.pending_calls(), 1);
    // The stranger has nowhere to send the error, so it is closed.
    assert!(stranger.is_closed());
    let seen = seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    assert!(seen.iter().any(|e| matches!(e, Error::RemoteEndFailure(_))));
    Ok(())
}

#[tokio::test]
async fn test_call_settles_exactly_once() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (transport, _peer) = ChannelTransport::pair();
    let route = Route::new(transport, &serving);

    let (id, rx) = bus.await_reply(&route);
    let waiter = bus.resolve_reply(id, &route)?;
    assert!(matches!(bus.resolve_reply(id, &route), Err(Error::Fault(Fault::UnknownMessageId(_)))));
    let _ = waiter.send(Ok(Vec::new()));
    assert!(rx.await.map_err(|_| Error::Shutdown)?.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_message_ids_increase() -> Result<()> {
    let (bus, _serving) = seed(BusConfig::default())?;
    let first = bus.next_message_id();
    let second = bus.next_message_id();
    assert!(second > first);
    Ok(())
}

// --- Test 5: Timeout window ---

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_within_window() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (transport, _peer) = ChannelTransport::pair();
    let route = Route::new(transport, &serving);

    let started = tokio::time::Instant::now();
    let (_id, mut rx) = bus.await_reply(&route);

    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    let settled = rx.await.map_err(|_| Error::Shutdown)?;
    let elapsed = started.elapsed();
    assert!(matches!(settled, Err(Error::Timeout)));
    assert!(elapsed >= Duration::from_millis(2000), "fired after {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(2500), "fired after {:?}", elapsed);
    assert_eq!(bus.pending_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_answered_call_never_times_out() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (transport, _peer) = ChannelTransport::pair();
    let route = Route::new(transport, &serving);

    let (id, rx) = bus.await_reply(&route);
    let waiter = bus.resolve_reply(id, &route)?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let _ = waiter.send(Ok(vec![1]));
    assert_eq!(rx.await.map_err(|_| Error::Shutdown)??, vec![1]);
    Ok(())
}

#[test]
fn test_timeout_window_bounds() {
    let config = BusConfig::default();
    assert_eq!(config.timeout_window(), (Duration::from_millis(2000), Duration::from_millis(2500)));
    let short = BusConfig::default().with_window_len(2).with_tick(Duration::from_millis(10));
    assert_eq!(short.timeout_window(), (Duration::from_millis(10), Duration::from_millis(20)));
}

#[tokio::test]
async fn test_shutdown_fails_pending_calls() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (transport, _peer) = ChannelTransport::pair();
    let route = Route::new(transport, &serving);

    let (_id, rx) = bus.await_reply(&route);
    bus.shutdown();
    assert!(matches!(rx.await.map_err(|_| Error::Local("dropped".into()))?, Err(Error::Shutdown)));
    assert!(bus.is_shut_down());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_call_just_before_a_tick_gets_the_full_window() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (transport, _peer) = ChannelTransport::pair();
    let route = Route::new(transport, &serving);

    // One millisecond before the first rotation.
    tokio::time::sleep(Duration::from_millis(499)).await;
    let started = tokio::time::Instant::now();
    let (_id, mut rx) = bus.await_reply(&route);

    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    let settled = rx.await.map_err(|_| Error::Shutdown)?;
    let elapsed = started.elapsed();
    assert!(matches!(settled, Err(Error::Timeout)));
    assert!(elapsed >= Duration::from_millis(2000), "fired after {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(2500), "fired after {:?}", elapsed);
    Ok(())
}

#[tokio::test]
async fn test_stalled_runtime_does_not_shorten_the_window() -> Result<()> {
    let config = BusConfig::default().with_window_len(3).with_tick(Duration::from_millis(100));
    let (bus, serving) = seed(config)?;
    let (transport, _peer) = ChannelTransport::pair();
    let route = Route::new(transport, &serving);

    tokio::time::sleep(Duration::from_millis(150)).await;
    // Blocks the only runtime thread across several ticks.
    std::thread::sleep(Duration::from_millis(500));

    let started = std::time::Instant::now();
    let (_id, rx) = bus.await_reply(&route);
    let settled = rx.await.map_err(|_| Error::Shutdown)?;
    let elapsed = started.elapsed();
    assert!(matches!(settled, Err(Error::Timeout)));
    assert!(elapsed >= Duration::from_millis(200), "fired after {:?}", elapsed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_is_ignored() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (tx, mut faults) = mpsc::unbounded_channel();
    bus.set_failure_handler(move |_, fault| {
        let _ = tx.send(fault.clone());
    });
    offer_echo(&serving).await?;
    let (client, echo) = client_of(&bus, echo_interface()).await?;
    let route = echo.route().clone();

    let (id, mut rx) = bus.await_reply(&route);
    tokio::time::sleep(Duration::from_millis(2600)).await;
    assert!(matches!(rx.try_recv(), Ok(Err(Error::Timeout))));
    assert!(matches!(bus.resolve_reply(id, &route), Err(Error::Fault(Fault::UnknownMessageId(m))) if m == id));

    let mut enc = transpack::Encoder::new();
    enc.header(Header::Reply);
    enc.id(id);
    client.dispatch(route, enc.into_bytes()).await;

    // The peer hears about the stray reply; the caller heard only the timeout.
    let fault = faults.recv().await.ok_or(Error::Shutdown)?;
    assert!(matches!(fault, Fault::UnknownMessageId(m) if m == id));
    assert!(rx.try_recv().is_err());
    assert_eq!(bus.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_registration_after_shutdown_fails_at_once() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (transport, _peer) = ChannelTransport::pair();
    let route = Route::new(transport, &serving);

    bus.shutdown();
    let (_id, mut rx) = bus.await_reply(&route);
    assert!(matches!(rx.try_recv(), Ok(Err(Error::Shutdown))));
    assert_eq!(bus.pending_calls(), 0);
    Ok(())
}

// --- Test 6: OpenRoute state machine ---

#[tokio::test]
async fn test_open_route_rejects_out_of_order_steps() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let me = bus.id().ok_or(Error::Local("no id".into()))?;
    let open = OpenRoute::new(serving.clone());

    let early = open.complete_route(transpack::RouteToken(1), serving.id());
    assert!(matches!(early, Err(Error::Route(RouteError::NotSupplied))));

    let token = open.supply_endpoint_bus(me).await?;
    let twice = open.supply_endpoint_bus(me).await;
    assert!(matches!(twice, Err(Error::Route(RouteError::AlreadySupplied))));

    open.complete_route(token, serving.id())?;
    let again = open.complete_route(token, serving.id());
    assert!(matches!(again, Err(Error::Route(RouteError::AlreadyCompleted))));
    assert!(open.route()?.is_complete());
    Ok(())
}

// --- Test 7: Transverse maps ---

#[tokio::test]
async fn test_first_registered_map_wins() -> Result<()> {
    let (_bus, serving) = seed(BusConfig::default())?;
    let tid = TransverseId::from_name("Clock::now");
    let make = |answer: i32| -> Shared {
        let call = ExposedCall::new(
            tid.clone(),
            vec![],
            vec![Type::Int32],
            CallKind::Eval,
            handler(move |_, _| async move { Ok(vec![Value::Int32(answer)]) }),
        );
        Arc::new(call)
    };
    let first = make(1);
    let second = make(2);

    let mut early = TransverseMap::new();
    early.insert(tid.clone(), first.clone());
    let mut late = TransverseMap::new();
    late.insert(tid.clone(), second);
    serving.add_transverse_map(early);
    serving.add_transverse_map(late);

    let found = serving.lookup_transverse(&tid).ok_or(Error::Local("missing".into()))?;
    assert!(Arc::ptr_eq(&found, &first));
    Ok(())
}

#[test]
fn test_service_build_checks_members() {
    let unfinished = ServiceImplementation::new(echo_interface())
        .implement("echo", handler(|_, args| async move { Ok(args) }))
        .build();
    assert!(matches!(unfinished, Err(ServiceError::NotImplemented(_))));

    let extra = ServiceImplementation::new(counter_interface())
        .implement("make", handler(|_, _| async move { Ok(vec![]) }))
        .implement("increment", handler(|_, _| async move { Ok(vec![]) }))
        .implement("decrement", handler(|_, _| async move { Ok(vec![]) }))
        .build();
    assert!(matches!(extra, Err(ServiceError::UnknownMember(name)) if name == "decrement"));
}

#[test]
fn test_methods_take_a_receiver() -> std::result::Result<(), ServiceError> {
    let counter = counter_interface();
    let increment = counter.member("increment")?;
    assert!(increment.is_method());
    assert_eq!(increment.params(), &[Type::object("Counter")]);
    assert_eq!(increment.transverse_id(), &TransverseId::from_name("Counter::increment"));
    Ok(())
}

// --- Test 8: Filters ---

struct CountingXor {
    key: u8,
    uses: Arc<AtomicUsize>,
}

impl FilterElement for CountingXor {
    fn transcode(&self, input: &[u8]) -> std::result::Result<Vec<u8>, Fault> {
        self.uses.fetch_add(1, Ordering::SeqCst);
        XorFilter(self.key).transcode(input)
    }
}

#[tokio::test]
async fn test_filters_wrap_call_and_reply() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    offer_echo(&serving).await?;
    let (client, echo) = client_of(&bus, echo_interface()).await?;

    let server_uses = Arc::new(AtomicUsize::new(0));
    let client_uses = Arc::new(AtomicUsize::new(0));
    let server_filter = Filter::shared(CountingXor { key: 0x5a, uses: server_uses.clone() });
    let client_filter = Filter::shared(CountingXor { key: 0x5a, uses: client_uses.clone() });
    let server_ref = serving.share_object(&server_filter);
    let client_ref = client.share_object(&client_filter);

    let reply = echo
        .bind("echo")?
        .filter_in(server_ref, client_filter)
        .filter_out(server_ref, client_ref)
        .eval(vec!["masked".into()])
        .await?;

    assert_eq!(reply[0].as_str()?, "echo: masked");
    assert_eq!(server_uses.load(Ordering::SeqCst), 2);
    assert_eq!(client_uses.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_unknown_filter_is_reported() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.set_failure_handler(move |_, fault| {
        let _ = tx.send(fault.clone());
    });
    offer_echo(&serving).await?;
    let (_client, echo) = client_of(&bus, echo_interface()).await?;

    let mut enc = transpack::Encoder::new();
    enc.header(Header::FilterIn);
    enc.reference(&Reference::new(serving.id(), ObjectId(404)));
    enc.raw(&[0x01]);
    echo.route().send(enc.into_bytes()).await?;

    let fault = rx.recv().await.ok_or(Error::Shutdown)?;
    assert!(matches!(fault, Fault::UnknownObjectId(ObjectId(404))));
    Ok(())
}

// --- Test 9: Configuration ---

#[test]
fn test_config_defaults() {
    let config = BusConfig::default();
    assert_eq!(config.window_len, 5);
    assert_eq!(config.tick, Duration::from_millis(500));
    assert!(!config.debug_errors);
    assert_eq!(BusConfig::default().with_window_len(0).window_len, 1);
}

// --- Test 10: Notifications ---

fn bell_interface() -> Arc<Interface> {
    Interface::new("Bell").notification("ring", vec![Type::Int32]).shared()
}

async fn offer_bell(serving: &Connection, rung: mpsc::UnboundedSender<i32>) -> Result<()> {
    ServiceImplementation::new(bell_interface())
        .implement(
            "ring",
            handler(move |_, args| {
                let rung = rung.clone();
                async move {
                    let times = args[0].as_int32()?;
                    if times == 0 {
                        return Err(Error::Fault(Fault::Application("silent bell".into())));
                    }
                    let _ = rung.send(times);
                    Ok(Vec::new())
                }
            }),
        )
        .build()?
        .offer_on(serving, true)
        .await
}

#[tokio::test]
async fn test_notification_runs_handler() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (tx, mut rung) = mpsc::unbounded_channel();
    offer_bell(&serving, tx).await?;
    let (_client, bell) = client_of(&bus, bell_interface()).await?;

    bell.notify("ring", vec![Value::Int32(41)]).await?;
    assert_eq!(rung.recv().await, Some(41));
    assert_eq!(bus.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_notification_raises_general_error() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (faults_tx, mut faults) = mpsc::unbounded_channel();
    bus.set_failure_handler(move |_, fault| {
        let _ = faults_tx.send(fault.clone());
    });
    let (tx, _rung) = mpsc::unbounded_channel();
    offer_bell(&serving, tx).await?;
    let (_client, bell) = client_of(&bus, bell_interface()).await?;

    bell.notify("ring", vec![Value::Int32(0)]).await?;
    let fault = faults.recv().await.ok_or(Error::Shutdown)?;
    assert!(matches!(fault, Fault::Application(ref m) if m == "silent bell"));
    Ok(())
}

#[tokio::test]
async fn test_notify_member_cannot_be_evaluated() -> Result<()> {
    let (bus, serving) = seed(BusConfig::default())?;
    let (tx, _rung) = mpsc::unbounded_channel();
    offer_bell(&serving, tx).await?;
    let (_client, bell) = client_of(&bus, bell_interface()).await?;

    assert!(bell.call("ring", vec![Value::Int32(1)]).await.is_err());
    Ok(())
}

// --- Test 11: Channel transport lifecycle ---

#[tokio::test]
async fn test_closing_one_end_stops_both() -> Result<()> {
    let (near, far) = ChannelTransport::pair();
    near.close();
    assert!(matches!(near.send(RouteToken(1), vec![1]).await, Err(TransportError::Closed)));

    // The far pump ends once the near sender is gone.
    assert!(far.recv_bootstrap().await.is_err());
    let failed = tokio::time::timeout(Duration::from_secs(1), async {
        while far.send(RouteToken(1), vec![1]).await.is_ok() {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(failed.is_ok(), "peer kept accepting sends after close");
    Ok(())
}
