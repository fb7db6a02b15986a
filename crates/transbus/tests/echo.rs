//! Two busses over a channel transport: a master offering services and a
//! client bootstrapped onto it.

use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use tracing_subscriber::EnvFilter;

use transbus::Bus;
use transbus::BusConfig;
use transbus::BusMaster;
use transbus::Connection;
use transbus::Error;
use transbus::Fault;
use transbus::Interface;
use transbus::ObjectProxy;
use transbus::ServiceImplementation;
use transbus::ServiceProxy;
use transbus::Type;
use transbus::Value;
use transbus::channel::ChannelTransport;
use transbus::exposed::CallContext;
use transbus::exposed::handler;
use transbus::transport::Transport;
use transbus::value::Exposed;
use transbus::value::Shared;
use transpack::ObjectId;
use transpack::Reference;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
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
        .shared()
}

fn counter_interface() -> Arc<Interface> {
    Interface::new("Counter")
        .function("make", vec![], vec![Type::object("Counter")])
        .method("increment", vec![], vec![Type::Int32])
        .shared()
}

async fn echo(_: CallContext, args: Vec<Value>) -> transbus::Result<Vec<Value>> {
    let message = args[0].as_str()?;
    Ok(vec![Value::string(message.to_uppercase())])
}

async fn increment(_: CallContext, args: Vec<Value>) -> transbus::Result<Vec<Value>> {
    let counter = args[0].as_local::<Counter>()?;
    Ok(vec![Value::Int32(counter.value.fetch_add(1, Ordering::SeqCst) + 1)])
}

struct Pair {
    master_bus: Bus,
    serving: Connection,
    client_bus: Bus,
    client: Connection,
    wire: Arc<ChannelTransport>,
}

/// Seeds a master bus offering Echo and Counter, and bootstraps a client onto it.
async fn pair() -> anyhow::Result<Pair> {
    init_tracing();
    let master_bus = Bus::new(BusConfig::default());
    let serving = master_bus.bootstrap_on_local_master(BusMaster::new())?;

    ServiceImplementation::new(echo_interface())
        .implement("echo", handler(echo))
        .build()?
        .offer_on(&serving, true)
        .await?;

    let counter: Shared = Arc::new(Counter { value: AtomicI32::new(0) });
    ServiceImplementation::new(counter_interface())
        .implement(
            "make",
            handler(move |_, _| {
                let counter = counter.clone();
                async move { Ok(vec![Value::local(counter)]) }
            }),
        )
        .implement("increment", handler(increment))
        .build()?
        .offer_on(&serving, false)
        .await?;

    let client_bus = Bus::new(BusConfig::default());
    let (wire, far) = ChannelTransport::pair();
    let (client_id, client) = tokio::try_join!(
        master_bus.await_client(far),
        client_bus.bootstrap_on_transport(wire.clone())
    )?;
    assert_eq!(client_bus.id(), Some(client_id));

    Ok(Pair {
        master_bus,
        serving,
        client_bus,
        client,
        wire,
    })
}

// --- Test 1: Bootstrap ---

#[tokio::test]
async fn test_bootstrap_assigns_ids() -> anyhow::Result<()> {
    let pair = pair().await?;
    let master_id = pair.master_bus.id().ok_or_else(|| anyhow::anyhow!("master has no id"))?;
    let client_id = pair.client_bus.id().ok_or_else(|| anyhow::anyhow!("client has no id"))?;

    assert_ne!(master_id, client_id);
    assert_eq!(pair.client.id().0, client_id.0);
    assert!(pair.client.route_to(pair.serving.id()).is_some());

    let fresh = pair.client_bus.new_connection().await?;
    assert_ne!(fresh.id(), pair.client.id());
    assert_ne!(fresh.id(), pair.serving.id());
    Ok(())
}

// --- Test 2: Echo across busses ---

#[tokio::test]
async fn test_echo_reuses_resolved_name() -> anyhow::Result<()> {
    let pair = pair().await?;
    let echo = ServiceProxy::on(&pair.client, echo_interface()).await?;
    assert_eq!(echo.route().remote_connection()?, pair.serving.id());

    let before = pair.wire.messages_sent();
    let reply = echo.call("echo", vec!["hi".into()]).await?;
    assert_eq!(reply[0].as_str()?, "HI");
    // RESOLVE, then EVAL.
    assert_eq!(pair.wire.messages_sent() - before, 2);

    let tid = echo_interface().transverse_id("echo")?;
    assert!(pair.client.cached_reference(pair.serving.id(), &tid).is_some());

    let before = pair.wire.messages_sent();
    let reply = echo.call("echo", vec!["again".into()]).await?;
    assert_eq!(reply[0].as_str()?, "AGAIN");
    // EVAL only.
    assert_eq!(pair.wire.messages_sent() - before, 1);
    assert_eq!(pair.client_bus.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_routes_carry_transport_shiboleth() -> anyhow::Result<()> {
    let pair = pair().await?;
    let echo = ServiceProxy::on(&pair.client, echo_interface()).await?;

    let shiboleth = echo.route().shiboleth();
    assert!(shiboleth.is_some());
    assert_eq!(shiboleth, pair.wire.shiboleth());
    Ok(())
}

// --- Test 3: Objects by reference ---

#[tokio::test]
async fn test_remote_object_methods() -> anyhow::Result<()> {
    let pair = pair().await?;
    let counters = ServiceProxy::on(&pair.client, counter_interface()).await?;
    // Each client of the counter service gets its own connection.
    assert_ne!(counters.route().remote_connection()?, pair.serving.id());

    let made = counters.call("make", vec![]).await?;
    let counter = counters.object(&made[0])?;
    let increment = counters.interface().member("increment")?;
    assert_eq!(counter.bind(increment).eval(vec![]).await?[0].as_int32()?, 1);
    assert_eq!(counter.bind(increment).eval(vec![]).await?[0].as_int32()?, 2);

    // The same object comes back under the same reference.
    let again = counters.object(&counters.call("make", vec![]).await?[0])?;
    assert_eq!(again.reference(), counter.reference());
    Ok(())
}

#[tokio::test]
async fn test_unknown_object_fails_the_call() -> anyhow::Result<()> {
    let pair = pair().await?;
    let counters = ServiceProxy::on(&pair.client, counter_interface()).await?;
    let remote = counters.route().remote_connection()?;

    let bogus = ObjectProxy::new(counters.route().clone(), Reference::new(remote, ObjectId(4096)));
    let result = bogus.bind(counters.interface().member("increment")?).eval(vec![]).await;
    assert!(matches!(result, Err(Error::Remote(Fault::UnknownObjectId(ObjectId(4096))))));
    Ok(())
}

// --- Test 4: Shutdown ---

#[tokio::test]
async fn test_shutdown_closes_the_bus() -> anyhow::Result<()> {
    let pair = pair().await?;
    let echo = ServiceProxy::on(&pair.client, echo_interface()).await?;
    pair.client_bus.shutdown();

    let result = echo.call("echo", vec!["late".into()]).await;
    assert!(result.is_err());
    assert!(pair.client_bus.is_shut_down());
    Ok(())
}
