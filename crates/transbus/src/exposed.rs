//! Receiving side of a call: a native handler bound to a TransverseID and a
//! positional signature.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use transpack::TransverseId;

use crate::connection::Connection;
use crate::error::Fault;
use crate::error::Result;
use crate::route::Route;
use crate::value::Exposed;
use crate::value::Shared;
use crate::value::Type;
use crate::value::Value;

/// Whether a call answers with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Eval,
    Notify,
}

/// Where a call came from.
#[derive(Clone)]
pub struct CallContext {
    pub connection: Connection,
    /// The route the call arrived on; replies go back along it.
    pub route: Route,
}

impl CallContext {
    pub fn new(connection: Connection, route: Route) -> Self {
        Self { connection, route }
    }
}

pub type Handler = Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Result<Vec<Value>>> + Send + Sync>;

/// Wraps an async closure as a `Handler`.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
{
    Arc::new(move |ctx: CallContext, args: Vec<Value>| -> BoxFuture<'static, Result<Vec<Value>>> {
        Box::pin(f(ctx, args))
    })
}

pub struct ExposedCall {
    tid: TransverseId,
    params: Vec<Type>,
    results: Vec<Type>,
    kind: CallKind,
    handler: Handler,
}

impl ExposedCall {
    pub fn new(tid: TransverseId, params: Vec<Type>, results: Vec<Type>, kind: CallKind, handler: Handler) -> Self {
        Self { tid, params, results, kind, handler }
    }

    pub fn transverse_id(&self) -> &TransverseId {
        &self.tid
    }

    pub fn params(&self) -> &[Type] {
        &self.params
    }

    pub fn results(&self) -> &[Type] {
        &self.results
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Runs the handler, checking arguments and results against the signature.
    pub fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> BoxFuture<'static, Result<Vec<Value>>> {
        if !conforms(&args, &self.params) {
            let fault = Fault::TypeMismatch(format!("arguments do not match {}", self.tid));
            return Box::pin(async move { Err(fault.into()) });
        }
        let pending = (self.handler)(ctx, args);
        let results = self.results.clone();
        let tid = self.tid.clone();
        Box::pin(async move {
            let values = pending.await?;
            if !conforms(&values, &results) {
                return Err(Fault::Encoding(format!("results do not match {}", tid)).into());
            }
            Ok(values)
        })
    }
}

fn conforms(values: &[Value], types: &[Type]) -> bool {
    values.len() == types.len() && values.iter().zip(types).all(|(v, t)| v.conforms_to(t))
}

impl Exposed for ExposedCall {
    fn as_call(&self) -> Option<&ExposedCall> {
        Some(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Names offered on a connection, mapped to the objects behind them.
#[derive(Clone, Default)]
pub struct TransverseMap {
    entries: HashMap<TransverseId, Shared>,
}

impl TransverseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tid: TransverseId, object: Shared) {
        self.entries.insert(tid, object);
    }

    pub fn get(&self, tid: &TransverseId) -> Option<Shared> {
        self.entries.get(tid).cloned()
    }

    pub fn contains(&self, tid: &TransverseId) -> bool {
        self.entries.contains_key(tid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds every entry of `other` that this map does not already name.
    pub fn merge(&mut self, other: TransverseMap) {
        for (tid, object) in other.entries {
            self.entries.entry(tid).or_insert(object);
        }
    }
}
