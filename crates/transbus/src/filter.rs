//! Filter elements transcode the bytes of a message in flight.
//!
//! `FILTER_IN` asks the receiver to run the rest of a message through one of its
//! filters before dispatching it. `FILTER_OUT` asks the receiver to run its reply
//! through one of its filters and tag the result so the sender can undo it.

use std::any::Any;
use std::sync::Arc;

use crate::error::Fault;
use crate::value::Exposed;
use crate::value::Shared;

pub trait FilterElement: Send + Sync + 'static {
    fn transcode(&self, input: &[u8]) -> Result<Vec<u8>, Fault>;
}

/// Shares a filter element on the bus.
pub struct Filter {
    element: Box<dyn FilterElement>,
}

impl Filter {
    pub fn shared(element: impl FilterElement) -> Shared {
        Arc::new(Self { element: Box::new(element) })
    }
}

impl Exposed for Filter {
    fn as_filter(&self) -> Option<&dyn FilterElement> {
        Some(self.element.as_ref())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// XORs every byte with a fixed key. Its own inverse.
pub struct XorFilter(pub u8);

impl FilterElement for XorFilter {
    fn transcode(&self, input: &[u8]) -> Result<Vec<u8>, Fault> {
        Ok(input.iter().map(|b| b ^ self.0).collect())
    }
}
