//! # Flows
//!
//! Ordered middleware run before a call reaches its handler. Each item sees the
//! call and decides whether the chain goes on.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::HandlerError;
use crate::error::guard;

/// What a flow item wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the next item, then the handler.
    Continue,
    /// Stop here. The item is responsible for any response the call needs.
    Stop,
}

/// One middleware item over calls of type `C`.
#[async_trait::async_trait]
pub trait Flow<C>: Send + Sync + 'static
where
    C: Send + Sync + 'static,
{
    async fn process(&self, call: Arc<C>) -> Result<Decision, HandlerError>;
}

type FlowFn<C> = dyn Fn(Arc<C>) -> BoxFuture<'static, Result<Decision, HandlerError>> + Send + Sync;

struct FnFlow<C>(Box<FlowFn<C>>);

#[async_trait::async_trait]
impl<C> Flow<C> for FnFlow<C>
where
    C: Send + Sync + 'static,
{
    async fn process(&self, call: Arc<C>) -> Result<Decision, HandlerError> {
        (self.0)(call).await
    }
}

/// The ordered flow items for one call kind.
pub struct FlowChain<C> {
    items: Vec<Arc<dyn Flow<C>>>,
}

impl<C> Default for FlowChain<C> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<C> FlowChain<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, flow: impl Flow<C>) -> &mut Self {
        self.items.push(Arc::new(flow));
        self
    }

    /// Appends an async closure as a flow item.
    pub fn push_fn<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Decision, HandlerError>> + Send + 'static,
    {
        self.push(FnFlow(Box::new(move |call| f(call).boxed())))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Runs the items in order until one stops or fails.
    ///
    /// A panicking item is reported as an internal error.
    pub async fn run(&self, call: Arc<C>) -> Result<Decision, HandlerError> {
        for item in &self.items {
            if guard(item.process(call.clone())).await? == Decision::Stop {
                return Ok(Decision::Stop);
            }
        }
        Ok(Decision::Continue)
    }
}
