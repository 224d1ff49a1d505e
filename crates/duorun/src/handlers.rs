//! Handler tables shared by server and client.
//!
//! An API name has at most one handler. A message name may have any number of
//! listeners, run in registration order and removed by the `ListenerId` their
//! registration returned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::HandlerError;

/// A type-erased async handler taking `T`.
pub type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Boxes an async closure into a `Handler`.
pub fn handler<T, F, Fut>(f: F) -> Handler<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |arg| f(arg).boxed())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An API may only be implemented once.
    AlreadyImplemented(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyImplemented(name) => write!(f, "API '{}' is already implemented", name),
        }
    }
}

impl std::error::Error for Error {}

/// Identifies one listener registration.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// One handler per API name.
pub struct ApiHandlers<T> {
    handlers: HashMap<String, Handler<T>>,
}

impl<T> Default for ApiHandlers<T> {
    fn default() -> Self {
        Self { handlers: HashMap::new() }
    }
}

impl<T> ApiHandlers<T> {
    pub fn implement(&mut self, name: &str, handler: Handler<T>) -> Result<(), Error> {
        if self.handlers.contains_key(name) {
            return Err(Error::AlreadyImplemented(name.to_string()));
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Handler<T>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Any number of listeners per message name.
pub struct Listeners<T> {
    listeners: HashMap<String, Vec<(ListenerId, Handler<T>)>>,
    next_id: u64,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self { listeners: HashMap::new(), next_id: 1 }
    }
}

impl<T> Listeners<T> {
    pub fn listen(&mut self, name: &str, handler: Handler<T>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.entry(name.to_string()).or_default().push((id, handler));
        id
    }

    /// Removes the listener `id`, or every listener for `name` when `id` is
    /// `None`. Returns how many were removed.
    pub fn unlisten(&mut self, name: &str, id: Option<ListenerId>) -> usize {
        let Some(list) = self.listeners.get_mut(name) else {
            return 0;
        };
        let before = list.len();
        match id {
            Some(id) => list.retain(|(existing, _)| *existing != id),
            None => list.clear(),
        }
        let removed = before - list.len();
        if list.is_empty() {
            self.listeners.remove(name);
        }
        removed
    }

    /// The listeners for `name`, in registration order.
    ///
    /// Returned as owned handles so callers can run them without holding
    /// whatever lock guards this table.
    pub fn snapshot(&self, name: &str) -> Vec<Handler<T>> {
        self.listeners
            .get(name)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, Vec::len)
    }
}
