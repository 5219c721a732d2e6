use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, trace};

use taskhub_core::sync::lock;
use taskhub_core::{ClientId, KernelError, ResultHandle};

type Outcome<T> = Result<T, KernelError>;

/// Result cell: `None` until resolved. Receivers subscribe to await resolution.
type Cell<T> = watch::Sender<Option<Outcome<T>>>;

/// Per-client handle namespace.
struct ClientBook<T> {
    next_seq: u64,
    cells: HashMap<u64, Cell<T>>,
}

impl<T> ClientBook<T> {
    fn new() -> Self {
        Self {
            next_seq: 0,
            cells: HashMap::new(),
        }
    }
}

/// Handle counts for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientSummary {
    pub pending: usize,
    pub resolved: usize,
}

/// Registry of in-flight and completed asynchronous results.
///
/// Every handle belongs to the client it was created for and is invisible to
/// other clients. A handle is resolved exactly once; afterwards any number of
/// concurrent fetches read the same stored value or error.
///
/// The internal lock is never held across an await point: blocking fetches
/// subscribe to the cell under the lock and wait after releasing it.
pub struct PendingResultBroker<T> {
    clients: Mutex<HashMap<ClientId, ClientBook<T>>>,
}

impl<T: Clone> PendingResultBroker<T> {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new, empty handle namespace.
    pub fn register_client(&self) -> ClientId {
        let id = ClientId::new();
        lock(&self.clients).insert(id, ClientBook::new());
        debug!(client = %id, "registered broker client");
        id
    }

    /// Drop a client and every handle it owns.
    ///
    /// Returns the number of unresolved handles discarded. Tasks blocked in
    /// [`fetch`](Self::fetch) on one of them fail with `InvalidClient`.
    pub fn unregister_client(&self, client: ClientId) -> Result<usize, KernelError> {
        let book = lock(&self.clients)
            .remove(&client)
            .ok_or(KernelError::InvalidClient(client))?;
        let discarded = book
            .cells
            .values()
            .filter(|cell| cell.borrow().is_none())
            .count();
        debug!(client = %client, discarded, "unregistered broker client");
        Ok(discarded)
    }

    pub fn clients(&self) -> Vec<ClientId> {
        lock(&self.clients).keys().copied().collect()
    }

    /// Allocate the next unresolved handle in `client`'s namespace.
    pub fn new_handle(&self, client: ClientId) -> Result<ResultHandle, KernelError> {
        let mut clients = lock(&self.clients);
        let book = clients
            .get_mut(&client)
            .ok_or(KernelError::InvalidClient(client))?;
        let seq = book.next_seq;
        book.next_seq += 1;
        let (tx, _rx) = watch::channel(None);
        book.cells.insert(seq, tx);
        trace!(client = %client, seq, "allocated result handle");
        Ok(ResultHandle::new(client, seq))
    }

    /// Store the outcome for `handle`. Legal exactly once per handle.
    pub fn resolve(&self, handle: ResultHandle, outcome: Outcome<T>) -> Result<(), KernelError> {
        let clients = lock(&self.clients);
        let cell = Self::cell(&clients, handle)?;
        if cell.borrow().is_some() {
            return Err(KernelError::AlreadyResolved(handle));
        }
        trace!(handle = %handle, ok = outcome.is_ok(), "resolving result handle");
        cell.send_replace(Some(outcome));
        Ok(())
    }

    /// Retrieve the outcome of `handle` on behalf of `client`.
    ///
    /// With `block = false` an unresolved handle yields `NotCompleted`. With
    /// `block = true` the caller is suspended until the handle is resolved.
    /// A resolved failure is returned as the error itself.
    pub async fn fetch(
        &self,
        client: ClientId,
        handle: ResultHandle,
        block: bool,
    ) -> Result<T, KernelError> {
        if handle.client() != client {
            return Err(KernelError::InvalidHandle(handle));
        }

        let mut rx = {
            let clients = lock(&self.clients);
            let cell = Self::cell(&clients, handle)?;
            if let Some(outcome) = cell.borrow().as_ref() {
                return outcome.clone();
            }
            if !block {
                return Err(KernelError::NotCompleted(handle));
            }
            cell.subscribe()
        };

        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| KernelError::InvalidClient(client))?;
        match resolved.as_ref() {
            Some(outcome) => outcome.clone(),
            None => Err(KernelError::NotCompleted(handle)),
        }
    }

    /// Wait until `handle` is resolved without reading its outcome.
    pub async fn wait(&self, handle: ResultHandle) -> Result<(), KernelError> {
        let mut rx = {
            let clients = lock(&self.clients);
            let cell = Self::cell(&clients, handle)?;
            if cell.borrow().is_some() {
                return Ok(());
            }
            cell.subscribe()
        };
        rx.wait_for(Option::is_some)
            .await
            .map(|_| ())
            .map_err(|_| KernelError::InvalidClient(handle.client()))
    }

    pub fn is_resolved(&self, handle: ResultHandle) -> Result<bool, KernelError> {
        let clients = lock(&self.clients);
        let cell = Self::cell(&clients, handle)?;
        let resolved = cell.borrow().is_some();
        Ok(resolved)
    }

    /// Drop every resolved handle owned by `client`. Returns how many were dropped.
    pub fn flush(&self, client: ClientId) -> Result<usize, KernelError> {
        let mut clients = lock(&self.clients);
        let book = clients
            .get_mut(&client)
            .ok_or(KernelError::InvalidClient(client))?;
        let before = book.cells.len();
        book.cells.retain(|_, cell| cell.borrow().is_none());
        let flushed = before - book.cells.len();
        debug!(client = %client, flushed, "flushed resolved handles");
        Ok(flushed)
    }

    /// Drop a single resolved handle.
    pub fn release(&self, handle: ResultHandle) -> Result<(), KernelError> {
        let mut clients = lock(&self.clients);
        let book = clients
            .get_mut(&handle.client())
            .ok_or(KernelError::InvalidClient(handle.client()))?;
        match book.cells.get(&handle.seq()) {
            None => Err(KernelError::InvalidHandle(handle)),
            Some(cell) if cell.borrow().is_none() => Err(KernelError::NotCompleted(handle)),
            Some(_) => {
                book.cells.remove(&handle.seq());
                Ok(())
            }
        }
    }

    pub fn summary(&self, client: ClientId) -> Result<ClientSummary, KernelError> {
        let clients = lock(&self.clients);
        let book = clients
            .get(&client)
            .ok_or(KernelError::InvalidClient(client))?;
        let pending = book
            .cells
            .values()
            .filter(|cell| cell.borrow().is_none())
            .count();
        Ok(ClientSummary {
            pending,
            resolved: book.cells.len() - pending,
        })
    }

    fn cell(
        clients: &HashMap<ClientId, ClientBook<T>>,
        handle: ResultHandle,
    ) -> Result<&Cell<T>, KernelError> {
        clients
            .get(&handle.client())
            .ok_or(KernelError::InvalidClient(handle.client()))?
            .cells
            .get(&handle.seq())
            .ok_or(KernelError::InvalidHandle(handle))
    }
}

impl<T: Clone> Default for PendingResultBroker<T> {
    fn default() -> Self {
        Self::new()
    }
}
