use std::future::Future;
use std::sync::Mutex;

type Connect<C> = Box<dyn Fn(&str) -> eyre::Result<C> + Send + Sync>;

struct Cursor<C> {
    endpoints: Vec<String>,
    index: usize,
    client: Option<(usize, C)>,
}

/// Fails over across an ordered list of RPC endpoints for one chain.
///
/// Every call runs against the current endpoint. A failure retires that
/// endpoint and the call is retried once on the next one. Once the list is
/// exhausted the rotator stays on the last endpoint that connects, so a
/// recovered node serves calls again. [`EndpointRotator::reset`] and
/// [`EndpointRotator::set_endpoints`] return to the primary. The cursor
/// belongs to this value only.
pub struct EndpointRotator<C> {
    label: String,
    connect: Connect<C>,
    cursor: Mutex<Cursor<C>>,
}

impl<C: Clone> EndpointRotator<C> {
    pub fn new(
        label: impl Into<String>,
        endpoints: Vec<String>,
        connect: impl Fn(&str) -> eyre::Result<C> + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            connect: Box::new(connect),
            cursor: Mutex::new(Cursor {
                endpoints,
                index: 0,
                client: None,
            }),
        }
    }

    /// Run `f` against the current endpoint, failing over once.
    pub async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: Fn(C) -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        let (index, url, client) = match self.select() {
            Some(selected) => selected,
            None => {
                tracing::error!(chain = %self.label, op, "No usable RPC endpoint");
                return None;
            }
        };

        match f(client).await {
            Ok(value) => return Some(value),
            Err(e) => {
                tracing::warn!(
                    chain = %self.label,
                    op,
                    endpoint = %url,
                    error = %e,
                    "RPC call failed, switching endpoint"
                );
            }
        }

        let (next, url, client) = self.advance_past(index)?;
        if next == index {
            return None;
        }
        match f(client).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(
                    chain = %self.label,
                    op,
                    endpoint = %url,
                    error = %e,
                    "RPC call failed on fallback endpoint"
                );
                self.advance_past(next);
                None
            }
        }
    }

    /// Return to the primary endpoint.
    pub fn reset(&self) {
        let mut cursor = self.lock();
        cursor.index = 0;
        cursor.client = None;
    }

    /// Replace the endpoint list and return to its primary.
    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        let mut cursor = self.lock();
        if cursor.endpoints == endpoints {
            return;
        }
        tracing::info!(chain = %self.label, endpoints = endpoints.len(), "RPC endpoints updated");
        cursor.endpoints = endpoints;
        cursor.index = 0;
        cursor.client = None;
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.lock().endpoints.clone()
    }

    pub fn current_index(&self) -> usize {
        self.lock().index
    }

    pub fn is_exhausted(&self) -> bool {
        let cursor = self.lock();
        cursor.index >= cursor.endpoints.len()
    }

    fn select(&self) -> Option<(usize, String, C)> {
        let mut cursor = self.lock();
        self.select_locked(&mut cursor)
    }

    // Only the caller that saw `failed` fail moves the cursor, so concurrent
    // failures on the same endpoint retire it once.
    fn advance_past(&self, failed: usize) -> Option<(usize, String, C)> {
        let mut cursor = self.lock();
        if cursor.index == failed {
            cursor.index += 1;
            cursor.client = None;
            if let Some(url) = cursor.endpoints.get(cursor.index) {
                tracing::info!(chain = %self.label, endpoint = %url, "Rotated to backup RPC endpoint");
            } else {
                tracing::warn!(chain = %self.label, "All RPC endpoints failed, staying on the last one");
            }
        }
        self.select_locked(&mut cursor)
    }

    fn select_locked(&self, cursor: &mut Cursor<C>) -> Option<(usize, String, C)> {
        if let Some((index, client)) = &cursor.client {
            return Some((*index, cursor.endpoints[*index].clone(), client.clone()));
        }
        while cursor.index < cursor.endpoints.len() {
            let url = cursor.endpoints[cursor.index].clone();
            match (self.connect)(&url) {
                Ok(client) => {
                    cursor.client = Some((cursor.index, client.clone()));
                    return Some((cursor.index, url, client));
                }
                Err(e) => {
                    tracing::warn!(chain = %self.label, endpoint = %url, error = %e, "Invalid RPC endpoint");
                    cursor.index += 1;
                }
            }
        }
        // Exhausted: keep serving from the last endpoint that connects.
        for index in (0..cursor.endpoints.len()).rev() {
            let url = cursor.endpoints[index].clone();
            if let Ok(client) = (self.connect)(&url) {
                cursor.client = Some((index, client.clone()));
                return Some((index, url, client));
            }
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cursor<C>> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}
