use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use http::StatusCode;
use tracing::{debug, info, warn};

use crate::error::{BoxError, Error};
use crate::util::lock_unpoisoned;

/// Coordinates authorization refreshes around every request attempt.
///
/// The processor awaits [`ready`](TokenRefresher::ready) before each attempt
/// and routes every failed attempt through
/// [`try_refresh`](TokenRefresher::try_refresh). `Ok(())` from `try_refresh`
/// means the request is dispatched again; `Err(error)` is what the caller
/// sees.
pub trait TokenRefresher: Send + Sync {
    fn ready(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn try_refresh(&self, error: Error) -> BoxFuture<'_, Result<(), Error>>;
}

impl<T> TokenRefresher for Arc<T>
where
    T: TokenRefresher + ?Sized,
{
    fn ready(&self) -> BoxFuture<'_, Result<(), Error>> {
        (**self).ready()
    }

    fn try_refresh(&self, error: Error) -> BoxFuture<'_, Result<(), Error>> {
        (**self).try_refresh(error)
    }
}

/// Never refreshes: failures are surfaced unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTokenRefresher;

impl TokenRefresher for NoopTokenRefresher {
    fn ready(&self) -> BoxFuture<'_, Result<(), Error>> {
        futures_util::future::ready(Ok(())).boxed()
    }

    fn try_refresh(&self, error: Error) -> BoxFuture<'_, Result<(), Error>> {
        futures_util::future::ready(Err(error)).boxed()
    }
}

/// The credential side of a [`SharedTokenRefresher`].
pub trait RefreshToken: Send + Sync + 'static {
    /// Whether `error` means the current token was rejected. Defaults to a
    /// `401 Unauthorized` response.
    fn is_refreshable(&self, error: &Error) -> bool {
        error.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// Obtains and stores a fresh token.
    fn refresh(&self) -> BoxFuture<'static, Result<(), BoxError>>;
}

type RefreshOutcome = Result<(), Arc<dyn std::error::Error + Send + Sync>>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    id: u64,
    refresh: SharedRefresh,
}

struct SharedState<R> {
    token: R,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    refreshes: AtomicU64,
}

/// Single-flight refresher: callers failing while a refresh is running join
/// it instead of starting another one.
pub struct SharedTokenRefresher<R> {
    state: Arc<SharedState<R>>,
}

impl<R> Clone for SharedTokenRefresher<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R> std::fmt::Debug for SharedTokenRefresher<R> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SharedTokenRefresher")
            .field("refreshing", &self.is_refreshing())
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

impl<R: RefreshToken> SharedTokenRefresher<R> {
    pub fn new(token: R) -> Self {
        Self {
            state: Arc::new(SharedState {
                token,
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    pub fn token(&self) -> &R {
        &self.state.token
    }

    fn join_or_start(&self) -> SharedRefresh {
        let mut slot = lock_unpoisoned(&self.state.in_flight);
        if let Some(in_flight) = slot.as_ref() {
            debug!("joining in-flight token refresh");
            return in_flight.refresh.clone();
        }

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.refreshes.fetch_add(1, Ordering::Relaxed);
        info!("refreshing access token");

        let pending = self.state.token.refresh();
        let state: Weak<SharedState<R>> = Arc::downgrade(&self.state);
        let refresh = async move {
            let outcome: RefreshOutcome = pending.await.map_err(Arc::from);
            if let Some(state) = state.upgrade() {
                let mut slot = lock_unpoisoned(&state.in_flight);
                if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                    *slot = None;
                }
            }
            outcome
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            refresh: refresh.clone(),
        });
        refresh
    }
}

impl<R> SharedTokenRefresher<R> {
    /// Number of underlying refreshes started so far.
    pub fn refresh_count(&self) -> u64 {
        self.state.refreshes.load(Ordering::Relaxed)
    }

    pub fn is_refreshing(&self) -> bool {
        lock_unpoisoned(&self.state.in_flight).is_some()
    }

    fn current(&self) -> Option<SharedRefresh> {
        lock_unpoisoned(&self.state.in_flight)
            .as_ref()
            .map(|in_flight| in_flight.refresh.clone())
    }
}

impl<R: RefreshToken> TokenRefresher for SharedTokenRefresher<R> {
    fn ready(&self) -> BoxFuture<'_, Result<(), Error>> {
        let in_flight = self.current();
        async move {
            if let Some(refresh) = in_flight {
                debug!("waiting for in-flight token refresh");
                // A failed refresh is reported to the call that triggered it.
                let _ = refresh.await;
            }
            Ok(())
        }
        .boxed()
    }

    fn try_refresh(&self, error: Error) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            if !self.state.token.is_refreshable(&error) {
                return Err(error);
            }
            warn!(error = %error, code = error.code().as_str(), "access token rejected");
            self.join_or_start()
                .await
                .map_err(|source| Error::Refresh { source })
        }
        .boxed()
    }
}
