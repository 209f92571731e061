use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::Shared;
use murmur_storage::{AuthorId, BoxFuture, ProfileStore};
use tracing::{debug, warn};

use crate::entry::Profile;

type ProfileFetch = Shared<BoxFuture<'static, Arc<Profile>>>;

enum Slot {
    Ready(Arc<Profile>),
    InFlight(ProfileFetch),
}

/// Session-scoped author cache with at most one outstanding fetch per author.
///
/// Resolved profiles are handed out as one shared `Arc`, so every entry of an author points at
/// the same value. Missing or failing lookups settle on the placeholder and are not retried.
#[derive(Clone)]
pub struct ProfileResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    store: Arc<dyn ProfileStore>,
    slots: Mutex<HashMap<AuthorId, Slot>>,
    placeholder: Arc<Profile>,
}

impl ProfileResolver {
    pub fn new(store: Arc<dyn ProfileStore>, placeholder: Profile) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                store,
                slots: Mutex::new(HashMap::new()),
                placeholder: Arc::new(placeholder),
            }),
        }
    }

    pub fn placeholder(&self) -> Arc<Profile> {
        Arc::clone(&self.inner.placeholder)
    }

    pub fn cached(&self, author_id: AuthorId) -> Option<Arc<Profile>> {
        match self.inner.slots().get(&author_id) {
            Some(Slot::Ready(profile)) => Some(Arc::clone(profile)),
            _ => None,
        }
    }

    /// Stores a profile that arrived alongside data; an already resolved profile wins.
    pub fn seed(&self, author_id: AuthorId, profile: Profile) -> Arc<Profile> {
        let mut slots = self.inner.slots();
        if let Some(Slot::Ready(existing)) = slots.get(&author_id) {
            return Arc::clone(existing);
        }

        let profile = Arc::new(profile);
        slots.insert(author_id, Slot::Ready(Arc::clone(&profile)));
        profile
    }

    /// Returns the cached profile or joins the single fetch for `author_id`.
    pub async fn resolve(&self, author_id: AuthorId) -> Arc<Profile> {
        let fetch = {
            let mut slots = self.inner.slots();
            match slots.get(&author_id) {
                Some(Slot::Ready(profile)) => return Arc::clone(profile),
                Some(Slot::InFlight(fetch)) => fetch.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let fetch: BoxFuture<'static, Arc<Profile>> =
                        Box::pin(async move { inner.fetch(author_id).await });
                    let fetch = fetch.shared();
                    slots.insert(author_id, Slot::InFlight(fetch.clone()));
                    fetch
                }
            }
        };

        let profile = fetch.await;

        let mut slots = self.inner.slots();
        if let Some(Slot::Ready(existing)) = slots.get(&author_id) {
            return Arc::clone(existing);
        }
        slots.insert(author_id, Slot::Ready(Arc::clone(&profile)));
        profile
    }
}

impl ResolverInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<AuthorId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, author_id: AuthorId) -> Arc<Profile> {
        match self.store.fetch_profile(author_id).await {
            Ok(Some(record)) => Arc::new(Profile::from(record)),
            Ok(None) => {
                debug!(%author_id, "author profile not found, using placeholder");
                Arc::clone(&self.placeholder)
            }
            Err(error) => {
                warn!(%author_id, error = %error, "author profile fetch failed, using placeholder");
                Arc::clone(&self.placeholder)
            }
        }
    }
}

impl std::fmt::Debug for ProfileResolver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProfileResolver")
            .field("cached", &self.inner.slots().len())
            .field("placeholder", &self.inner.placeholder.full_name)
            .finish()
    }
}
