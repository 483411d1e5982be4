//! Session registry.
//!
//! Owns the endpoint and registration-id indices of [`ClientSession`]s and the
//! profile cache. Indices are concurrent maps; every mutation goes through the
//! map's entry API so that it is linearizable per key.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{CredentialsKind, DeviceProfile, SessionEvent, TransportService};
use crate::credentials::CredentialResolver;
use crate::engine::{ProtocolEngine, Registration};
use crate::error::{GatewayError, Result};
use crate::profile::ProfileConfig;
use crate::session::ClientSession;

/// Outcome of [`SessionRegistry::resolve_or_create`].
pub struct Admission {
    pub session: Arc<ClientSession>,
    /// Profile carried by the credentials when it differs from the cached
    /// snapshot of the same id
    pub changed_profile: Option<DeviceProfile>,
}

pub struct SessionRegistry {
    by_endpoint: DashMap<String, Arc<ClientSession>>,
    by_registration: DashMap<String, Arc<ClientSession>>,
    profiles: DashMap<Uuid, Arc<ProfileConfig>>,
    resolver: Arc<CredentialResolver>,
    engine: Arc<dyn ProtocolEngine>,
    backend: Arc<dyn TransportService>,
}

impl SessionRegistry {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        engine: Arc<dyn ProtocolEngine>,
        backend: Arc<dyn TransportService>,
    ) -> Self {
        Self {
            by_endpoint: DashMap::new(),
            by_registration: DashMap::new(),
            profiles: DashMap::new(),
            resolver,
            engine,
            backend,
        }
    }

    /// Session for a registration, creating it from backend credentials if needed.
    ///
    /// A registration already indexed is a plain lookup. A known endpoint gets
    /// its registration rebound. Otherwise credentials are resolved and a
    /// failure refuses the registration.
    pub async fn resolve_or_create(&self, registration: Arc<Registration>) -> Result<Admission> {
        if let Some(session) = self
            .by_registration_id(&registration.id)
            .or_else(|| self.by_endpoint(&registration.endpoint))
        {
            self.rebind(&session, registration);
            return Ok(Admission {
                session,
                changed_profile: None,
            });
        }

        let identity = registration
            .identity
            .clone()
            .unwrap_or_else(|| registration.endpoint.clone());
        let resolved = self
            .resolver
            .resolve(&identity, CredentialsKind::Client)
            .await
            .ok_or_else(|| GatewayError::Admission {
                endpoint: registration.endpoint.clone(),
                reason: "credentials not found or not validated in time".into(),
            })?;

        if resolved.endpoint != registration.endpoint {
            warn!(
                endpoint = %registration.endpoint,
                declared = %resolved.endpoint,
                "Credential endpoint differs from registration endpoint"
            );
        }
        // The cached snapshot stays authoritative; a newer one is handed back
        // so that the sessions already bound to it get reconciled.
        let mut changed_profile = None;
        if let Some(profile) = resolved.profile {
            let config = ProfileConfig::from_profile(&profile)?;
            match self.profiles.entry(profile.id) {
                Entry::Occupied(current) => {
                    if **current.get() != config {
                        changed_profile = Some(profile);
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(config));
                }
            }
        }

        let candidate = Arc::new(ClientSession::new(
            registration.endpoint.clone(),
            identity,
            resolved.security_info,
            resolved.device,
        ));
        let session = match self.by_endpoint.entry(registration.endpoint.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(vacant) => {
                vacant.insert(candidate.clone());
                info!(endpoint = %registration.endpoint, session_id = %candidate.session_id(), "Client session created");
                candidate
            }
        };
        self.rebind(&session, registration);
        Ok(Admission {
            session,
            changed_profile,
        })
    }

    fn rebind(&self, session: &Arc<ClientSession>, registration: Arc<Registration>) {
        let registration_id = registration.id.clone();
        if let Some(previous) = session.bind_registration(registration) {
            if previous.id != registration_id {
                self.by_registration
                    .remove_if(&previous.id, |_, s| Arc::ptr_eq(s, session));
                debug!(endpoint = %session.endpoint(), old = %previous.id, new = %registration_id, "Registration rebound");
            }
        }
        self.by_registration.insert(registration_id, session.clone());
    }

    /// Drop a registration: close its backend session, remove index entries and
    /// the profile when no other session uses it.
    pub async fn evict(&self, registration_id: &str) -> Option<Arc<ClientSession>> {
        let (_, session) = self.by_registration.remove(registration_id)?;

        let current = session.registration().map(|r| r.id.clone());
        if current.as_deref() != Some(registration_id) {
            // A newer registration owns the endpoint now.
            return Some(session);
        }

        if let Some(info) = session.session_info() {
            if let Err(e) = self.backend.process_session_event(&info, SessionEvent::Closed).await {
                warn!(endpoint = %session.endpoint(), error = %e, "Failed to close backend session");
            }
            if let Err(e) = self.backend.deregister_session(&info).await {
                warn!(endpoint = %session.endpoint(), error = %e, "Failed to deregister backend session");
            }
        }

        self.by_endpoint
            .remove_if(session.endpoint(), |_, s| Arc::ptr_eq(s, &session));
        self.engine.remove_security_info(session.endpoint());

        if let Some(profile_id) = session.profile_id() {
            if self.clients_by_profile(profile_id).is_empty() {
                self.profiles.remove(&profile_id);
                debug!(profile_id = %profile_id, "Profile evicted");
            }
        }
        info!(endpoint = %session.endpoint(), registration_id, "Client session removed");
        Some(session)
    }

    pub fn by_registration_id(&self, registration_id: &str) -> Option<Arc<ClientSession>> {
        self.by_registration.get(registration_id).map(|s| s.value().clone())
    }

    pub fn by_endpoint(&self, endpoint: &str) -> Option<Arc<ClientSession>> {
        self.by_endpoint.get(endpoint).map(|s| s.value().clone())
    }

    pub fn by_session_id(&self, session_id: Uuid) -> Option<Arc<ClientSession>> {
        self.by_endpoint
            .iter()
            .find(|s| s.value().session_id() == session_id)
            .map(|s| s.value().clone())
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.by_endpoint.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_endpoint.is_empty()
    }

    pub fn profile(&self, profile_id: Uuid) -> Option<Arc<ProfileConfig>> {
        self.profiles.get(&profile_id).map(|p| p.value().clone())
    }

    pub fn profile_for(&self, session: &ClientSession) -> Option<Arc<ProfileConfig>> {
        session.profile_id().and_then(|id| self.profile(id))
    }

    pub fn clients_by_profile(&self, profile_id: Uuid) -> Vec<Arc<ClientSession>> {
        self.by_endpoint
            .iter()
            .filter(|s| s.value().profile_id() == Some(profile_id))
            .map(|s| s.value().clone())
            .collect()
    }

    /// Replace a cached profile with a new snapshot.
    ///
    /// Returns the old and new snapshots when the profile is in use and its
    /// configuration changed; `None` otherwise.
    pub fn update_profile(
        &self,
        profile: &DeviceProfile,
    ) -> Result<Option<(Arc<ProfileConfig>, Arc<ProfileConfig>)>> {
        let config = ProfileConfig::from_profile(profile)?;
        match self.profiles.entry(profile.id) {
            Entry::Occupied(mut current) => {
                if **current.get() == config {
                    return Ok(None);
                }
                let new = Arc::new(config);
                let old = current.insert(new.clone());
                Ok(Some((old, new)))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    /// Cache a profile snapshot, keeping an equal one already present.
    pub fn put_profile(&self, profile: &DeviceProfile) -> Result<Arc<ProfileConfig>> {
        let config = ProfileConfig::from_profile(profile)?;
        let entry = self
            .profiles
            .entry(profile.id)
            .and_modify(|current| {
                if **current != config {
                    *current = Arc::new(config.clone());
                }
            })
            .or_insert_with(|| Arc::new(config.clone()));
        Ok(entry.value().clone())
    }
}
