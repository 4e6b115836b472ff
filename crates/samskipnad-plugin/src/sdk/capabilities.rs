//! Guest handles for the host's core services.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::capabilities::{CapabilityOffer, Service};
use crate::error::PluginError;
use crate::value::{Value, ValueMap};
use crate::wire::{method, RpcClient};

/// Client for one granted service. Clones share the broker connection.
#[derive(Clone)]
pub struct ServiceClient {
    service: Service,
    conn: Arc<Mutex<RpcClient>>,
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl ServiceClient {
    pub fn service(&self) -> Service {
        self.service
    }

    /// Invoke `method` on the service through the host's broker.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, PluginError> {
        let mut conn = self.conn.lock().await;
        let response = conn
            .call(&format!("{}.{method}", self.service), params)
            .await?;
        response.into_result().map_err(PluginError::Capability)
    }
}

/// Everything a guest was granted at initialization.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    clients: BTreeMap<Service, ServiceClient>,
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySet")
            .field("granted", &self.granted())
            .finish()
    }
}

impl CapabilitySet {
    /// Dial and authenticate against the broker named in `offer`.
    pub async fn connect(offer: &CapabilityOffer) -> Result<Self, PluginError> {
        if offer.services.is_empty() {
            return Ok(Self::default());
        }

        let mut client = RpcClient::connect(offer.broker).await?;
        let mut auth = ValueMap::new();
        auth.insert("token".into(), offer.token.as_str().into());
        client
            .call(method::AUTHENTICATE, Value::Map(auth))
            .await?
            .into_result()
            .map_err(PluginError::Capability)?;

        let conn = Arc::new(Mutex::new(client));
        let clients = offer
            .services
            .iter()
            .map(|&service| {
                (
                    service,
                    ServiceClient {
                        service,
                        conn: conn.clone(),
                    },
                )
            })
            .collect();
        Ok(Self { clients })
    }

    pub fn get(&self, service: Service) -> Option<&ServiceClient> {
        self.clients.get(&service)
    }

    pub fn granted(&self) -> Vec<Service> {
        self.clients.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn user_profile(&self) -> Option<&ServiceClient> {
        self.get(Service::UserProfile)
    }

    pub fn community_management(&self) -> Option<&ServiceClient> {
        self.get(Service::CommunityManagement)
    }

    pub fn item_management(&self) -> Option<&ServiceClient> {
        self.get(Service::ItemManagement)
    }

    pub fn payment(&self) -> Option<&ServiceClient> {
        self.get(Service::Payment)
    }

    pub fn event_bus(&self) -> Option<&ServiceClient> {
        self.get(Service::EventBus)
    }
}
