use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::relay::RelayBroker;
use crate::sandbox::HostRegistry;
use crate::storage::BlobStore;
use crate::workspace::WorkspaceRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub workspaces: Arc<WorkspaceRegistry>,
    pub hosts: Arc<HostRegistry>,
    pub broker: Arc<RelayBroker>,
    pub blobs: BlobStore,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let hosts = Arc::new(HostRegistry::new());
        let workspaces = Arc::new(WorkspaceRegistry::new(config.clone(), hosts.clone()));
        let broker = Arc::new(RelayBroker::new(
            Duration::from_secs(config.relay.action_timeout_secs),
            Duration::from_secs(config.relay.query_timeout_secs),
        ));
        let blobs = BlobStore::new(&config.data.dir);

        Self {
            config,
            workspaces,
            hosts,
            broker,
            blobs,
        }
    }
}
