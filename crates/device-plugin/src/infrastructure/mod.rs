pub mod inventory_client;
pub mod kubelet;
pub mod watchers;
