mod local_client;

pub use local_client::LocalClient;
pub use local_client::LocalClientConfig;
pub use local_client::LocalClientError;
