pub mod backup;
pub mod error;
pub mod node;
pub mod schema;

pub use backup::{BackupDriver, BackupOptions};
pub use error::{ClientError, ClientResult};
pub use node::{
    ByteStream, ClientFactory, ClientOptions, NodeApi, NodeClient, NodeInfo, RemoteClientFactory,
    TlsOptions,
};
pub use schema::Schema;
