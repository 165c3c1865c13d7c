pub mod config;
pub mod directory;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap_handler;
pub mod ldap_protocol;
pub mod ldif;
pub mod metrics;
pub mod schema;
pub mod server;
pub mod store;
pub mod tls;

pub use config::Config;
pub use directory::Directory;
pub use dn::{Dn, Rdn};
pub use entry::{Attribute, Entry, Modification, ModificationOp};
pub use error::{DirectoryError, DirectoryResult, ResultCode};
pub use filter::Filter;
pub use ldap_handler::{Request, Response, SearchRequest, Session, SessionState};
pub use ldif::ImportPolicy;
pub use metrics::{run_metrics_server, Metrics};
pub use schema::Schema;
pub use server::LdapServer;
pub use store::{DitStore, SearchScope};
