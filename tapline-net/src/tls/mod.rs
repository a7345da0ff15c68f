mod acceptor;
mod authority;
mod cache;
mod leaf;
mod types;

pub use acceptor::build_acceptor;
pub use authority::{generate_authority, load_or_generate_authority, write_authority_to_dir};
pub use cache::IdentityCache;
pub use leaf::issue_identity;
pub use types::{
    Authority, AuthorityMaterial, AuthorityPaths, ServerIdentity, TlsError, TlsErrorKind,
};
