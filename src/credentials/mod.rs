pub mod acquirer;
pub mod store;

pub use acquirer::{Session, SessionAcquirer};
pub use store::{CredentialBundle, CredentialStore};
