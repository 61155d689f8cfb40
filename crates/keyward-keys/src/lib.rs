pub mod managed;
pub mod policy;
pub mod store;

#[cfg(feature = "aws-custodian")]
pub mod aws;

pub use managed::{ManagedKeyRef, ManagedKeySystemView, StaticSystemView, SystemView};
pub use policy::{KeyKind, KeyPolicy, KeyVersion};
pub use store::{CacheMode, PolicyStore};
