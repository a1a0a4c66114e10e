// Tessera common library - main library exports

pub mod crypto;
pub mod hash;
pub mod interfaces;
pub mod messages;
pub mod network;
pub mod types;
pub mod validation;

// Flattened re-exports
pub use self::hash::*;
pub use self::types::*;
