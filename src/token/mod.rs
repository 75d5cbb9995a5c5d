//! Session token lifecycle: signing, verification and revocation.

mod codec;
pub mod revocation;

pub use codec::{IssuedToken, SessionToken, TokenCodec};
pub use revocation::RevocationList;
