/*!
This module contains the types which underpin the lowest level of abstraction
in a strongbox repository: the binary blob, or `Chunk`, and the key material,
compression, encryption, and MAC schemes used to produce one.
*/
pub mod chunk;
pub mod compression;
pub mod encryption;
pub mod hmac;
pub mod key;

pub use self::hmac::*;
pub use chunk::*;
pub use compression::*;
pub use encryption::*;
pub use key::*;
