pub mod keyset;
pub mod nca;
pub mod ncz;
pub mod pfs0;

pub use keyset::Keyset;
