pub mod sample_profile;
pub mod summary;
pub mod util;

pub use crate::sample_profile::{parse, parse_bytes};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ProfileFormat {
    Binary,
    Text,
}
