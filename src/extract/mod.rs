// Extraction module - decode primitives and hoster pipelines used by the builtin extension
pub mod decode;
pub mod hosters;
pub mod unpacker;

pub use hosters::{find_hoster, hoster_infos, Challenge, Extraction, HosterDescriptor, Pipeline, HOSTERS};
