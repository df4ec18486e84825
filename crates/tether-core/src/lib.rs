#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]

pub mod crypto;
pub mod pairing;
pub mod profile;
pub mod protocol;
